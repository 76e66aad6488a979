//! Replica view: which node holds which file, as last reported.
//!
//! Derived from the per-node catalog snapshots and rebuilt wholesale after
//! every refresh. Nothing here is persisted.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::common::{FileId, NodeId};
use crate::protocol::{Catalog, FileMeta, FileRecord, FileStatus};

/// Every holder's record of one file. Holders iterate in node id order,
/// which is also the order snapshots are folded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaEntry {
    /// Metadata as reported by the first holder.
    pub meta: FileMeta,
    pub holders: BTreeMap<NodeId, FileRecord>,
}

impl ReplicaEntry {
    pub fn holder_ids(&self) -> Vec<NodeId> {
        self.holders.keys().cloned().collect()
    }

    /// The record listings are reported from.
    pub fn representative(&self) -> Option<(&NodeId, &FileRecord)> {
        self.holders.iter().next()
    }
}

/// One line of the cluster's file listing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileListing {
    pub id: FileId,
    pub holders: Vec<NodeId>,
    pub name: String,
    pub record: FileRecord,
}

#[derive(Debug, Default, Clone)]
pub struct ReplicaView {
    files: BTreeMap<FileId, ReplicaEntry>,
}

impl ReplicaView {
    pub fn rebuild(snapshots: &BTreeMap<NodeId, Catalog>) -> Self {
        let mut files: BTreeMap<FileId, ReplicaEntry> = BTreeMap::new();
        for (node, catalog) in snapshots {
            for (id, record) in catalog {
                files
                    .entry(id.clone())
                    .or_insert_with(|| ReplicaEntry {
                        meta: record.meta.clone(),
                        holders: BTreeMap::new(),
                    })
                    .holders
                    .insert(node.clone(), record.clone());
            }
        }
        Self { files }
    }

    pub fn get(&self, id: &FileId) -> Option<&ReplicaEntry> {
        self.files.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileId, &ReplicaEntry)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files whose representative record is live and not deleted, by id.
    pub fn list_live_files(&self) -> Vec<FileListing> {
        self.files
            .iter()
            .filter_map(|(id, entry)| {
                let (_, record) = entry.representative()?;
                if record.status != FileStatus::Live || record.date_deleted.is_some() {
                    return None;
                }
                Some(FileListing {
                    id: id.clone(),
                    holders: entry.holder_ids(),
                    name: entry.meta.name.clone(),
                    record: record.clone(),
                })
            })
            .collect()
    }
}
