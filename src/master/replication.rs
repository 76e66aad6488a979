//! Replica validation and repair.
//!
//! The engine keeps the latest catalog snapshot of every node and the
//! [`ReplicaView`] derived from them. A repair pass first plans one action per
//! file from the view and the registry, then the master executes the plans
//! with the file's repair lock held. Planning never touches the network.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::registry::NodeRegistry;
use super::view::{FileListing, ReplicaEntry, ReplicaView};
use crate::common::{duration_ms, elapsed_ms, FileId, NodeId};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{AddRequest, Catalog, DeleteRequest, Request, UpdateRequest};
use crate::rpc::NodeLink;

/// Which field the holders of a file disagree on, checked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceTier {
    Version,
    Meta,
    Content,
}

impl DivergenceTier {
    /// Metadata fixes leave the faulty holder's content alone.
    pub fn carries_content(self) -> bool {
        !matches!(self, DivergenceTier::Meta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    /// Too many holders: drop the file from `node`.
    Demote { node: NodeId },
    /// Too few holders: copy the file from `source` to `target`.
    Replicate { source: NodeId, target: NodeId },
    /// Holders disagree: overwrite each faulty holder from `authority`.
    Reconcile {
        authority: NodeId,
        faulty: Vec<NodeId>,
        tier: DivergenceTier,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairTask {
    pub file: FileId,
    pub action: RepairAction,
}

/// Outcome of planning one repair pass.
#[derive(Debug, Default)]
pub struct RepairPlan {
    pub tasks: Vec<RepairTask>,
    /// Files that need a repair no action can carry out yet, such as a
    /// missing replication target.
    pub unplanned: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RepairTimeouts {
    pub rpc: Duration,
    pub transfer: Duration,
}

impl From<&Config> for RepairTimeouts {
    fn from(config: &Config) -> Self {
        Self {
            rpc: config.rpc_timeout(),
            transfer: config.transfer_timeout(),
        }
    }
}

pub struct ReplicationEngine {
    snapshots: BTreeMap<NodeId, Catalog>,
    view: ReplicaView,
    // Files with a repair or a delete in flight. Kept apart from the view so
    // a rebuild never drops them.
    repair_locks: HashSet<FileId>,
    replica_factor: usize,
    startup_grace_ms: u64,
}

impl ReplicationEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            snapshots: BTreeMap::new(),
            view: ReplicaView::default(),
            repair_locks: HashSet::new(),
            replica_factor: config.replica_factor,
            startup_grace_ms: duration_ms(config.startup_grace()),
        }
    }

    pub fn store_snapshot(&mut self, node: NodeId, catalog: Catalog) {
        self.snapshots.insert(node, catalog);
    }

    pub fn rebuild_view(&mut self) {
        self.view = ReplicaView::rebuild(&self.snapshots);
        debug!(
            "Rebuilt replica view: {} files over {} nodes",
            self.view.len(),
            self.snapshots.len()
        );
    }

    pub fn view(&self) -> &ReplicaView {
        &self.view
    }

    pub fn list_live_files(&self) -> Vec<FileListing> {
        self.view.list_live_files()
    }

    /// Takes the repair lock of `id`. False if someone already holds it.
    pub fn try_lock(&mut self, id: &FileId) -> bool {
        self.repair_locks.insert(id.clone())
    }

    pub fn unlock(&mut self, id: &FileId) {
        self.repair_locks.remove(id);
    }

    pub fn is_locked(&self, id: &FileId) -> bool {
        self.repair_locks.contains(id)
    }

    /// Plans at most one action per file and takes the repair lock of every
    /// file it returns a task for. Locked files are skipped.
    pub fn plan_repairs(&mut self, registry: &NodeRegistry, now: u64) -> RepairPlan {
        let mut plan = RepairPlan::default();
        for (id, entry) in self.view.iter() {
            if self.repair_locks.contains(id) {
                debug!("Skipping {}: repair already in flight", id);
                continue;
            }
            match self.plan_file(id, entry, registry, now) {
                Ok(Some(action)) => plan.tasks.push(RepairTask {
                    file: id.clone(),
                    action,
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!("Cannot repair {} ({}): {}", id, e.kind(), e);
                    plan.unplanned += 1;
                }
            }
        }
        for task in &plan.tasks {
            self.repair_locks.insert(task.file.clone());
        }
        plan
    }

    /// Decides what, if anything, file `id` needs.
    pub fn plan_file(
        &self,
        id: &FileId,
        entry: &ReplicaEntry,
        registry: &NodeRegistry,
        now: u64,
    ) -> Result<Option<RepairAction>> {
        let holders = entry.holders.len();
        if holders == 0 {
            return Ok(None);
        }

        // Holders that restarted recently may simply not have reported yet.
        let youngest_restart = entry
            .holders
            .keys()
            .filter_map(|node| registry.get(node))
            .map(|node| node.last_restart)
            .max();
        if holders < self.replica_factor {
            if let Some(restart) = youngest_restart {
                if elapsed_ms(now, restart) < self.startup_grace_ms {
                    return Ok(None);
                }
            }
        }

        if holders > self.replica_factor {
            return Ok(busiest_holder(entry, registry).map(|node| RepairAction::Demote { node }));
        }

        if holders < self.replica_factor {
            let Some(source) = entry
                .holders
                .keys()
                .find(|node| registry.get(node).is_some_and(|n| n.alive))
            else {
                return Ok(None);
            };
            let target =
                least_loaded_outside(entry, registry).ok_or_else(|| Error::Capacity(id.clone()))?;
            return Ok(Some(RepairAction::Replicate {
                source: source.clone(),
                target,
            }));
        }

        Ok(find_divergence(entry))
    }
}

fn busiest_holder(entry: &ReplicaEntry, registry: &NodeRegistry) -> Option<NodeId> {
    let mut busiest: Option<(&NodeId, usize)> = None;
    for node in entry.holders.keys() {
        let count = registry.get(node).map_or(0, |n| n.file_count);
        if busiest.map_or(true, |(_, max)| count > max) {
            busiest = Some((node, count));
        }
    }
    busiest.map(|(node, _)| node.clone())
}

fn least_loaded_outside(entry: &ReplicaEntry, registry: &NodeRegistry) -> Option<NodeId> {
    let mut best: Option<(&NodeId, usize)> = None;
    for node in registry.alive().filter(|n| !entry.holders.contains_key(&n.id)) {
        if best.map_or(true, |(_, min)| node.file_count < min) {
            best = Some((&node.id, node.file_count));
        }
    }
    best.map(|(node, _)| node.clone())
}

fn find_divergence(entry: &ReplicaEntry) -> Option<RepairAction> {
    let versions: Vec<(&NodeId, u64)> =
        entry.holders.iter().map(|(node, r)| (node, r.version)).collect();
    let highest = versions.iter().map(|(_, v)| *v).max()?;
    let lowest = versions.iter().map(|(_, v)| *v).min()?;
    if highest != lowest {
        let authority = versions.iter().find(|(_, v)| *v == highest)?.0.clone();
        let faulty = versions
            .iter()
            .filter(|(_, v)| *v == lowest)
            .map(|(node, _)| (*node).clone())
            .collect();
        return Some(RepairAction::Reconcile {
            authority,
            faulty,
            tier: DivergenceTier::Version,
        });
    }

    let metas: Vec<(&NodeId, u32)> =
        entry.holders.iter().map(|(node, r)| (node, r.meta_checksum)).collect();
    if let Some((authority, faulty)) = majority(&metas) {
        return Some(RepairAction::Reconcile {
            authority,
            faulty,
            tier: DivergenceTier::Meta,
        });
    }

    let contents: Vec<(&NodeId, u32)> =
        entry.holders.iter().map(|(node, r)| (node, r.content_checksum)).collect();
    majority(&contents).map(|(authority, faulty)| RepairAction::Reconcile {
        authority,
        faulty,
        tier: DivergenceTier::Content,
    })
}

/// Most frequent value among `values`, ties going to the value seen first.
/// Returns its first holder and every holder that disagrees, or None when
/// all values agree.
fn majority(values: &[(&NodeId, u32)]) -> Option<(NodeId, Vec<NodeId>)> {
    let mut counts: Vec<(u32, usize)> = Vec::new();
    for (_, value) in values {
        match counts.iter_mut().find(|(seen, _)| seen == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((*value, 1)),
        }
    }
    if counts.len() < 2 {
        return None;
    }

    let mut winner = counts[0];
    for candidate in &counts[1..] {
        if candidate.1 > winner.1 {
            winner = *candidate;
        }
    }

    let authority = values.iter().find(|(_, v)| *v == winner.0)?.0.clone();
    let faulty = values
        .iter()
        .filter(|(_, v)| *v != winner.0)
        .map(|(node, _)| (*node).clone())
        .collect();
    Some((authority, faulty))
}

fn link_to<'a>(links: &'a BTreeMap<NodeId, NodeLink>, node: &NodeId) -> Result<&'a NodeLink> {
    links.get(node).ok_or_else(|| Error::Disconnected(node.clone()))
}

/// Carries out one planned repair against the nodes in `links`.
pub async fn execute(
    task: &RepairTask,
    links: &BTreeMap<NodeId, NodeLink>,
    timeouts: RepairTimeouts,
) -> Result<()> {
    let id = &task.file;
    match &task.action {
        RepairAction::Demote { node } => {
            info!("File {} is over-replicated, removing it from {}", id, node);
            let request = Request::Delete(DeleteRequest {
                id: id.clone(),
                version: None,
                force: true,
            });
            link_to(links, node)?.call(request, timeouts.rpc).await?;
        }
        RepairAction::Replicate { source, target } => {
            info!("File {} is under-replicated, copying it from {} to {}", id, source, target);
            let copy = link_to(links, source)?
                .call(Request::FileQuery { id: id.clone() }, timeouts.transfer)
                .await?
                .into_file()?;
            let request = Request::Add(AddRequest {
                id: id.clone(),
                version: copy.record.version,
                content: copy.content.unwrap_or_default(),
                meta: copy.record.meta,
            });
            link_to(links, target)?.call(request, timeouts.transfer).await?;
        }
        RepairAction::Reconcile {
            authority,
            faulty,
            tier,
        } => {
            info!(
                "File {} has a {:?} mismatch on {:?}, fixing from {}",
                id, tier, faulty, authority
            );
            let copy = link_to(links, authority)?
                .call(Request::FileQuery { id: id.clone() }, timeouts.transfer)
                .await?
                .into_file()?;
            let with_content = tier.carries_content();
            let after = if with_content {
                timeouts.transfer
            } else {
                timeouts.rpc
            };
            for node in faulty {
                let request = Request::Update(UpdateRequest::from_authority(&copy, with_content));
                link_to(links, node)?.call(request, after).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileMeta, FileRecord, FileStatus, Heartbeat};
    use crate::rpc::Connection;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const NOW: u64 = 1_000_000;

    fn record(version: u64, meta_checksum: u32, content_checksum: u32) -> FileRecord {
        FileRecord {
            id: "f1".into(),
            version,
            meta: FileMeta {
                name: "f1.bin".into(),
                size: 3,
            },
            status: FileStatus::Live,
            date_added: 1,
            date_updated: None,
            date_deleted: None,
            content_checksum,
            meta_checksum,
        }
    }

    fn entry(holders: &[(&str, FileRecord)]) -> ReplicaEntry {
        ReplicaEntry {
            meta: holders[0].1.meta.clone(),
            holders: holders
                .iter()
                .map(|(node, record)| (NodeId::from(*node), record.clone()))
                .collect(),
        }
    }

    /// Registry with every node alive, restarted well before `NOW`.
    fn registry(nodes: &[(&str, usize)]) -> NodeRegistry {
        let mut registry = NodeRegistry::new(Duration::from_secs(20));
        for (id, file_count) in nodes {
            let (tx, _rx) = mpsc::unbounded_channel();
            let link = NodeLink::remote(NodeId::from(*id), Arc::new(Connection::new(tx)));
            let heartbeat = Heartbeat {
                id: NodeId::from(*id),
                file_count: *file_count,
            };
            registry.record_heartbeat(&heartbeat, link, NOW - 60_000);
        }
        registry
    }

    fn engine() -> ReplicationEngine {
        ReplicationEngine::new(&Config::default())
    }

    fn plan(entry: &ReplicaEntry, registry: &NodeRegistry) -> Result<Option<RepairAction>> {
        engine().plan_file(&"f1".into(), entry, registry, NOW)
    }

    #[test]
    fn agreeing_replicas_need_nothing() {
        let registry = registry(&[("a", 1), ("b", 1), ("c", 1)]);
        let entry = entry(&[("a", record(1, 7, 9)), ("b", record(1, 7, 9)), ("c", record(1, 7, 9))]);
        assert_eq!(plan(&entry, &registry).unwrap(), None);
    }

    #[test]
    fn over_replicated_file_leaves_busiest_holder() {
        let registry = registry(&[("a", 3), ("b", 8), ("c", 8), ("d", 1)]);
        let same = record(1, 7, 9);
        let entry = entry(&[("a", same.clone()), ("b", same.clone()), ("c", same.clone()), ("d", same)]);
        assert_eq!(
            plan(&entry, &registry).unwrap(),
            Some(RepairAction::Demote { node: "b".into() })
        );
    }

    #[test]
    fn under_replicated_file_goes_to_least_loaded_node() {
        // B is the sole holder of f1; A has fewer files than C.
        let registry = registry(&[("a", 2), ("b", 5), ("c", 7)]);
        let entry = entry(&[("b", record(1, 7, 9))]);
        assert_eq!(
            plan(&entry, &registry).unwrap(),
            Some(RepairAction::Replicate {
                source: "b".into(),
                target: "a".into()
            })
        );
    }

    #[test]
    fn no_free_node_is_a_capacity_error() {
        let registry = registry(&[("a", 2), ("b", 5)]);
        let entry = entry(&[("a", record(1, 7, 9)), ("b", record(1, 7, 9))]);
        let err = plan(&entry, &registry).unwrap_err();
        assert!(matches!(err, Error::Capacity(ref id) if id.as_str() == "f1"));
    }

    #[test]
    fn recently_restarted_holder_delays_replication() {
        let mut registry = registry(&[("a", 2), ("b", 5), ("c", 7)]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = NodeLink::remote("b".into(), Arc::new(Connection::new(tx.clone())));
        registry.liveness_sweep(NOW);
        let heartbeat = Heartbeat {
            id: "b".into(),
            file_count: 5,
        };
        // Every node died in the sweep above; b comes back 5 s before NOW.
        registry.record_heartbeat(&heartbeat, link, NOW - 5_000);
        for id in ["a", "c"] {
            let link = NodeLink::remote(id.into(), Arc::new(Connection::new(tx.clone())));
            let heartbeat = Heartbeat {
                id: id.into(),
                file_count: 0,
            };
            registry.record_heartbeat(&heartbeat, link, NOW - 60_000);
        }

        let partial = entry(&[("b", record(1, 7, 9))]);
        assert_eq!(plan(&partial, &registry).unwrap(), None);

        // Fully replicated files are checked regardless of restarts.
        let mut diverged = record(1, 7, 9);
        diverged.content_checksum = 10;
        let full = entry(&[
            ("a", record(1, 7, 9)),
            ("b", diverged),
            ("c", record(1, 7, 9)),
        ]);
        assert!(matches!(
            plan(&full, &registry).unwrap(),
            Some(RepairAction::Reconcile {
                tier: DivergenceTier::Content,
                ..
            })
        ));
    }

    #[test]
    fn highest_version_is_authoritative() {
        let registry = registry(&[("a", 1), ("b", 1), ("c", 1)]);
        let entry = entry(&[("a", record(2, 7, 9)), ("b", record(3, 8, 10)), ("c", record(1, 7, 9))]);
        assert_eq!(
            plan(&entry, &registry).unwrap(),
            Some(RepairAction::Reconcile {
                authority: "b".into(),
                faulty: vec!["c".into()],
                tier: DivergenceTier::Version,
            })
        );
    }

    #[test]
    fn meta_mismatch_is_fixed_by_majority() {
        let registry = registry(&[("a", 1), ("b", 1), ("c", 1)]);
        let entry = entry(&[("a", record(1, 5, 9)), ("b", record(1, 7, 9)), ("c", record(1, 7, 9))]);
        assert_eq!(
            plan(&entry, &registry).unwrap(),
            Some(RepairAction::Reconcile {
                authority: "b".into(),
                faulty: vec!["a".into()],
                tier: DivergenceTier::Meta,
            })
        );
    }

    #[test]
    fn content_tie_goes_to_first_seen_value() {
        let registry = registry(&[("a", 1), ("b", 1), ("c", 1)]);
        let entry = entry(&[("a", record(1, 7, 1)), ("b", record(1, 7, 2)), ("c", record(1, 7, 3))]);
        assert_eq!(
            plan(&entry, &registry).unwrap(),
            Some(RepairAction::Reconcile {
                authority: "a".into(),
                faulty: vec!["b".into(), "c".into()],
                tier: DivergenceTier::Content,
            })
        );
    }

    #[test]
    fn planning_locks_files_and_skips_locked_ones() {
        let registry = registry(&[("a", 2), ("b", 5), ("c", 7)]);
        let mut engine = engine();
        let mut catalog = Catalog::new();
        catalog.insert("f1".into(), record(1, 7, 9));
        engine.store_snapshot("b".into(), catalog);
        engine.rebuild_view();

        let plan = engine.plan_repairs(&registry, NOW);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.unplanned, 0);
        assert!(engine.is_locked(&"f1".into()));

        // A rebuild keeps the lock, and a locked file is not planned again.
        engine.rebuild_view();
        assert!(engine.plan_repairs(&registry, NOW).tasks.is_empty());

        engine.unlock(&"f1".into());
        assert_eq!(engine.plan_repairs(&registry, NOW).tasks.len(), 1);
    }
}
