//! Wire protocol between the master and its storage nodes.
//!
//! Every node keeps one TCP connection to the master. Both sides exchange
//! newline-delimited JSON [`Frame`]s over it: nodes push heartbeats and
//! answer calls, the master issues calls. A call is one [`Request`] tagged
//! with a `call_id` and settles with exactly one [`Frame::Response`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{crc32, FileId, NodeId};
use crate::error::{Error, Result};

/// User-visible metadata of a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
}

impl FileMeta {
    /// Checksum over the canonical `key:value` rendering of the metadata,
    /// keys sorted and joined with `/`.
    pub fn checksum(&self) -> u32 {
        crc32(format!("name:{}/size:{}", self.name, self.size).as_bytes())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Live,
    Deleted,
}

/// A node's catalog entry for one file. Content is stored separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: FileId,
    pub version: u64,
    pub meta: FileMeta,
    pub status: FileStatus,
    pub date_added: u64,
    #[serde(default)]
    pub date_updated: Option<u64>,
    #[serde(default)]
    pub date_deleted: Option<u64>,
    pub content_checksum: u32,
    pub meta_checksum: u32,
}

impl FileRecord {
    pub fn is_tombstone(&self) -> bool {
        self.status == FileStatus::Deleted
    }
}

/// A detached copy of a record, optionally carrying the raw content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCopy {
    pub record: FileRecord,
    #[serde(default)]
    pub content: Option<Vec<u8>>,
}

/// Full id -> record table of one node.
pub type Catalog = BTreeMap<FileId, FileRecord>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddRequest {
    pub id: FileId,
    pub version: u64,
    pub content: Vec<u8>,
    pub meta: FileMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRequest {
    pub id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Erase the record entirely instead of leaving a tombstone.
    #[serde(default)]
    pub force: bool,
}

/// Partial overwrite of a record. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRequest {
    pub id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FileMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_updated: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_deleted: Option<u64>,
}

impl UpdateRequest {
    /// Builds the update that makes a faulty replica match `authority`.
    pub fn from_authority(authority: &FileCopy, with_content: bool) -> Self {
        let record = &authority.record;
        Self {
            id: record.id.clone(),
            version: Some(record.version),
            meta: Some(record.meta.clone()),
            content: if with_content {
                Some(authority.content.clone().unwrap_or_default())
            } else {
                None
            },
            status: Some(record.status),
            date_added: Some(record.date_added),
            date_updated: record.date_updated,
            date_deleted: record.date_deleted,
        }
    }
}

/// Node-directed calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Add(AddRequest),
    Delete(DeleteRequest),
    Update(UpdateRequest),
    MetaQuery,
    FileQuery { id: FileId },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Add(_) => "ADD",
            Request::Delete(_) => "DELETE",
            Request::Update(_) => "UPDATE",
            Request::MetaQuery => "META_QUERY",
            Request::FileQuery { .. } => "FILE_QUERY",
        }
    }

    /// Decodes and validates a request body received off the wire.
    pub fn decode(body: serde_json::Value) -> Result<Self> {
        let request: Request =
            serde_json::from_value(body).map_err(|e| Error::Malformed(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<()> {
        let id = match self {
            Request::Add(req) => &req.id,
            Request::Delete(req) => &req.id,
            Request::Update(req) => &req.id,
            Request::FileQuery { id } => id,
            Request::MetaQuery => return Ok(()),
        };
        if id.as_str().trim().is_empty() {
            return Err(Error::Malformed(format!("{} with empty file id", self.name())));
        }
        // Ids name blobs on disk.
        if id.as_str().contains(['/', '\\']) || id.as_str().starts_with('.') {
            return Err(Error::Malformed(format!("{} with invalid file id {id}", self.name())));
        }
        if let Request::Add(req) = self {
            if req.meta.name.is_empty() {
                return Err(Error::Malformed(format!("ADD {} without a name", req.id)));
            }
        }
        Ok(())
    }
}

/// Successful outcome of a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Catalog { files: Catalog },
    File { file: FileCopy },
}

impl Response {
    pub fn into_catalog(self) -> Result<Catalog> {
        match self {
            Response::Catalog { files } => Ok(files),
            other => Err(Error::Malformed(format!("expected a catalog, got {other:?}"))),
        }
    }

    pub fn into_file(self) -> Result<FileCopy> {
        match self {
            Response::File { file } => Ok(file),
            other => Err(Error::Malformed(format!("expected a file, got {other:?}"))),
        }
    }
}

/// Liveness signal a node pushes on a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub id: NodeId,
    pub file_count: usize,
}

/// Outcome carried by a response frame: a payload or the node's error text.
pub type Outcome = std::result::Result<Response, String>;

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Heartbeat(Heartbeat),
    /// The body stays raw until the node validates it, so a bad body can
    /// still be answered under its `call_id`.
    Request {
        call_id: u64,
        request: serde_json::Value,
    },
    Response {
        call_id: u64,
        outcome: Outcome,
    },
}

impl Frame {
    pub fn request(call_id: u64, request: &Request) -> Result<Self> {
        Ok(Frame::Request {
            call_id,
            request: serde_json::to_value(request)?,
        })
    }

    /// Serializes the frame as a single line, newline included.
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_checksum_uses_sorted_key_rendering() {
        let meta = FileMeta {
            name: "report.pdf".into(),
            size: 42,
        };
        assert_eq!(meta.checksum(), crc32(b"name:report.pdf/size:42"));
    }

    #[test]
    fn delete_without_force_is_soft() {
        let request = Request::decode(json!({"type": "DELETE", "id": "f1", "version": 7})).unwrap();
        assert_eq!(
            request,
            Request::Delete(DeleteRequest {
                id: "f1".into(),
                version: Some(7),
                force: false,
            })
        );
    }

    #[test]
    fn update_keeps_only_present_fields() {
        let request = Request::decode(json!({"type": "UPDATE", "id": "f1", "version": 3})).unwrap();
        let Request::Update(update) = request else {
            panic!("expected an update");
        };
        assert_eq!(update.version, Some(3));
        assert!(update.meta.is_none());
        assert!(update.content.is_none());
        assert!(update.status.is_none());
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        let err = Request::decode(json!({"type": "ADD", "id": "f1"})).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));

        let err = Request::decode(json!({"type": "FILE_QUERY", "id": ""})).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));

        let err = Request::decode(json!({"type": "RENAME", "id": "f1"})).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn frames_are_single_lines() {
        let frame = Frame::request(
            9,
            &Request::Add(AddRequest {
                id: "f1".into(),
                version: 1,
                content: b"line one\nline two".to_vec(),
                meta: FileMeta {
                    name: "notes.txt".into(),
                    size: 17,
                },
            }),
        )
        .unwrap();
        let line = frame.encode().unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));

        let Frame::Request { call_id, request } = Frame::decode(line.trim_end()).unwrap() else {
            panic!("expected a request frame");
        };
        assert_eq!(call_id, 9);
        assert_eq!(Request::decode(request).unwrap().name(), "ADD");
    }

    #[test]
    fn unknown_record_fields_are_ignored() {
        // Snapshots written by older builds carried a lock flag.
        let value = json!({
            "id": "f1",
            "version": 1,
            "meta": { "name": "a", "size": 1 },
            "status": "live",
            "date_added": 10,
            "content_checksum": 1,
            "meta_checksum": 2,
            "locked": true,
        });
        let record: FileRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.date_updated, None);
        assert_eq!(record.meta_checksum, 2);
    }
}
