use std::time::Duration;

use thiserror::Error;

use crate::common::{FileId, NodeId};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by nodes, the transport and the master.
#[derive(Debug, Error)]
pub enum Error {
    /// The file id is unknown to the catalog or to the replica view.
    #[error("file {0} not found")]
    NotFound(FileId),

    /// An RPC did not settle before its deadline.
    #[error("{request} to node {node} timed out after {after:?}")]
    Timeout {
        node: NodeId,
        request: &'static str,
        after: Duration,
    },

    /// The node answered the call with an explicit error.
    #[error("node {node} rejected request: {message}")]
    Remote { node: NodeId, message: String },

    /// A stored checksum disagreed with the recomputed one.
    #[error("checksum mismatch on file {id}: stored {stored:08x}, computed {computed:08x}")]
    Corruption {
        id: FileId,
        stored: u32,
        computed: u32,
    },

    /// No alive node can take another replica of the file.
    #[error("no eligible node to hold a new replica of {0}")]
    Capacity(FileId),

    /// An RPC payload could not be decoded or failed validation.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The connection to the node is gone.
    #[error("node {0} is disconnected")]
    Disconnected(NodeId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Short label for the kind of fault, used in repair logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Timeout { .. } => "timeout",
            Error::Remote { .. } => "remote",
            Error::Corruption { .. } => "corruption",
            Error::Capacity(_) => "capacity",
            Error::Malformed(_) => "malformed",
            Error::Disconnected(_) => "disconnected",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}
