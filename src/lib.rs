//! A small replicated file store.
//!
//! A single master keeps every file on exactly three storage nodes. Nodes
//! hold whole files on local disk, heartbeat to the master and answer its
//! calls; the master tracks node liveness, builds a view of which node holds
//! which file and repairs missing, surplus or diverging replicas.

pub mod common;
pub mod config;
pub mod error;
pub mod master;
pub mod node;
pub mod protocol;
pub mod rpc;

pub use config::Config;
pub use error::{Error, Result};
pub use master::Master;
pub use node::NodeAgent;
