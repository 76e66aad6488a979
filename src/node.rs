//! Storage node.
//!
//! A node keeps a [`NodeCatalog`] of the files it holds, answers the master's
//! calls against it and reports in with a heartbeat on a fixed interval. It
//! never talks to other nodes; all replication is driven by the master.

pub mod catalog;
pub mod content;


use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::common::NodeId;
use crate::config::Config;
use crate::error::Result;
use crate::protocol::{Frame, Heartbeat, Request, Response};
use crate::rpc::write_frames;

pub use catalog::{NodeCatalog, ScanReport};
pub use content::ContentStore;

pub struct NodeAgent {
    pub id: NodeId,
    config: Config,
    catalog: NodeCatalog,
}

impl NodeAgent {
    /// Brings up the node's storage under the configured root. The catalog is
    /// loaded and scanned before this returns, so the agent can serve calls
    /// and heartbeat right away.
    pub async fn bootstrap(id: NodeId, config: Config) -> Result<Arc<NodeAgent>> {
        let root = config.node_storage(id.as_str());
        Self::open(id, config, &root).await
    }

    /// Same as [`NodeAgent::bootstrap`] with an explicit storage root.
    pub async fn open(id: NodeId, config: Config, root: &Path) -> Result<Arc<NodeAgent>> {
        let catalog = NodeCatalog::open(root, config.tombstone_grace()).await?;
        info!("Node {} ready with {} files", id, catalog.file_count());
        Ok(Arc::new(NodeAgent {
            id,
            config,
            catalog,
        }))
    }

    pub fn catalog(&self) -> &NodeCatalog {
        &self.catalog
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            id: self.id.clone(),
            file_count: self.catalog.file_count(),
        }
    }

    /// Executes one call from the master against the local catalog.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::Add(req) => {
                debug!("Received ADD for {} ({})", req.id, req.meta.name);
                self.catalog.add_file(req).await?;
                Ok(Response::Ack)
            }
            Request::Delete(req) => {
                debug!("Received DELETE for {} (force={})", req.id, req.force);
                self.catalog.delete_file(req).await?;
                Ok(Response::Ack)
            }
            Request::Update(req) => {
                debug!("Received UPDATE for {}", req.id);
                self.catalog.update_file(req).await?;
                Ok(Response::Ack)
            }
            Request::MetaQuery => Ok(Response::Catalog {
                files: self.catalog.catalog_snapshot(),
            }),
            Request::FileQuery { id } => Ok(Response::File {
                file: self.catalog.get_file(&id, true).await?,
            }),
        }
    }

    /// Decodes a raw request body, runs it and wraps the outcome into the
    /// response frame for `call_id`.
    pub async fn answer(&self, call_id: u64, body: serde_json::Value) -> Frame {
        let outcome = match Request::decode(body) {
            Ok(request) => {
                let name = request.name();
                self.handle(request).await.map_err(|e| {
                    warn!("Failed {} call {}: {}", name, call_id, e);
                    e.to_string()
                })
            }
            Err(e) => {
                warn!("Rejected call {}: {}", call_id, e);
                Err(e.to_string())
            }
        };
        Frame::Response { call_id, outcome }
    }

    /// Runs the node until the process exits: the periodic integrity scan,
    /// and the master connection with reconnects.
    pub async fn run(self: Arc<Self>) {
        let scanner = self.clone();
        tokio::spawn(async move { scanner.integrity_loop().await });

        loop {
            match TcpStream::connect(self.config.master_addr).await {
                Ok(stream) => {
                    info!("Connected to master at {}", self.config.master_addr);
                    if let Err(e) = self.clone().serve(stream).await {
                        warn!("Connection to master lost: {}", e);
                    } else {
                        warn!("Master closed the connection");
                    }
                }
                Err(e) => warn!("Failed to reach master at {}: {}", self.config.master_addr, e),
            }
            tokio::time::sleep(self.config.reconnect_delay()).await;
        }
    }

    async fn integrity_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.integrity_scan_interval());
        // The first tick completes immediately; bootstrap already scanned.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = self.catalog.integrity_scan().await {
                error!("Integrity scan failed: {}", e);
            }
        }
    }

    /// Serves one master connection: heartbeats on their own timer, and one
    /// task per incoming call. Returns when the stream ends.
    pub async fn serve(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, rx));

        let heartbeat_task = {
            let agent = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(agent.config.heartbeat_interval());
                loop {
                    interval.tick().await;
                    if tx.send(Frame::Heartbeat(agent.heartbeat())).is_err() {
                        break;
                    }
                }
            })
        };

        let mut lines = BufReader::new(reader).lines();
        let result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            };
            if line.trim().is_empty() {
                continue;
            }
            match Frame::decode(&line) {
                Ok(Frame::Request { call_id, request }) => {
                    let agent = self.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = agent.answer(call_id, request).await;
                        let _ = tx.send(response);
                    });
                }
                Ok(other) => debug!("Ignoring unexpected frame from master: {:?}", other),
                Err(e) => warn!("Dropping undecodable frame from master: {}", e),
            }
        };

        heartbeat_task.abort();
        drop(tx);
        writer_task.abort();
        result
    }
}
