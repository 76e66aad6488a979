//! Master (coordinator).
//!
//! The master never stores files itself. It learns about nodes from their
//! heartbeats, periodically pulls every live node's catalog into a replica
//! view, and sends repair calls to bring each file back to exactly
//! `replica_factor` agreeing holders. It also places new files and deletes
//! them cluster-wide.

pub mod registry;
pub mod replication;
pub mod view;


use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::common::{now_ms, FileId, NodeId};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::NodeAgent;
use crate::protocol::{AddRequest, Catalog, DeleteRequest, FileMeta, Frame, Heartbeat, Request};
use crate::rpc::{write_frames, Connection, LocalNode, NodeLink};

pub use registry::{HeartbeatOutcome, NodeEntry, NodeRegistry, NodeStatus};
pub use replication::{DivergenceTier, RepairAction, RepairPlan, RepairTask, ReplicationEngine};
pub use view::{FileListing, ReplicaEntry, ReplicaView};

const DELETE_LOCK_POLL: Duration = Duration::from_millis(50);

pub struct Master {
    config: Config,
    // Lock order: registry before engine. Neither is held across an await.
    registry: Mutex<NodeRegistry>,
    engine: Mutex<ReplicationEngine>,
    // Held for a whole refresh or repair pass. The periodic loops skip a
    // tick while a pass is running; facade calls wait for it instead.
    refresh_pass: tokio::sync::Mutex<()>,
    repair_pass: tokio::sync::Mutex<()>,
}

impl Master {
    pub fn new(config: Config) -> Arc<Master> {
        Arc::new(Master {
            registry: Mutex::new(NodeRegistry::new(config.connection_timeout())),
            engine: Mutex::new(ReplicationEngine::new(&config)),
            refresh_pass: tokio::sync::Mutex::new(()),
            repair_pass: tokio::sync::Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, NodeRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine(&self) -> MutexGuard<'_, ReplicationEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle_heartbeat(&self, heartbeat: &Heartbeat, link: NodeLink) -> HeartbeatOutcome {
        debug!("Heartbeat from {} ({} files)", heartbeat.id, heartbeat.file_count);
        self.registry().record_heartbeat(heartbeat, link, now_ms())
    }

    /// Registers a node running in this process and reports its first
    /// heartbeat.
    pub fn attach_local(&self, agent: Arc<NodeAgent>) -> Arc<LocalNode> {
        let local = Arc::new(LocalNode::new(agent));
        self.local_heartbeat(&local);
        local
    }

    /// Heartbeat on behalf of an in-process node.
    pub fn local_heartbeat(&self, local: &Arc<LocalNode>) -> HeartbeatOutcome {
        let heartbeat = local.agent().heartbeat();
        let link = NodeLink::local(heartbeat.id.clone(), local.clone());
        self.handle_heartbeat(&heartbeat, link)
    }

    pub fn liveness_sweep(&self) -> Vec<NodeId> {
        self.registry().liveness_sweep(now_ms())
    }

    pub fn list_nodes(&self) -> Vec<NodeStatus> {
        self.registry().list_nodes()
    }

    /// Live files as of the last refresh, ordered by id.
    pub fn list_files(&self) -> Vec<FileListing> {
        self.engine().list_live_files()
    }

    /// Pulls every live node's catalog and rebuilds the replica view.
    /// Returns false when a refresh was already running.
    pub async fn refresh_catalogs(&self) -> bool {
        let Ok(_pass) = self.refresh_pass.try_lock() else {
            debug!("Catalog refresh already running, skipping");
            return false;
        };
        self.refresh_locked().await;
        true
    }

    /// Like [`Master::refresh_catalogs`], but waits for a running refresh and
    /// then does a fresh one.
    async fn sync_catalogs(&self) {
        let _pass = self.refresh_pass.lock().await;
        self.refresh_locked().await;
    }

    async fn refresh_locked(&self) {
        let links: Vec<NodeLink> = {
            let mut registry = self.registry();
            registry.liveness_sweep(now_ms());
            let mut engine = self.engine();
            for entry in registry.entries().filter(|entry| !entry.alive) {
                engine.store_snapshot(entry.id.clone(), Catalog::new());
            }
            registry.alive().map(|entry| entry.link.clone()).collect()
        };

        let after = self.config.rpc_timeout();
        let mut queries = JoinSet::new();
        for link in links {
            queries.spawn(async move {
                let result = query_catalog(&link, after).await;
                (link.node().clone(), result)
            });
        }

        let mut fresh = Vec::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((node, Ok(catalog))) => fresh.push((node, catalog)),
                Ok((node, Err(e))) => warn!("Failed to get the catalog of {}: {}", node, e),
                Err(e) => error!("Catalog query task failed: {}", e),
            }
        }

        let mut engine = self.engine();
        for (node, catalog) in fresh {
            engine.store_snapshot(node, catalog);
        }
        engine.rebuild_view();
    }

    /// Pulls one node's catalog right away, used when a node (re)connects.
    pub async fn refresh_node(&self, link: NodeLink) {
        match query_catalog(&link, self.config.rpc_timeout()).await {
            Ok(catalog) => {
                let mut engine = self.engine();
                engine.store_snapshot(link.node().clone(), catalog);
                engine.rebuild_view();
            }
            Err(e) => warn!("Failed to get the catalog of {}: {}", link.node(), e),
        }
    }

    /// Runs one validation pass over every file in the view and returns the
    /// number of files that needed a repair, whether or not it succeeded.
    /// Failed repairs are retried next pass.
    pub async fn validate_and_repair(&self) -> usize {
        let Ok(_pass) = self.repair_pass.try_lock() else {
            debug!("Repair pass already running, skipping");
            return 0;
        };

        let (plan, links) = {
            let registry = self.registry();
            let mut engine = self.engine();
            (engine.plan_repairs(&registry, now_ms()), alive_links(&registry))
        };
        let updated = plan.tasks.len() + plan.unplanned;
        if updated == 0 {
            return 0;
        }

        let links = Arc::new(links);
        let timeouts = replication::RepairTimeouts::from(&self.config);
        let mut repairs = JoinSet::new();
        for task in plan.tasks.iter().cloned() {
            let links = links.clone();
            repairs.spawn(async move {
                let result = replication::execute(&task, &links, timeouts).await;
                (task, result)
            });
        }

        let mut repaired = 0;
        while let Some(joined) = repairs.join_next().await {
            match joined {
                Ok((task, Ok(()))) => {
                    debug!("Done fixing {}", task.file);
                    repaired += 1;
                }
                Ok((task, Err(e))) => {
                    warn!("Failed to repair {} ({}): {}", task.file, e.kind(), e)
                }
                Err(e) => error!("Repair task failed: {}", e),
            }
        }

        {
            let mut engine = self.engine();
            for task in &plan.tasks {
                engine.unlock(&task.file);
            }
        }

        info!("Repaired {} of {} files, refreshing catalogs", repaired, updated);
        self.sync_catalogs().await;
        updated
    }

    /// Stores a new file on the least-loaded live nodes. Returns its id and
    /// how many nodes took it; repair tops up a partial placement later.
    pub async fn submit_add(
        &self,
        name: impl Into<String>,
        size: u64,
        content: Vec<u8>,
    ) -> Result<(FileId, usize)> {
        let id = FileId::generate();
        let meta = FileMeta {
            name: name.into(),
            size,
        };

        let targets: Vec<NodeLink> = {
            let registry = self.registry();
            let mut alive: Vec<&NodeEntry> = registry.alive().collect();
            alive.sort_by_key(|entry| entry.file_count);
            alive
                .into_iter()
                .take(self.config.replica_factor)
                .map(|entry| entry.link.clone())
                .collect()
        };
        if targets.is_empty() {
            return Err(Error::Capacity(id));
        }

        let after = self.config.rpc_timeout();
        let content = Arc::new(content);
        let mut writes = JoinSet::new();
        for link in targets {
            let request = Request::Add(AddRequest {
                id: id.clone(),
                version: 1,
                content: content.as_ref().clone(),
                meta: meta.clone(),
            });
            writes.spawn(async move {
                let result = link.call(request, after).await;
                (link.node().clone(), result)
            });
        }

        let (written, failure) = settle_writes(&mut writes).await;
        if let (0, Some(e)) = (written, failure) {
            return Err(e);
        }
        info!("Stored {} ({}) on {} nodes", id, meta.name, written);

        self.sync_catalogs().await;
        Ok((id, written))
    }

    /// Erases a file from every live holder. Waits for a repair in flight on
    /// the same file to finish first.
    pub async fn submit_delete(&self, id: &FileId) -> Result<usize> {
        loop {
            {
                let mut engine = self.engine();
                if engine.view().get(id).is_none() {
                    return Err(Error::NotFound(id.clone()));
                }
                if engine.try_lock(id) {
                    break;
                }
            }
            tokio::time::sleep(DELETE_LOCK_POLL).await;
        }

        let result = self.delete_everywhere(id).await;
        self.engine().unlock(id);
        let deleted = result?;

        info!("Deleted {} from {} nodes", id, deleted);
        self.sync_catalogs().await;
        Ok(deleted)
    }

    async fn delete_everywhere(&self, id: &FileId) -> Result<usize> {
        let links: Vec<NodeLink> = {
            let registry = self.registry();
            let engine = self.engine();
            let holders = engine
                .view()
                .get(id)
                .map(|entry| entry.holder_ids())
                .unwrap_or_default();
            holders
                .iter()
                .filter_map(|node| registry.alive_link(node))
                .collect()
        };

        let after = self.config.rpc_timeout();
        let mut deletes = JoinSet::new();
        for link in links {
            let request = Request::Delete(DeleteRequest {
                id: id.clone(),
                version: None,
                force: true,
            });
            deletes.spawn(async move {
                let result = link.call(request, after).await;
                (link.node().clone(), result)
            });
        }

        let (deleted, failure) = settle_writes(&mut deletes).await;
        match failure {
            Some(e) if deleted == 0 => Err(e),
            _ => Ok(deleted),
        }
    }

    /// Starts the liveness, refresh and repair loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweep = self.clone();
        let refresh = self.clone();
        let repair = self.clone();
        vec![
            spawn_every(self.config.liveness_sweep_interval(), move || {
                sweep.liveness_sweep();
                async {}
            }),
            spawn_every(self.config.catalog_refresh_interval(), move || {
                let master = refresh.clone();
                async move {
                    master.refresh_catalogs().await;
                }
            }),
            spawn_every(self.config.repair_interval(), move || {
                let master = repair.clone();
                async move {
                    master.validate_and_repair().await;
                }
            }),
        ]
    }

    /// Starts the loops and accepts node connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let _loops = self.start();
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Master listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let master = self.clone();
            tokio::spawn(async move {
                if let Err(e) = master.handle_connection(stream, peer).await {
                    warn!("Connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!("Accepted connection from {}", peer);
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, rx));
        let connection = Arc::new(Connection::new(tx));
        let mut node: Option<NodeId> = None;

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
                Ok(Frame::Heartbeat(heartbeat)) => {
                    let link = NodeLink::remote(heartbeat.id.clone(), connection.clone());
                    self.handle_heartbeat(&heartbeat, link.clone());
                    if node.is_none() {
                        node = Some(heartbeat.id.clone());
                        let master = self.clone();
                        tokio::spawn(async move { master.refresh_node(link).await });
                    }
                }
                Ok(Frame::Response { call_id, outcome }) => connection.deliver(call_id, outcome),
                Ok(other) => debug!("Ignoring unexpected frame from {}: {:?}", peer, other),
                Err(e) => warn!("Dropping undecodable frame from {}: {}", peer, e),
            }
        };

        connection.close();
        writer_task.abort();
        match node {
            Some(node) => warn!("Node {} disconnected", node),
            None => debug!("Connection from {} closed before any heartbeat", peer),
        }
        result
    }
}

async fn query_catalog(link: &NodeLink, after: Duration) -> Result<Catalog> {
    link.call(Request::MetaQuery, after).await?.into_catalog()
}

fn alive_links(registry: &NodeRegistry) -> BTreeMap<NodeId, NodeLink> {
    registry
        .alive()
        .map(|entry| (entry.id.clone(), entry.link.clone()))
        .collect()
}

/// Waits for every call in `calls`. Returns how many succeeded and the first
/// failure, if any.
async fn settle_writes<T: 'static>(
    calls: &mut JoinSet<(NodeId, Result<T>)>,
) -> (usize, Option<Error>) {
    let mut succeeded = 0;
    let mut failure = None;
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok((_, Ok(_))) => succeeded += 1,
            Ok((node, Err(e))) => {
                warn!("Call to {} failed ({}): {}", node, e.kind(), e);
                failure.get_or_insert(e);
            }
            Err(e) => error!("Call task failed: {}", e),
        }
    }
    (succeeded, failure)
}

fn spawn_every<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick().await;
        }
    })
}
