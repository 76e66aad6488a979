//! Node registry.
//!
//! Liveness of every node the master has ever heard from, driven purely by
//! heartbeats. Entries are never removed: a silent node is marked dead and
//! brought back by its next heartbeat, flagged unhealthy from then on.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::common::{duration_ms, elapsed_ms, NodeId};
use crate::protocol::Heartbeat;
use crate::rpc::NodeLink;

pub struct NodeEntry {
    pub id: NodeId,
    pub link: NodeLink,
    pub alive: bool,
    /// Cleared when a dead node comes back. Nothing sets it again.
    pub healthy: bool,
    pub first_seen: u64,
    pub last_restart: u64,
    pub last_heartbeat: u64,
    pub last_death: Option<u64>,
    pub file_count: usize,
}

/// Read-only summary of a node, for reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub alive: bool,
    pub healthy: bool,
    pub first_seen: u64,
    pub last_restart: u64,
    pub last_heartbeat: u64,
    pub last_death: Option<u64>,
    pub file_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// First heartbeat ever seen from this node.
    Joined,
    Refreshed,
    /// The node had been declared dead.
    Reconnected,
}

pub struct NodeRegistry {
    nodes: BTreeMap<NodeId, NodeEntry>,
    connection_timeout_ms: u64,
}

impl NodeRegistry {
    pub fn new(connection_timeout: Duration) -> Self {
        Self {
            nodes: BTreeMap::new(),
            connection_timeout_ms: duration_ms(connection_timeout),
        }
    }

    pub fn record_heartbeat(
        &mut self,
        heartbeat: &Heartbeat,
        link: NodeLink,
        now: u64,
    ) -> HeartbeatOutcome {
        let Some(entry) = self.nodes.get_mut(&heartbeat.id) else {
            info!("New node connected: {}", heartbeat.id);
            self.nodes.insert(
                heartbeat.id.clone(),
                NodeEntry {
                    id: heartbeat.id.clone(),
                    link,
                    alive: true,
                    healthy: true,
                    first_seen: now,
                    last_restart: now,
                    last_heartbeat: now,
                    last_death: None,
                    file_count: heartbeat.file_count,
                },
            );
            return HeartbeatOutcome::Joined;
        };

        entry.last_heartbeat = now;
        entry.file_count = heartbeat.file_count;
        entry.link = link;

        if entry.alive {
            return HeartbeatOutcome::Refreshed;
        }

        info!("Node reconnected: {}", heartbeat.id);
        entry.alive = true;
        entry.healthy = false;
        entry.last_restart = now;
        HeartbeatOutcome::Reconnected
    }

    /// Marks dead every alive node that has been silent for the connection
    /// timeout or whose transport is gone. Returns the nodes that just died.
    pub fn liveness_sweep(&mut self, now: u64) -> Vec<NodeId> {
        let mut died = Vec::new();
        for entry in self.nodes.values_mut().filter(|entry| entry.alive) {
            let silent_for = elapsed_ms(now, entry.last_heartbeat);
            if silent_for >= self.connection_timeout_ms || !entry.link.is_connected() {
                entry.alive = false;
                entry.last_death = Some(now);
                warn!("Node just died: {} (silent for {} ms)", entry.id, silent_for);
                died.push(entry.id.clone());
            }
        }
        died
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    pub fn alive(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values().filter(|entry| entry.alive)
    }

    /// Link to `id` if the node is currently alive.
    pub fn alive_link(&self, id: &NodeId) -> Option<NodeLink> {
        self.nodes
            .get(id)
            .filter(|entry| entry.alive)
            .map(|entry| entry.link.clone())
    }

    pub fn list_nodes(&self) -> Vec<NodeStatus> {
        self.nodes
            .values()
            .map(|entry| NodeStatus {
                id: entry.id.clone(),
                alive: entry.alive,
                healthy: entry.healthy,
                first_seen: entry.first_seen,
                last_restart: entry.last_restart,
                last_heartbeat: entry.last_heartbeat,
                last_death: entry.last_death,
                file_count: entry.file_count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::rpc::Connection;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(20);

    fn link(id: &str) -> (NodeLink, Arc<Connection>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::new(tx));
        (NodeLink::remote(NodeId::from(id), connection.clone()), connection, rx)
    }

    fn heartbeat(id: &str, file_count: usize) -> Heartbeat {
        Heartbeat {
            id: NodeId::from(id),
            file_count,
        }
    }

    #[test]
    fn first_heartbeat_creates_healthy_entry() {
        let mut registry = NodeRegistry::new(TIMEOUT);
        let (link, _conn, _rx) = link("a");

        let outcome = registry.record_heartbeat(&heartbeat("a", 4), link, 1_000);
        assert_eq!(outcome, HeartbeatOutcome::Joined);

        let entry = registry.get(&NodeId::from("a")).unwrap();
        assert!(entry.alive && entry.healthy);
        assert_eq!(entry.first_seen, 1_000);
        assert_eq!(entry.last_restart, 1_000);
        assert_eq!(entry.file_count, 4);
    }

    #[test]
    fn node_dies_exactly_at_connection_timeout() {
        let mut registry = NodeRegistry::new(TIMEOUT);
        let (link, _conn, _rx) = link("a");
        registry.record_heartbeat(&heartbeat("a", 0), link, 1_000);

        let boundary = 1_000 + 20_000;
        assert!(registry.liveness_sweep(boundary - 1).is_empty());
        assert!(registry.get(&NodeId::from("a")).unwrap().alive);

        assert_eq!(registry.liveness_sweep(boundary), vec![NodeId::from("a")]);
        let entry = registry.get(&NodeId::from("a")).unwrap();
        assert!(!entry.alive);
        assert_eq!(entry.last_death, Some(boundary));

        // Already dead nodes are not reported twice.
        assert!(registry.liveness_sweep(boundary + 5_000).is_empty());
    }

    #[test]
    fn disconnected_transport_kills_node_early() {
        let mut registry = NodeRegistry::new(TIMEOUT);
        let (link, conn, _rx) = link("a");
        registry.record_heartbeat(&heartbeat("a", 0), link, 1_000);

        conn.close();
        assert_eq!(registry.liveness_sweep(1_001), vec![NodeId::from("a")]);
    }

    #[test]
    fn reconnection_restores_alive_but_not_healthy() {
        let mut registry = NodeRegistry::new(TIMEOUT);
        let (first, _c1, _r1) = link("a");
        registry.record_heartbeat(&heartbeat("a", 1), first, 1_000);
        registry.liveness_sweep(30_000);

        let (second, _c2, _r2) = link("a");
        let outcome = registry.record_heartbeat(&heartbeat("a", 3), second, 40_000);
        assert_eq!(outcome, HeartbeatOutcome::Reconnected);

        let entry = registry.get(&NodeId::from("a")).unwrap();
        assert!(entry.alive);
        assert!(!entry.healthy);
        assert_eq!(entry.last_restart, 40_000);
        assert_eq!(entry.first_seen, 1_000);
        assert_eq!(entry.file_count, 3);

        // Staying up does not bring health back.
        let (third, _c3, _r3) = link("a");
        assert_eq!(
            registry.record_heartbeat(&heartbeat("a", 3), third, 45_000),
            HeartbeatOutcome::Refreshed
        );
        assert!(!registry.get(&NodeId::from("a")).unwrap().healthy);
    }

    #[test]
    fn list_nodes_reports_every_entry_in_id_order() {
        let mut registry = NodeRegistry::new(TIMEOUT);
        for id in ["c", "a", "b"] {
            let (link, _conn, _rx) = link(id);
            registry.record_heartbeat(&heartbeat(id, 0), link, 1_000);
        }
        registry.liveness_sweep(50_000);

        let nodes = registry.list_nodes();
        let ids: Vec<_> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(nodes.iter().all(|n| !n.alive));
        assert!(registry.alive_link(&NodeId::from("a")).is_none());
    }
}
