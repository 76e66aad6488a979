//! Calls from the master to its nodes.
//!
//! A [`NodeLink`] is the master's handle on one node. Remote nodes are reached
//! through a [`Connection`] multiplexing calls over the node's TCP stream;
//! in-process nodes are called directly through a [`LocalNode`]. Either way a
//! call settles exactly once: with the node's answer or with its timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::common::NodeId;
use crate::error::{Error, Result};
use crate::node::NodeAgent;
use crate::protocol::{Frame, Outcome, Request, Response};

/// Calls waiting for their response frame, keyed by call id.
///
/// Removing an entry is what settles a call, so whichever of the response or
/// the timeout gets there first wins and the other finds nothing to settle.
#[derive(Default)]
pub struct PendingCalls {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
}

impl PendingCalls {
    fn calls(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Outcome>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self) -> (u64, oneshot::Receiver<Outcome>) {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls().insert(call_id, tx);
        (call_id, rx)
    }

    /// Hands the outcome to the waiting caller. Returns false when the call
    /// was already settled, timed out or never existed.
    pub fn settle(&self, call_id: u64, outcome: Outcome) -> bool {
        match self.calls().remove(&call_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drops a call whose caller gave up on it.
    pub fn forget(&self, call_id: u64) -> bool {
        self.calls().remove(&call_id).is_some()
    }

    /// Wakes every waiting caller with a closed channel.
    pub fn fail_all(&self) {
        self.calls().clear();
    }

    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The master's side of one node's TCP stream.
pub struct Connection {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: PendingCalls,
    connected: AtomicBool,
}

impl Connection {
    /// Frames pushed to `outbound` are written to the stream by the owner of
    /// the receiving end.
    pub fn new(outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            outbound,
            pending: PendingCalls::default(),
            connected: AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Marks the stream gone and fails every call still waiting on it.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.pending.fail_all();
    }

    /// Routes a response frame to its caller. Late or duplicate responses
    /// are dropped.
    pub fn deliver(&self, call_id: u64, outcome: Outcome) {
        if !self.pending.settle(call_id, outcome) {
            debug!("Dropping response to settled call {}", call_id);
        }
    }

    pub async fn call(&self, node: &NodeId, request: Request, after: Duration) -> Result<Response> {
        if !self.is_connected() {
            return Err(Error::Disconnected(node.clone()));
        }
        let name = request.name();
        let (call_id, rx) = self.pending.register();
        let frame = match Frame::request(call_id, &request) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.forget(call_id);
                return Err(e);
            }
        };
        if self.outbound.send(frame).is_err() {
            self.pending.forget(call_id);
            return Err(Error::Disconnected(node.clone()));
        }

        match tokio::time::timeout(after, rx).await {
            Ok(Ok(outcome)) => outcome.map_err(|message| Error::Remote {
                node: node.clone(),
                message,
            }),
            Ok(Err(_)) => Err(Error::Disconnected(node.clone())),
            Err(_) => {
                self.pending.forget(call_id);
                Err(Error::Timeout {
                    node: node.clone(),
                    request: name,
                    after,
                })
            }
        }
    }
}

/// A node running inside the master's process, called without a socket.
pub struct LocalNode {
    agent: Arc<NodeAgent>,
    connected: AtomicBool,
}

impl LocalNode {
    pub fn new(agent: Arc<NodeAgent>) -> Self {
        Self {
            agent,
            connected: AtomicBool::new(true),
        }
    }

    pub fn agent(&self) -> &Arc<NodeAgent> {
        &self.agent
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn call(&self, node: &NodeId, request: Request, after: Duration) -> Result<Response> {
        if !self.is_connected() {
            return Err(Error::Disconnected(node.clone()));
        }
        let name = request.name();
        match tokio::time::timeout(after, self.agent.handle(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::Remote {
                node: node.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout {
                node: node.clone(),
                request: name,
                after,
            }),
        }
    }
}

#[derive(Clone)]
enum Transport {
    Remote(Arc<Connection>),
    Local(Arc<LocalNode>),
}

/// The master's handle on one node.
#[derive(Clone)]
pub struct NodeLink {
    node: NodeId,
    transport: Transport,
}

impl NodeLink {
    pub fn remote(node: NodeId, connection: Arc<Connection>) -> Self {
        Self {
            node,
            transport: Transport::Remote(connection),
        }
    }

    pub fn local(node: NodeId, local: Arc<LocalNode>) -> Self {
        Self {
            node,
            transport: Transport::Local(local),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn is_connected(&self) -> bool {
        match &self.transport {
            Transport::Remote(connection) => connection.is_connected(),
            Transport::Local(local) => local.is_connected(),
        }
    }

    /// Issues one call and waits at most `after` for its outcome.
    pub async fn call(&self, request: Request, after: Duration) -> Result<Response> {
        match &self.transport {
            Transport::Remote(connection) => connection.call(&self.node, request, after).await,
            Transport::Local(local) => local.call(&self.node, request, after).await,
        }
    }
}

/// Drains `rx` onto `writer`, one encoded frame per line, until every sender
/// is gone or the stream fails.
pub async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Frame>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let line = frame.encode()?;
        writer.write_all(line.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new(tx)), rx)
    }

    fn call_id_of(frame: Frame) -> u64 {
        match frame {
            Frame::Request { call_id, .. } => call_id,
            other => panic!("expected a request frame, got {other:?}"),
        }
    }

    #[test]
    fn call_settles_only_once() {
        let pending = PendingCalls::default();
        let (call_id, mut rx) = pending.register();

        assert!(pending.settle(call_id, Ok(Response::Ack)));
        assert!(!pending.settle(call_id, Err("second answer".into())));
        assert_eq!(rx.try_recv().unwrap(), Ok(Response::Ack));
        assert!(pending.is_empty());
    }

    #[test]
    fn late_response_after_timeout_is_dropped() {
        let pending = PendingCalls::default();
        let (call_id, rx) = pending.register();

        // The caller times out and walks away.
        assert!(pending.forget(call_id));
        drop(rx);

        assert!(!pending.settle(call_id, Ok(Response::Ack)));
    }

    #[tokio::test]
    async fn remote_call_resolves_with_response() {
        let (connection, mut rx) = connection();
        let node = NodeId::from("n1");

        let caller = {
            let connection = connection.clone();
            let node = node.clone();
            tokio::spawn(async move {
                connection
                    .call(&node, Request::MetaQuery, Duration::from_secs(5))
                    .await
            })
        };

        let call_id = call_id_of(rx.recv().await.unwrap());
        connection.deliver(call_id, Ok(Response::Catalog { files: Default::default() }));

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.into_catalog().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn remote_error_maps_to_remote() {
        let (connection, mut rx) = connection();
        let node = NodeId::from("n1");

        let caller = {
            let connection = connection.clone();
            let node = node.clone();
            tokio::spawn(async move {
                connection
                    .call(&node, Request::FileQuery { id: "f1".into() }, Duration::from_secs(5))
                    .await
            })
        };

        let call_id = call_id_of(rx.recv().await.unwrap());
        connection.deliver(call_id, Err("file f1 not found".into()));

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Remote { ref message, .. } if message.contains("not found")));
    }

    #[tokio::test]
    async fn timed_out_call_ignores_late_response() {
        let (connection, mut rx) = connection();
        let node = NodeId::from("n1");

        let err = connection
            .call(&node, Request::MetaQuery, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { request: "META_QUERY", .. }));

        // The node answers after the deadline; nothing is left to settle.
        let call_id = call_id_of(rx.recv().await.unwrap());
        assert!(!connection.pending.settle(call_id, Ok(Response::Ack)));
        connection.deliver(call_id, Ok(Response::Ack));
        assert!(connection.pending.is_empty());
    }

    #[tokio::test]
    async fn closing_fails_waiting_calls() {
        let (connection, _rx) = connection();
        let node = NodeId::from("n1");

        let caller = {
            let connection = connection.clone();
            let node = node.clone();
            tokio::spawn(async move {
                connection
                    .call(&node, Request::MetaQuery, Duration::from_secs(5))
                    .await
            })
        };

        while connection.pending.is_empty() {
            tokio::task::yield_now().await;
        }
        connection.close();

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
        assert!(!connection.is_connected());

        let err = connection
            .call(&node, Request::MetaQuery, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }
}
