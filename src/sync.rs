//! A thread-safe node handle and an async driver for it.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::*;

use crate::{
    core::{config::Config, error::Error, id::NodeId, message::Envelope, traits::ProcessData},
    node::{NodeEvent, OverlayNode},
    router::NextHop,
};

/// An [`OverlayNode`] suitable for use in async contexts.
///
/// Clones share the same node. Locks are only held for the duration of each call, never across
/// an await point.
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[derive(Debug, Clone)]
pub struct SyncOverlayNode {
    node: Arc<RwLock<OverlayNode>>,
}

impl SyncOverlayNode {
    pub fn new(local_id: NodeId, local_addr: SocketAddr, config: Config) -> Result<Self, Error> {
        Ok(Self::from(OverlayNode::new(local_id, local_addr, config)?))
    }

    pub fn local_id(&self) -> NodeId {
        self.node.read().local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node.read().local_addr()
    }

    pub fn is_ready(&self) -> bool {
        self.node.read().is_ready()
    }

    pub fn get_next_hop(&self, id: &NodeId) -> NextHop {
        self.node.read().get_next_hop(id)
    }

    pub fn take_events(&self) -> Vec<NodeEvent> {
        self.node.write().take_events()
    }

    /// Locks the node for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, OverlayNode> {
        self.node.read()
    }

    /// Locks the node for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, OverlayNode> {
        self.node.write()
    }
}

impl From<OverlayNode> for SyncOverlayNode {
    fn from(node: OverlayNode) -> Self {
        Self {
            node: Arc::new(RwLock::new(node)),
        }
    }
}

/// Connects a [`SyncOverlayNode`] to a transport.
///
/// Implementors provide [`unicast`](Overlay::unicast); received envelopes are passed to
/// [`receive`](Overlay::receive) and the node's timers are driven by the task returned from
/// [`start_timers`](Overlay::start_timers).
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[async_trait::async_trait]
pub trait Overlay: Clone + Send + Sync + 'static {
    const TIMER_TICK_MILLIS: u64 = 250;

    fn node(&self) -> &SyncOverlayNode;

    /// Sends an envelope to `dst`. Delivery isn't expected to be guaranteed.
    async fn unicast(&self, dst: SocketAddr, envelope: Envelope);

    /// Sends everything the node has queued.
    async fn flush(&self) {
        let outgoing = self.node().write().take_outgoing();
        for (dst, envelope) in outgoing {
            self.unicast(dst, envelope).await;
        }
    }

    /// Joins the ring through a comma-separated list of `ip[:port]` endpoints, an empty list
    /// starts a new one.
    async fn join(&self, bootstrap: &str) -> Result<(), Error> {
        self.node()
            .write()
            .join(bootstrap, OffsetDateTime::now_utc())?;
        self.flush().await;

        Ok(())
    }

    /// Leaves the ring. The timer task should be aborted as well.
    async fn leave(&self) {
        self.node().write().leave();
        self.flush().await;
    }

    /// Spawns the task polling the node's timers.
    fn start_timers(&self) -> JoinHandle<()> {
        let overlay = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(Self::TIMER_TICK_MILLIS));
            loop {
                interval.tick().await;
                overlay
                    .node()
                    .write()
                    .poll_timers(OffsetDateTime::now_utc());
                overlay.flush().await;
            }
        })
    }

    /// Processes an envelope received from the network and sends whatever it triggers.
    async fn receive<S, T>(&self, state: S, envelope: Envelope)
    where
        S: Clone + Send + 'static,
        T: ProcessData<S> + 'static,
    {
        trace!(source = %envelope.source_addr, uri = %envelope.message.uri(), "received envelope");
        self.node()
            .write()
            .process_message::<S, T>(state, envelope, OffsetDateTime::now_utc());
        self.flush().await;
    }

    /// Sends an application message towards the node closest to `dest_id`, see
    /// [`OverlayNode::send_to_id`].
    async fn send_to_id(&self, dest_id: NodeId, uri: &str, payload: Bytes) -> NextHop {
        let next_hop = self.node().write().send_to_id(dest_id, uri, payload);
        self.flush().await;

        next_hop
    }
}
