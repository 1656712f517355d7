#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;
use graviti::{
    config::Config, message::Envelope, ring::nearest_id, router::NextHop, NodeEvent, NodeId,
    OverlayNode, ProcessData,
};
use time::OffsetDateTime;
use tracing_subscriber::{fmt, EnvFilter};

#[allow(dead_code)]
pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Application messages delivered to a node: source, uri and text.
pub type Inbox = Rc<RefCell<Vec<(NodeId, String, String)>>>;

pub struct Data(String);

impl TryFrom<Bytes> for Data {
    type Error = std::string::FromUtf8Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        String::from_utf8(bytes.to_vec()).map(Data)
    }
}

impl ProcessData<Inbox> for Data {
    fn process_data(&self, state: Inbox, source: NodeId, uri: &str) {
        state.borrow_mut().push((source, uri.to_owned(), self.0.clone()));
    }
}

/// Nodes exchanging envelopes instantly, on a simulated clock.
pub struct Network {
    pub now: OffsetDateTime,
    nodes: HashMap<SocketAddr, OverlayNode>,
    inboxes: HashMap<SocketAddr, Inbox>,
    events: HashMap<SocketAddr, Vec<NodeEvent>>,
    offline: HashSet<SocketAddr>,
    queue: VecDeque<(SocketAddr, Envelope)>,
    next_port: u16,
}

impl Network {
    pub fn new() -> Self {
        Self {
            now: OffsetDateTime::now_utc(),
            nodes: HashMap::new(),
            inboxes: HashMap::new(),
            events: HashMap::new(),
            offline: HashSet::new(),
            queue: VecDeque::new(),
            next_port: 4000,
        }
    }

    /// Adds a node with the given identifier, returns its address.
    pub fn add_node(&mut self, id: NodeId, config: Config) -> SocketAddr {
        let addr: SocketAddr = format!("127.0.0.1:{}", self.next_port).parse().unwrap();
        self.next_port += 1;

        self.nodes
            .insert(addr, OverlayNode::new(id, addr, config).unwrap());
        self.inboxes.insert(addr, Inbox::default());

        addr
    }

    /// Adds a node and joins it through `bootstrap`, delivering everything that follows.
    pub fn add_and_join(&mut self, id: NodeId, config: Config, bootstrap: &str) -> SocketAddr {
        let addr = self.add_node(id, config);
        self.join(addr, bootstrap);

        addr
    }

    pub fn join(&mut self, addr: SocketAddr, bootstrap: &str) {
        let now = self.now;
        self.node_mut(addr).join(bootstrap, now).unwrap();
        self.deliver_all();
    }

    pub fn node(&self, addr: SocketAddr) -> &OverlayNode {
        &self.nodes[&addr]
    }

    pub fn node_mut(&mut self, addr: SocketAddr) -> &mut OverlayNode {
        self.nodes.get_mut(&addr).unwrap()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.nodes
            .keys()
            .filter(|addr| !self.offline.contains(addr))
            .copied()
            .collect()
    }

    pub fn id(&self, addr: SocketAddr) -> NodeId {
        self.node(addr).local_id()
    }

    pub fn inbox(&self, addr: SocketAddr) -> Vec<(NodeId, String, String)> {
        self.inboxes[&addr].borrow().clone()
    }

    /// Returns the events raised by a node so far and forgets them.
    pub fn take_events(&mut self, addr: SocketAddr) -> Vec<NodeEvent> {
        self.collect_events();
        self.events.remove(&addr).unwrap_or_default()
    }

    /// Makes a node unreachable without it leaving.
    pub fn kill(&mut self, addr: SocketAddr) {
        self.offline.insert(addr);
    }

    pub fn revive(&mut self, addr: SocketAddr) {
        self.offline.remove(&addr);
    }

    /// Gracefully removes a node.
    pub fn leave(&mut self, addr: SocketAddr) {
        self.node_mut(addr).leave();
        self.deliver_all();
        self.offline.insert(addr);
    }

    /// Delivers envelopes until no node has anything left to send.
    pub fn deliver_all(&mut self) {
        let mut delivered = 0;

        loop {
            self.collect_outgoing();
            let (dst, envelope) = match self.queue.pop_front() {
                Some(next) => next,
                None => break,
            };

            delivered += 1;
            assert!(delivered < 1_000_000, "message storm");

            if self.offline.contains(&dst) {
                continue;
            }

            let now = self.now;
            let inbox = self.inboxes[&dst].clone();
            if let Some(node) = self.nodes.get_mut(&dst) {
                node.process_message::<Inbox, Data>(inbox, envelope, now);
            }
        }

        self.collect_events();
    }

    /// Advances the clock in steps, polling every node's timers after each.
    pub fn run_for(&mut self, duration: Duration, step: Duration) {
        let end = self.now + duration;
        while self.now < end {
            self.now += step;

            let now = self.now;
            for (addr, node) in self.nodes.iter_mut() {
                if !self.offline.contains(addr) {
                    node.poll_timers(now);
                }
            }

            self.deliver_all();
        }
    }

    /// Sends a text message from `from` towards `key`, handling it locally when `from` is the
    /// closest node.
    pub fn send_to_id(&mut self, from: SocketAddr, key: NodeId, text: &str) {
        let payload = Bytes::copy_from_slice(text.as_bytes());
        if self.node_mut(from).send_to_id(key, "test/text", payload) == NextHop::Local {
            let source = self.id(from);
            self.inboxes[&from]
                .borrow_mut()
                .push((source, "test/text".to_owned(), text.to_owned()));
        }

        self.deliver_all();
    }

    /// Returns the online node whose identifier is closest to `key`.
    pub fn closest_to(&self, key: &NodeId) -> SocketAddr {
        let ids: HashMap<NodeId, SocketAddr> = self
            .addrs()
            .into_iter()
            .map(|addr| (self.id(addr), addr))
            .collect();

        let nearest = nearest_id(key, ids.keys(), true).nearest.unwrap();
        ids[&nearest]
    }

    /// Follows next hops from `from` towards `key`, returns the node the message ends up at.
    pub fn route(&self, from: SocketAddr, key: &NodeId) -> SocketAddr {
        let mut current = from;
        for _ in 0..NodeId::DIGITS {
            match self.node(current).get_next_hop(key) {
                NextHop::Local => return current,
                NextHop::Peer { addr, .. } => current = addr,
            }
        }

        panic!("no route to {} from {}", key, from);
    }

    fn collect_outgoing(&mut self) {
        for node in self.nodes.values_mut() {
            self.queue.extend(node.take_outgoing());
        }
    }

    fn collect_events(&mut self) {
        for (addr, node) in self.nodes.iter_mut() {
            self.events
                .entry(*addr)
                .or_default()
                .extend(node.take_events());
        }
    }
}
