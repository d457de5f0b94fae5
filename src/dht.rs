//! Dht node.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle, ThreadId},
};

use flume::Sender;
use tracing::debug;

use crate::{
    actor::{
        config::Config, dispatcher::AllowAll, transport::MemoryNetwork, Actor, ActorMessage, Info,
    },
    common::{Contact, DhtValue, DhtValueEntity, Id, ValueKey, ValueType},
    core::{
        BootstrapResult, BootstrapSeed, BootstrapState, DhtFuture, FindValueResult,
        NodeLookupResult, PingTarget, Shared, StoreResult,
    },
    error::DhtError,
};

#[derive(Debug, Clone)]
/// Mojito DHT node.
///
/// Cloning a Dht returns another handle to the same node, the node keeps
/// running until [Dht::close] is called or every handle is dropped.
pub struct Dht {
    sender: Sender<ActorMessage>,
    shared: Shared,
    local: Contact,
    actor_thread: ThreadId,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Dht {
    /// Create a new node, binding its transport and starting its actor thread.
    ///
    /// If [Config::bootstrap] is not empty, bootstrapping starts immediately.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let (sender, receiver) = flume::unbounded();

        let seeds: Vec<BootstrapSeed> = config
            .bootstrap
            .iter()
            .copied()
            .map(BootstrapSeed::from)
            .collect();

        let actor = Actor::new(config, receiver)?;

        let shared = actor.shared().clone();
        let local = actor.local_contact().clone();

        let handle = thread::Builder::new()
            .name("Mojito Dht".to_string())
            .spawn(move || actor.run())?;

        let dht = Dht {
            sender,
            shared,
            local,
            actor_thread: handle.thread().id(),
            handle: Arc::new(Mutex::new(Some(handle))),
        };

        if !seeds.is_empty() {
            dht.bootstrap_from(seeds);
        }

        Ok(dht)
    }

    // === Getters ===

    /// The descriptor this node sends with every message.
    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    /// Estimated number of nodes in the network.
    pub fn size(&self) -> usize {
        self.shared.size()
    }

    pub fn state(&self) -> BootstrapState {
        self.shared.status.get()
    }

    /// Returns true while a bootstrap is running.
    pub fn is_booting(&self) -> bool {
        self.state() == BootstrapState::Booting
    }

    /// Returns true once bootstrapped, until the node is closed or
    /// bootstraps again.
    pub fn is_ready(&self) -> bool {
        self.state() == BootstrapState::Ready
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Result<Info, DhtError> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtError::Closed)?;

        receiver.recv().map_err(|_| DhtError::Closed)
    }

    // === Public Methods ===

    /// Join the network through a known node or address.
    ///
    /// Cancels any bootstrap already running.
    pub fn bootstrap(&self, seed: impl Into<BootstrapSeed>) -> DhtFuture<BootstrapResult> {
        self.bootstrap_from(vec![seed.into()])
    }

    /// Join the network through the first responding seed.
    pub fn bootstrap_from(&self, seeds: Vec<BootstrapSeed>) -> DhtFuture<BootstrapResult> {
        if !self.shared.is_closed() {
            self.shared.status.set(BootstrapState::Booting);
        }

        let future = DhtFuture::new();
        let future = self.send(&future, ActorMessage::Bootstrap(seeds, future.clone()));

        if self.shared.is_closed() {
            self.shared.status.set(BootstrapState::Init);
        }

        future
    }

    /// Ping an address or contact, completes with the responder's contact.
    pub fn ping(&self, target: impl Into<PingTarget>) -> DhtFuture<Contact> {
        let future = DhtFuture::new();
        self.send(&future, ActorMessage::Ping(target.into(), future.clone()))
    }

    /// Find the k closest live nodes to `target`.
    pub fn lookup(&self, target: Id) -> DhtFuture<NodeLookupResult> {
        let future = DhtFuture::new();
        self.send(&future, ActorMessage::Lookup(target, future.clone()))
    }

    /// Find values matching `key`, locally first.
    ///
    /// Not finding anything is not an error, see [FindValueResult::found].
    pub fn get(&self, key: impl Into<ValueKey>) -> DhtFuture<FindValueResult> {
        let future = DhtFuture::new();
        self.send(&future, ActorMessage::Get(key.into(), future.clone()))
    }

    /// Store a value locally and on the k closest nodes to `key`, right away.
    pub fn put(&self, key: Id, value: DhtValue) -> DhtFuture<StoreResult> {
        let future = DhtFuture::new();
        self.send(&future, ActorMessage::Put(self.entity(key, value), future.clone()))
    }

    /// Like [Dht::put], but waits in a FIFO queue for one of
    /// [Config::max_concurrent_stores] slots.
    pub fn enqueue(&self, key: Id, value: DhtValue) -> DhtFuture<StoreResult> {
        let future = DhtFuture::new();
        self.send(&future, ActorMessage::Enqueue(self.entity(key, value), future.clone()))
    }

    /// Remove our value under `key`, locally and on the closest nodes.
    pub fn remove(&self, key: Id) -> DhtFuture<StoreResult> {
        self.put(key, DhtValue::empty(ValueType::ANY))
    }

    /// Notify the closest nodes, cancel every running operation and stop the
    /// actor thread.
    ///
    /// Every operation afterwards fails with [DhtError::Closed].
    pub fn close(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        // Closing from a listener running on the actor thread itself, the
        // actor stops once the listener returns.
        if thread::current().id() == self.actor_thread {
            let _ = self.sender.send(ActorMessage::Close(sender));
            return;
        }

        if self.sender.send(ActorMessage::Close(sender)).is_ok() {
            let _ = receiver.recv();
        }

        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                debug!("Mojito Dht's actor thread panicked");
            }
        }
    }

    // === Private Methods ===

    fn entity(&self, key: Id, value: DhtValue) -> DhtValueEntity {
        DhtValueEntity::new(self.local.clone(), key, value, true)
    }

    pub(crate) fn sender(&self) -> &Sender<ActorMessage> {
        &self.sender
    }

    /// Send a command completing `future`, which fails with [DhtError::Closed]
    /// if the actor is gone or stopping.
    fn send<T>(&self, future: &DhtFuture<T>, message: ActorMessage) -> DhtFuture<T>
    where
        T: Clone + Send + 'static,
    {
        match self.sender.send(message) {
            Ok(()) => {
                // Sent after the actor drained its mailbox.
                if self.shared.is_closed() {
                    future.set_error(DhtError::Closed);
                }
            }
            Err(flume::SendError(message)) => message.closed(),
        }

        future.clone()
    }
}

#[derive(Debug)]
/// Create a testnet of Dht nodes on an in-memory network, to run tests
/// without touching the real network.
pub struct Testnet {
    pub network: MemoryNetwork,
    /// Addresses of the testnet's nodes, to bootstrap from.
    pub bootstrap: Vec<SocketAddr>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Create `count` nodes, each bootstrapped from the first one.
    ///
    /// Fails if any node fails to bootstrap.
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let network = MemoryNetwork::new();

        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            let node = Dht::new(Testnet::config(&network))?;

            if i > 0 {
                Testnet::join(&node, nodes[0].local_contact().address)?;
            }

            bootstrap.push(node.local_contact().address);
            nodes.push(node);
        }

        if let Some(seed) = nodes.get(1) {
            Testnet::join(&nodes[0], seed.local_contact().address)?;
        }

        Ok(Self {
            network,
            bootstrap,
            nodes,
        })
    }

    /// A [Config] for a new node on the same network, not bootstrapped yet.
    pub fn node_config(&self) -> Config {
        Testnet::config(&self.network)
    }

    fn join(node: &Dht, seed: SocketAddr) -> Result<(), std::io::Error> {
        node.bootstrap(seed).wait().map(|_| ()).map_err(|error| {
            debug!(?seed, ?error, "Testnet node failed to bootstrap");

            std::io::Error::new(std::io::ErrorKind::Other, error)
        })
    }

    fn config(network: &MemoryNetwork) -> Config {
        Config {
            transport: Some(Box::new(network.transport())),
            // Every node of the network shares the same ip.
            host_filter: Some(Box::new(AllowAll)),
            ..Default::default()
        }
    }
}

impl Drop for Testnet {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.close();
        }
    }
}
