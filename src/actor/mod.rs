//! Actor implementation - I/O orchestration layer for the DHT.

pub(crate) mod config;
pub(crate) mod dispatcher;
mod info;
pub(crate) mod transport;

use std::time::Duration;

use flume::{Receiver, RecvError, Sender, TryRecvError};
use tracing::{debug, info, trace};

use crate::common::{
    self, Contact, Database, DhtValueEntity, Id, MessageType, RequestSpecific, RouteTable,
    SelectMode, ValueKey, FLAG_SHUTDOWN,
};
use crate::core::bootstrap::{BootstrapManager, BootstrapResult, BootstrapSeed, BootstrapState};
use crate::core::lookup::{FindValueResult, NodeLookup, NodeLookupResult, ValueLookup};
use crate::core::maintenance::{BucketRefresher, DatabaseCleaner};
use crate::core::ping::{PingProcess, PingTarget};
use crate::core::process::{AsyncProcess, Environment, FutureManager};
use crate::core::server::Server;
use crate::core::store::{StoreManager, StoreProcess, StoreResult};
use crate::core::{DhtFuture, Shared};
use crate::error::DhtError;

use config::Config;
use dispatcher::{DispatcherEvent, FloodFilter, MessageDispatcher};
use transport::{UdpTransport, MAX_THREAD_BLOCK_DURATION};

pub use info::Info;

#[derive(Debug)]
/// Owns the dispatcher and every running operation, called in the Dht thread loop.
pub(crate) struct Actor {
    config: Config,
    shared: Shared,
    receiver: Receiver<ActorMessage>,

    dispatcher: MessageDispatcher,
    manager: FutureManager,
    server: Server,

    bootstrap_manager: BootstrapManager,
    store_manager: StoreManager,
    refresher: BucketRefresher,
    cleaner: DatabaseCleaner,
}

impl Actor {
    /// Bind the transport and create the routing table and database.
    pub fn new(mut config: Config, receiver: Receiver<ActorMessage>) -> std::io::Result<Self> {
        let transport = match config.transport.take() {
            Some(transport) => transport,
            None => Box::new(UdpTransport::bind(config.port)?),
        };

        let id = config.local_id.unwrap_or_else(Id::random);
        let local = config.local_contact(id, transport.local_addr());

        let shared = Shared::new(
            RouteTable::with_settings(local.clone(), config.route_table_settings()),
            Database::new(config.database_settings()),
        );

        let filter = match config.host_filter.take() {
            Some(filter) => filter,
            None => Box::new(FloodFilter::new(
                config.max_requests_per_window,
                config.flood_window,
            )),
        };

        let dispatcher = MessageDispatcher::new(
            transport,
            local,
            shared.routing_table.clone(),
            filter,
            config.request_timeout,
        );

        info!(
            id = ?dispatcher.local_contact().id,
            address = ?dispatcher.local_addr(),
            "Mojito DHT listening"
        );

        Ok(Self {
            server: Server::new(config.k, config.token_rotate_interval),
            store_manager: StoreManager::new(config.max_concurrent_stores),
            refresher: BucketRefresher::new(config.bucket_refresh_tick),
            cleaner: DatabaseCleaner::new(config.database_cleaner_tick),
            bootstrap_manager: BootstrapManager::new(),
            manager: FutureManager::new(),
            dispatcher,
            receiver,
            shared,
            config,
        })
    }

    // === Getters ===

    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn local_contact(&self) -> &Contact {
        self.dispatcher.local_contact()
    }

    pub fn info(&self) -> Info {
        Info::new(self)
    }

    // === Public Methods ===

    /// Run until the Dht is closed or every handle is dropped.
    pub fn run(mut self) {
        while self.tick().is_ok() {}
    }

    /// Handle pending commands, one incoming message, expired requests and
    /// maintenance.
    ///
    /// Returns an error once the actor should stop.
    pub fn tick(&mut self) -> Result<(), RecvError> {
        loop {
            match self.receiver.try_recv() {
                Ok(ActorMessage::Close(sender)) => {
                    self.close();
                    let _ = sender.send(());
                    return Err(RecvError::Disconnected);
                }
                Ok(message) => self.handle_message(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Every handle was dropped, kill this thread.
                    debug!("Mojito Dht's actor thread was shutdown after Drop.");
                    self.close();
                    return Err(RecvError::Disconnected);
                }
            }
        }

        if let Some(event) = self.dispatcher.recv(MAX_THREAD_BLOCK_DURATION) {
            self.handle_event(event);
        }

        for event in self.dispatcher.expired() {
            self.handle_event(event);
        }

        self.tick_processes();
        self.periodic_maintenance();

        Ok(())
    }

    // === Private Methods ===

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Bootstrap(seeds, future) => {
                let process = self
                    .bootstrap_manager
                    .bootstrap(&self.shared.status, seeds, future);

                let timeout = self.config.bootstrap_timeout;
                self.submit(Box::new(process), timeout);
            }
            ActorMessage::Ping(target, future) => {
                let timeout = self.config.ping_timeout;
                self.submit(Box::new(PingProcess::new(target, future)), timeout);
            }
            ActorMessage::Lookup(target, future) => {
                let timeout = self.config.lookup_timeout;
                self.submit(Box::new(NodeLookup::new(target, future)), timeout);
            }
            ActorMessage::Get(key, future) => {
                let timeout = self.config.lookup_timeout;
                self.submit(Box::new(ValueLookup::new(key, future)), timeout);
            }
            ActorMessage::Put(entity, future) => {
                let timeout = self.config.store_timeout;
                self.submit(Box::new(StoreProcess::new(entity, future)), timeout);
            }
            ActorMessage::Enqueue(entity, future) => {
                self.store_manager
                    .enqueue(StoreProcess::new(entity, future));
            }
            ActorMessage::Info(sender) => {
                let _ = sender.send(self.info());
            }
            ActorMessage::Close(_) => {}
        }
    }

    fn handle_event(&mut self, event: DispatcherEvent) {
        match event {
            DispatcherEvent::Request {
                from,
                transaction_id,
                request,
            } => {
                trace!(context = "request", ?from, ?request, "Request");

                match self.server.handle_request(&self.shared, &from, request) {
                    MessageType::Response(response) => {
                        self.dispatcher
                            .response(from.address, transaction_id, response)
                    }
                    MessageType::Error(error) => {
                        self.dispatcher.error(from.address, transaction_id, error)
                    }
                    MessageType::Request(_) => {}
                }
            }
            event => {
                let mut env = Environment {
                    config: &self.config,
                    shared: &self.shared,
                    dispatcher: &mut self.dispatcher,
                };

                self.manager.handle_event(&mut env, event);
            }
        }
    }

    fn submit(&mut self, process: Box<dyn AsyncProcess>, timeout: Duration) {
        let mut env = Environment {
            config: &self.config,
            shared: &self.shared,
            dispatcher: &mut self.dispatcher,
        };

        self.manager.submit(&mut env, process, timeout);
    }

    fn tick_processes(&mut self) {
        let mut env = Environment {
            config: &self.config,
            shared: &self.shared,
            dispatcher: &mut self.dispatcher,
        };

        self.manager.tick(&mut env);

        for process in self.store_manager.poll() {
            let timeout = self.config.store_timeout;
            self.submit(Box::new(process), timeout);
        }
    }

    /// Bucket refreshes and database cleanup, both driven by their own ticks.
    fn periodic_maintenance(&mut self) {
        let state = self.shared.status.get();

        if let Some(refresh) = self.refresher.poll(state) {
            let timeout = self.config.lookup_timeout;
            self.submit(Box::new(refresh), timeout);
        }

        let republish =
            self.cleaner
                .poll(&self.shared.database, state, self.config.republish_interval);

        if !republish.is_empty() {
            debug!(values = republish.len(), "Republishing local values");
        }

        for entity in republish {
            self.store_manager
                .enqueue(StoreProcess::new(entity, DhtFuture::new()));
        }
    }

    /// Tell the closest nodes we are leaving, then cancel everything.
    fn close(&mut self) {
        if self.shared.status.get() == BootstrapState::Ready {
            let local = self.dispatcher.local_contact().clone();
            let leaving = local.clone().with_flags(local.flags | FLAG_SHUTDOWN);

            self.dispatcher.set_local_contact(leaving);

            let contacts = common::read(&self.shared.routing_table).select(
                &local.id,
                self.config.k * 2,
                SelectMode::Alive,
            );

            debug!(contacts = contacts.len(), "Notifying the closest nodes of shutdown");

            for contact in contacts {
                let _ = self.dispatcher.request(
                    None,
                    contact.address,
                    Some(contact.id),
                    RequestSpecific::Ping,
                    None,
                );
            }
        }

        self.manager.close(&mut self.dispatcher);
        self.store_manager.close();
        self.bootstrap_manager.close(&self.shared.status);

        // Commands sent while closing.
        self.shared.set_closed();
        for message in self.receiver.try_iter() {
            message.closed();
        }

        info!(address = ?self.dispatcher.local_addr(), "Mojito DHT closed");
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Bootstrap(Vec<BootstrapSeed>, DhtFuture<BootstrapResult>),
    Ping(PingTarget, DhtFuture<Contact>),
    Lookup(Id, DhtFuture<NodeLookupResult>),
    Get(ValueKey, DhtFuture<FindValueResult>),
    Put(DhtValueEntity, DhtFuture<StoreResult>),
    Enqueue(DhtValueEntity, DhtFuture<StoreResult>),
    Info(Sender<Info>),
    Close(Sender<()>),
}

impl ActorMessage {
    /// Fail the future of a command that will never be handled.
    pub(crate) fn closed(self) {
        match self {
            ActorMessage::Bootstrap(_, future) => {
                future.set_error(DhtError::Closed);
            }
            ActorMessage::Ping(_, future) => {
                future.set_error(DhtError::Closed);
            }
            ActorMessage::Lookup(_, future) => {
                future.set_error(DhtError::Closed);
            }
            ActorMessage::Get(_, future) => {
                future.set_error(DhtError::Closed);
            }
            ActorMessage::Put(_, future) | ActorMessage::Enqueue(_, future) => {
                future.set_error(DhtError::Closed);
            }
            ActorMessage::Info(_) => {}
            ActorMessage::Close(sender) => {
                let _ = sender.send(());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::actor::transport::MemoryNetwork;

    fn actor(network: &MemoryNetwork) -> (Actor, Sender<ActorMessage>) {
        let (sender, receiver) = flume::unbounded();

        let config = Config {
            transport: Some(Box::new(network.transport())),
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };

        (Actor::new(config, receiver).unwrap(), sender)
    }

    #[test]
    fn answers_pings() {
        let network = MemoryNetwork::new();

        let (mut a, sender_a) = actor(&network);
        let (b, sender_b) = actor(&network);

        let b_address = b.local_contact().address;
        let b_id = b.local_contact().id;
        let handle = thread::spawn(move || b.run());

        let future = DhtFuture::new();
        sender_a
            .send(ActorMessage::Ping(PingTarget::Address(b_address), future.clone()))
            .unwrap();

        while !future.is_done() {
            a.tick().unwrap();
        }

        assert_eq!(future.try_result().unwrap().unwrap().id, b_id);
        assert!(common::read(&a.shared().routing_table).get(&b_id).is_some());

        drop(sender_b);
        handle.join().unwrap();
    }

    #[test]
    fn close_fails_pending_commands() {
        let network = MemoryNetwork::new();
        let (mut a, sender) = actor(&network);

        let (close_sender, close_receiver) = flume::bounded(1);
        let lookup = DhtFuture::new();

        sender.send(ActorMessage::Close(close_sender)).unwrap();
        sender
            .send(ActorMessage::Lookup(Id::random(), lookup.clone()))
            .unwrap();

        assert!(a.tick().is_err());
        assert!(close_receiver.recv().is_ok());
        assert!(matches!(lookup.try_result(), Some(Err(DhtError::Closed))));
    }
}
