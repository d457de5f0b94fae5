//! Multi round operations and the manager driving them.

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::{RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::actor::config::Config;
use crate::actor::dispatcher::{DispatcherEvent, MessageDispatcher};
use crate::common::{
    self, Contact, Database, ErrorSpecific, Id, RequestSpecific, ResponseSpecific, RouteTable,
};
use crate::error::DhtError;

use super::Shared;

/// Identifies a running [AsyncProcess] so the dispatcher can route responses to it.
pub type ProcessId = u64;

/// A multi round operation, driven by the responses and timeouts of the
/// requests it sends.
///
/// A process owns the [super::DhtFuture] it completes; once that future is
/// done (completed, failed or cancelled from outside) the process is dropped
/// and responses to its inflight requests are ignored.
pub(crate) trait AsyncProcess: Send + Debug {
    /// Called once, right after submission.
    fn start(&mut self, ctx: &mut Context<'_>);

    fn handle_response(&mut self, ctx: &mut Context<'_>, from: Contact, response: ResponseSpecific);

    /// Error responses count as failures of the responder.
    fn handle_error(&mut self, ctx: &mut Context<'_>, from: Contact, error: ErrorSpecific) {
        trace!(?from, ?error, "Error response");
        self.handle_timeout(ctx, from.address, Some(from.id));
    }

    fn handle_timeout(&mut self, ctx: &mut Context<'_>, to: SocketAddr, node_id: Option<Id>);

    /// Called on every actor tick, to poll child futures.
    fn tick(&mut self, _ctx: &mut Context<'_>) {}

    /// Complete the process with an error, no-op if already done.
    fn fail(&mut self, error: DhtError);

    fn is_done(&self) -> bool;
}

/// Borrowed state of the actor, handed to a process while it runs.
pub(crate) struct Environment<'a> {
    pub config: &'a Config,
    pub shared: &'a Shared,
    pub dispatcher: &'a mut MessageDispatcher,
}

/// What a process can do while handling an event.
pub(crate) struct Context<'a> {
    process: ProcessId,
    pub config: &'a Config,
    pub shared: &'a Shared,
    pub dispatcher: &'a mut MessageDispatcher,
    spawned: Vec<(Box<dyn AsyncProcess>, Duration)>,
}

impl<'a> Context<'a> {
    fn new(process: ProcessId, env: &'a mut Environment<'_>) -> Self {
        Self {
            process,
            config: env.config,
            shared: env.shared,
            dispatcher: &mut *env.dispatcher,
            spawned: vec![],
        }
    }

    /// The descriptor of the local node.
    pub fn local(&self) -> Contact {
        self.dispatcher.local_contact().clone()
    }

    /// Send a request to a contact, returns false if the dispatcher refused it.
    pub fn send(&mut self, contact: &Contact, request: RequestSpecific) -> bool {
        self.dispatcher
            .request_contact(Some(self.process), contact, request)
            .is_ok()
    }

    /// Send a request to a bare address.
    pub fn send_to(&mut self, address: SocketAddr, request: RequestSpecific) -> bool {
        self.dispatcher
            .request(Some(self.process), address, None, request, None)
            .is_ok()
    }

    /// Ping an address under a throwaway id, to find out whether another
    /// node answers with our id.
    pub fn send_collision_ping(&mut self, address: SocketAddr) -> bool {
        self.dispatcher
            .collision_ping(Some(self.process), address)
            .is_ok()
    }

    /// Start a child process after the current call returns.
    ///
    /// The parent keeps a clone of the child's future and polls it in
    /// [AsyncProcess::tick].
    pub fn submit(&mut self, process: Box<dyn AsyncProcess>, timeout: Duration) {
        self.spawned.push((process, timeout));
    }

    pub fn routing_table(&self) -> RwLockReadGuard<'_, RouteTable> {
        common::read(&self.shared.routing_table)
    }

    pub fn routing_table_mut(&self) -> RwLockWriteGuard<'_, RouteTable> {
        common::write(&self.shared.routing_table)
    }

    pub fn database(&self) -> RwLockReadGuard<'_, Database> {
        common::read(&self.shared.database)
    }

    pub fn database_mut(&self) -> RwLockWriteGuard<'_, Database> {
        common::write(&self.shared.database)
    }
}

#[derive(Debug)]
struct Entry {
    process: Box<dyn AsyncProcess>,
    timeout: Duration,
    deadline: Instant,
}

#[derive(Debug, Default)]
/// Owns every running process, routes dispatcher events to them and
/// enforces their deadlines.
pub(crate) struct FutureManager {
    next_id: ProcessId,
    processes: HashMap<ProcessId, Entry>,
}

impl FutureManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Start a process that fails with [DhtError::Timeout] if not done within `timeout`.
    pub fn submit(
        &mut self,
        env: &mut Environment<'_>,
        process: Box<dyn AsyncProcess>,
        timeout: Duration,
    ) -> ProcessId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.processes.insert(
            id,
            Entry {
                process,
                timeout,
                deadline: Instant::now() + timeout,
            },
        );

        self.call(env, id, |process, ctx| process.start(ctx));

        id
    }

    /// Hand a response, error or timeout to the process waiting for it.
    pub fn handle_event(&mut self, env: &mut Environment<'_>, event: DispatcherEvent) {
        match event {
            DispatcherEvent::Response {
                process: Some(id),
                from,
                response,
                ..
            } => self.call(env, id, |process, ctx| {
                process.handle_response(ctx, from, response)
            }),
            DispatcherEvent::Error {
                process: Some(id),
                from,
                error,
            } => self.call(env, id, |process, ctx| process.handle_error(ctx, from, error)),
            DispatcherEvent::Timeout {
                process: Some(id),
                to,
                node_id,
            } => self.call(env, id, |process, ctx| {
                process.handle_timeout(ctx, to, node_id)
            }),
            _ => {}
        }
    }

    /// Fail processes past their deadline, poll the rest, and drop the
    /// processes that are done.
    pub fn tick(&mut self, env: &mut Environment<'_>) {
        let now = Instant::now();
        let ids: Vec<ProcessId> = self.processes.keys().copied().collect();

        for id in ids {
            let expired = match self.processes.get_mut(&id) {
                Some(entry) if entry.deadline <= now => {
                    debug!(?id, timeout = ?entry.timeout, "Operation timed out");
                    entry.process.fail(DhtError::Timeout(entry.timeout));
                    true
                }
                Some(_) => false,
                None => continue,
            };

            if !expired {
                self.call(env, id, |process, ctx| process.tick(ctx));
            }
        }

        let done: Vec<ProcessId> = self
            .processes
            .iter()
            .filter(|(_, entry)| entry.process.is_done())
            .map(|(id, _)| *id)
            .collect();

        for id in done {
            self.processes.remove(&id);
            env.dispatcher.forget_process(id);
        }
    }

    /// Cancel every running process.
    pub fn close(&mut self, dispatcher: &mut MessageDispatcher) {
        for (id, mut entry) in self.processes.drain() {
            entry.process.fail(DhtError::Cancelled);
            dispatcher.forget_process(id);
        }
    }

    // === Private Methods ===

    fn call<F>(&mut self, env: &mut Environment<'_>, id: ProcessId, f: F)
    where
        F: FnOnce(&mut dyn AsyncProcess, &mut Context<'_>),
    {
        let mut entry = match self.processes.remove(&id) {
            Some(entry) => entry,
            None => return,
        };

        let spawned = {
            let mut ctx = Context::new(id, env);

            if !entry.process.is_done() {
                f(entry.process.as_mut(), &mut ctx);
            }

            ctx.spawned
        };

        if entry.process.is_done() {
            env.dispatcher.forget_process(id);
        } else {
            self.processes.insert(id, entry);
        }

        for (child, timeout) in spawned {
            self.submit(env, child, timeout);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::actor::dispatcher::AllowAll;
    use crate::actor::transport::MemoryNetwork;
    use crate::actor::transport::Transport;
    use crate::core::{DhtFuture, Shared};

    #[derive(Debug)]
    struct Echo {
        to: Contact,
        future: DhtFuture<Contact>,
    }

    impl AsyncProcess for Echo {
        fn start(&mut self, ctx: &mut Context<'_>) {
            let to = self.to.clone();
            if !ctx.send(&to, RequestSpecific::Ping) {
                self.future.set_error(DhtError::NoContacts);
            }
        }

        fn handle_response(&mut self, _ctx: &mut Context<'_>, from: Contact, _: ResponseSpecific) {
            self.future.set_value(from);
        }

        fn handle_timeout(&mut self, _ctx: &mut Context<'_>, _: SocketAddr, _: Option<Id>) {
            self.future.set_error(DhtError::Timeout(Duration::ZERO));
        }

        fn fail(&mut self, error: DhtError) {
            self.future.set_error(error);
        }

        fn is_done(&self) -> bool {
            self.future.is_done()
        }
    }

    fn setup(network: &MemoryNetwork) -> (Config, Shared, MessageDispatcher) {
        let transport = network.transport();
        let local = Contact::random(transport.local_addr());
        let shared = Shared::new(RouteTable::new(local.clone()), Database::default());

        let dispatcher = MessageDispatcher::new(
            Box::new(transport),
            local,
            shared.routing_table.clone(),
            Box::new(AllowAll),
            Duration::from_millis(20),
        );

        (Config::default(), shared, dispatcher)
    }

    #[test]
    fn refused_send_completes_on_start() {
        let network = MemoryNetwork::new();
        let (config, shared, mut dispatcher) = setup(&network);
        let mut manager = FutureManager::new();

        let future = DhtFuture::new();
        let local = dispatcher.local_contact().clone();

        let mut env = Environment {
            config: &config,
            shared: &shared,
            dispatcher: &mut dispatcher,
        };
        manager.submit(
            &mut env,
            Box::new(Echo {
                to: local,
                future: future.clone(),
            }),
            Duration::from_secs(1),
        );

        assert_eq!(future.try_result(), Some(Err(DhtError::NoContacts)));
        assert!(manager.is_empty());
    }

    #[test]
    fn deadline_and_cancellation() {
        let network = MemoryNetwork::new();
        let (config, shared, mut dispatcher) = setup(&network);
        let mut manager = FutureManager::new();

        // Nobody listens on this address, so nothing ever responds.
        let silent = Contact::random("127.0.0.1:1".parse().unwrap());

        let slow = DhtFuture::new();
        let cancelled = DhtFuture::new();

        let mut env = Environment {
            config: &config,
            shared: &shared,
            dispatcher: &mut dispatcher,
        };

        manager.submit(
            &mut env,
            Box::new(Echo {
                to: silent.clone(),
                future: slow.clone(),
            }),
            Duration::ZERO,
        );
        manager.submit(
            &mut env,
            Box::new(Echo {
                to: silent,
                future: cancelled.clone(),
            }),
            Duration::from_secs(60),
        );
        assert_eq!(manager.len(), 2);

        cancelled.cancel();
        manager.tick(&mut env);

        assert_eq!(slow.try_result(), Some(Err(DhtError::Timeout(Duration::ZERO))));
        assert!(cancelled.is_cancelled());
        assert!(manager.is_empty());
    }

    #[test]
    fn close_cancels_everything() {
        let network = MemoryNetwork::new();
        let (config, shared, mut dispatcher) = setup(&network);
        let mut manager = FutureManager::new();

        let future = DhtFuture::new();
        let silent = Contact::random("127.0.0.1:1".parse().unwrap());

        {
            let mut env = Environment {
                config: &config,
                shared: &shared,
                dispatcher: &mut dispatcher,
            };
            manager.submit(
                &mut env,
                Box::new(Echo {
                    to: silent,
                    future: future.clone(),
                }),
                Duration::from_secs(60),
            );
        }

        manager.close(&mut dispatcher);

        assert!(future.is_cancelled());
        assert!(manager.is_empty());
        assert_eq!(dispatcher.inflight_count(), 0);
    }
}
