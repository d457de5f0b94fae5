//! Joining the network: INIT -> BOOTING -> READY.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::common::{Contact, ErrorSpecific, Id, RequestSpecific, ResponseSpecific};
use crate::error::DhtError;

use super::lookup::{NodeLookup, NodeLookupResult};
use super::maintenance::{BucketRefresh, RefreshResult};
use super::process::{AsyncProcess, Context};
use super::DhtFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Bootstrap state of a node.
pub enum BootstrapState {
    /// Not bootstrapped, or the last bootstrap failed.
    Init,
    Booting,
    /// Bootstrapped, maintenance is running.
    Ready,
}

#[derive(Debug, Clone)]
/// [BootstrapState] shared with the [crate::Dht] handles.
pub(crate) struct BootstrapStatus(Arc<AtomicU8>);

impl BootstrapStatus {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    pub fn get(&self) -> BootstrapState {
        match self.0.load(Ordering::Acquire) {
            1 => BootstrapState::Booting,
            2 => BootstrapState::Ready,
            _ => BootstrapState::Init,
        }
    }

    pub fn set(&self, state: BootstrapState) {
        let value = match state {
            BootstrapState::Init => 0,
            BootstrapState::Booting => 1,
            BootstrapState::Ready => 2,
        };

        self.0.store(value, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
/// A node to bootstrap from.
pub enum BootstrapSeed {
    /// A known node, used without pinging it first.
    Contact(Contact),
    /// A bare address, pinged to learn the node's id.
    Address(SocketAddr),
}

impl From<SocketAddr> for BootstrapSeed {
    fn from(address: SocketAddr) -> Self {
        BootstrapSeed::Address(address)
    }
}

impl From<Contact> for BootstrapSeed {
    fn from(contact: Contact) -> Self {
        BootstrapSeed::Contact(contact)
    }
}

#[derive(Debug, Clone)]
/// Result of a successful bootstrap.
pub struct BootstrapResult {
    /// Contacts in the routing table once bootstrapped.
    pub contacts: usize,
    pub buckets: usize,
    /// The routing table looked stale and was purged along the way.
    pub purged: bool,
    pub elapsed: Duration,
}

#[derive(Debug)]
enum Phase {
    /// Waiting for the first pong from the seeds.
    Ping { pending: usize },
    /// Looking up our own id.
    Lookup(DhtFuture<NodeLookupResult>),
    /// Pinging the nodes reported with our id, any response means our id is taken.
    Collisions { pending: HashSet<SocketAddr> },
    /// Forced refresh of every bucket.
    Refresh(DhtFuture<RefreshResult>),
    Done,
}

#[derive(Debug)]
pub(crate) struct BootstrapProcess {
    seeds: Vec<BootstrapSeed>,
    phase: Phase,
    /// Purged the routing table and started over once already.
    purged: bool,
    started_at: Instant,
    future: DhtFuture<BootstrapResult>,
}

impl BootstrapProcess {
    pub fn new(seeds: Vec<BootstrapSeed>, future: DhtFuture<BootstrapResult>) -> Self {
        Self {
            seeds,
            phase: Phase::Done,
            purged: false,
            started_at: Instant::now(),
            future,
        }
    }

    fn start_lookup(&mut self, ctx: &mut Context<'_>) {
        let local = ctx.local().id;
        debug!(?local, "Bootstrap: looking up our own id");

        let lookup = DhtFuture::new();
        self.cancel_with_parent(&lookup);

        ctx.submit(
            Box::new(NodeLookup::new(local, lookup.clone())),
            ctx.config.lookup_timeout,
        );
        self.phase = Phase::Lookup(lookup);
    }

    fn start_refresh(&mut self, ctx: &mut Context<'_>) {
        debug!("Bootstrap: refreshing all buckets");

        let refresh = DhtFuture::new();
        self.cancel_with_parent(&refresh);

        ctx.submit(
            Box::new(BucketRefresh::new(true, refresh.clone())),
            ctx.config.lookup_timeout,
        );
        self.phase = Phase::Refresh(refresh);
    }

    fn lookup_done(&mut self, ctx: &mut Context<'_>, result: Result<NodeLookupResult, DhtError>) {
        let result = match result {
            Ok(result) => result,
            Err(error) => {
                self.abort(error.to_string());
                return;
            }
        };

        let local = ctx.local().id;
        if !result.contacts.iter().any(|c| c.id != local) {
            self.abort("no node responded to the lookup".to_string());
            return;
        }

        let mut pending = HashSet::new();
        for contact in result.collisions {
            debug!(?contact, "Bootstrap: checking a node reported with our id");

            if ctx.send_collision_ping(contact.address) {
                pending.insert(contact.address);
            }
        }

        if pending.is_empty() {
            self.start_refresh(ctx);
        } else {
            self.phase = Phase::Collisions { pending };
        }
    }

    fn refresh_done(&mut self, ctx: &mut Context<'_>, result: RefreshResult) {
        let failures = result.route_table_failures;
        if failures < ctx.config.max_bootstrap_failures {
            self.finish(ctx);
            return;
        }

        if !self.purged {
            info!(failures, "Routing table looks stale, purging it and bootstrapping again");
            self.purged = true;
            ctx.routing_table_mut().purge();
            self.start_lookup(ctx);
            return;
        }

        let (alive, total) = {
            let table = ctx.routing_table();
            (table.active_contacts().len(), table.contacts().len())
        };
        ctx.routing_table_mut().purge();

        if is_bootstrapped(alive, total, ctx.config.bootstrapped_ratio) {
            self.finish(ctx);
        } else {
            self.abort(format!(
                "routing table still stale, {} of {} contacts alive",
                alive, total
            ));
        }
    }

    fn finish(&mut self, ctx: &mut Context<'_>) {
        self.phase = Phase::Done;

        let (contacts, buckets) = {
            let table = ctx.routing_table();
            (table.size(), table.bucket_count())
        };

        if contacts < ctx.config.min_bootstrap_contacts {
            self.abort(format!(
                "only {} contacts after bootstrapping, expected at least {}",
                contacts, ctx.config.min_bootstrap_contacts
            ));
            return;
        }

        let elapsed = self.started_at.elapsed();
        info!(contacts, buckets, ?elapsed, "Bootstrapped");

        self.future.set_value(BootstrapResult {
            contacts,
            buckets,
            purged: self.purged,
            elapsed,
        });
    }

    fn abort(&mut self, reason: String) {
        debug!(?reason, "Bootstrap failed");
        self.phase = Phase::Done;
        self.future.set_error(DhtError::BootstrapFailed(reason));
    }

    /// Cancelling the bootstrap cancels the running phase.
    fn cancel_with_parent<T: Clone + Send + 'static>(&self, child: &DhtFuture<T>) {
        let child = child.clone();
        self.future.add_listener(move |_| {
            child.cancel();
        });
    }
}

impl AsyncProcess for BootstrapProcess {
    fn start(&mut self, ctx: &mut Context<'_>) {
        self.started_at = Instant::now();

        let mut pending = 0;
        let mut known = 0;

        for seed in self.seeds.clone() {
            match seed {
                BootstrapSeed::Contact(contact) => {
                    if contact.id != ctx.local().id {
                        ctx.routing_table_mut().add_unknown(contact);
                        known += 1;
                    }
                }
                BootstrapSeed::Address(address) => {
                    if ctx.send_to(address, RequestSpecific::Ping) {
                        pending += 1;
                    }
                }
            }
        }

        if pending > 0 && known == 0 {
            debug!(seeds = pending, "Bootstrap: pinging seeds");
            self.phase = Phase::Ping { pending };
        } else {
            self.start_lookup(ctx);
        }
    }

    fn handle_response(&mut self, ctx: &mut Context<'_>, from: Contact, response: ResponseSpecific) {
        match self.phase {
            Phase::Ping { .. } => {
                if let ResponseSpecific::Pong(pong) = response {
                    ctx.shared.estimator().add_remote(pong.estimated_size);
                }

                debug!(seed = ?from, "Bootstrap: seed responded");
                self.start_lookup(ctx);
            }
            Phase::Collisions { .. } if from.id == ctx.local().id => {
                self.abort(format!("node id collides with {}", from.address));
            }
            _ => {}
        }
    }

    fn handle_error(&mut self, ctx: &mut Context<'_>, from: Contact, error: ErrorSpecific) {
        if let Phase::Collisions { .. } = self.phase {
            if from.id == ctx.local().id {
                self.abort(format!("node id collides with {}", from.address));
                return;
            }
        }

        debug!(?from, ?error, "Bootstrap: error response");
        self.handle_timeout(ctx, from.address, Some(from.id));
    }

    fn handle_timeout(&mut self, ctx: &mut Context<'_>, to: SocketAddr, _node_id: Option<Id>) {
        match &mut self.phase {
            Phase::Ping { pending } => {
                debug!(?to, "Bootstrap: seed did not respond");
                *pending -= 1;

                if *pending == 0 {
                    self.abort("no seed responded".to_string());
                }
            }
            Phase::Collisions { pending } => {
                if pending.remove(&to) && pending.is_empty() {
                    debug!("Bootstrap: no node is using our id");
                    self.start_refresh(ctx);
                }
            }
            _ => {}
        }
    }

    fn tick(&mut self, ctx: &mut Context<'_>) {
        let lookup = match &self.phase {
            Phase::Lookup(lookup) => lookup.try_result(),
            _ => None,
        };
        if let Some(result) = lookup {
            self.lookup_done(ctx, result);
            return;
        }

        let refresh = match &self.phase {
            Phase::Refresh(refresh) => refresh.try_result(),
            _ => None,
        };
        match refresh {
            Some(Ok(result)) => self.refresh_done(ctx, result),
            Some(Err(error)) => {
                debug!(?error, "Bootstrap: refresh did not complete");
                self.finish(ctx);
            }
            None => {}
        }
    }

    fn fail(&mut self, error: DhtError) {
        self.future.set_error(error);
    }

    fn is_done(&self) -> bool {
        self.future.is_done()
    }
}

/// Whether enough of the routing table is alive to call the node bootstrapped.
fn is_bootstrapped(alive: usize, total: usize, ratio: f32) -> bool {
    total > 0 && alive as f32 / total as f32 >= ratio
}

#[derive(Debug, Default)]
/// Makes sure only one bootstrap runs at a time, and keeps the shared
/// [BootstrapState] in sync with it.
pub(crate) struct BootstrapManager {
    current: Option<DhtFuture<BootstrapResult>>,
}

impl BootstrapManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the running bootstrap if any, and create a new one completing `future`.
    pub fn bootstrap(
        &mut self,
        status: &BootstrapStatus,
        seeds: Vec<BootstrapSeed>,
        future: DhtFuture<BootstrapResult>,
    ) -> BootstrapProcess {
        if let Some(current) = self.current.take() {
            if current.cancel() {
                debug!("Cancelled the running bootstrap");
            }
        }

        status.set(BootstrapState::Booting);

        let listener_status = status.clone();
        future.add_listener(move |result| {
            listener_status.set(match result {
                Ok(_) => BootstrapState::Ready,
                Err(_) => BootstrapState::Init,
            });
        });

        self.current = Some(future.clone());

        BootstrapProcess::new(seeds, future)
    }

    /// Cancel the running bootstrap, back to [BootstrapState::Init].
    pub fn close(&mut self, status: &BootstrapStatus) {
        if let Some(current) = self.current.take() {
            current.cancel();
        }

        status.set(BootstrapState::Init);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trip() {
        let status = BootstrapStatus::new();
        assert_eq!(status.get(), BootstrapState::Init);

        status.set(BootstrapState::Booting);
        assert_eq!(status.clone().get(), BootstrapState::Booting);

        status.set(BootstrapState::Ready);
        assert_eq!(status.get(), BootstrapState::Ready);
    }

    #[test]
    fn new_bootstrap_cancels_the_running_one() {
        let status = BootstrapStatus::new();
        let mut manager = BootstrapManager::new();

        let first = DhtFuture::new();
        manager.bootstrap(&status, vec![], first.clone());
        assert_eq!(status.get(), BootstrapState::Booting);

        let second = DhtFuture::new();
        manager.bootstrap(&status, vec![], second.clone());
        assert!(first.is_cancelled());
        assert!(!second.is_done());
        assert_eq!(status.get(), BootstrapState::Booting);

        second.set_value(BootstrapResult {
            contacts: 1,
            buckets: 1,
            purged: false,
            elapsed: Duration::ZERO,
        });
        assert_eq!(status.get(), BootstrapState::Ready);

        manager.close(&status);
        assert_eq!(status.get(), BootstrapState::Init);
    }

    #[test]
    fn failed_bootstrap_returns_to_init() {
        let status = BootstrapStatus::new();
        let mut manager = BootstrapManager::new();

        let future = DhtFuture::new();
        manager.bootstrap(&status, vec![], future.clone());
        future.set_error(DhtError::BootstrapFailed("unreachable".to_string()));

        assert_eq!(status.get(), BootstrapState::Init);
    }

    #[test]
    fn bootstrapped_ratio() {
        assert!(is_bootstrapped(5, 10, 0.5));
        assert!(is_bootstrapped(10, 10, 1.0));
        assert!(!is_bootstrapped(4, 10, 0.5));
        assert!(!is_bootstrapped(0, 0, 0.0));
    }
}
