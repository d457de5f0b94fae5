//! Periodic bucket refreshes and database cleanup.

use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{self, Contact, Database, DhtValueEntity, Id, ResponseSpecific};
use crate::error::DhtError;

use super::bootstrap::BootstrapState;
use super::lookup::{NodeLookup, NodeLookupResult};
use super::process::{AsyncProcess, Context};
use super::DhtFuture;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Outcome of a [BucketRefresh].
pub(crate) struct RefreshResult {
    /// Lookups that succeeded.
    pub refreshed: usize,
    /// Routing table contacts that failed to respond, summed over all lookups.
    pub route_table_failures: usize,
}

#[derive(Debug)]
/// Looks up a random id in every stale bucket.
pub(crate) struct BucketRefresh {
    force: bool,
    lookups: Vec<DhtFuture<NodeLookupResult>>,
    future: DhtFuture<RefreshResult>,
}

impl BucketRefresh {
    /// Refresh every bucket if `force` is true, otherwise only the stale ones.
    pub fn new(force: bool, future: DhtFuture<RefreshResult>) -> Self {
        Self {
            force,
            lookups: vec![],
            future,
        }
    }
}

impl AsyncProcess for BucketRefresh {
    fn start(&mut self, ctx: &mut Context<'_>) {
        let ids = ctx
            .routing_table()
            .buckets_needing_refresh(ctx.config.bucket_refresh_interval, self.force);

        if ids.is_empty() {
            self.future.set_value(RefreshResult::default());
            return;
        }

        debug!(buckets = ids.len(), force = self.force, "Refreshing buckets");

        for id in ids {
            let lookup = DhtFuture::new();

            let child = lookup.clone();
            self.future.add_listener(move |_| {
                child.cancel();
            });

            ctx.submit(
                Box::new(NodeLookup::new(id, lookup.clone())),
                ctx.config.lookup_timeout,
            );
            self.lookups.push(lookup);
        }
    }

    fn handle_response(&mut self, _: &mut Context<'_>, _: Contact, _: ResponseSpecific) {}

    fn handle_timeout(&mut self, _: &mut Context<'_>, _: SocketAddr, _: Option<Id>) {}

    fn tick(&mut self, _ctx: &mut Context<'_>) {
        if !self.lookups.iter().all(|lookup| lookup.is_done()) {
            return;
        }

        let mut result = RefreshResult::default();
        for lookup in &self.lookups {
            if let Some(Ok(lookup)) = lookup.try_result() {
                result.refreshed += 1;
                result.route_table_failures += lookup.route_table_failures;
            }
        }

        debug!(
            refreshed = result.refreshed,
            failures = result.route_table_failures,
            total = self.lookups.len(),
            "Buckets refreshed"
        );
        self.future.set_value(result);
    }

    fn fail(&mut self, error: DhtError) {
        self.future.set_error(error);
    }

    fn is_done(&self) -> bool {
        self.future.is_done()
    }
}

#[derive(Debug)]
/// Starts a [BucketRefresh] every tick while the node is ready, with at
/// most one in flight.
pub(crate) struct BucketRefresher {
    tick: Duration,
    last_tick: Instant,
    inflight: Option<DhtFuture<RefreshResult>>,
}

impl BucketRefresher {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            last_tick: Instant::now(),
            inflight: None,
        }
    }

    /// Returns a refresh to submit, if one is due.
    pub fn poll(&mut self, state: BootstrapState) -> Option<BucketRefresh> {
        if state != BootstrapState::Ready || self.last_tick.elapsed() < self.tick {
            return None;
        }
        self.last_tick = Instant::now();

        if let Some(inflight) = &self.inflight {
            if !inflight.is_done() {
                return None;
            }
        }

        let future = DhtFuture::new();
        self.inflight = Some(future.clone());

        Some(BucketRefresh::new(false, future))
    }
}

#[derive(Debug)]
/// Removes expired values every tick, and returns the local values due
/// for republishing while the node is ready.
pub(crate) struct DatabaseCleaner {
    tick: Duration,
    last_tick: Instant,
}

impl DatabaseCleaner {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            last_tick: Instant::now(),
        }
    }

    pub fn poll(
        &mut self,
        database: &RwLock<Database>,
        state: BootstrapState,
        republish_interval: Duration,
    ) -> Vec<DhtValueEntity> {
        if self.last_tick.elapsed() < self.tick {
            return vec![];
        }
        self.last_tick = Instant::now();

        let mut database = common::write(database);

        let expired = database.expire();
        if !expired.is_empty() {
            debug!(expired = expired.len(), "Removed expired values");
        }

        if state != BootstrapState::Ready {
            return vec![];
        }

        let republish = database.values_to_republish(republish_interval);
        for entity in &republish {
            database.mark_published(&entity.primary_key, &entity.secondary_key);
        }

        republish
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::common::{DatabaseSettings, DhtValue, ValueType};

    fn entity(local: bool) -> DhtValueEntity {
        let creator = Contact::random("127.0.0.1:6881".parse().unwrap());
        DhtValueEntity::new(
            creator,
            Id::random(),
            DhtValue::new(ValueType::BINARY, &b"hello"[..]),
            local,
        )
    }

    #[test]
    fn refresher_runs_only_when_ready() {
        let mut refresher = BucketRefresher::new(Duration::ZERO);

        assert!(refresher.poll(BootstrapState::Init).is_none());
        assert!(refresher.poll(BootstrapState::Booting).is_none());

        let refresh = refresher.poll(BootstrapState::Ready);
        assert!(refresh.is_some());

        // One refresh cycle in flight at a time.
        assert!(refresher.poll(BootstrapState::Ready).is_none());

        if let Some(refresh) = refresh {
            refresh.future.set_value(RefreshResult::default());
        }
        assert!(refresher.poll(BootstrapState::Ready).is_some());
    }

    #[test]
    fn cleaner_expires_remote_values() {
        let database = RwLock::new(Database::new(DatabaseSettings {
            value_ttl: Duration::from_millis(100),
            ..Default::default()
        }));

        let remote = entity(false);
        let local = entity(true);
        common::write(&database).store(remote.clone());
        common::write(&database).store(local.clone());

        let mut cleaner = DatabaseCleaner::new(Duration::from_millis(10));

        thread::sleep(Duration::from_millis(150));

        let republish = cleaner.poll(&database, BootstrapState::Init, Duration::ZERO);
        assert!(republish.is_empty());

        let database_after = common::read(&database);
        assert!(database_after.get(&remote.primary_key).is_empty());
        assert_eq!(database_after.get(&local.primary_key), vec![local]);
    }

    #[test]
    fn cleaner_republishes_local_values_when_ready() {
        let database = RwLock::new(Database::default());
        let local = entity(true);
        common::write(&database).store(local.clone());

        let mut cleaner = DatabaseCleaner::new(Duration::ZERO);

        let republish = cleaner.poll(&database, BootstrapState::Ready, Duration::from_secs(60));
        assert_eq!(republish, vec![local]);

        // Just published.
        let republish = cleaner.poll(&database, BootstrapState::Ready, Duration::from_secs(60));
        assert!(republish.is_empty());
    }
}
