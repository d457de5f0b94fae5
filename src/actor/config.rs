use std::net::SocketAddr;
use std::time::Duration;

use crate::common::{
    Contact, DatabaseSettings, Id, RouteTableSettings, Vendor, FLAG_FIREWALLED, MAX_BUCKET_SIZE_K,
};

use super::dispatcher::{HostFilter, DEFAULT_REQUEST_TIMEOUT};
use super::transport::Transport;

/// Default number of parallel requests of a lookup.
pub const DEFAULT_ALPHA: usize = 3;
/// Default vendor code sent with every message.
pub const DEFAULT_VENDOR: Vendor = *b"MOJR";

#[derive(Debug)]
/// Dht Configurations
pub struct Config {
    /// Node Id of this node.
    ///
    /// Defaults to None, where a random Id is generated.
    pub local_id: Option<Id>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None
    pub port: Option<u16>,
    /// Transport to send and receive datagrams with, overrides [Self::port].
    ///
    /// Defaults to None, where a UDP socket is bound to [Self::port].
    pub transport: Option<Box<dyn Transport>>,
    /// Addresses of nodes to bootstrap from as soon as the node starts.
    ///
    /// Defaults to an empty list, call [crate::Dht::bootstrap] instead.
    pub bootstrap: Vec<SocketAddr>,

    /// Bucket size, and number of closest nodes a lookup converges to.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Number of parallel requests of a lookup.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,

    /// Request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take until they are deemeed "done".
    /// The shorter this duration is, the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Silence after which a lookup queries one more node beyond [Self::alpha].
    ///
    /// Defaults to 3 seconds
    pub boost_timeout: Duration,
    /// Deadline of lookup and get operations.
    ///
    /// Defaults to 60 seconds
    pub lookup_timeout: Duration,
    /// Deadline of a bootstrap.
    ///
    /// Defaults to 60 seconds
    pub bootstrap_timeout: Duration,
    /// Deadline of a store, including its lookup.
    ///
    /// Defaults to 120 seconds
    pub store_timeout: Duration,
    /// Deadline of a ping operation.
    ///
    /// Defaults to 10 seconds
    pub ping_timeout: Duration,

    /// Number of contacts a single store talks to in parallel.
    ///
    /// Defaults to 4
    pub parallel_stores: usize,
    /// Number of enqueued stores running at the same time.
    ///
    /// Defaults to 1
    pub max_concurrent_stores: usize,

    /// Age after which a bucket is refreshed with a lookup.
    ///
    /// Defaults to 30 minutes
    pub bucket_refresh_interval: Duration,
    /// How often the buckets are checked for staleness.
    ///
    /// Defaults to 1 minute
    pub bucket_refresh_tick: Duration,
    /// How often expired values are removed and local values republished.
    ///
    /// Defaults to 1 minute
    pub database_cleaner_tick: Duration,

    /// Time a value stored by another node is kept.
    ///
    /// Defaults to 60 minutes
    pub value_ttl: Duration,
    /// Age after which a local value is published again.
    ///
    /// Defaults to 30 minutes
    pub republish_interval: Duration,
    /// Maximum number of keys holding remote values in the database.
    ///
    /// Defaults to 16384
    pub max_database_size: usize,
    /// Maximum number of values stored under one primary key.
    ///
    /// Defaults to 5
    pub max_values_per_key: usize,

    /// Maximum number of contacts in a bucket's replacement cache.
    ///
    /// Defaults to 16
    pub max_cache_size: usize,
    /// Buckets far from the local node split only at depths that are not a multiple of this.
    ///
    /// Defaults to 4
    pub depth_limit: usize,
    /// Failures after which a contact that never responded is dead.
    ///
    /// Defaults to 2
    pub max_unknown_failures: u8,
    /// Failures after which a contact that once responded is dead.
    ///
    /// Defaults to 4
    pub max_alive_failures: u8,
    /// Failures in a row after which failures are ignored, as we are probably disconnected.
    ///
    /// Defaults to 100
    pub max_consecutive_failures: usize,

    /// Contacts the routing table has to hold for a bootstrap to succeed.
    ///
    /// Defaults to 1
    pub min_bootstrap_contacts: usize,
    /// Routing table contacts failing during the bootstrap refresh, past
    /// which the routing table is considered stale.
    ///
    /// The first time, the routing table is purged and the bootstrap starts over.
    ///
    /// Defaults to 40
    pub max_bootstrap_failures: usize,
    /// Share of alive contacts needed to be bootstrapped when the routing
    /// table stays stale after a purge.
    ///
    /// Defaults to 0.5
    pub bootstrapped_ratio: f32,

    /// Filter consulted before parsing any inbound datagram.
    ///
    /// Defaults to None, where a [crate::FloodFilter] allowing
    /// [Self::max_requests_per_window] requests per [Self::flood_window] is used.
    pub host_filter: Option<Box<dyn HostFilter>>,
    /// Requests allowed per host in a [Self::flood_window].
    ///
    /// Defaults to 32
    pub max_requests_per_window: u32,
    /// Window of the default flood filter.
    ///
    /// Defaults to 1 second
    pub flood_window: Duration,

    /// How often the secret behind security tokens rotates.
    ///
    /// Defaults to 5 minutes
    pub token_rotate_interval: Duration,

    /// Vendor code sent with every message.
    ///
    /// Defaults to [DEFAULT_VENDOR]
    pub vendor: Vendor,
    /// Version sent with every message.
    ///
    /// Defaults to 0
    pub version: u16,
    /// Tell other nodes not to add us to their routing tables.
    ///
    /// Defaults to false
    pub firewalled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_id: None,
            port: None,
            transport: None,
            bootstrap: vec![],

            k: MAX_BUCKET_SIZE_K,
            alpha: DEFAULT_ALPHA,

            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            boost_timeout: Duration::from_secs(3),
            lookup_timeout: Duration::from_secs(60),
            bootstrap_timeout: Duration::from_secs(60),
            store_timeout: Duration::from_secs(120),
            ping_timeout: Duration::from_secs(10),

            parallel_stores: 4,
            max_concurrent_stores: 1,

            bucket_refresh_interval: Duration::from_secs(30 * 60),
            bucket_refresh_tick: Duration::from_secs(60),
            database_cleaner_tick: Duration::from_secs(60),

            value_ttl: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(30 * 60),
            max_database_size: 16384,
            max_values_per_key: 5,

            max_cache_size: 16,
            depth_limit: 4,
            max_unknown_failures: 2,
            max_alive_failures: 4,
            max_consecutive_failures: 100,

            min_bootstrap_contacts: 1,
            max_bootstrap_failures: 40,
            bootstrapped_ratio: 0.5,

            host_filter: None,
            max_requests_per_window: 32,
            flood_window: Duration::from_secs(1),

            token_rotate_interval: Duration::from_secs(5 * 60),

            vendor: DEFAULT_VENDOR,
            version: 0,
            firewalled: false,
        }
    }
}

impl Config {
    pub(crate) fn route_table_settings(&self) -> RouteTableSettings {
        RouteTableSettings {
            k: self.k.max(1),
            max_cache_size: self.max_cache_size,
            depth_limit: self.depth_limit.max(1),
            max_unknown_failures: self.max_unknown_failures,
            max_alive_failures: self.max_alive_failures,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub(crate) fn database_settings(&self) -> DatabaseSettings {
        DatabaseSettings {
            value_ttl: self.value_ttl,
            max_database_size: self.max_database_size,
            max_values_per_key: self.max_values_per_key,
        }
    }

    /// The descriptor of this node sent with every message.
    pub(crate) fn local_contact(&self, id: Id, address: SocketAddr) -> Contact {
        let contact = Contact::new(id, address).with_vendor(self.vendor, self.version);

        if self.firewalled {
            contact.with_flags(FLAG_FIREWALLED)
        } else {
            contact
        }
    }
}
