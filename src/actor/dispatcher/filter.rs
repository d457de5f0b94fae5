//! Filters deciding which hosts may reach the dispatcher.

use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;

/// Number of hosts the [FloodFilter] keeps track of.
const TRACKED_HOSTS: usize = 1024;

/// Consulted on every inbound datagram before it is parsed.
///
/// Datagrams from hosts that are not allowed are dropped silently.
pub trait HostFilter: Send + Sync + Debug {
    /// Returns true if datagrams from this source are allowed.
    fn allow(&self, from: &SocketAddr) -> bool;

    /// Count a request received from this source, responses to our own
    /// requests are not counted.
    fn register(&self, _from: &SocketAddr) {}
}

#[derive(Debug, Clone, Copy)]
/// Allows every host.
pub struct AllowAll;

impl HostFilter for AllowAll {
    fn allow(&self, _from: &SocketAddr) -> bool {
        true
    }
}

#[derive(Debug)]
/// Drops hosts sending more than `max_per_window` requests within a window.
pub struct FloodFilter {
    max_per_window: u32,
    window: Duration,
    hosts: Mutex<LruCache<IpAddr, (Instant, u32)>>,
}

impl FloodFilter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            hosts: Mutex::new(LruCache::new(
                NonZeroUsize::new(TRACKED_HOSTS).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }
}

impl FloodFilter {
    fn hosts(&self) -> MutexGuard<'_, LruCache<IpAddr, (Instant, u32)>> {
        match self.hosts.lock() {
            Ok(hosts) => hosts,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl HostFilter for FloodFilter {
    fn allow(&self, from: &SocketAddr) -> bool {
        match self.hosts().peek(&from.ip()) {
            Some((window_start, count)) => {
                window_start.elapsed() >= self.window || *count < self.max_per_window
            }
            None => self.max_per_window > 0,
        }
    }

    fn register(&self, from: &SocketAddr) {
        let mut hosts = self.hosts();
        let now = Instant::now();

        match hosts.get_mut(&from.ip()) {
            Some((window_start, count)) => {
                if now.duration_since(*window_start) >= self.window {
                    *window_start = now;
                    *count = 1;
                } else {
                    *count = count.saturating_add(1);
                }
            }
            None => {
                hosts.put(from.ip(), (now, 1));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn flooding_host_is_dropped() {
        let filter = FloodFilter::new(3, Duration::from_millis(50));
        let flooder: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let other: SocketAddr = "10.0.0.2:1000".parse().unwrap();

        for _ in 0..3 {
            assert!(filter.allow(&flooder));
            filter.register(&flooder);
        }
        assert!(!filter.allow(&flooder));
        assert!(filter.allow(&other));

        thread::sleep(Duration::from_millis(60));
        assert!(filter.allow(&flooder));
        filter.register(&flooder);
        assert!(filter.allow(&flooder));
    }
}
