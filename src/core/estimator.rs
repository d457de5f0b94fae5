//! Estimating the number of nodes in the network.

use std::collections::VecDeque;

use crate::common::{Id, RouteTable, SelectMode};

/// Number of remote estimates kept.
const MAX_REMOTE_ESTIMATES: usize = 32;

#[derive(Debug, Clone, Default)]
/// Combines an estimate from the density of our closest contacts with the
/// estimates other nodes send us in pongs.
pub struct SizeEstimator {
    remote: VecDeque<u64>,
}

impl SizeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an estimate received from another node, zero means unknown.
    pub fn add_remote(&mut self, estimate: u64) {
        if estimate == 0 {
            return;
        }

        if self.remote.len() >= MAX_REMOTE_ESTIMATES {
            self.remote.pop_front();
        }
        self.remote.push_back(estimate);
    }

    /// Estimated size of the network, including the local node.
    pub fn estimate(&self, routing_table: &RouteTable) -> usize {
        let local = local_estimate(routing_table);

        if self.remote.is_empty() {
            return local;
        }

        let sum = self
            .remote
            .iter()
            .fold(local as u128, |sum, estimate| sum + *estimate as u128);

        (sum / (self.remote.len() as u128 + 1)) as usize
    }
}

/// Estimate from the distances of the k closest contacts to the local id.
///
/// With ids distributed uniformly, the `i`th closest node to any target is
/// expected at distance `i * MAX / N`, so every contact gives an estimate of
/// `N`, which are averaged.
pub fn local_estimate(routing_table: &RouteTable) -> usize {
    let local = *routing_table.id();
    let k = routing_table.settings().k;
    let closest = routing_table.select(&local, k, SelectMode::All);

    if closest.is_empty() {
        return 1;
    }

    let mut sum: usize = 0;
    let mut count = 0;

    for contact in &closest {
        count += 1;

        let estimated_n = estimate_from_distance(&contact.id.xor(&local), count);
        sum = sum.saturating_add(estimated_n);
    }

    (sum / count).max(closest.len() + 1)
}

fn estimate_from_distance(xor: &Id, count: usize) -> usize {
    let mut high = [0_u8; 16];
    high.copy_from_slice(&xor.as_bytes()[0..16]);

    // Round up the lower 4 bytes to get a u128 from u160.
    let distance = u128::from_be_bytes(high).saturating_add(1);

    let intervals = (u128::MAX / distance).min(usize::MAX as u128) as usize;
    intervals.saturating_mul(count)
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::Contact;

    fn address(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn empty_table_is_just_us() {
        let table = RouteTable::new(Contact::random(address(1)));

        assert_eq!(SizeEstimator::new().estimate(&table), 1);
    }

    #[test]
    fn dense_network_estimate() {
        let local = Contact::new(Id::MIN, address(1));
        let mut table = RouteTable::new(local);

        // 20 contacts evenly spread over the whole key space.
        for i in 1..=20_u8 {
            let mut bytes = [0_u8; 20];
            bytes[0] = i.wrapping_mul(12);
            bytes[1] = 1;
            table.add(Contact::new(Id(bytes), address(1000 + i as u16)));
        }

        let estimate = local_estimate(&table);
        assert!(estimate >= 21, "{estimate}");
        assert!(estimate < 1000, "{estimate}");
    }

    #[test]
    fn remote_estimates_are_averaged() {
        let local = Contact::new(Id::MIN, address(1));
        let table = RouteTable::new(local);

        let mut estimator = SizeEstimator::new();
        estimator.add_remote(0);
        estimator.add_remote(199);

        assert_eq!(estimator.estimate(&table), 100);
    }
}
