use std::net::SocketAddr;

use crate::common::{Contact, Id};
use crate::core::BootstrapState;

use super::dispatcher::DispatcherStats;
use super::Actor;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    local: Contact,
    state: BootstrapState,
    routing_table_size: usize,
    bucket_count: usize,
    database_size: usize,
    estimated_size: usize,
    running: usize,
    queued_stores: usize,
    stats: DispatcherStats,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.local.id
    }
    /// Address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local.address
    }
    /// The descriptor this node sends with every message.
    pub fn local_contact(&self) -> &Contact {
        &self.local
    }
    pub fn state(&self) -> BootstrapState {
        self.state
    }
    /// Number of live contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }
    /// Number of values stored in the local database, local and remote ones.
    pub fn database_size(&self) -> usize {
        self.database_size
    }
    /// Estimated number of nodes in the network.
    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }
    /// Number of running operations, child operations included.
    pub fn running(&self) -> usize {
        self.running
    }
    /// Number of enqueued stores waiting for a slot.
    pub fn queued_stores(&self) -> usize {
        self.queued_stores
    }
    /// Counters of sent, received and dropped messages.
    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }
}

impl Info {
    pub(crate) fn new(actor: &Actor) -> Self {
        let (routing_table_size, bucket_count) = {
            let table = crate::common::read(&actor.shared.routing_table);
            (table.size(), table.bucket_count())
        };

        Self {
            local: actor.dispatcher.local_contact().clone(),
            state: actor.shared.status.get(),
            routing_table_size,
            bucket_count,
            database_size: crate::common::read(&actor.shared.database).size(),
            estimated_size: actor.shared.size(),
            running: actor.manager.len(),
            queued_stores: actor.store_manager.queued(),
            stats: actor.dispatcher.stats(),
        }
    }
}
