//! Dht operations as processes, and the state they share with the facade.

pub(crate) mod bootstrap;
pub(crate) mod estimator;
mod future;
pub(crate) mod lookup;
pub(crate) mod maintenance;
pub(crate) mod ping;
pub(crate) mod process;
pub(crate) mod server;
pub(crate) mod store;
pub(crate) mod tokens;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::common::{Database, RouteTable};

pub use bootstrap::{BootstrapResult, BootstrapSeed, BootstrapState};
pub use future::{DhtFuture, DhtResult};
pub use lookup::{FindValueResult, NodeLookupResult};
pub use ping::PingTarget;
pub use store::{StoreResult, StoreStatus};

pub(crate) use process::ProcessId;

use bootstrap::BootstrapStatus;
use estimator::SizeEstimator;

#[derive(Debug, Clone)]
/// State shared between the actor thread and the [crate::Dht] handles.
pub(crate) struct Shared {
    pub routing_table: Arc<RwLock<RouteTable>>,
    pub database: Arc<RwLock<Database>>,
    pub estimator: Arc<Mutex<SizeEstimator>>,
    pub status: BootstrapStatus,
    closed: Arc<AtomicBool>,
}

impl Shared {
    pub fn new(routing_table: RouteTable, database: Database) -> Self {
        Self {
            routing_table: Arc::new(RwLock::new(routing_table)),
            database: Arc::new(RwLock::new(database)),
            estimator: Arc::new(Mutex::new(SizeEstimator::new())),
            status: BootstrapStatus::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true once the actor stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn estimator(&self) -> MutexGuard<'_, SizeEstimator> {
        match self.estimator.lock() {
            Ok(estimator) => estimator,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Estimated size of the network.
    pub fn size(&self) -> usize {
        let table = crate::common::read(&self.routing_table);
        self.estimator().estimate(&table)
    }
}
