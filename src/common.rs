//! Miscellaneous common structs used throughout the library.

mod contact;
mod database;
mod id;
pub mod messages;
mod routing_table;
mod value;

pub use contact::*;
pub use database::*;
pub use id::*;
pub use messages::*;
pub use routing_table::*;
pub use value::*;

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read guard, recovering from a poisoned lock.
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Acquire a write guard, recovering from a poisoned lock.
pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
