#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod actor;
#[cfg(feature = "async")]
pub mod async_dht;
mod common;
mod core;
mod dht;
mod error;

pub use crate::actor::config::{Config, DEFAULT_ALPHA, DEFAULT_VENDOR};
pub use crate::actor::dispatcher::{
    AllowAll, DispatcherStats, FloodFilter, HostFilter, DEFAULT_REQUEST_TIMEOUT,
};
pub use crate::actor::transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
pub use crate::actor::Info;
pub use crate::common::{
    messages, Bucket, Contact, ContactState, Database, DatabaseSettings, DhtValue, DhtValueEntity,
    Id, RouteTable, RouteTableSettings, SelectMode, ValueKey, ValueType, Vendor, FLAG_FIREWALLED,
    FLAG_SHUTDOWN, ID_SIZE, MAX_BUCKET_SIZE_K,
};
pub use crate::core::{
    BootstrapResult, BootstrapSeed, BootstrapState, DhtFuture, DhtResult, FindValueResult,
    NodeLookupResult, PingTarget, StoreResult, StoreStatus,
};
pub use crate::dht::{Dht, Testnet};
pub use crate::error::{DecodeError, DhtError, Error, SendMessageError};

pub use bytes::Bytes;
