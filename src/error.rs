//! Main Crate Error

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
/// Mojito crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Id is not 20 bytes long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id is not a valid hex string.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Errors completing a [DhtFuture](crate::DhtFuture).
///
/// Per contact failures never show up here, they are excluded from the results
/// of the operation instead.
pub enum DhtError {
    /// The operation did not complete within its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The Dht was closed, either before or while the operation was running.
    #[error("Dht is closed")]
    Closed,

    /// There was nobody to send requests to.
    #[error("No contacts to query")]
    NoContacts,

    /// Bootstrapping failed, the node remains in the init state.
    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// A required argument was invalid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

#[derive(thiserror::Error, Debug)]
/// Errors decoding a datagram into a [Message](crate::messages::Message).
pub enum DecodeError {
    /// Errors related to parsing DHT messages.
    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    InvalidId(#[from] Error),

    /// Indicates that the message transaction_id is not four bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    #[error("Invalid vendor: {0:?}")]
    InvalidVendor(Vec<u8>),

    #[error("Wrong number of bytes for a socket address: {0}")]
    InvalidAddress(usize),

    #[error("Wrong number of bytes for a contact: {0}")]
    InvalidContact(usize),

    #[error("Invalid store status code: {0}")]
    InvalidStatusCode(u8),
}

#[derive(thiserror::Error, Debug)]
/// Errors sending a message, logged and never surfaced to callers.
pub enum SendMessageError {
    /// Errors related to encoding DHT messages.
    #[error("Failed to encode message: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Refused to send to ourselves or to an invalid address.
    #[error("Refused to send to {0}")]
    InvalidDestination(std::net::SocketAddr),
}
