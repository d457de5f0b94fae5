//! Security tokens authorizing STORE requests from remote addresses.

use crc::{Crc, CRC_32_ISCSI};
use rand::Rng;
use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use tracing::trace;

const SECRET_SIZE: usize = 20;
const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Tokens generator.
///
/// A token is a checksum of the requester's address and a secret that is
/// rotated every `rotate_interval`, tokens issued with the previous secret
/// remain valid until the next rotation.
#[derive(Clone)]
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
    rotate_interval: Duration,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    /// Create a Tokens generator.
    pub fn new(rotate_interval: Duration) -> Self {
        Tokens {
            prev_secret: random(),
            curr_secret: random(),
            last_updated: Instant::now(),
            rotate_interval,
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret needs to be updated after an interval.
    pub fn should_update(&self) -> bool {
        self.last_updated.elapsed() > self.rotate_interval
    }

    /// Validate that the token was generated for this address with the
    /// current or the previous secret.
    pub fn validate(&self, address: SocketAddr, token: &[u8]) -> bool {
        let prev = internal_generate_token(address, &self.prev_secret);
        let curr = internal_generate_token(address, &self.curr_secret);

        token == curr || token == prev
    }

    /// Rotate the tokens secret.
    pub fn rotate(&mut self) {
        trace!("Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = random();

        self.last_updated = Instant::now();
    }

    /// Generates a new token for a remote peer.
    pub fn generate_token(&self, address: SocketAddr) -> [u8; TOKEN_SIZE] {
        internal_generate_token(address, &self.curr_secret)
    }
}

fn internal_generate_token(address: SocketAddr, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
    let mut digest = CASTAGNOLI.digest();

    match address.ip() {
        IpAddr::V4(ip) => digest.update(&ip.octets()),
        IpAddr::V6(ip) => digest.update(&ip.octets()),
    }
    digest.update(&address.port().to_be_bytes());
    digest.update(secret);

    digest.finalize().to_be_bytes()
}

fn random() -> [u8; SECRET_SIZE] {
    rand::thread_rng().gen()
}
