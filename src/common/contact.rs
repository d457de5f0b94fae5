//! Remote node identity as known to the routing table.
use std::{
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    net::SocketAddr,
};

use crate::common::Id;

/// The contact can't receive unsolicited messages.
pub const FLAG_FIREWALLED: u8 = 0x01;
/// The contact is shutting down and should be removed from routing tables.
pub const FLAG_SHUTDOWN: u8 = 0x02;

/// Four letters vendor code, similar to Gnutella's vendor codes.
pub type Vendor = [u8; 4];

#[derive(Clone)]
/// Immutable snapshot of a remote node.
///
/// Liveness bookkeeping (failures, last seen time) lives in the
/// [RouteTable](crate::RouteTable), so cloning a Contact is all that is needed
/// to hand it out to other threads.
///
/// Two contacts are equal if their ids are equal.
pub struct Contact {
    pub id: Id,
    pub address: SocketAddr,
    pub vendor: Vendor,
    pub version: u16,
    pub instance_id: u8,
    pub flags: u8,
}

impl Contact {
    /// Creates a new Contact from an id and socket address with unknown vendor and version.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            vendor: [0; 4],
            version: 0,
            instance_id: 0,
            flags: 0,
        }
    }

    /// Creates a contact with a random Id.
    pub fn random(address: SocketAddr) -> Contact {
        Contact::new(Id::random(), address)
    }

    pub fn with_vendor(mut self, vendor: Vendor, version: u16) -> Self {
        self.vendor = vendor;
        self.version = version;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_instance_id(mut self, instance_id: u8) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn is_firewalled(&self) -> bool {
        self.flags & FLAG_FIREWALLED != 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.flags & FLAG_SHUTDOWN != 0
    }

    /// Returns `true` if both the ids and the addresses are equal.
    pub fn same_node(&self, other: &Contact) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Contact({}, {}, {}/{})",
            self.id,
            self.address,
            String::from_utf8_lossy(&self.vendor),
            self.version
        )
    }
}
