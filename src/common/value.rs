//! Values stored in the Dht and the keys used to look them up.

use std::time::Instant;

use bytes::Bytes;

use crate::common::{Contact, Id};

/// Value type tag.
///
/// The Dht does not interpret values, the tag lets applications share the
/// same primary key for different kinds of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueType(pub u32);

impl ValueType {
    /// Matches any value type in a [ValueKey].
    pub const ANY: ValueType = ValueType(0);
    /// Opaque binary value.
    pub const BINARY: ValueType = ValueType(u32::from_be_bytes(*b"BINA"));
    /// UTF-8 text value.
    pub const TEXT: ValueType = ValueType(u32::from_be_bytes(*b"TEXT"));

    pub fn matches(&self, other: &ValueType) -> bool {
        *self == ValueType::ANY || *other == ValueType::ANY || self == other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An opaque payload with a type tag and version.
pub struct DhtValue {
    pub value_type: ValueType,
    pub version: u16,
    pub value: Bytes,
}

impl DhtValue {
    pub fn new(value_type: ValueType, value: impl Into<Bytes>) -> Self {
        Self {
            value_type,
            version: 0,
            value: value.into(),
        }
    }

    /// An empty value. Storing it removes the originator's value.
    pub fn empty(value_type: ValueType) -> Self {
        Self::new(value_type, Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

#[derive(Debug, Clone)]
/// A stored (key, value, originator) record.
pub struct DhtValueEntity {
    /// The key this value is stored under.
    pub primary_key: Id,
    /// The originator's id, distinguishes values of multiple publishers
    /// under the same primary key.
    pub secondary_key: Id,
    pub value: DhtValue,
    /// The node that published the value.
    pub creator: Contact,
    /// The node that sent the value to us, differs from the creator for
    /// republished values.
    pub sender: Contact,
    /// When the value was created on this node.
    pub creation_time: Instant,
    /// `true` if this node is the creator of the value.
    pub local: bool,
}

impl DhtValueEntity {
    /// Create a value published by `creator`.
    pub fn new(creator: Contact, primary_key: Id, value: DhtValue, local: bool) -> Self {
        Self {
            primary_key,
            secondary_key: creator.id,
            value,
            sender: creator.clone(),
            creator,
            creation_time: Instant::now(),
            local,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.value.is_empty()
    }

    /// `true` if the value was received from its creator.
    pub fn is_direct(&self) -> bool {
        self.sender.id == self.creator.id
    }
}

impl PartialEq for DhtValueEntity {
    fn eq(&self, other: &Self) -> bool {
        self.primary_key == other.primary_key
            && self.secondary_key == other.secondary_key
            && self.value == other.value
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Describes what to look up with [crate::Dht::get].
pub struct ValueKey {
    pub primary_key: Id,
    pub secondary_key: Option<Id>,
    pub value_type: ValueType,
    /// Known location of the value, if any.
    pub source: Option<Contact>,
}

impl ValueKey {
    /// Resolve any value under `primary_key` through the network.
    pub fn lookup(primary_key: Id) -> Self {
        Self {
            primary_key,
            secondary_key: None,
            value_type: ValueType::ANY,
            source: None,
        }
    }

    /// Fetch the values of one originator from a known contact.
    pub fn at(source: Contact, primary_key: Id, secondary_key: Id) -> Self {
        Self {
            primary_key,
            secondary_key: Some(secondary_key),
            value_type: ValueType::ANY,
            source: Some(source),
        }
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Returns `true` if the value has to be resolved through an iterative lookup.
    pub fn is_lookup_key(&self) -> bool {
        self.source.is_none()
    }

    pub fn matches(&self, entity: &DhtValueEntity) -> bool {
        entity.primary_key == self.primary_key
            && self
                .secondary_key
                .map(|s| s == entity.secondary_key)
                .unwrap_or(true)
            && self.value_type.matches(&entity.value.value_type)
    }
}

impl From<Id> for ValueKey {
    fn from(primary_key: Id) -> Self {
        ValueKey::lookup(primary_key)
    }
}
