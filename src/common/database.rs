//! Local value store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::common::{DhtValueEntity, Id, StoreStatusCode, ValueKey};

#[derive(Debug, Clone)]
/// Database settings, see [crate::Config] for defaults.
pub struct DatabaseSettings {
    /// How long a remote value lives unless it is stored again.
    pub value_ttl: Duration,
    /// Max number of primary keys holding remote values.
    pub max_database_size: usize,
    /// Max number of values (publishers) per primary key.
    pub max_values_per_key: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            value_ttl: Duration::from_secs(60 * 60),
            max_database_size: 16_384,
            max_values_per_key: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    entity: DhtValueEntity,
    stored_at: Instant,
    /// Last time a local value was published to the network.
    last_published: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
/// Values by primary key, then by secondary key (the originator's id).
///
/// Values this node published are never replaced by remote values, and never
/// expire; they are republished instead.
pub struct Database {
    settings: DatabaseSettings,
    bags: HashMap<Id, HashMap<Id, StoredValue>>,
    size: usize,
}

impl Database {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self {
            settings,
            bags: HashMap::new(),
            size: 0,
        }
    }

    // === Getters ===

    /// Number of values in the database.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn keys(&self) -> Vec<Id> {
        self.bags.keys().copied().collect()
    }

    /// All values stored under a primary key.
    pub fn get(&self, primary_key: &Id) -> Vec<DhtValueEntity> {
        self.bags
            .get(primary_key)
            .map(|bag| bag.values().map(|v| v.entity.clone()).collect())
            .unwrap_or_default()
    }

    /// Values matching a [ValueKey].
    pub fn get_matching(&self, key: &ValueKey) -> Vec<DhtValueEntity> {
        self.bags
            .get(&key.primary_key)
            .map(|bag| {
                bag.values()
                    .filter(|v| key.matches(&v.entity))
                    .map(|v| v.entity.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, primary_key: &Id, secondary_key: &Id) -> bool {
        self.bags
            .get(primary_key)
            .map(|bag| bag.contains_key(secondary_key))
            .unwrap_or(false)
    }

    pub fn values(&self) -> Vec<DhtValueEntity> {
        self.bags
            .values()
            .flat_map(|bag| bag.values().map(|v| v.entity.clone()))
            .collect()
    }

    // === Public Methods ===

    /// Store a value, or remove the originator's value if the value is empty.
    ///
    /// Remote values are either direct (sent by their creator) or indirect.
    /// Only direct values may remove a value, and indirect values never
    /// replace a direct one.
    pub fn store(&mut self, entity: DhtValueEntity) -> StoreStatusCode {
        let primary_key = entity.primary_key;
        let secondary_key = entity.secondary_key;

        let current = self
            .bags
            .get(&primary_key)
            .and_then(|bag| bag.get(&secondary_key))
            .map(|v| (v.entity.local, v.entity.is_direct()));

        if !entity.local {
            match current {
                Some((true, _)) => {
                    trace!(context = "database", ?primary_key, "Remote value can't replace a local value");
                    return StoreStatusCode::Rejected;
                }
                Some((false, true)) if !entity.is_direct() => {
                    trace!(context = "database", ?primary_key, "Indirect value can't replace a direct value");
                    return StoreStatusCode::Rejected;
                }
                _ => {}
            }
        }

        if entity.is_removal() {
            if !entity.local && !entity.is_direct() {
                trace!(
                    context = "database",
                    ?primary_key,
                    sender = ?entity.sender.id,
                    "Only the creator can remove its value"
                );
                return StoreStatusCode::Rejected;
            }

            self.remove(&primary_key, &secondary_key);
            return StoreStatusCode::Stored;
        }

        if !entity.local && !self.can_add(&entity) {
            return StoreStatusCode::Rejected;
        }

        if current.is_none() {
            self.size += 1;
        }

        let last_published = self
            .bags
            .get(&primary_key)
            .and_then(|bag| bag.get(&secondary_key))
            .filter(|v| v.entity.value == entity.value)
            .and_then(|v| v.last_published);

        self.bags.entry(primary_key).or_default().insert(
            secondary_key,
            StoredValue {
                entity,
                stored_at: Instant::now(),
                last_published,
            },
        );

        StoreStatusCode::Stored
    }

    /// Remove a value, returns it if it existed.
    pub fn remove(&mut self, primary_key: &Id, secondary_key: &Id) -> Option<DhtValueEntity> {
        let bag = self.bags.get_mut(primary_key)?;
        let removed = bag.remove(secondary_key)?;

        if bag.is_empty() {
            self.bags.remove(primary_key);
        }
        self.size -= 1;

        Some(removed.entity)
    }

    /// Remote values are limited in keys and in values per key, a full key
    /// only accepts its direct values again.
    fn can_add(&self, entity: &DhtValueEntity) -> bool {
        match self.bags.get(&entity.primary_key) {
            None if self.bags.len() >= self.settings.max_database_size => {
                trace!(context = "database", keys = self.bags.len(), "Database is full");
                false
            }
            None => true,
            Some(bag) if bag.len() < self.settings.max_values_per_key => true,
            Some(bag) => {
                let replaces = entity.is_direct() && bag.contains_key(&entity.secondary_key);
                if !replaces {
                    trace!(context = "database", primary_key = ?entity.primary_key, "Too many values for key");
                }
                replaces
            }
        }
    }

    /// Remove all remote values older than the value TTL, returns the removed values.
    pub fn expire(&mut self) -> Vec<DhtValueEntity> {
        let ttl = self.settings.value_ttl;
        let mut expired = vec![];

        for bag in self.bags.values_mut() {
            let keys: Vec<Id> = bag
                .iter()
                .filter(|(_, v)| !v.entity.local && v.stored_at.elapsed() >= ttl)
                .map(|(k, _)| *k)
                .collect();

            for key in keys {
                if let Some(value) = bag.remove(&key) {
                    expired.push(value.entity);
                }
            }
        }

        self.bags.retain(|_, bag| !bag.is_empty());
        self.size -= expired.len();

        expired
    }

    /// Local values that were never published, or not within `interval`.
    pub fn values_to_republish(&self, interval: Duration) -> Vec<DhtValueEntity> {
        self.bags
            .values()
            .flat_map(|bag| bag.values())
            .filter(|v| v.entity.local)
            .filter(|v| {
                v.last_published
                    .map(|t| t.elapsed() >= interval)
                    .unwrap_or(true)
            })
            .map(|v| v.entity.clone())
            .collect()
    }

    /// Records that a local value was just published.
    pub fn mark_published(&mut self, primary_key: &Id, secondary_key: &Id) {
        if let Some(value) = self
            .bags
            .get_mut(primary_key)
            .and_then(|bag| bag.get_mut(secondary_key))
        {
            value.last_published = Some(Instant::now());
        }
    }
}
