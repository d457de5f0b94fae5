//! Kademlia routing table as a binary trie of k-buckets.
//!
//! Buckets partition the key space into contiguous ranges, keyed by their
//! prefix. The bucket containing the local node always splits when full,
//! the rest either split (while not too deep) or keep a replacement cache of
//! contacts waiting for a live contact to die.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::common::{Contact, Id};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// Minimum time between two liveness probes of the same contact.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// An alive contact seen within this duration is not replaced by another
/// contact claiming the same id from a different address.
const RECENTLY_ALIVE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
/// Routing table settings, see [crate::Config] for defaults.
pub struct RouteTableSettings {
    /// Max number of live contacts per bucket.
    pub k: usize,
    /// Max number of contacts in each bucket's replacement cache.
    pub max_cache_size: usize,
    /// Buckets at a depth that is a multiple of this limit don't split,
    /// unless they contain the local node or are the smallest subtree.
    pub depth_limit: usize,
    /// Failures before a contact that was never alive is considered dead.
    pub max_unknown_failures: u8,
    /// Failures before a contact that was alive is considered dead.
    pub max_alive_failures: u8,
    /// Consecutive failures after which we assume we are disconnected and
    /// stop counting failures against contacts.
    pub max_consecutive_failures: usize,
}

impl Default for RouteTableSettings {
    fn default() -> Self {
        Self {
            k: MAX_BUCKET_SIZE_K,
            max_cache_size: 16,
            depth_limit: 4,
            max_unknown_failures: 2,
            max_alive_failures: 4,
            max_consecutive_failures: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which contacts [RouteTable::select] returns.
pub enum SelectMode {
    /// Only contacts we received a message from.
    Alive,
    /// Alive contacts and contacts we only heard about from others.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    /// We received a message from this contact.
    Alive,
    /// We only heard about this contact from others.
    Unknown,
    /// Failed too many times.
    Dead,
}

#[derive(Debug, Clone)]
struct ContactEntry {
    contact: Contact,
    state: ContactState,
    ever_alive: bool,
    failures: u8,
    last_seen: Instant,
    last_probe: Option<Instant>,
}

impl ContactEntry {
    fn new(contact: Contact, alive: bool) -> Self {
        Self {
            contact,
            state: if alive {
                ContactState::Alive
            } else {
                ContactState::Unknown
            },
            ever_alive: alive,
            failures: 0,
            last_seen: Instant::now(),
            last_probe: None,
        }
    }

    fn is_alive(&self) -> bool {
        self.state == ContactState::Alive
    }

    fn recently_alive(&self) -> bool {
        self.is_alive() && self.last_seen.elapsed() < RECENTLY_ALIVE
    }

    fn mark_alive(&mut self, contact: Contact) {
        self.contact = contact;
        self.state = ContactState::Alive;
        self.ever_alive = true;
        self.failures = 0;
        self.last_seen = Instant::now();
    }
}

#[derive(Debug, Clone)]
/// A bucket covering all ids sharing its first `depth` bits with its prefix.
pub struct Bucket {
    prefix: Id,
    depth: usize,
    /// Live contacts, sorted by the least recently seen.
    live: Vec<ContactEntry>,
    /// Replacement cache, sorted by the least recently seen.
    cache: Vec<ContactEntry>,
    last_refreshed: Instant,
}

impl Bucket {
    fn root() -> Self {
        Bucket {
            prefix: Id::MIN,
            depth: 0,
            live: Vec::with_capacity(MAX_BUCKET_SIZE_K),
            cache: vec![],
            last_refreshed: Instant::now(),
        }
    }

    // === Getters ===

    pub fn prefix(&self) -> &Id {
        &self.prefix
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn last_refreshed(&self) -> Instant {
        self.last_refreshed
    }

    pub fn live_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.live.iter().map(|e| &e.contact)
    }

    pub fn cached_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.cache.iter().map(|e| &e.contact)
    }

    pub fn contains(&self, id: &Id) -> bool {
        id.shares_prefix(&self.prefix, self.depth)
    }

    // === Private Methods ===

    fn live_position(&self, id: &Id) -> Option<usize> {
        self.live.iter().position(|e| &e.contact.id == id)
    }

    fn cache_position(&self, id: &Id) -> Option<usize> {
        self.cache.iter().position(|e| &e.contact.id == id)
    }

    fn split(self) -> (Bucket, Bucket) {
        let depth = self.depth + 1;
        let bit = self.depth;

        let mut left = Bucket {
            prefix: self.prefix.with_bit(bit, false),
            depth,
            live: Vec::with_capacity(MAX_BUCKET_SIZE_K),
            cache: vec![],
            last_refreshed: self.last_refreshed,
        };
        let mut right = Bucket {
            prefix: self.prefix.with_bit(bit, true),
            ..left.clone()
        };

        for entry in self.live {
            if entry.contact.id.bit(bit) {
                right.live.push(entry);
            } else {
                left.live.push(entry);
            }
        }

        for entry in self.cache {
            if entry.contact.id.bit(bit) {
                right.cache.push(entry);
            } else {
                left.cache.push(entry);
            }
        }

        (left, right)
    }

    /// Promote the most recently seen cached contact to the live list.
    fn promote_cached(&mut self) -> Option<Id> {
        let mut entry = self.cache.pop()?;
        entry.state = ContactState::Unknown;
        entry.failures = 0;

        let id = entry.contact.id;
        self.live.push(entry);
        self.last_refreshed = Instant::now();

        Some(id)
    }
}

#[derive(Debug, Clone)]
/// Kademlia routing table of [Bucket]s.
///
/// The table itself is not synchronized, the actor shares it behind a
/// [std::sync::RwLock] so readers never observe a partial update.
pub struct RouteTable {
    local: Contact,
    settings: RouteTableSettings,
    /// Buckets by the smallest id they cover.
    buckets: BTreeMap<Id, Bucket>,
    /// Prefix and depth of the sibling of the bucket containing the local node.
    smallest_subtree: Option<(Id, usize)>,
    consecutive_failures: usize,
}

impl RouteTable {
    /// Create a new [RouteTable] for a given local contact with default settings.
    pub fn new(local: Contact) -> Self {
        Self::with_settings(local, RouteTableSettings::default())
    }

    pub fn with_settings(local: Contact, settings: RouteTableSettings) -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(Id::MIN, Bucket::root());

        RouteTable {
            local,
            settings,
            buckets,
            smallest_subtree: None,
            consecutive_failures: 0,
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.local.id
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    pub fn settings(&self) -> &RouteTableSettings {
        &self.settings
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the bucket covering `id`.
    pub fn bucket(&self, id: &Id) -> Option<&Bucket> {
        self.buckets.range(..=*id).next_back().map(|(_, b)| b)
    }

    /// Return the number of live contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.values().map(|b| b.live.len()).sum()
    }

    /// Returns `true` if this routing table has no live contacts.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns a live or cached contact by its id.
    pub fn get(&self, id: &Id) -> Option<Contact> {
        self.entry(id).map(|e| e.contact.clone())
    }

    pub fn state(&self, id: &Id) -> Option<ContactState> {
        self.entry(id).map(|e| e.state)
    }

    /// Number of failures recorded against a contact since it was last seen.
    pub fn failures(&self, id: &Id) -> u8 {
        self.entry(id).map(|e| e.failures).unwrap_or(0)
    }

    /// All live contacts we received a message from.
    pub fn active_contacts(&self) -> Vec<Contact> {
        self.buckets
            .values()
            .flat_map(|b| b.live.iter())
            .filter(|e| e.is_alive())
            .map(|e| e.contact.clone())
            .collect()
    }

    /// All live contacts, alive or unknown.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .values()
            .flat_map(|b| b.live.iter())
            .map(|e| e.contact.clone())
            .collect()
    }

    // === Public Methods ===

    /// Sets the local contact, for example after learning our external address.
    pub fn set_local_contact(&mut self, local: Contact) {
        if local.id == self.local.id {
            self.local = local;
        }
    }

    /// Add or update a contact we received a message from.
    ///
    /// Returns a contact to probe with a ping if the new contact was put in a
    /// replacement cache. If the probe fails, [Self::handle_failure] evicts it
    /// and promotes a cached contact.
    pub fn add(&mut self, contact: Contact) -> Option<Contact> {
        self.insert(contact, true)
    }

    /// Add a contact we only heard about from another node.
    ///
    /// Unknown contacts never overwrite existing ones.
    pub fn add_unknown(&mut self, contact: Contact) -> Option<Contact> {
        self.insert(contact, false)
    }

    /// Return up to `count` contacts closest to the target, sorted by distance.
    ///
    /// The local node is never returned.
    pub fn select(&self, target: &Id, count: usize, mode: SelectMode) -> Vec<Contact> {
        let mut candidates: Vec<&ContactEntry> = self
            .buckets
            .values()
            .flat_map(|b| b.live.iter())
            .filter(|e| match mode {
                SelectMode::Alive => e.is_alive(),
                SelectMode::All => e.state != ContactState::Dead,
            })
            .collect();

        candidates.sort_by_key(|e| e.contact.id.xor(target));

        candidates
            .into_iter()
            .take(count)
            .map(|e| e.contact.clone())
            .collect()
    }

    /// Marks the bucket covering `id` as refreshed.
    pub fn touch_bucket(&mut self, id: &Id) {
        if let Some(bucket) = self.bucket_mut(id) {
            bucket.last_refreshed = Instant::now();
        }
    }

    /// Returns a random id within each bucket that was not refreshed for
    /// `max_age`, or within every bucket if `force` is true.
    ///
    /// The bucket containing the local node is refreshed by looking up
    /// the local id instead.
    pub fn buckets_needing_refresh(&self, max_age: Duration, force: bool) -> Vec<Id> {
        self.buckets
            .values()
            .filter(|b| !b.contains(self.id()))
            .filter(|b| force || b.last_refreshed.elapsed() >= max_age)
            .map(|b| Id::random_with_prefix(&b.prefix, b.depth))
            .collect()
    }

    /// Records a failed request to a contact.
    ///
    /// Contacts that fail too often are removed, and replaced by the most
    /// recently seen contact in the bucket's replacement cache.
    pub fn handle_failure(&mut self, id: &Id) {
        if id == self.id() {
            return;
        }

        if self.entry(id).is_none() {
            return;
        }

        if self.consecutive_failures >= self.settings.max_consecutive_failures {
            trace!(
                context = "route_table",
                "Ignoring failure, we appear to be disconnected"
            );
            return;
        }
        self.consecutive_failures += 1;

        let max_unknown = self.settings.max_unknown_failures;
        let max_alive = self.settings.max_alive_failures;

        let bucket = match self.bucket_mut(id) {
            Some(bucket) => bucket,
            None => return,
        };

        if let Some(index) = bucket.live_position(id) {
            let entry = &mut bucket.live[index];
            entry.failures = entry.failures.saturating_add(1);

            let max = if entry.ever_alive {
                max_alive
            } else {
                max_unknown
            };

            if entry.failures >= max {
                entry.state = ContactState::Dead;

                let removed = bucket.live.remove(index);
                let promoted = bucket.promote_cached();

                trace!(context = "route_table", removed = ?removed.contact, ?promoted, "Removed dead contact");
            }
        } else if let Some(index) = bucket.cache_position(id) {
            let entry = &mut bucket.cache[index];
            entry.failures = entry.failures.saturating_add(1);

            if entry.failures >= max_unknown {
                bucket.cache.remove(index);
            }
        }
    }

    /// Removes a contact, for example after it announced its shutdown,
    /// promoting a cached contact in its place.
    pub fn remove(&mut self, id: &Id) -> bool {
        let bucket = match self.bucket_mut(id) {
            Some(bucket) => bucket,
            None => return false,
        };

        if let Some(index) = bucket.live_position(id) {
            bucket.live.remove(index);
            bucket.promote_cached();
            true
        } else if let Some(index) = bucket.cache_position(id) {
            bucket.cache.remove(index);
            true
        } else {
            false
        }
    }

    /// Removes all contacts that are not alive and clears replacement caches.
    pub fn purge(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.live.retain(|e| e.is_alive());
            bucket.cache.clear();
        }

        self.consecutive_failures = 0;
    }

    // === Private Methods ===

    fn entry(&self, id: &Id) -> Option<&ContactEntry> {
        let bucket = self.bucket(id)?;

        bucket
            .live
            .iter()
            .chain(bucket.cache.iter())
            .find(|e| &e.contact.id == id)
    }

    fn bucket_mut(&mut self, id: &Id) -> Option<&mut Bucket> {
        self.buckets.range_mut(..=*id).next_back().map(|(_, b)| b)
    }

    fn insert(&mut self, contact: Contact, alive: bool) -> Option<Contact> {
        if contact.id == self.local.id || contact.is_firewalled() {
            return None;
        }

        if alive {
            self.consecutive_failures = 0;
        }

        let k = self.settings.k;
        let max_cache_size = self.settings.max_cache_size;

        let key = self.bucket_key(&contact.id);
        let can_split = self.can_split(&key);

        let bucket = self.buckets.get_mut(&key)?;

        if let Some(index) = bucket.live_position(&contact.id) {
            update_live(bucket, index, contact, alive);
            return None;
        }

        if let Some(index) = bucket.cache_position(&contact.id) {
            if alive {
                let mut entry = bucket.cache.remove(index);
                entry.mark_alive(contact);
                bucket.cache.push(entry);
            }
            return None;
        }

        if bucket.live.len() < k {
            bucket.live.push(ContactEntry::new(contact, alive));
            if alive {
                bucket.last_refreshed = Instant::now();
            }
            return None;
        }

        if can_split {
            self.split(&key);
            return self.insert(contact, alive);
        }

        // Bucket is full and can't split.
        if alive {
            if let Some(index) = bucket
                .live
                .iter()
                .position(|e| e.state == ContactState::Unknown)
            {
                let replaced = bucket.live.remove(index);
                trace!(context = "route_table", replaced = ?replaced.contact, ?contact, "Replacing unknown contact");

                bucket.live.push(ContactEntry::new(contact, alive));
                bucket.last_refreshed = Instant::now();
                return None;
            }
        }

        if bucket.cache.len() >= max_cache_size {
            bucket.cache.remove(0);
        }
        bucket.cache.push(ContactEntry::new(contact, alive));

        let lrs = bucket.live.first_mut()?;
        let probe_due = lrs
            .last_probe
            .map(|t| t.elapsed() >= PROBE_INTERVAL)
            .unwrap_or(true);

        if probe_due && lrs.last_seen.elapsed() >= PROBE_INTERVAL {
            lrs.last_probe = Some(Instant::now());
            return Some(lrs.contact.clone());
        }

        None
    }

    fn bucket_key(&self, id: &Id) -> Id {
        self.buckets
            .range(..=*id)
            .next_back()
            .map(|(key, _)| *key)
            .unwrap_or(Id::MIN)
    }

    fn can_split(&self, key: &Id) -> bool {
        let bucket = match self.buckets.get(key) {
            Some(bucket) => bucket,
            None => return false,
        };

        if bucket.depth >= crate::common::ID_BITS {
            return false;
        }

        let contains_local = bucket.contains(self.id());
        let is_smallest_subtree = self.smallest_subtree == Some((bucket.prefix, bucket.depth));
        let too_deep = bucket.depth % self.settings.depth_limit.max(1) == 0;

        contains_local || is_smallest_subtree || !too_deep
    }

    fn split(&mut self, key: &Id) {
        let bucket = match self.buckets.remove(key) {
            Some(bucket) => bucket,
            None => return,
        };

        let contains_local = bucket.contains(self.id());
        let (left, right) = bucket.split();

        trace!(
            context = "route_table",
            depth = left.depth,
            left = left.live.len(),
            right = right.live.len(),
            "Split bucket"
        );

        if contains_local {
            self.smallest_subtree = if left.contains(self.id()) {
                Some((right.prefix, right.depth))
            } else {
                Some((left.prefix, left.depth))
            };
        }

        self.buckets.insert(left.prefix, left);
        self.buckets.insert(right.prefix, right);
    }
}

fn update_live(bucket: &mut Bucket, index: usize, contact: Contact, alive: bool) {
    if !alive {
        // Unknown contacts never replace existing ones.
        return;
    }

    let existing = &bucket.live[index];

    if existing.contact.address != contact.address && existing.recently_alive() {
        trace!(context = "route_table", ?existing.contact, ?contact, "Ignoring contact with a different address");
        return;
    }

    let mut entry = bucket.live.remove(index);
    entry.mark_alive(contact);
    bucket.live.push(entry);
    bucket.last_refreshed = Instant::now();
}
