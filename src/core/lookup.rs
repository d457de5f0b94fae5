//! Iterative FIND_NODE and FIND_VALUE lookups.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    Contact, DhtValueEntity, FindNodeRequestArguments, FindValueRequestArguments, Id,
    RequestSpecific, ResponseSpecific, SecurityToken, SelectMode, ValueKey,
};
use crate::error::DhtError;

use super::process::{AsyncProcess, Context};
use super::DhtFuture;

#[derive(Debug, Clone)]
/// Result of a node lookup.
pub struct NodeLookupResult {
    pub target: Id,
    /// Up to k closest nodes that responded, sorted by distance to the target.
    ///
    /// Includes the local node if it is among the closest.
    pub contacts: Vec<Contact>,
    /// Security tokens the responders sent along their closer nodes.
    pub tokens: HashMap<Id, SecurityToken>,
    /// Number of hops from our routing table to the furthest responder.
    pub hops: usize,
    /// Contacts from our routing table that failed to respond.
    pub route_table_failures: usize,
    /// Requests that timed out.
    pub timeouts: usize,
    /// Other nodes reported with our id at a different address.
    pub collisions: Vec<Contact>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
/// Result of a value lookup.
pub struct FindValueResult {
    pub key: ValueKey,
    /// Values matching the key, empty if none was found.
    pub entities: Vec<DhtValueEntity>,
    /// Nodes that responded before the lookup ended.
    pub contacts: Vec<Contact>,
    pub found: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Pending,
    Querying,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    contact: Contact,
    state: CandidateState,
    /// Failures recorded by the routing table when the candidate was added.
    failures: u8,
    hop: usize,
    from_table: bool,
}

#[derive(Debug)]
/// Candidates of a lookup, and the bookkeeping of its convergence.
struct Shortlist {
    target: Id,
    local: Id,
    local_address: SocketAddr,
    k: usize,
    alpha: usize,
    candidates: HashMap<Id, Candidate>,
    /// Ids of responders, by their distance to the target.
    responders: BTreeMap<Id, Id>,
    tokens: HashMap<Id, SecurityToken>,
    inflight: usize,
    hops: usize,
    timeouts: usize,
    route_table_failures: usize,
    collisions: Vec<Contact>,
    started_at: Instant,
    /// Last response or failure.
    last_activity: Instant,
}

impl Shortlist {
    /// The local node counts as a responder, and is never queried.
    fn new(target: Id, local: Contact, k: usize, alpha: usize) -> Self {
        let mut shortlist = Self {
            target,
            local: local.id,
            local_address: local.address,
            k: k.max(1),
            alpha: alpha.max(1),
            candidates: HashMap::new(),
            responders: BTreeMap::new(),
            tokens: HashMap::new(),
            inflight: 0,
            hops: 0,
            timeouts: 0,
            route_table_failures: 0,
            collisions: vec![],
            started_at: Instant::now(),
            last_activity: Instant::now(),
        };

        shortlist.responders.insert(local.id.xor(&target), local.id);
        shortlist.candidates.insert(
            local.id,
            Candidate {
                contact: local,
                state: CandidateState::Responded,
                failures: 0,
                hop: 0,
                from_table: false,
            },
        );

        shortlist
    }

    /// Query a single known node, whatever its distance compared to ours.
    fn direct(target: Id, local: Contact, node: Contact) -> Self {
        let mut shortlist = Self::new(target, local, 1, 1);
        shortlist.responders.clear();
        shortlist.add(node, 0, 0, false);
        shortlist
    }

    /// Add a candidate, returns false if it is the local node or already known.
    ///
    /// A contact with our id at another address is recorded as a collision.
    fn add(&mut self, contact: Contact, failures: u8, hop: usize, from_table: bool) -> bool {
        if contact.id == self.local {
            if contact.address != self.local_address
                && !self.collisions.iter().any(|c| c.address == contact.address)
            {
                debug!(?contact, "Another node is using our id");
                self.collisions.push(contact);
            }
            return false;
        }

        if self.candidates.contains_key(&contact.id) {
            return false;
        }

        self.candidates.insert(
            contact.id,
            Candidate {
                contact,
                state: CandidateState::Pending,
                failures,
                hop,
                from_table,
            },
        );

        true
    }

    /// Distance of the furthest of the k closest responders, once k responded.
    fn kth_responder_distance(&self) -> Option<&Id> {
        if self.responders.len() < self.k {
            return None;
        }

        self.responders.keys().nth(self.k - 1)
    }

    /// The closest pending candidate worth querying.
    ///
    /// Candidates in the same distance bucket of the target are tried
    /// in order of fewer failures first.
    fn next(&self) -> Option<Id> {
        let bound = self.kth_responder_distance();

        self.candidates
            .values()
            .filter(|c| c.state == CandidateState::Pending)
            .map(|c| (c.contact.id.xor(&self.target), c))
            .filter(|(distance, _)| bound.map(|b| distance < b).unwrap_or(true))
            .min_by_key(|(distance, c)| {
                (
                    self.target.log_distance(&c.contact.id),
                    c.failures,
                    *distance,
                )
            })
            .map(|(_, c)| c.contact.id)
    }

    /// Mark the next candidates as queried, up to `alpha` inflight requests.
    fn take_next(&mut self) -> Vec<Contact> {
        let mut next = vec![];

        while self.inflight < self.alpha {
            let id = match self.next() {
                Some(id) => id,
                None => break,
            };

            if let Some(candidate) = self.candidates.get_mut(&id) {
                candidate.state = CandidateState::Querying;
                self.inflight += 1;
                next.push(candidate.contact.clone());
            }
        }

        next
    }

    /// Query one more candidate, beyond `alpha`, once nothing was heard
    /// from the inflight ones for `timeout`.
    fn boost(&mut self, timeout: Duration) -> Option<Contact> {
        if self.inflight == 0 || self.last_activity.elapsed() < timeout {
            return None;
        }

        let id = self.next()?;
        let candidate = self.candidates.get_mut(&id)?;

        candidate.state = CandidateState::Querying;
        self.inflight += 1;
        self.last_activity = Instant::now();

        Some(candidate.contact.clone())
    }

    /// A request could not even be sent.
    fn refused(&mut self, id: &Id) {
        if let Some(candidate) = self.candidates.get_mut(id) {
            if candidate.state == CandidateState::Querying {
                candidate.state = CandidateState::Failed;
                self.inflight -= 1;
            }
        }
    }

    /// Record a response, returns false if we were not waiting for one from this node.
    fn responded(&mut self, from: &Contact, token: Option<SecurityToken>) -> bool {
        let candidate = match self.candidates.get_mut(&from.id) {
            Some(candidate) if candidate.state == CandidateState::Querying => candidate,
            _ => return false,
        };

        candidate.state = CandidateState::Responded;
        candidate.contact = from.clone();
        self.inflight -= 1;
        self.hops = self.hops.max(candidate.hop);
        self.last_activity = Instant::now();

        self.responders.insert(from.id.xor(&self.target), from.id);

        if let Some(token) = token {
            self.tokens.insert(from.id, token);
        }

        true
    }

    /// Add the closer contacts a responder returned, returns the new ones.
    fn merge(&mut self, from: &Id, contacts: &[Contact], failures: impl Fn(&Id) -> u8) -> Vec<Contact> {
        let hop = self
            .candidates
            .get(from)
            .map(|c| c.hop + 1)
            .unwrap_or(1);

        contacts
            .iter()
            .filter(|c| !c.is_firewalled())
            .filter(|c| self.add((*c).clone(), failures(&c.id), hop, false))
            .cloned()
            .collect()
    }

    /// Record a request that timed out or failed.
    fn failed(&mut self, address: &SocketAddr, node_id: Option<&Id>) -> bool {
        let id = match node_id {
            Some(id) => *id,
            None => match self
                .candidates
                .values()
                .find(|c| c.state == CandidateState::Querying && &c.contact.address == address)
            {
                Some(c) => c.contact.id,
                None => return false,
            },
        };

        let candidate = match self.candidates.get_mut(&id) {
            Some(candidate) if candidate.state == CandidateState::Querying => candidate,
            _ => return false,
        };

        candidate.state = CandidateState::Failed;
        self.inflight -= 1;
        self.timeouts += 1;
        self.last_activity = Instant::now();
        if candidate.from_table {
            self.route_table_failures += 1;
        }

        true
    }

    /// Converged: nothing closer left to query and nothing inflight.
    fn is_done(&self) -> bool {
        self.inflight == 0 && self.next().is_none()
    }

    /// Up to k closest responders, sorted by distance.
    fn closest(&self) -> Vec<Contact> {
        self.responders
            .values()
            .take(self.k)
            .filter_map(|id| self.candidates.get(id))
            .map(|c| c.contact.clone())
            .collect()
    }

    fn into_node_result(self) -> NodeLookupResult {
        NodeLookupResult {
            target: self.target,
            contacts: self.closest(),
            tokens: self.tokens,
            hops: self.hops,
            route_table_failures: self.route_table_failures,
            timeouts: self.timeouts,
            collisions: self.collisions,
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// Seed a shortlist from the routing table.
fn seed(ctx: &Context<'_>, target: Id) -> Option<Shortlist> {
    let local = ctx.local();
    let mut shortlist = Shortlist::new(target, local, ctx.config.k, ctx.config.alpha);

    let table = ctx.routing_table();
    for contact in table.select(&target, ctx.config.k, SelectMode::All) {
        let failures = table.failures(&contact.id);
        shortlist.add(contact, failures, 0, true);
    }

    if shortlist.candidates.len() <= 1 {
        return None;
    }

    Some(shortlist)
}

/// Send requests to the next candidates.
fn query_next(ctx: &mut Context<'_>, shortlist: &mut Shortlist, request: &RequestSpecific) {
    // Refused requests free their slot, so keep going until nothing is sent.
    loop {
        let next = shortlist.take_next();
        if next.is_empty() {
            break;
        }

        for contact in next {
            if !ctx.send(&contact, request.clone()) {
                shortlist.refused(&contact.id);
            }
        }
    }
}

/// Give a slow lookup one more candidate.
fn boost(ctx: &mut Context<'_>, shortlist: &mut Shortlist, request: &RequestSpecific) {
    if let Some(contact) = shortlist.boost(ctx.config.boost_timeout) {
        trace!(?contact, "Boosting lookup");

        if !ctx.send(&contact, request.clone()) {
            shortlist.refused(&contact.id);
        }
    }
}

/// Learn about the contacts a responder returned.
fn merge_contacts(ctx: &mut Context<'_>, shortlist: &mut Shortlist, from: &Id, contacts: &[Contact]) {
    let added = {
        let table = ctx.routing_table();
        shortlist.merge(from, contacts, |id| table.failures(id))
    };

    if !added.is_empty() {
        let mut table = ctx.routing_table_mut();
        for contact in added {
            table.add_unknown(contact);
        }
    }
}

#[derive(Debug)]
/// Iterative FIND_NODE converging on the k closest nodes to a target.
pub(crate) struct NodeLookup {
    target: Id,
    shortlist: Option<Shortlist>,
    future: DhtFuture<NodeLookupResult>,
}

impl NodeLookup {
    pub fn new(target: Id, future: DhtFuture<NodeLookupResult>) -> Self {
        Self {
            target,
            shortlist: None,
            future,
        }
    }

    fn request(&self) -> RequestSpecific {
        RequestSpecific::FindNode(FindNodeRequestArguments {
            target: self.target,
        })
    }

    fn advance(&mut self, ctx: &mut Context<'_>) {
        let request = self.request();

        let done = match self.shortlist.as_mut() {
            Some(shortlist) => {
                query_next(ctx, shortlist, &request);
                shortlist.is_done()
            }
            None => return,
        };

        if done {
            if let Some(shortlist) = self.shortlist.take() {
                ctx.routing_table_mut().touch_bucket(&self.target);

                let result = shortlist.into_node_result();
                debug!(
                    target = ?result.target,
                    closest = result.contacts.len(),
                    hops = result.hops,
                    timeouts = result.timeouts,
                    elapsed = ?result.elapsed,
                    "Node lookup done"
                );

                self.future.set_value(result);
            }
        }
    }
}

impl AsyncProcess for NodeLookup {
    fn start(&mut self, ctx: &mut Context<'_>) {
        match seed(ctx, self.target) {
            Some(shortlist) => {
                self.shortlist = Some(shortlist);
                self.advance(ctx);
            }
            None => {
                debug!(target = ?self.target, "Nothing to contact for node lookup");
                self.future.set_error(DhtError::NoContacts);
            }
        }
    }

    fn handle_response(&mut self, ctx: &mut Context<'_>, from: Contact, response: ResponseSpecific) {
        let shortlist = match self.shortlist.as_mut() {
            Some(shortlist) => shortlist,
            None => return,
        };

        let token = response.token().cloned();
        if !shortlist.responded(&from, token) {
            trace!(?from, "Response from a node we were not waiting for");
            return;
        }

        if let Some(contacts) = response.contacts() {
            merge_contacts(ctx, shortlist, &from.id, contacts);
        }

        self.advance(ctx);
    }

    fn handle_timeout(&mut self, ctx: &mut Context<'_>, to: SocketAddr, node_id: Option<Id>) {
        if let Some(shortlist) = self.shortlist.as_mut() {
            shortlist.failed(&to, node_id.as_ref());
        }

        self.advance(ctx);
    }

    fn tick(&mut self, ctx: &mut Context<'_>) {
        let request = self.request();
        if let Some(shortlist) = self.shortlist.as_mut() {
            boost(ctx, shortlist, &request);
        }

        self.advance(ctx);
    }

    fn fail(&mut self, error: DhtError) {
        self.future.set_error(error);
    }

    fn is_done(&self) -> bool {
        self.future.is_done()
    }
}

#[derive(Debug)]
/// Iterative FIND_VALUE, ending on the first response carrying values.
pub(crate) struct ValueLookup {
    key: ValueKey,
    shortlist: Option<Shortlist>,
    future: DhtFuture<FindValueResult>,
}

impl ValueLookup {
    pub fn new(key: ValueKey, future: DhtFuture<FindValueResult>) -> Self {
        Self {
            key,
            shortlist: None,
            future,
        }
    }

    fn request(&self) -> RequestSpecific {
        RequestSpecific::FindValue(FindValueRequestArguments {
            target: self.key.primary_key,
            secondary_keys: self.key.secondary_key.into_iter().collect(),
            value_type: self.key.value_type,
        })
    }

    fn complete(&mut self, entities: Vec<DhtValueEntity>, contacts: Vec<Contact>) {
        let found = !entities.is_empty();

        debug!(key = ?self.key.primary_key, found, values = entities.len(), "Value lookup done");

        self.future.set_value(FindValueResult {
            key: self.key.clone(),
            entities,
            contacts,
            found,
        });
    }

    fn advance(&mut self, ctx: &mut Context<'_>) {
        let request = self.request();

        let done = match self.shortlist.as_mut() {
            Some(shortlist) => {
                query_next(ctx, shortlist, &request);
                shortlist.is_done()
            }
            None => return,
        };

        if done {
            if let Some(shortlist) = self.shortlist.take() {
                ctx.routing_table_mut().touch_bucket(&self.key.primary_key);
                self.complete(vec![], shortlist.closest());
            }
        }
    }
}

impl AsyncProcess for ValueLookup {
    fn start(&mut self, ctx: &mut Context<'_>) {
        let local = ctx.database().get_matching(&self.key);
        if !local.is_empty() {
            self.complete(local, vec![ctx.local()]);
            return;
        }

        let shortlist = match self.key.source.clone() {
            Some(source) if source.id == ctx.local().id => {
                self.complete(vec![], vec![]);
                return;
            }
            Some(source) => Some(Shortlist::direct(self.key.primary_key, ctx.local(), source)),
            None => seed(ctx, self.key.primary_key),
        };

        match shortlist {
            Some(shortlist) => {
                self.shortlist = Some(shortlist);
                self.advance(ctx);
            }
            None => {
                debug!(key = ?self.key.primary_key, "Nothing to contact for value lookup");
                self.future.set_error(DhtError::NoContacts);
            }
        }
    }

    fn handle_response(&mut self, ctx: &mut Context<'_>, from: Contact, response: ResponseSpecific) {
        let shortlist = match self.shortlist.as_mut() {
            Some(shortlist) => shortlist,
            None => return,
        };

        let token = response.token().cloned();
        if !shortlist.responded(&from, token) {
            trace!(?from, "Response from a node we were not waiting for");
            return;
        }

        if let ResponseSpecific::FindValue(arguments) = &response {
            let key = &self.key;
            let entities: Vec<DhtValueEntity> = arguments
                .values
                .iter()
                .filter(|entity| key.matches(entity))
                .cloned()
                .collect();

            if !entities.is_empty() {
                let contacts = shortlist.closest();
                self.shortlist = None;
                self.complete(entities, contacts);
                return;
            }
        }

        if self.key.source.is_none() {
            if let Some(contacts) = response.contacts() {
                merge_contacts(ctx, shortlist, &from.id, contacts);
            }
        }

        self.advance(ctx);
    }

    fn handle_timeout(&mut self, ctx: &mut Context<'_>, to: SocketAddr, node_id: Option<Id>) {
        if let Some(shortlist) = self.shortlist.as_mut() {
            shortlist.failed(&to, node_id.as_ref());
        }

        self.advance(ctx);
    }

    fn tick(&mut self, ctx: &mut Context<'_>) {
        let request = self.request();
        if let Some(shortlist) = self.shortlist.as_mut() {
            boost(ctx, shortlist, &request);
        }

        self.advance(ctx);
    }

    fn fail(&mut self, error: DhtError) {
        self.future.set_error(error);
    }

    fn is_done(&self) -> bool {
        self.future.is_done()
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::actor::config::Config;
    use crate::actor::dispatcher::{AllowAll, MessageDispatcher};
    use crate::actor::transport::{MemoryNetwork, Transport};
    use crate::common::{self, Database, RouteTable};
    use crate::core::process::{Environment, FutureManager};
    use crate::core::Shared;

    fn contact(first_byte: u8, port: u16) -> Contact {
        let mut bytes = [0_u8; 20];
        bytes[0] = first_byte;
        Contact::new(Id(bytes), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn local_node_is_a_responder_never_queried() {
        let local = contact(0x00, 1);
        let mut shortlist = Shortlist::new(contact(0x81, 0).id, local.clone(), 20, 3);

        assert!(!shortlist.add(local.clone(), 0, 0, true));
        assert!(shortlist.take_next().is_empty());
        assert!(shortlist.is_done());
        assert_eq!(shortlist.closest(), vec![local]);
    }

    #[test]
    fn alpha_bounds_inflight_requests() {
        let target = contact(0xff, 0).id;
        let mut shortlist = Shortlist::new(target, contact(0x00, 1), 20, 3);

        for i in 1..=10 {
            shortlist.add(contact(0x80 + i, 1000 + i as u16), 0, 0, true);
        }

        let first = shortlist.take_next();
        assert_eq!(first.len(), 3);
        assert!(shortlist.take_next().is_empty());

        // Closest first.
        assert_eq!(first[0].id, contact(0x8a, 0).id);

        assert!(shortlist.responded(&first[0], Some(vec![1, 2, 3, 4])));
        assert_eq!(shortlist.take_next().len(), 1);
        assert!(shortlist.tokens.contains_key(&first[0].id));
    }

    #[test]
    fn tie_break_prefers_fewer_failures() {
        let target = contact(0x00, 0).id;
        let mut shortlist = Shortlist::new(target, contact(0xff, 1), 20, 1);

        // Same distance bucket (leading bit 0, second bit 1), different failures.
        shortlist.add(contact(0x40, 2), 3, 0, true);
        shortlist.add(contact(0x41, 3), 0, 0, true);

        assert_eq!(shortlist.take_next()[0].id, contact(0x41, 0).id);
    }

    #[test]
    fn converges_on_k_closest_responders() {
        let target = contact(0x00, 0).id;
        let mut shortlist = Shortlist::new(target, contact(0xff, 1), 2, 3);

        let near = contact(0x01, 2);
        let nearer = contact(0x02, 3);
        let far = contact(0x70, 4);

        shortlist.add(far.clone(), 0, 0, true);
        shortlist.add(near.clone(), 0, 0, true);

        let queried = shortlist.take_next();
        assert_eq!(queried.len(), 2);

        assert!(shortlist.responded(&near, None));
        let added = shortlist.merge(&near.id, &[nearer.clone(), far.clone()], |_| 0);
        assert_eq!(added, vec![nearer.clone()]);

        assert!(shortlist.responded(&far, None));
        assert_eq!(shortlist.take_next(), vec![nearer.clone()]);
        assert!(!shortlist.is_done());

        assert!(shortlist.failed(&nearer.address, Some(&nearer.id)));
        assert!(shortlist.is_done());

        let result = shortlist.into_node_result();
        assert_eq!(result.contacts, vec![near, far]);
        assert_eq!(result.timeouts, 1);
        assert_eq!(result.route_table_failures, 0);
        assert_eq!(result.hops, 0);
    }

    #[test]
    fn direct_queries_the_source_only() {
        let target = contact(0x00, 0).id;
        let source = contact(0xf0, 2);
        let mut shortlist = Shortlist::direct(target, contact(0x01, 1), source.clone());

        assert_eq!(shortlist.take_next(), vec![source.clone()]);
        assert!(shortlist.responded(&source, None));
        assert!(shortlist.is_done());
        assert_eq!(shortlist.closest(), vec![source]);
    }

    #[test]
    fn ignores_unexpected_responders() {
        let target = contact(0x00, 0).id;
        let mut shortlist = Shortlist::new(target, contact(0xff, 1), 20, 3);

        let stranger = contact(0x01, 2);
        assert!(!shortlist.responded(&stranger, None));
        assert!(!shortlist.failed(&stranger.address, None));
        assert!(shortlist.closest().iter().all(|c| c.id != stranger.id));
    }

    #[test]
    fn records_other_nodes_with_our_id() {
        let local = contact(0x00, 1);
        let mut shortlist = Shortlist::new(contact(0x81, 0).id, local.clone(), 20, 3);

        let twin = contact(0x00, 2);
        let added = shortlist.merge(&local.id, &[twin.clone(), local.clone(), twin.clone()], |_| 0);

        assert!(added.is_empty());
        assert_eq!(shortlist.into_node_result().collisions, vec![twin]);
    }

    #[test]
    fn boost_queries_beyond_alpha_when_idle() {
        let target = contact(0x00, 0).id;
        let mut shortlist = Shortlist::new(target, contact(0xff, 1), 20, 1);

        assert!(shortlist.boost(Duration::ZERO).is_none());

        shortlist.add(contact(0x01, 2), 0, 0, true);
        shortlist.add(contact(0x02, 3), 0, 0, true);
        assert_eq!(shortlist.take_next().len(), 1);

        assert!(shortlist.boost(Duration::from_secs(60)).is_none());
        assert_eq!(shortlist.boost(Duration::ZERO), Some(contact(0x02, 3)));
        assert_eq!(shortlist.inflight, 2);

        // Nothing left to boost with.
        assert!(shortlist.boost(Duration::ZERO).is_none());
    }

    #[test]
    fn silent_nodes_get_a_boosted_lookup() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let local = contact(0xff, transport.local_addr().port());

        let shared = Shared::new(RouteTable::new(local.clone()), Database::default());
        {
            let mut table = common::write(&shared.routing_table);
            // Nobody listens on these addresses.
            table.add_unknown(contact(0x10, 2));
            table.add_unknown(contact(0x20, 3));
        }

        let mut dispatcher = MessageDispatcher::new(
            Box::new(transport),
            local,
            shared.routing_table.clone(),
            Box::new(AllowAll),
            Duration::from_secs(60),
        );
        let config = Config {
            alpha: 1,
            boost_timeout: Duration::from_millis(200),
            ..Default::default()
        };

        let mut env = Environment {
            config: &config,
            shared: &shared,
            dispatcher: &mut dispatcher,
        };
        let mut manager = FutureManager::new();

        let future = DhtFuture::new();
        manager.submit(
            &mut env,
            Box::new(NodeLookup::new(contact(0x00, 0).id, future.clone())),
            Duration::from_secs(60),
        );
        assert_eq!(env.dispatcher.inflight_count(), 1);

        manager.tick(&mut env);
        assert_eq!(env.dispatcher.inflight_count(), 1);

        thread::sleep(Duration::from_millis(250));
        manager.tick(&mut env);

        assert_eq!(env.dispatcher.inflight_count(), 2);
        assert!(!future.is_done());
    }
}
