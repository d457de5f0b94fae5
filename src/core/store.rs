//! Publishing values: lookup the closest nodes, then store on each of them.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::common::{
    Contact, DhtValueEntity, ErrorSpecific, Id, RequestSpecific, ResponseSpecific, SecurityToken,
    StoreRequestArguments, StoreStatusCode,
};
use crate::error::DhtError;

use super::lookup::{NodeLookup, NodeLookupResult};
use super::process::{AsyncProcess, Context};
use super::DhtFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of storing a value on one node.
pub enum StoreStatus {
    Stored,
    /// The node rejected our security token, even after acquiring a new one.
    BadToken,
    /// The node refused the value, because it is full for example.
    Rejected,
    /// The node did not respond.
    Timeout,
}

#[derive(Debug, Clone)]
/// Result of a store, per contacted node.
pub struct StoreResult {
    pub key: Id,
    pub locations: HashMap<Id, StoreStatus>,
    /// Nodes that stored the value, the local node included.
    pub stored_on: Vec<Contact>,
    pub failed: Vec<Contact>,
}

impl StoreResult {
    fn new(key: Id) -> Self {
        Self {
            key,
            locations: HashMap::new(),
            stored_on: vec![],
            failed: vec![],
        }
    }

    /// Returns true if at least one node stored the value.
    pub fn is_stored(&self) -> bool {
        !self.stored_on.is_empty()
    }

    fn record(&mut self, contact: Contact, status: StoreStatus) {
        self.locations.insert(contact.id, status);

        if status == StoreStatus::Stored {
            self.stored_on.push(contact);
        } else {
            self.failed.push(contact);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Token,
    Store,
}

#[derive(Debug)]
struct Exchange {
    contact: Contact,
    step: Step,
    retried: bool,
}

#[derive(Debug)]
/// Two phase store: a node lookup for the key, then GET_SECURITY_TOKEN
/// (unless the lookup already returned a token) and STORE on every node the
/// lookup found, a few nodes at a time.
pub(crate) struct StoreProcess {
    entity: DhtValueEntity,
    lookup: Option<DhtFuture<NodeLookupResult>>,
    queue: VecDeque<(Contact, Option<SecurityToken>)>,
    exchanges: HashMap<Id, Exchange>,
    result: StoreResult,
    future: DhtFuture<StoreResult>,
}

impl StoreProcess {
    pub fn new(entity: DhtValueEntity, future: DhtFuture<StoreResult>) -> Self {
        Self {
            result: StoreResult::new(entity.primary_key),
            entity,
            lookup: None,
            queue: VecDeque::new(),
            exchanges: HashMap::new(),
            future,
        }
    }

    pub fn future(&self) -> &DhtFuture<StoreResult> {
        &self.future
    }

    fn store_request(&self, token: SecurityToken) -> RequestSpecific {
        RequestSpecific::Store(StoreRequestArguments {
            token,
            values: vec![self.entity.clone()],
        })
    }

    /// Start exchanges while under the parallel limit, and complete once
    /// every exchange finished.
    fn pump(&mut self, ctx: &mut Context<'_>) {
        while self.exchanges.len() < ctx.config.parallel_stores.max(1) {
            let (contact, token) = match self.queue.pop_front() {
                Some(next) => next,
                None => break,
            };

            let (request, step) = match token {
                Some(token) => (self.store_request(token), Step::Store),
                None => (RequestSpecific::GetSecurityToken, Step::Token),
            };

            if ctx.send(&contact, request) {
                self.exchanges.insert(
                    contact.id,
                    Exchange {
                        contact,
                        step,
                        retried: false,
                    },
                );
            } else {
                self.result.record(contact, StoreStatus::Rejected);
            }
        }

        if self.lookup.is_none() && self.queue.is_empty() && self.exchanges.is_empty() {
            debug!(
                key = ?self.result.key,
                stored = self.result.stored_on.len(),
                failed = self.result.failed.len(),
                "Store done"
            );

            self.future.set_value(self.result.clone());
        }
    }

    fn finish_exchange(&mut self, id: &Id, status: StoreStatus) {
        if let Some(exchange) = self.exchanges.remove(id) {
            trace!(contact = ?exchange.contact, ?status, "Store exchange done");
            self.result.record(exchange.contact, status);
        }
    }

    fn exchange_id(&self, address: &SocketAddr, node_id: Option<Id>) -> Option<Id> {
        match node_id {
            Some(id) => Some(id),
            None => self
                .exchanges
                .values()
                .find(|e| &e.contact.address == address)
                .map(|e| e.contact.id),
        }
    }

    fn lookup_done(&mut self, ctx: &mut Context<'_>, lookup: NodeLookupResult) {
        let local = ctx.local();

        for contact in lookup.contacts {
            if contact.id == local.id {
                self.result.record(local.clone(), StoreStatus::Stored);
                continue;
            }

            let token = lookup.tokens.get(&contact.id).cloned();
            self.queue.push_back((contact, token));
        }

        debug!(key = ?self.result.key, nodes = self.queue.len(), "Storing on closest nodes");
        self.pump(ctx);
    }
}

impl AsyncProcess for StoreProcess {
    fn start(&mut self, ctx: &mut Context<'_>) {
        {
            let mut database = ctx.database_mut();
            database.store(self.entity.clone());
            database.mark_published(&self.entity.primary_key, &self.entity.secondary_key);
        }

        let lookup = DhtFuture::new();

        let child = lookup.clone();
        self.future.add_listener(move |_| {
            child.cancel();
        });

        ctx.submit(
            Box::new(NodeLookup::new(self.entity.primary_key, lookup.clone())),
            ctx.config.lookup_timeout,
        );
        self.lookup = Some(lookup);
    }

    fn handle_response(&mut self, ctx: &mut Context<'_>, from: Contact, response: ResponseSpecific) {
        let (step, retried) = match self.exchanges.get(&from.id) {
            Some(exchange) => (exchange.step, exchange.retried),
            None => return,
        };

        match (step, response) {
            (Step::Token, ResponseSpecific::SecurityToken(token)) => {
                let request = self.store_request(token);

                if ctx.send(&from, request) {
                    if let Some(exchange) = self.exchanges.get_mut(&from.id) {
                        exchange.step = Step::Store;
                    }
                } else {
                    self.finish_exchange(&from.id, StoreStatus::Rejected);
                }
            }
            (Step::Store, ResponseSpecific::Store(arguments)) => {
                let code = arguments
                    .status
                    .iter()
                    .find(|s| {
                        s.primary_key == self.entity.primary_key
                            && s.secondary_key == self.entity.secondary_key
                    })
                    .map(|s| s.code);

                match code {
                    Some(StoreStatusCode::Stored) => {
                        self.finish_exchange(&from.id, StoreStatus::Stored)
                    }
                    Some(StoreStatusCode::BadToken) if !retried => {
                        debug!(?from, "Token rejected, acquiring a new one");

                        if ctx.send(&from, RequestSpecific::GetSecurityToken) {
                            if let Some(exchange) = self.exchanges.get_mut(&from.id) {
                                exchange.step = Step::Token;
                                exchange.retried = true;
                            }
                        } else {
                            self.finish_exchange(&from.id, StoreStatus::BadToken);
                        }
                    }
                    Some(StoreStatusCode::BadToken) => {
                        self.finish_exchange(&from.id, StoreStatus::BadToken)
                    }
                    _ => self.finish_exchange(&from.id, StoreStatus::Rejected),
                }
            }
            (_, response) => {
                trace!(?from, ?response, "Unexpected response to a store exchange");
                self.finish_exchange(&from.id, StoreStatus::Rejected);
            }
        }

        self.pump(ctx);
    }

    fn handle_error(&mut self, ctx: &mut Context<'_>, from: Contact, error: ErrorSpecific) {
        trace!(?from, ?error, "Store exchange failed");
        self.finish_exchange(&from.id, StoreStatus::Rejected);
        self.pump(ctx);
    }

    fn handle_timeout(&mut self, ctx: &mut Context<'_>, to: SocketAddr, node_id: Option<Id>) {
        if let Some(id) = self.exchange_id(&to, node_id) {
            self.finish_exchange(&id, StoreStatus::Timeout);
        }
        self.pump(ctx);
    }

    fn tick(&mut self, ctx: &mut Context<'_>) {
        let result = match &self.lookup {
            Some(lookup) => match lookup.try_result() {
                Some(result) => result,
                None => return,
            },
            None => return,
        };
        self.lookup = None;

        match result {
            Ok(lookup) => self.lookup_done(ctx, lookup),
            Err(error) => {
                debug!(key = ?self.result.key, ?error, "Store lookup failed");
                self.future.set_error(error);
            }
        }
    }

    fn fail(&mut self, error: DhtError) {
        self.future.set_error(error);
    }

    fn is_done(&self) -> bool {
        self.future.is_done()
    }
}

#[derive(Debug)]
/// FIFO queue of stores, of which at most `max_concurrent` run at a time.
pub(crate) struct StoreManager {
    max_concurrent: usize,
    queue: VecDeque<StoreProcess>,
    running: Vec<DhtFuture<StoreResult>>,
}

impl StoreManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            queue: VecDeque::new(),
            running: vec![],
        }
    }

    /// Number of stores waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&mut self, process: StoreProcess) {
        self.queue.push_back(process);
    }

    /// Returns the queued stores that may start now.
    pub fn poll(&mut self) -> Vec<StoreProcess> {
        self.running.retain(|future| !future.is_done());

        let mut ready = vec![];

        while self.running.len() < self.max_concurrent {
            let process = match self.queue.pop_front() {
                Some(process) => process,
                None => break,
            };

            // Cancelled while waiting.
            if process.is_done() {
                continue;
            }

            self.running.push(process.future().clone());
            ready.push(process);
        }

        ready
    }

    /// Cancel the queued stores.
    pub fn close(&mut self) {
        for mut process in self.queue.drain(..) {
            process.fail(DhtError::Cancelled);
        }
        self.running.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{DhtValue, ValueType};

    fn process() -> (StoreProcess, DhtFuture<StoreResult>) {
        let creator = Contact::random("127.0.0.1:6881".parse().unwrap());
        let entity = DhtValueEntity::new(
            creator,
            Id::random(),
            DhtValue::new(ValueType::TEXT, &b"value"[..]),
            true,
        );

        let future = DhtFuture::new();
        (StoreProcess::new(entity, future.clone()), future)
    }

    #[test]
    fn queue_respects_the_concurrency_window() {
        let mut manager = StoreManager::new(1);

        let (first, first_future) = process();
        let (second, _) = process();

        manager.enqueue(first);
        manager.enqueue(second);

        assert_eq!(manager.poll().len(), 1);
        assert_eq!(manager.queued(), 1);

        // Still running.
        assert!(manager.poll().is_empty());

        first_future.set_value(StoreResult::new(Id::random()));
        assert_eq!(manager.poll().len(), 1);
        assert_eq!(manager.queued(), 0);
    }

    #[test]
    fn cancelled_while_queued_is_skipped() {
        let mut manager = StoreManager::new(1);

        let (first, first_future) = process();
        let (second, second_future) = process();
        let (third, _) = process();

        manager.enqueue(first);
        manager.enqueue(second);
        manager.enqueue(third);

        assert_eq!(manager.poll().len(), 1);

        second_future.cancel();
        first_future.cancel();

        let ready = manager.poll();
        assert_eq!(ready.len(), 1);
        assert!(!ready[0].is_done());
    }

    #[test]
    fn close_cancels_queued_stores() {
        let mut manager = StoreManager::new(1);
        let (first, _) = process();
        let (second, second_future) = process();

        manager.enqueue(first);
        manager.enqueue(second);
        manager.poll();

        manager.close();
        assert!(second_future.is_cancelled());
    }

    #[test]
    fn result_bookkeeping() {
        let mut result = StoreResult::new(Id::random());
        let ok = Contact::random("127.0.0.1:1".parse().unwrap());
        let ko = Contact::random("127.0.0.1:2".parse().unwrap());

        result.record(ok.clone(), StoreStatus::Stored);
        result.record(ko.clone(), StoreStatus::Timeout);

        assert!(result.is_stored());
        assert_eq!(result.stored_on, vec![ok.clone()]);
        assert_eq!(result.failed, vec![ko.clone()]);
        assert_eq!(result.locations.get(&ko.id), Some(&StoreStatus::Timeout));
    }
}
