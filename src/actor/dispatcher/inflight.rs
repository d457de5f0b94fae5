use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::common::Id;
use crate::core::ProcessId;

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub to: SocketAddr,
    /// Expected responder, unknown when pinging a bare address.
    pub node_id: Option<Id>,
    /// The process waiting for the response, `None` for fire and forget requests.
    pub process: Option<ProcessId>,
    pub sent_at: Instant,
    pub deadline: Instant,
    /// Sent under a throwaway id, the response is expected to carry our own id.
    pub collision: bool,
}

impl InflightRequest {
    pub fn does_match(&self, from: &SocketAddr, node_id: &Id) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        if let Some(expected) = self.node_id {
            if &expected != node_id {
                return false;
            }
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug, Default)]
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new inflight request O(1) amortized
    pub fn add(&mut self, transaction_id: u32, request: InflightRequest) {
        self.requests.insert(transaction_id, request);
    }

    /// Check if a transaction_id is still inflight and not expired O(1)
    pub fn contains(&self, transaction_id: u32) -> bool {
        self.requests
            .get(&transaction_id)
            .map(|request| request.deadline > Instant::now())
            .unwrap_or(false)
    }

    pub fn get(&self, transaction_id: u32) -> Option<&InflightRequest> {
        self.requests.get(&transaction_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Remove inflight request by transaction_id if it exists and matches the
    /// responder's address and id.
    pub fn remove(
        &mut self,
        transaction_id: u32,
        from: &SocketAddr,
        node_id: &Id,
    ) -> Option<InflightRequest> {
        let request = self.requests.get(&transaction_id)?;

        // Late responses are handled as timeouts by `expire`.
        if request.deadline <= Instant::now() {
            return None;
        }

        if !request.does_match(from, node_id) {
            return None;
        }

        self.requests.remove(&transaction_id)
    }

    /// Remove and return requests past their deadline.
    pub fn expire(&mut self) -> Vec<InflightRequest> {
        let now = Instant::now();

        let expired: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(tid, _)| *tid)
            .collect();

        expired
            .into_iter()
            .filter_map(|tid| self.requests.remove(&tid))
            .collect()
    }

    /// Remove all requests of a process.
    pub fn forget_process(&mut self, process: ProcessId) {
        self.requests
            .retain(|_, request| request.process != Some(process));
    }
}
