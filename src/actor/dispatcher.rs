//! Message dispatcher correlating requests and responses over a [Transport].

mod filter;
mod inflight;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    self, Contact, ErrorSpecific, Id, Message, MessageType, RequestSpecific, ResponseSpecific,
    RouteTable, FLAG_FIREWALLED,
};
use crate::core::ProcessId;
use crate::error::SendMessageError;

use super::transport::Transport;
use inflight::{InflightRequest, InflightRequests};

pub use filter::{AllowAll, FloodFilter, HostFilter};

const VERSION: [u8; 4] = *b"MJ01";

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds

#[derive(Debug, Clone)]
/// What the dispatcher received or observed.
pub enum DispatcherEvent {
    /// An unsolicited request.
    Request {
        from: Contact,
        transaction_id: u32,
        request: RequestSpecific,
    },
    /// A response to one of our requests.
    Response {
        process: Option<ProcessId>,
        from: Contact,
        response: ResponseSpecific,
        rtt: Duration,
    },
    /// An error response to one of our requests.
    Error {
        process: Option<ProcessId>,
        from: Contact,
        error: ErrorSpecific,
    },
    /// One of our requests got no response before its deadline.
    Timeout {
        process: Option<ProcessId>,
        to: SocketAddr,
        node_id: Option<Id>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Counters of the dispatcher's traffic.
pub struct DispatcherStats {
    pub sent: u64,
    pub received: u64,
    /// Datagrams dropped by the [HostFilter].
    pub filtered: u64,
    /// Datagrams that could not be decoded.
    pub malformed: u64,
    /// Responses with an unknown transaction id or from the wrong address.
    pub unexpected: u64,
    pub timeouts: u64,
}

/// Sends requests, correlates responses by transaction id and source address,
/// and fires timeouts for requests past their deadline.
///
/// Every message received from a node updates the [RouteTable] before it
/// is handed over.
#[derive(Debug)]
pub struct MessageDispatcher {
    next_tid: u32,
    transport: Box<dyn Transport>,
    local: Contact,
    /// Sender id of our collision pings.
    collision_id: Id,
    routing_table: Arc<RwLock<RouteTable>>,
    inflight: InflightRequests,
    filter: Box<dyn HostFilter>,
    request_timeout: Duration,
    stats: DispatcherStats,
}

impl MessageDispatcher {
    pub fn new(
        transport: Box<dyn Transport>,
        local: Contact,
        routing_table: Arc<RwLock<RouteTable>>,
        filter: Box<dyn HostFilter>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            next_tid: 0,
            transport,
            local,
            collision_id: Id::random(),
            routing_table,
            inflight: InflightRequests::new(),
            filter,
            request_timeout,
            stats: DispatcherStats::default(),
        }
    }

    // === Getters ===

    /// Returns the address the transport is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns true if this transaction_id is still inflight
    pub fn inflight(&self, transaction_id: u32) -> bool {
        self.inflight.contains(transaction_id)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    // === Public Methods ===

    /// Updates the sender descriptor put on outgoing messages.
    pub fn set_local_contact(&mut self, local: Contact) {
        self.local = local;
    }

    /// Send a request to a contact on behalf of a process, and return the transaction_id.
    pub fn request_contact(
        &mut self,
        process: Option<ProcessId>,
        contact: &Contact,
        request: RequestSpecific,
    ) -> Result<u32, SendMessageError> {
        self.request(process, contact.address, Some(contact.id), request, None)
    }

    /// Send a request to an address, the response is only accepted from that
    /// address and, if known, from `node_id`.
    pub fn request(
        &mut self,
        process: Option<ProcessId>,
        address: SocketAddr,
        node_id: Option<Id>,
        request: RequestSpecific,
        timeout: Option<Duration>,
    ) -> Result<u32, SendMessageError> {
        if !self.is_valid_destination(&address, node_id.as_ref()) {
            trace!(context = "dispatcher_validation", ?address, "Refusing to send to ourselves");
            return Err(SendMessageError::InvalidDestination(address));
        }

        let transaction_id = self.tid();
        let message = self.message(transaction_id, MessageType::Request(request));

        self.enqueue(
            process,
            address,
            node_id,
            message,
            timeout.unwrap_or(self.request_timeout),
            false,
        );

        Ok(transaction_id)
    }

    /// Ping an address under a throwaway id, flagged firewalled so the
    /// remote node does not add it to its routing table.
    ///
    /// A node using our id responds with it, and only these responses
    /// carrying our id are accepted.
    pub fn collision_ping(
        &mut self,
        process: Option<ProcessId>,
        address: SocketAddr,
    ) -> Result<u32, SendMessageError> {
        if !self.is_valid_destination(&address, None) {
            trace!(context = "dispatcher_validation", ?address, "Refusing to send to ourselves");
            return Err(SendMessageError::InvalidDestination(address));
        }

        let mut sender = self.local.clone().with_flags(FLAG_FIREWALLED);
        sender.id = self.collision_id;

        let transaction_id = self.tid();
        let message = Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            sender,
            message_type: MessageType::Request(RequestSpecific::Ping),
        };

        self.enqueue(process, address, None, message, self.request_timeout, true);

        Ok(transaction_id)
    }

    /// Send a response to the given address.
    pub fn response(&mut self, address: SocketAddr, transaction_id: u32, response: ResponseSpecific) {
        let message = self.message(transaction_id, MessageType::Response(response));

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&mut self, address: SocketAddr, transaction_id: u32, error: ErrorSpecific) {
        let message = self.message(transaction_id, MessageType::Error(error));

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Waits up to `timeout` for a datagram, and returns it if it is a request
    /// or an expected response.
    ///
    /// Filtered, malformed and unexpected datagrams are dropped silently.
    pub fn recv(&mut self, timeout: Duration) -> Option<DispatcherEvent> {
        let (bytes, from) = match self.transport.recv_from(timeout) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return None,
            Err(error) => {
                trace!(context = "dispatcher_error", ?error, "recv_from failed unexpectedly");
                return None;
            }
        };

        if from.port() == 0 {
            trace!(
                context = "dispatcher_validation",
                message = "Datagram from port 0"
            );
            return None;
        }

        if !self.filter.allow(&from) {
            self.stats.filtered += 1;
            trace!(context = "dispatcher_validation", ?from, "Filtered host");
            return None;
        }

        let message = match Message::from_bytes(&bytes, from) {
            Ok(message) => message,
            Err(error) => {
                self.stats.malformed += 1;
                trace!(
                    context = "dispatcher_validation",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(&bytes),
                    "Received invalid message"
                );
                return None;
            }
        };

        self.stats.received += 1;

        if let MessageType::Request(_) = message.message_type {
            self.filter.register(&from);
        }

        if message.sender.id == self.collision_id {
            trace!(context = "dispatcher_validation", ?from, "Our own collision ping");
            return None;
        }

        if message.sender.id == self.local.id {
            return self.collision_response(message);
        }

        trace!(context = "dispatcher_receiving", ?message, ?from);

        let transaction_id = message.transaction_id;
        let sender = message.sender;

        match message.message_type {
            MessageType::Request(request) => {
                self.observe(&sender);

                Some(DispatcherEvent::Request {
                    from: sender,
                    transaction_id,
                    request,
                })
            }
            MessageType::Response(response) => {
                let request = self.expected(transaction_id, &sender)?;
                self.observe(&sender);

                Some(DispatcherEvent::Response {
                    process: request.process,
                    from: sender,
                    response,
                    rtt: request.sent_at.elapsed(),
                })
            }
            MessageType::Error(error) => {
                let request = self.expected(transaction_id, &sender)?;
                self.observe(&sender);

                Some(DispatcherEvent::Error {
                    process: request.process,
                    from: sender,
                    error,
                })
            }
        }
    }

    /// Removes requests past their deadline, records the failures in the
    /// [RouteTable] and returns them as [DispatcherEvent::Timeout]s.
    pub fn expired(&mut self) -> Vec<DispatcherEvent> {
        let expired = self.inflight.expire();
        if expired.is_empty() {
            return vec![];
        }

        self.stats.timeouts += expired.len() as u64;

        {
            let mut table = common::write(&self.routing_table);
            for request in &expired {
                if let Some(id) = &request.node_id {
                    table.handle_failure(id);
                }
            }
        }

        expired
            .into_iter()
            .map(|request| DispatcherEvent::Timeout {
                process: request.process,
                to: request.to,
                node_id: request.node_id,
            })
            .collect()
    }

    /// Forget the inflight requests of a finished process, their responses
    /// will be dropped as unexpected.
    pub fn forget_process(&mut self, process: ProcessId) {
        self.inflight.forget_process(process);
    }

    // === Private Methods ===

    fn enqueue(
        &mut self,
        process: Option<ProcessId>,
        address: SocketAddr,
        node_id: Option<Id>,
        message: Message,
        timeout: Duration,
        collision: bool,
    ) {
        let now = Instant::now();
        self.inflight.add(
            message.transaction_id,
            InflightRequest {
                to: address,
                node_id,
                process,
                sent_at: now,
                deadline: now + timeout,
                collision,
            },
        );

        // Failing to send is handled like any other lost datagram, by the timeout.
        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending request message");
        });
    }

    /// A message carrying our own id is only accepted as the response to a
    /// collision ping, and never reaches the routing table.
    fn collision_response(&mut self, message: Message) -> Option<DispatcherEvent> {
        let is_collision = !matches!(message.message_type, MessageType::Request(_))
            && self
                .inflight
                .get(message.transaction_id)
                .map(|request| request.collision)
                .unwrap_or(false);

        if !is_collision {
            trace!(
                context = "dispatcher_validation",
                from = ?message.sender.address,
                "Message carrying our own id"
            );
            return None;
        }

        let request = self.expected(message.transaction_id, &message.sender)?;
        debug!(from = ?message.sender.address, "Another node responded with our id");

        match message.message_type {
            MessageType::Response(response) => Some(DispatcherEvent::Response {
                process: request.process,
                from: message.sender,
                response,
                rtt: request.sent_at.elapsed(),
            }),
            MessageType::Error(error) => Some(DispatcherEvent::Error {
                process: request.process,
                from: message.sender,
                error,
            }),
            MessageType::Request(_) => None,
        }
    }

    fn expected(&mut self, transaction_id: u32, sender: &Contact) -> Option<InflightRequest> {
        match self
            .inflight
            .remove(transaction_id, &sender.address, &sender.id)
        {
            Some(request) => Some(request),
            None => {
                self.stats.unexpected += 1;
                trace!(
                    context = "dispatcher_validation",
                    ?transaction_id,
                    from = ?sender.address,
                    "Unexpected response id or wrong address"
                );
                None
            }
        }
    }

    /// Update the routing table with a node we just heard from.
    fn observe(&mut self, sender: &Contact) {
        let probe = {
            let mut table = common::write(&self.routing_table);

            if sender.is_shutdown() {
                debug!(?sender, "Contact is shutting down");
                table.remove(&sender.id);
                None
            } else {
                table.add(sender.clone())
            }
        };

        if let Some(probe) = probe {
            trace!(context = "dispatcher_probe", ?probe, "Pinging least recently seen contact");
            let _ = self.request_contact(None, &probe, RequestSpecific::Ping);
        }
    }

    fn is_valid_destination(&self, address: &SocketAddr, node_id: Option<&Id>) -> bool {
        if address.port() == 0 || address.ip().is_unspecified() {
            return false;
        }

        if node_id == Some(&self.local.id) {
            return false;
        }

        let local = self.local_addr();
        if address == &local {
            return false;
        }

        !(local.ip().is_unspecified() && address.ip().is_loopback() && address.port() == local.port())
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&mut self) -> u32 {
        // We don't bother much with reusing freed transaction ids,
        // since the timeout is so short we are unlikely to run out
        // of 4 billion ids.
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn message(&self, transaction_id: u32, message_type: MessageType) -> Message {
        Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            sender: self.local.clone(),
            message_type,
        }
    }

    /// Send a raw dht message
    fn send(&mut self, address: SocketAddr, message: Message) -> Result<(), SendMessageError> {
        trace!(context = "dispatcher_sending", ?message, ?address);

        self.transport.send_to(&message.to_bytes()?, address)?;
        self.stats.sent += 1;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::actor::transport::{MemoryNetwork, MemoryTransport};
    use crate::common::{PongResponseArguments, FLAG_SHUTDOWN};

    fn dispatcher(network: &MemoryNetwork, filter: Box<dyn HostFilter>) -> MessageDispatcher {
        let transport: MemoryTransport = network.transport();
        let local = Contact::random(transport.local_addr());

        MessageDispatcher::new(
            Box::new(transport),
            local.clone(),
            Arc::new(RwLock::new(RouteTable::new(local))),
            filter,
            Duration::from_millis(50),
        )
    }

    fn recv(dispatcher: &mut MessageDispatcher) -> Option<DispatcherEvent> {
        dispatcher.recv(Duration::from_millis(100))
    }

    fn pong() -> ResponseSpecific {
        ResponseSpecific::Pong(PongResponseArguments {
            external_address: None,
            estimated_size: 0,
        })
    }

    #[test]
    fn tid() {
        let network = MemoryNetwork::new();
        let mut dispatcher = dispatcher(&network, Box::new(AllowAll));

        assert_eq!(dispatcher.tid(), 0);
        assert_eq!(dispatcher.tid(), 1);

        dispatcher.next_tid = u32::MAX;

        assert_eq!(dispatcher.tid(), u32::MAX);
        assert_eq!(dispatcher.tid(), 0);
    }

    #[test]
    fn request_response_updates_routing_table() {
        let network = MemoryNetwork::new();
        let mut client = dispatcher(&network, Box::new(AllowAll));
        let mut server = dispatcher(&network, Box::new(AllowAll));

        let server_contact = server.local_contact().clone();
        let tid = client
            .request_contact(Some(7), &server_contact, RequestSpecific::Ping)
            .unwrap();
        assert!(client.inflight(tid));

        match recv(&mut server) {
            Some(DispatcherEvent::Request {
                from,
                transaction_id,
                request,
            }) => {
                assert_eq!(from, *client.local_contact());
                assert_eq!(transaction_id, tid);
                assert_eq!(request, RequestSpecific::Ping);

                server.response(from.address, transaction_id, pong());
            }
            other => panic!("unexpected {:?}", other),
        }

        // The server learned about the client from its request.
        assert!(common::read(&server.routing_table)
            .get(&client.local_contact().id)
            .is_some());

        match recv(&mut client) {
            Some(DispatcherEvent::Response { process, from, .. }) => {
                assert_eq!(process, Some(7));
                assert_eq!(from, server_contact);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(!client.inflight(tid));
        assert!(common::read(&client.routing_table)
            .get(&server_contact.id)
            .is_some());
    }

    #[test]
    fn ignore_response_from_wrong_address() {
        let network = MemoryNetwork::new();
        let mut client = dispatcher(&network, Box::new(AllowAll));
        let mut server = dispatcher(&network, Box::new(AllowAll));
        let mut impostor = dispatcher(&network, Box::new(AllowAll));

        let server_contact = server.local_contact().clone();
        let tid = client
            .request_contact(Some(1), &server_contact, RequestSpecific::Ping)
            .unwrap();

        // Drain the request on the server without answering.
        assert!(recv(&mut server).is_some());

        impostor.response(client.local_addr(), tid, pong());

        assert!(recv(&mut client).is_none());
        assert_eq!(client.stats().unexpected, 1);
        assert!(client.inflight(tid));
    }

    #[test]
    fn timeouts_are_reported_once() {
        let network = MemoryNetwork::new();
        let mut client = dispatcher(&network, Box::new(AllowAll));

        let unreachable = Contact::random("127.0.0.1:1".parse().unwrap());
        client
            .request_contact(Some(3), &unreachable, RequestSpecific::Ping)
            .unwrap();

        std::thread::sleep(Duration::from_millis(60));

        let events = client.expired();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DispatcherEvent::Timeout { process, node_id, .. } => {
                assert_eq!(*process, Some(3));
                assert_eq!(*node_id, Some(unreachable.id));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(client.expired().is_empty());
        assert_eq!(client.stats().timeouts, 1);
    }

    #[test]
    fn refuses_to_send_to_self() {
        let network = MemoryNetwork::new();
        let mut client = dispatcher(&network, Box::new(AllowAll));

        let local = client.local_contact().clone();
        assert!(client
            .request_contact(None, &local, RequestSpecific::Ping)
            .is_err());
        assert!(client
            .request(None, local.address, None, RequestSpecific::Ping, None)
            .is_err());
        assert!(client
            .request(None, "127.0.0.1:0".parse().unwrap(), None, RequestSpecific::Ping, None)
            .is_err());
    }

    #[test]
    fn filtered_and_malformed_datagrams_are_dropped_silently() {
        let network = MemoryNetwork::new();
        let mut server = dispatcher(&network, Box::new(FloodFilter::new(1, Duration::from_secs(60))));
        let mut peer = dispatcher(&network, Box::new(AllowAll));

        let raw = network.transport();
        raw.send_to(b"garbage", server.local_addr()).unwrap();
        raw.send_to(b"garbage", server.local_addr()).unwrap();

        assert!(recv(&mut server).is_none());
        assert!(recv(&mut server).is_none());
        assert_eq!(server.stats().malformed, 2);

        let server_contact = server.local_contact().clone();
        peer.request_contact(None, &server_contact, RequestSpecific::Ping)
            .unwrap();
        assert!(matches!(
            recv(&mut server),
            Some(DispatcherEvent::Request { .. })
        ));

        peer.request_contact(None, &server_contact, RequestSpecific::Ping)
            .unwrap();
        assert!(recv(&mut server).is_none());

        let stats = server.stats();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.sent, 0);
    }

    #[test]
    fn responses_do_not_count_against_the_flood_budget() {
        let network = MemoryNetwork::new();
        let mut client = dispatcher(&network, Box::new(FloodFilter::new(1, Duration::from_secs(60))));
        let mut server = dispatcher(&network, Box::new(AllowAll));

        let server_contact = server.local_contact().clone();

        for _ in 0..3 {
            client
                .request_contact(None, &server_contact, RequestSpecific::Ping)
                .unwrap();

            match recv(&mut server) {
                Some(DispatcherEvent::Request {
                    from,
                    transaction_id,
                    ..
                }) => server.response(from.address, transaction_id, pong()),
                other => panic!("unexpected {:?}", other),
            }

            assert!(matches!(
                recv(&mut client),
                Some(DispatcherEvent::Response { .. })
            ));
        }

        assert_eq!(client.stats().filtered, 0);
    }

    #[test]
    fn collision_ping_accepts_a_response_with_our_id() {
        let network = MemoryNetwork::new();
        let mut client = dispatcher(&network, Box::new(AllowAll));

        let transport = network.transport();
        let twin_contact = Contact::new(client.local_contact().id, transport.local_addr());
        let mut twin = MessageDispatcher::new(
            Box::new(transport),
            twin_contact.clone(),
            Arc::new(RwLock::new(RouteTable::new(twin_contact))),
            Box::new(AllowAll),
            Duration::from_millis(50),
        );

        client.collision_ping(Some(4), twin.local_addr()).unwrap();

        match recv(&mut twin) {
            Some(DispatcherEvent::Request {
                from,
                transaction_id,
                ..
            }) => {
                assert_ne!(from.id, twin.local_contact().id);
                assert!(from.is_firewalled());

                twin.response(from.address, transaction_id, pong());
            }
            other => panic!("unexpected {:?}", other),
        }

        // The throwaway id is not added to the routing table.
        assert_eq!(common::read(&twin.routing_table).size(), 0);

        match recv(&mut client) {
            Some(DispatcherEvent::Response { process, from, .. }) => {
                assert_eq!(process, Some(4));
                assert_eq!(from.id, client.local_contact().id);
                assert_eq!(from.address, twin.local_addr());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(common::read(&client.routing_table).size(), 0);

        // Outside of a collision ping, our own id is dropped.
        twin.request(None, client.local_addr(), None, RequestSpecific::Ping, None)
            .unwrap();
        assert!(recv(&mut client).is_none());
    }

    #[test]
    fn shutdown_flag_removes_sender() {
        let network = MemoryNetwork::new();
        let mut client = dispatcher(&network, Box::new(AllowAll));
        let mut server = dispatcher(&network, Box::new(AllowAll));

        let server_contact = server.local_contact().clone();

        client
            .request_contact(None, &server_contact, RequestSpecific::Ping)
            .unwrap();
        recv(&mut server);
        assert!(common::read(&server.routing_table)
            .get(&client.local_contact().id)
            .is_some());

        let shutting_down = client.local_contact().clone().with_flags(FLAG_SHUTDOWN);
        client.set_local_contact(shutting_down);
        client
            .request_contact(None, &server_contact, RequestSpecific::Ping)
            .unwrap();
        recv(&mut server);

        assert!(common::read(&server.routing_table)
            .get(&client.local_contact().id)
            .is_none());
    }
}
