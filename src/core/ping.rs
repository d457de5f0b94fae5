//! Pinging a single node.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use crate::common::{Contact, Id, RequestSpecific, ResponseSpecific};
use crate::error::DhtError;

use super::process::{AsyncProcess, Context};
use super::DhtFuture;

#[derive(Debug, Clone)]
/// Who to ping.
pub enum PingTarget {
    Address(SocketAddr),
    Contact(Contact),
}

impl From<SocketAddr> for PingTarget {
    fn from(address: SocketAddr) -> Self {
        PingTarget::Address(address)
    }
}

impl From<Contact> for PingTarget {
    fn from(contact: Contact) -> Self {
        PingTarget::Contact(contact)
    }
}

#[derive(Debug)]
/// Sends one PING, and completes with the responder's [Contact].
pub(crate) struct PingProcess {
    target: PingTarget,
    sent_at: Instant,
    future: DhtFuture<Contact>,
}

impl PingProcess {
    pub fn new(target: PingTarget, future: DhtFuture<Contact>) -> Self {
        Self {
            target,
            sent_at: Instant::now(),
            future,
        }
    }
}

impl AsyncProcess for PingProcess {
    fn start(&mut self, ctx: &mut Context<'_>) {
        self.sent_at = Instant::now();

        let sent = match &self.target {
            PingTarget::Address(address) => ctx.send_to(*address, RequestSpecific::Ping),
            PingTarget::Contact(contact) => ctx.send(contact, RequestSpecific::Ping),
        };

        if !sent {
            self.future
                .set_error(DhtError::InvalidArgument("can not ping the local node"));
        }
    }

    fn handle_response(&mut self, ctx: &mut Context<'_>, from: Contact, response: ResponseSpecific) {
        if let ResponseSpecific::Pong(pong) = response {
            ctx.shared.estimator().add_remote(pong.estimated_size);
            debug!(?from, external_address = ?pong.external_address, "Pong");
        }

        self.future.set_value(from);
    }

    fn handle_timeout(&mut self, _ctx: &mut Context<'_>, to: SocketAddr, _node_id: Option<Id>) {
        debug!(?to, "Ping timed out");
        self.future
            .set_error(DhtError::Timeout(self.sent_at.elapsed()));
    }

    fn fail(&mut self, error: DhtError) {
        self.future.set_error(error);
    }

    fn is_done(&self) -> bool {
        self.future.is_done()
    }
}
