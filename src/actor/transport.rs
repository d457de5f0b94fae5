//! Datagram transports the dispatcher sends and receives messages through.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

const MTU: usize = 2048;

/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A best-effort, unordered, lossy datagram channel.
pub trait Transport: Send + Debug {
    /// Returns the address this transport receives datagrams on.
    fn local_addr(&self) -> SocketAddr;

    /// Send a datagram, delivery is not guaranteed.
    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Waits up to `timeout` for a datagram.
    fn recv_from(&self, timeout: Duration) -> io::Result<Option<(Vec<u8>, SocketAddr)>>;
}

#[derive(Debug)]
/// [Transport] over a non-blocking [UdpSocket].
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to `0.0.0.0:{port}`, or a random port if `None`.
    pub fn bind(port: Option<u16>) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0))))?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, to)?;
        Ok(())
    }

    fn recv_from(&self, timeout: Duration) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buf = [0u8; MTU];
        let start = Instant::now();

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((amt, from)) => return Ok(Some((buf[..amt].to_vec(), from))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Ok(None);
                    }
                    std::thread::sleep(MAX_THREAD_BLOCK_DURATION.min(timeout - elapsed));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Debug, Clone, Default)]
/// In-memory datagram network, useful for simulations and tests.
///
/// Every [MemoryTransport] created from the same network can reach the others
/// by address. Datagrams to unknown addresses are silently dropped.
pub struct MemoryNetwork {
    inner: Arc<Mutex<MemoryNetworkInner>>,
}

#[derive(Debug, Default)]
struct MemoryNetworkInner {
    next_port: u16,
    hosts: HashMap<SocketAddr, flume::Sender<Datagram>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with a fresh `127.0.0.1` address.
    pub fn transport(&self) -> MemoryTransport {
        let (sender, receiver) = flume::unbounded();

        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };

        inner.next_port = inner.next_port.wrapping_add(1).max(1);
        let mut address = SocketAddr::from(([127, 0, 0, 1], 10_000u16.wrapping_add(inner.next_port)));
        while inner.hosts.contains_key(&address) {
            inner.next_port = inner.next_port.wrapping_add(1).max(1);
            address = SocketAddr::from(([127, 0, 0, 1], 10_000u16.wrapping_add(inner.next_port)));
        }

        inner.hosts.insert(address, sender);

        MemoryTransport {
            address,
            network: self.clone(),
            receiver,
        }
    }

    /// Remove a host, datagrams to it get dropped from now on.
    pub fn disconnect(&self, address: &SocketAddr) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.hosts.remove(address);
        }
    }

    fn deliver(&self, bytes: &[u8], from: SocketAddr, to: SocketAddr) {
        let sender = match self.inner.lock() {
            Ok(inner) => inner.hosts.get(&to).cloned(),
            Err(_) => None,
        };

        match sender {
            Some(sender) => {
                let _ = sender.send((bytes.to_vec(), from));
            }
            None => {
                trace!(context = "memory_network", ?to, "Dropping datagram to unknown host");
            }
        }
    }
}

#[derive(Debug)]
/// [Transport] on a [MemoryNetwork].
pub struct MemoryTransport {
    address: SocketAddr,
    network: MemoryNetwork,
    receiver: flume::Receiver<Datagram>,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.address
    }

    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        self.network.deliver(bytes, self.address, to);
        Ok(())
    }

    fn recv_from(&self, timeout: Duration) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(datagram) => Ok(Some(datagram)),
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(flume::RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "disconnected from the memory network",
            )),
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.disconnect(&self.address);
    }
}
