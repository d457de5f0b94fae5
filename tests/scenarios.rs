//! Multi node scenarios over the in memory network.
//!
//! Run with: cargo test --test scenarios

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use mojito::{
    messages::{Message, MessageType, RequestSpecific, ResponseSpecific},
    AllowAll, BootstrapSeed, BootstrapState, Config, Contact, Dht, DhtError, DhtValue,
    FloodFilter, Id, MemoryNetwork, Testnet, Transport, ValueKey, ValueType,
};

fn id(first_byte: u8) -> Id {
    let mut bytes = [0; 20];
    bytes[0] = first_byte;
    Id(bytes)
}

fn config(network: &MemoryNetwork) -> Config {
    // Run with `--nocapture` to see the nodes' logs.
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    Config {
        transport: Some(Box::new(network.transport())),
        host_filter: Some(Box::new(AllowAll)),
        request_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn address(dht: &Dht) -> SocketAddr {
    dht.local_contact().address
}

/// Poll `condition` for up to a second.
fn eventually(condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();

    while start.elapsed() < Duration::from_secs(1) {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }

    false
}

#[test]
fn two_nodes_lookup_closest() {
    let network = MemoryNetwork::new();

    let a = Dht::new(Config {
        local_id: Some(id(0x00)),
        ..config(&network)
    })
    .unwrap();
    let b = Dht::new(Config {
        local_id: Some(id(0x80)),
        ..config(&network)
    })
    .unwrap();

    b.bootstrap(address(&a)).wait().unwrap();
    assert!(b.is_ready());
    assert!(!a.is_ready());

    let result = a.lookup(id(0x81)).wait().unwrap();

    assert_eq!(result.contacts[0].id, id(0x80));
    assert_eq!(result.contacts[1].id, id(0x00));

    a.close();
    b.close();
}

#[test]
fn unreachable_seed_stays_init() {
    let network = MemoryNetwork::new();
    let dht = Dht::new(config(&network)).unwrap();

    let nobody: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let future = dht.bootstrap(nobody);
    assert!(dht.is_booting() || future.is_done());

    assert!(matches!(future.wait(), Err(DhtError::BootstrapFailed(_))));
    assert_eq!(dht.state(), BootstrapState::Init);

    dht.close();
}

#[test]
fn remote_values_expire() {
    let network = MemoryNetwork::new();

    let short_lived = || Config {
        value_ttl: Duration::from_millis(100),
        database_cleaner_tick: Duration::from_millis(20),
        ..config(&network)
    };

    let publisher = Dht::new(short_lived()).unwrap();
    let b = Dht::new(short_lived()).unwrap();
    let c = Dht::new(short_lived()).unwrap();

    b.bootstrap(address(&publisher)).wait().unwrap();
    c.bootstrap(address(&publisher)).wait().unwrap();
    publisher.bootstrap(address(&b)).wait().unwrap();

    let key = Id::hash(b"short lived");
    let stored = publisher
        .put(key, DhtValue::new(ValueType::TEXT, &b"gone soon"[..]))
        .wait()
        .unwrap();
    assert_eq!(stored.stored_on.len(), 3);

    publisher.close();

    thread::sleep(Duration::from_millis(300));

    let found = c.get(key).wait().unwrap();
    assert!(!found.found);
    assert!(found.entities.is_empty());

    b.close();
    c.close();
}

#[test]
fn put_get_remove() {
    let testnet = Testnet::new(10).unwrap();

    let a = &testnet.nodes[2];
    let b = &testnet.nodes[7];

    let key = Id::hash(b"key");
    let value = DhtValue::new(ValueType::BINARY, &b"value"[..]);

    assert!(a.put(key, value.clone()).wait().unwrap().is_stored());

    let found = b.get(key).wait().unwrap();
    assert!(found.found);
    assert_eq!(found.entities.len(), 1);
    assert_eq!(found.entities[0].value, value);

    // Only values of the requested type.
    let text_only = ValueKey::lookup(key).with_value_type(ValueType::TEXT);
    assert!(!b.get(text_only).wait().unwrap().found);

    // From a known location.
    let at = ValueKey::at(a.local_contact().clone(), key, a.local_contact().id);
    let found = b.get(at).wait().unwrap();
    assert!(found.found);

    a.remove(key).wait().unwrap();

    let found = b.get(key).wait().unwrap();
    assert!(!found.found);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreEvent {
    Sent(Id),
    Acked(Id),
}

/// Records the STORE requests a node sends and the STORE responses it gets.
#[derive(Debug)]
struct RecordStores {
    inner: Box<dyn Transport>,
    log: Arc<Mutex<Vec<StoreEvent>>>,
}

impl Transport for RecordStores {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        if let Ok(message) = Message::from_bytes(bytes, to) {
            if let MessageType::Request(RequestSpecific::Store(arguments)) = message.message_type {
                let mut log = self.log.lock().unwrap();
                for entity in arguments.values {
                    log.push(StoreEvent::Sent(entity.primary_key));
                }
            }
        }

        self.inner.send_to(bytes, to)
    }

    fn recv_from(&self, timeout: Duration) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let datagram = self.inner.recv_from(timeout)?;

        if let Some((bytes, from)) = &datagram {
            if let Ok(message) = Message::from_bytes(bytes, *from) {
                if let MessageType::Response(ResponseSpecific::Store(arguments)) =
                    message.message_type
                {
                    let mut log = self.log.lock().unwrap();
                    for status in arguments.status {
                        log.push(StoreEvent::Acked(status.primary_key));
                    }
                }
            }
        }

        Ok(datagram)
    }
}

#[test]
fn enqueued_stores_run_in_order() {
    let testnet = Testnet::new(5).unwrap();

    let log = Arc::new(Mutex::new(vec![]));
    let mut node_config = testnet.node_config();
    let inner = node_config.transport.take().unwrap();

    let dht = Dht::new(Config {
        transport: Some(Box::new(RecordStores {
            inner,
            log: log.clone(),
        })),
        max_concurrent_stores: 1,
        ..node_config
    })
    .unwrap();
    dht.bootstrap(testnet.nodes[0].local_contact().address)
        .wait()
        .unwrap();

    let keys: Vec<Id> = (0..3u8).map(|i| Id::hash([i])).collect();

    let futures: Vec<_> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| dht.enqueue(*key, DhtValue::new(ValueType::BINARY, vec![i as u8])))
        .collect();

    for future in futures {
        assert!(future.wait().unwrap().is_stored());
    }

    let log = log.lock().unwrap().clone();
    let first_sent = |key: &Id| log.iter().position(|e| *e == StoreEvent::Sent(*key));
    let last_acked = |key: &Id| log.iter().rposition(|e| *e == StoreEvent::Acked(*key));

    for pair in keys.windows(2) {
        let previous_done = last_acked(&pair[0]).unwrap();
        let next_started = first_sent(&pair[1]).unwrap();

        // The next store talks to nobody until the previous one is acknowledged everywhere.
        assert!(
            previous_done < next_started,
            "store of {:?} started before {:?} completed",
            pair[1],
            pair[0]
        );
    }

    dht.close();
}

#[test]
fn node_id_collision_fails_bootstrap() {
    let network = MemoryNetwork::new();

    let a = Dht::new(Config {
        local_id: Some(id(0x10)),
        ..config(&network)
    })
    .unwrap();
    let b = Dht::new(Config {
        local_id: Some(id(0x80)),
        ..config(&network)
    })
    .unwrap();
    b.bootstrap(address(&a)).wait().unwrap();

    let twin = Dht::new(Config {
        local_id: Some(id(0x10)),
        ..config(&network)
    })
    .unwrap();

    match twin.bootstrap(address(&b)).wait() {
        Err(DhtError::BootstrapFailed(reason)) => {
            assert!(reason.contains(&address(&a).to_string()), "{}", reason)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(twin.state(), BootstrapState::Init);

    // The original owner of the id is unaffected.
    let owner = b.lookup(id(0x10)).wait().unwrap();
    assert!(owner.contacts.iter().any(|c| c.address == address(&a)));

    twin.close();
    a.close();
    b.close();
}

#[test]
fn stale_routing_table_is_purged_and_bootstrap_retried() {
    let network = MemoryNetwork::new();
    let a = Dht::new(config(&network)).unwrap();

    // Nobody listens on ports below the in memory network's range.
    let seeds = || {
        let mut seeds: Vec<BootstrapSeed> = (1..=3)
            .map(|port| {
                BootstrapSeed::Contact(Contact::new(
                    Id::random(),
                    SocketAddr::from(([127, 0, 0, 1], port)),
                ))
            })
            .collect();
        seeds.push(BootstrapSeed::Contact(a.local_contact().clone()));
        seeds
    };

    let lenient = Dht::new(config(&network)).unwrap();
    let result = lenient.bootstrap_from(seeds()).wait().unwrap();
    assert!(!result.purged);

    let strict = Dht::new(Config {
        max_bootstrap_failures: 1,
        ..config(&network)
    })
    .unwrap();
    let result = strict.bootstrap_from(seeds()).wait().unwrap();

    assert!(result.purged);
    assert!(strict.is_ready());

    strict.close();
    lenient.close();
    a.close();
}

#[test]
fn flooding_host_gets_dropped() {
    let network = MemoryNetwork::new();

    let a = Dht::new(Config {
        host_filter: Some(Box::new(FloodFilter::new(2, Duration::from_secs(60)))),
        ..config(&network)
    })
    .unwrap();
    let b = Dht::new(config(&network)).unwrap();

    assert!(b.ping(address(&a)).wait().is_ok());
    assert!(b.ping(address(&a)).wait().is_ok());
    assert!(matches!(
        b.ping(address(&a)).wait(),
        Err(DhtError::Timeout(_))
    ));

    assert_eq!(a.info().unwrap().stats().filtered, 1);

    a.close();
    b.close();
}

#[test]
fn leaving_node_is_removed() {
    let network = MemoryNetwork::new();

    let a = Dht::new(config(&network)).unwrap();
    let b = Dht::new(config(&network)).unwrap();

    b.bootstrap(address(&a)).wait().unwrap();
    a.bootstrap(address(&b)).wait().unwrap();

    assert_eq!(b.info().unwrap().routing_table_size(), 1);

    a.close();

    assert!(eventually(|| b.info().unwrap().routing_table_size() == 0));

    b.close();
}

#[test]
fn operations_after_close_fail() {
    let network = MemoryNetwork::new();
    let dht = Dht::new(config(&network)).unwrap();

    dht.close();
    // Closing twice is fine.
    dht.close();

    assert!(matches!(dht.lookup(Id::random()).wait(), Err(DhtError::Closed)));
    assert!(matches!(
        dht.put(Id::random(), DhtValue::empty(ValueType::ANY)).wait(),
        Err(DhtError::Closed)
    ));
}
