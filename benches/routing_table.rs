//! Micro-benchmarks for RouteTable operations: add, select, and failure
//! handling at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use mojito::{Contact, Id, RouteTable, SelectMode};
use std::net::SocketAddr;
use std::time::Instant;

fn main() {
    println!("routing_table\n");

    bench_add();
    bench_select();
    bench_failures();
}

fn local() -> Contact {
    Contact::random("127.0.0.1:5000".parse().unwrap())
}

fn address(i: usize) -> SocketAddr {
    SocketAddr::from(([10, 0, (i >> 8) as u8, i as u8], 5000))
}

fn contacts(count: usize) -> Vec<Contact> {
    (0..count).map(|i| Contact::random(address(i))).collect()
}

fn bench_add() {
    println!("add");

    // Pre-generate random contacts outside the timed section
    let fresh = contacts(1000);

    // Empty table
    {
        let mut table = RouteTable::new(local());
        let start = Instant::now();
        for contact in fresh.iter().cloned() {
            table.add(contact);
        }
        let per_op = start.elapsed().as_nanos() / fresh.len() as u128;
        println!(
            "empty table:     {per_op}ns/op (final size: {}, buckets: {})",
            table.size(),
            table.bucket_count()
        );
    }

    // Pre-filled table, most additions land in full buckets' caches
    {
        let mut table = RouteTable::new(local());
        for contact in contacts(400) {
            table.add(contact);
        }

        let start = Instant::now();
        for contact in fresh.iter().cloned() {
            table.add(contact);
        }
        let per_op = start.elapsed().as_nanos() / fresh.len() as u128;
        println!("filled table:    {per_op}ns/op");
    }

    println!();
}

fn bench_select() {
    println!("select");

    let targets: Vec<_> = (0..1000).map(|_| Id::random()).collect();

    for size in [50, 100, 200, 400] {
        let mut table = RouteTable::new(local());
        for contact in contacts(size) {
            table.add(contact);
        }

        let start = Instant::now();
        for target in &targets {
            let _ = table.select(target, 20, SelectMode::Alive);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>3} contacts: {per_op}ns/op");
    }

    println!();
}

fn bench_failures() {
    println!("handle_failure");

    let mut table = RouteTable::new(local());
    let contacts = contacts(200);

    for contact in contacts.iter().cloned() {
        table.add(contact);
    }

    let n = contacts.len();
    let start = Instant::now();
    for contact in &contacts {
        table.handle_failure(&contact.id);
    }
    let per_op = start.elapsed().as_nanos() / n as u128;
    println!("{per_op}ns/op ({n} failures, size after: {})", table.size());
    println!();
}
