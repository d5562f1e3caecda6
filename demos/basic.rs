//! Basic usage examples for ConnectionPool

use std::thread;
use std::time::Duration;

use esox_connpool::{ConnectionPool, MemoryServer, PoolConfiguration};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("esox_connpool=debug")),
        )
        .init();

    println!("=== Esox ConnPool - Basic Examples ===\n");

    // Example 1: Checkout and release
    checkout_and_release();

    // Example 2: Growth and shrink
    growth_and_shrink();

    // Example 3: Idle timeout
    idle_timeout();
}

fn checkout_and_release() {
    println!("1. Checkout and Release:");
    let server = MemoryServer::new();
    let pool = ConnectionPool::new(
        server.connector("mem://basic"),
        PoolConfiguration::new().with_min_size(2).with_max_size(2),
    )
    .unwrap();

    let conn = pool.acquire().unwrap().unwrap();
    let executed = conn.with_connection(|c| c.execute("select 1")).unwrap();
    println!("   Executed {} statement(s) on connection {}", executed, conn.physical_id());

    pool.release(&conn).unwrap();
    match conn.probe() {
        Ok(()) => println!("   Released handle still usable?!"),
        Err(err) => println!("   Released handle is inert: {}", err),
    }
    println!("   {}\n", pool.status());
}

fn growth_and_shrink() {
    println!("2. Growth and Shrink:");
    let server = MemoryServer::new();
    let pool = ConnectionPool::new(
        server.connector("mem://sizing"),
        PoolConfiguration::new()
            .with_min_size(4)
            .with_max_size(9)
            .with_growth_increment(3),
    )
    .unwrap();

    let mut held = Vec::new();
    while let Some(conn) = pool.acquire().unwrap() {
        held.push(conn);
        println!("   acquire -> {}", pool.status());
    }

    for conn in held.drain(..) {
        pool.release(&conn).unwrap();
        println!("   release -> {}", pool.status());
    }
    println!("   Open sessions: {}\n", server.open_count());
}

fn idle_timeout() {
    println!("3. Idle Timeout:");
    let server = MemoryServer::new();
    let pool = ConnectionPool::new(
        server.connector("mem://idle"),
        PoolConfiguration::new()
            .with_min_size(1)
            .with_max_size(1)
            .with_idle_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let conn = pool.acquire().unwrap().unwrap();
    thread::sleep(Duration::from_millis(250));

    println!("   Pool size after sweep: {}", pool.size());
    if let Err(err) = conn.probe() {
        println!("   Idle connection reclaimed: {}", err);
    }
    if let Err(err) = pool.release(&conn) {
        println!("   Late release rejected: {}", err);
    }
}
