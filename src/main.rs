// Grows a pool against the in-memory backend until it hits its cap, hands
// every connection back so it shrinks to its floor, then tears it down.
// The longer walkthrough with logging lives in demos/basic.rs.

use esox_connpool::{ConnectionPool, MemoryServer, PoolConfiguration, PoolResult};

fn main() -> PoolResult<()> {
    println!("esox_connpool: grow, exhaust, shrink, tear down");
    let server = MemoryServer::new();
    let config = PoolConfiguration::new()
        .with_min_size(1)
        .with_max_size(6)
        .with_growth_increment(3);
    let pool = ConnectionPool::new(server.connector("mem://demo"), config)?;

    let mut held = Vec::new();
    while let Some(conn) = pool.acquire()? {
        println!("  Acquired connection {} -> {}", conn.physical_id(), pool.status());
        held.push(conn);
    }
    println!("  Exhausted at {}", pool.status());

    for conn in &held {
        pool.release(conn)?;
    }
    println!("  After release: {}", pool.status());

    pool.teardown();
    println!("  Open sessions after teardown: {}", server.open_count());
    Ok(())
}
