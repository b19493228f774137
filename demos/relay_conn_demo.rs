//! Demo: drives the connection subsystem end to end against real sockets —
//! bind a Dir listener, dial it as a peer would, push both sides through
//! the retry tick, and print what the table looks like at each step.
//! Grounded in Cyclone's `examples/tcp_server.rs` and `examples/basic.rs`
//! (stats struct + `tracing_subscriber::fmt::init()`), generalized from an
//! echo server to a one-shot walk of `retry_all_connections` / `handle_read`
//! / `tick_second` / `reap_marked`.

use relay_conn::config::Config;
use relay_conn::conn::ConnKind;
use relay_conn::eventloop::RecordingHooks;
use relay_conn::protocol::ProtocolHandlers;
use relay_conn::router::FakeDirectory;
use relay_conn::table::ConnTable;
use relay_conn::{dial, dispatch, ratelimit, retry};
use std::net::{IpAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Default)]
struct DemoStats {
    listeners_bound: usize,
    connections_accepted: usize,
    ticks_run: usize,
}

impl DemoStats {
    fn print(&self, elapsed: Duration) {
        println!("\nrelay-conn demo summary:");
        println!("  elapsed:             {:.3}s", elapsed.as_secs_f64());
        println!("  listeners bound:     {}", self.listeners_bound);
        println!("  connections accepted: {}", self.connections_accepted);
        println!("  control ticks run:    {}", self.ticks_run);
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let start = Instant::now();
    let mut stats = DemoStats::default();

    let mut table = ConnTable::new(None);
    let mut hooks = RecordingHooks::new();
    let mut directory = FakeDirectory::new();
    let mut handlers = ProtocolHandlers::default();
    let mut global = ratelimit::GlobalBucket::new(1_000_000);
    let config = Config { dir_port: Some(0), ..Config::default() };

    // Step 1: bring up the listeners the retry tick is responsible for.
    retry::retry_all_connections(&mut table, &mut hooks, &mut directory, &config);
    let dir_listener_id =
        table.get_by_type(ConnKind::DirListener).expect("retry_all_connections must have bound the Dir listener");
    stats.listeners_bound += 1;
    let bound_addr = table.get(dir_listener_id).unwrap().listener().unwrap().local_addr().unwrap();
    info!(%bound_addr, "dir listener bound");

    // Step 2: dial it the way a directory client would, from the outside.
    let peer = TcpStream::connect(bound_addr).expect("connect to our own listener");
    std::thread::sleep(Duration::from_millis(20));

    // Step 3: drive the listener through the same unified entry point the
    // event loop would call on any readable conn — `handle_read` delegates
    // to the listener engine on its own since `dir_listener_id` is a
    // listener-kind conn.
    dispatch::handle_read(&mut table, &mut hooks, &mut directory, &mut handlers, &mut global, &config, dir_listener_id)
        .expect("accept must not fail");
    let child_id = table.get_by_type(ConnKind::Dir).expect("a pending connection must be accepted");
    stats.connections_accepted += 1;
    let child = table.get(child_id).unwrap();
    info!(state = ?child.state, addr = ?child.address, "dir child accepted");

    // Step 4: also exercise the outbound dial path (C6), as a relay would
    // when opening an OR link to a peer.
    let mut or_conn = relay_conn::conn::Connection::new(ConnKind::Or);
    let or_addr = match bound_addr.ip() {
        IpAddr::V4(v4) => u32::from(v4),
        _ => unreachable!("loopback bind is always v4 here"),
    };
    let outcome = dial::connect(&mut or_conn, "127.0.0.1", or_addr, bound_addr.port());
    info!(?outcome, "outbound dial attempt");

    // Step 5: run a control tick: refill buckets, resume paused readers.
    retry::tick_second(&mut table, &mut hooks, &mut global);
    stats.ticks_run += 1;

    // Step 6: tear the demo peer down and reap it from the table.
    drop(peer);
    table.get_mut(child_id).unwrap().mark_for_close();
    let reaped = retry::reap_marked(&mut table, &mut hooks, &mut directory, &config);
    info!(?reaped, "reaped closed connections");

    let remaining: Vec<_> = table.ids().map(|id| table.get(id).unwrap().kind).collect();
    info!(?remaining, "connections remaining after reap");

    stats.print(start.elapsed());
}
