//! Retry loop (`spec.md` §4.8): startup and one-second control tick.
//! Grounded in Cyclone's `reactor` tick/timer-wheel callback shape,
//! generalized from "fire timers" to "refill buckets, resume paused
//! readers, bind missing listeners, reap closed connections".

use crate::config::Config;
use crate::conn::{ConnKind, ConnState, OrState};
use crate::eventloop::EventLoopHooks;
use crate::listener;
use crate::ratelimit::{receiver_bucket_should_increase, GlobalBucket};
use crate::router::RouterDirectory;
use crate::table::ConnTable;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// `retry_all_connections(or_port, ap_port, dir_port)`. OR and Dir listen
/// on `INADDR_ANY`; AP listens on `INADDR_LOOPBACK` only — the SOCKS port
/// is never exposed to the network.
pub fn retry_all_connections(table: &mut ConnTable, hooks: &mut dyn EventLoopHooks, directory: &mut dyn RouterDirectory, config: &Config) {
    if config.or_port.is_some() {
        directory.retry_connections();
    }

    for (port, listener_kind, bind_ip) in [
        (config.or_port, ConnKind::OrListener, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        (config.ap_port, ConnKind::ApListener, IpAddr::V4(Ipv4Addr::LOCALHOST)),
        (config.dir_port, ConnKind::DirListener, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
    ] {
        let Some(port) = port else { continue };
        if table.get_by_type(listener_kind).is_some() {
            continue;
        }
        let bind_addr = SocketAddr::new(bind_ip, port);
        match listener::create_listener(table, hooks, bind_addr, listener_kind) {
            Ok(_) => info!(%bind_addr, ?listener_kind, "listener (re)created"),
            Err(e) => warn!(error = %e, ?listener_kind, "failed to (re)create listener"),
        }
    }
}

/// `tick_second()`: refill both bucket layers and resume any reader the
/// budget exhaustion path paused.
pub fn tick_second(table: &mut ConnTable, hooks: &mut dyn EventLoopHooks, global: &mut GlobalBucket) {
    global.refill();

    let ids: Vec<_> = table.ids().collect();
    for id in ids {
        let conn = table.get_mut(id).unwrap();
        if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Open) && receiver_bucket_should_increase(conn) {
            conn.receiver_bucket += conn.bandwidth as i64;
        }
        if conn.wants_to_read {
            conn.wants_to_read = false;
            hooks.start_reading(conn);
        }
        if conn.wants_to_write {
            conn.wants_to_write = false;
            hooks.start_writing(conn);
        }
    }
}

/// `sweep_idle(max_idle)`: mark connections for close once both their read
/// and write sides have been silent for longer than `max_idle` (dropped
/// from the spec's distillation, recovered from `original_source/`'s
/// `connection_bucket_should_increase`-adjacent idle handling).
pub fn sweep_idle(table: &mut ConnTable, config: &Config, now: Instant) {
    let Some(max_idle) = config.idle_timeout else { return };
    for id in table.ids().collect::<Vec<_>>() {
        let conn = table.get_mut(id).unwrap();
        if conn.kind.is_listener() || conn.marked_for_close {
            continue;
        }
        let idle_since = conn.timestamp_lastread.max(conn.timestamp_lastwritten);
        if now.saturating_duration_since(idle_since) > max_idle {
            conn.mark_for_close();
        }
    }
}

/// `reap_marked()`: remove every connection with `marked_for_close = true`,
/// draining a final best-effort write first (`spec.md` §3.3, §5 "cyclic
/// relationships must be broken during close").
pub fn reap_marked(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    config: &Config,
) -> Vec<crate::table::ConnId> {
    let to_reap: Vec<_> = table.ids().filter(|&id| table.get(id).unwrap().marked_for_close).collect();

    let mut reaped = Vec::with_capacity(to_reap.len());
    for id in to_reap {
        if let Some(conn) = table.get_mut(id) {
            if !conn.kind.is_listener() && conn.outbuf_flushlen > 0 {
                let _ = crate::dispatch::handle_write(table, hooks, directory, &mut crate::protocol::ProtocolHandlers::default(), config, id);
            }
        }
        if let Some(mut conn) = table.remove(id) {
            conn.close_socket();
        }
        reaped.push(id);
    }
    reaped
}

#[allow(dead_code)]
fn _unused_duration_hint() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnKind, Connection};
    use crate::eventloop::RecordingHooks;
    use crate::router::FakeDirectory;

    #[test]
    fn retry_all_connections_binds_ap_to_loopback_only() {
        let mut table = ConnTable::new(None);
        let mut hooks = RecordingHooks::new();
        let mut directory = FakeDirectory::new();
        let config = Config { ap_port: Some(0), ..Config::default() };

        retry_all_connections(&mut table, &mut hooks, &mut directory, &config);

        let id = table.get_by_type(ConnKind::ApListener).expect("AP listener must be created");
        let bind_addr = table.get(id).unwrap().listener().unwrap().local_addr().unwrap();
        assert!(bind_addr.ip().is_loopback());
    }

    #[test]
    fn retry_all_connections_is_idempotent_when_listener_already_exists() {
        let mut table = ConnTable::new(None);
        let mut hooks = RecordingHooks::new();
        let mut directory = FakeDirectory::new();
        let config = Config { dir_port: Some(0), ..Config::default() };

        retry_all_connections(&mut table, &mut hooks, &mut directory, &config);
        let count_after_first = table.len();
        retry_all_connections(&mut table, &mut hooks, &mut directory, &config);
        assert_eq!(table.len(), count_after_first, "a second tick must not create a duplicate listener");
    }

    #[test]
    fn tick_second_clears_wants_to_read_and_reenables_interest() {
        let mut table = ConnTable::new(None);
        let mut hooks = RecordingHooks::new();
        let mut global = GlobalBucket::new(100);
        global.consume(100);

        let mut conn = Connection::new(ConnKind::Dir);
        conn.wants_to_read = true;
        let id = table.add(conn).unwrap();

        tick_second(&mut table, &mut hooks, &mut global);

        assert!(!table.get(id).unwrap().wants_to_read);
        assert!(hooks.is_reading(table.get(id).unwrap()));
        assert_eq!(global.level(), 100);
    }

    #[test]
    fn sweep_idle_marks_long_silent_connections_for_close() {
        let mut table = ConnTable::new(None);
        let config = Config { idle_timeout: Some(Duration::from_millis(1)), ..Config::default() };
        let id = table.add(Connection::new(ConnKind::Dir)).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        sweep_idle(&mut table, &config, Instant::now());

        assert!(table.get(id).unwrap().marked_for_close);
    }

    #[test]
    fn sweep_idle_is_a_no_op_when_unconfigured() {
        let mut table = ConnTable::new(None);
        let config = Config::default();
        let id = table.add(Connection::new(ConnKind::Dir)).unwrap();
        sweep_idle(&mut table, &config, Instant::now());
        assert!(!table.get(id).unwrap().marked_for_close);
    }

    #[test]
    fn reap_marked_removes_only_closed_connections() {
        let mut table = ConnTable::new(None);
        let mut hooks = RecordingHooks::new();
        let mut directory = FakeDirectory::new();
        let config = Config::default();

        let keep = table.add(Connection::new(ConnKind::Dir)).unwrap();
        let mut closing = Connection::new(ConnKind::Dir);
        closing.mark_for_close();
        let close = table.add(closing).unwrap();

        let reaped = reap_marked(&mut table, &mut hooks, &mut directory, &config);
        assert_eq!(reaped, vec![close]);
        assert!(table.get(keep).is_some());
        assert!(table.get(close).is_none());
    }
}
