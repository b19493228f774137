//! Invariant checker (C10), debug-only (`spec.md` §3.2, §9 Open Question
//! (a)). The original `assert_connection_ok` begins with an unconditional
//! return, making every assertion below it dead code; we implement the
//! assertions for real, gated behind `debug_assertions` so release builds
//! pay nothing for them.

use crate::conn::{ConnKind, ConnState, Connection, OrState};

/// Panics if `conn` violates any of the invariants in `spec.md` §3.2/§8.
/// A no-op in release builds (`cfg(not(debug_assertions))`).
pub fn assert_connection_ok(conn: &Connection) {
    #[cfg(debug_assertions)]
    {
        assert!(
            conn.timestamp_lastread >= conn.timestamp_created,
            "timestamp_lastread must not precede timestamp_created"
        );
        assert!(
            conn.timestamp_lastwritten >= conn.timestamp_created,
            "timestamp_lastwritten must not precede timestamp_created"
        );

        let tls_expected = conn.kind == ConnKind::Or
            && matches!(conn.state, ConnState::Or(OrState::Handshaking) | ConnState::Or(OrState::Open));
        assert_eq!(
            conn.tls.is_some(),
            tls_expected,
            "tls must be present iff kind=Or and state in {{Handshaking, Open}}"
        );

        if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Open) {
            assert!(conn.bandwidth > 0, "OR-Open connection must have bandwidth > 0");
            assert!(
                conn.receiver_bucket >= 0 && conn.receiver_bucket <= 10 * conn.bandwidth as i64,
                "receiver_bucket out of [0, 10*bandwidth]"
            );
            assert!(conn.address.is_some(), "OR-Open connection must have an address");
        }

        if matches!(conn.kind, ConnKind::Ap | ConnKind::Exit) {
            // edge fields are `Some` by construction; nothing further to check
        } else {
            assert!(conn.edge.is_none(), "edge-stream fields must be absent off Ap/Exit");
        }

        if conn.kind.is_listener() {
            assert_eq!(conn.state, ConnState::ListenerReady, "listener kinds must stay in Ready");
        }

        assert!(
            conn.outbuf_flushlen <= conn.outbuf.len(),
            "outbuf_flushlen must never exceed outbuf.len"
        );
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = conn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnKind;

    #[test]
    fn fresh_connections_of_every_kind_pass() {
        for kind in [
            ConnKind::OrListener,
            ConnKind::Or,
            ConnKind::ApListener,
            ConnKind::Ap,
            ConnKind::Exit,
            ConnKind::DirListener,
            ConnKind::Dir,
            ConnKind::DnsWorker,
            ConnKind::CpuWorker,
        ] {
            assert_connection_ok(&Connection::new(kind));
        }
    }

    #[test]
    #[cfg_attr(not(debug_assertions), ignore)]
    #[should_panic(expected = "outbuf_flushlen")]
    fn catches_flushlen_exceeding_outbuf_len() {
        let mut conn = Connection::new(ConnKind::Dir);
        conn.outbuf.write(b"abc");
        conn.outbuf_flushlen = 10;
        assert_connection_ok(&conn);
    }
}
