//! Read/write dispatcher (C8): readiness callbacks, backpressure, and the
//! plain-vs-TLS fork (`spec.md` §4.6). Adapted from Cyclone's reactor
//! read/write dispatch loop, generalized from "always read everything
//! available" to the fair-share/global-bucket/receiver-bucket clamp chain.

use crate::config::Config;
use crate::conn::{ConnKind, ConnState, DirState, OrState};
use crate::error::{Error, Result};
use crate::eventloop::EventLoopHooks;
use crate::handshake;
use crate::listener;
use crate::protocol::{Outcome, ProtocolHandlers};
use crate::ratelimit::GlobalBucket;
use crate::router::RouterDirectory;
use crate::table::{ConnId, ConnTable};
use crate::tls::TlsOutcome;
use std::time::Instant;
use tracing::{debug, warn};

/// `handle_read(conn)`: dispatch by kind, update timestamps, route into
/// the listener/handshake/plain-or-tls read path, then fire `process_inbuf`.
pub fn handle_read(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    handlers: &mut ProtocolHandlers,
    global: &mut GlobalBucket,
    config: &Config,
    id: ConnId,
) -> Result<()> {
    table.get_mut(id).expect("handle_read id must be valid").timestamp_lastread = Instant::now();

    let kind = table.get(id).unwrap().kind;
    if kind.is_listener() {
        // `spec.md` §4.6 step 2: a listener-kind conn delegates straight to
        // the listener engine rather than going through the read/TLS/bucket
        // path below, which only makes sense for a conn with a peer socket.
        let child_kind = match kind {
            ConnKind::OrListener => ConnKind::Or,
            ConnKind::ApListener => ConnKind::Ap,
            ConnKind::DirListener => ConnKind::Dir,
            _ => unreachable!("ConnKind::is_listener() only returns true for the three listener kinds"),
        };
        listener::handle_listener_read(table, hooks, directory, config, id, child_kind)?;
        return Ok(());
    }

    let read_result = read_to_buf(table, hooks, directory, global, config, id);
    if let Err(e) = read_result {
        if kind == ConnKind::Dir && matches!(table.get(id).unwrap().state, ConnState::Dir(DirState::ConnectingFetch | DirState::ConnectingUpload)) {
            let conn = table.get(id).unwrap();
            directory.forget(conn.addr, conn.port);
        }
        return Err(e);
    }

    let conn = table.get_mut(id).unwrap();
    let handler = handlers.for_kind(kind);
    match handler.process_inbuf(conn, directory) {
        Ok(Outcome::Ok) => Ok(()),
        Ok(Outcome::Break) => {
            conn.mark_for_close();
            Ok(())
        }
        Err(e) => {
            conn.mark_for_close();
            Err(e)
        }
    }
}

/// `read_to_buf(conn)`: computes `at_most` per `spec.md` §4.6, then reads
/// via the handshake/TLS/plain path and applies the bucket drawdown.
fn read_to_buf(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    global: &mut GlobalBucket,
    config: &Config,
    id: ConnId,
) -> Result<()> {
    let conn = table.get(id).unwrap();

    let at_most = if config.link_padding {
        global.available(u64::MAX)
    } else {
        global.available(config.fair_share as u64)
    };
    let at_most = if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Open) {
        at_most.min(conn.receiver_bucket.max(0) as u64)
    } else {
        at_most
    };
    let at_most = at_most as usize;

    if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Handshaking) {
        return handshake::tls_continue_handshake(table, hooks, directory, config, id);
    }

    if at_most == 0 {
        // Budget already exhausted before this conn got a turn (`spec.md`
        // §8 scenario 4): pause without touching the fd/TLS session at all.
        let conn = table.get_mut(id).unwrap();
        conn.wants_to_read = true;
        hooks.stop_reading(conn);
        return Ok(());
    }

    let conn = table.get_mut(id).unwrap();
    let read_n = if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Open) {
        let mut tls = conn.tls.take().expect("OR-Open conn must carry a tls session");
        let outcome = conn.inbuf.read_from_tls(&mut tls, at_most);
        conn.tls = Some(tls);
        match outcome {
            TlsOutcome::Error | TlsOutcome::Close => {
                conn.mark_for_close();
                return Err(Error::tls_failed("OR read reported error or close"));
            }
            TlsOutcome::WantRead | TlsOutcome::Done => 0,
            TlsOutcome::WantWrite => {
                hooks.start_writing(conn);
                0
            }
        }
    } else {
        let fd = conn.fd();
        let mut eof = false;
        let n = conn.inbuf.read_from_fd(fd, at_most, &mut eof)?;
        if eof {
            conn.inbuf_reached_eof = true;
        }
        n
    };

    if read_n > 0 {
        global.consume(read_n as u64);
        if global.level() == 0 {
            conn.wants_to_read = true;
            hooks.stop_reading(conn);
            return Ok(());
        }
        if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Open) {
            conn.receiver_bucket -= read_n as i64;
            if conn.receiver_bucket <= 0 {
                conn.receiver_bucket = 0;
                conn.wants_to_read = true;
                hooks.stop_reading(conn);
            }
        }
    }
    Ok(())
}

/// `handle_write(conn)`: the mirror of `handle_read` for the outbound path.
pub fn handle_write(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    handlers: &mut ProtocolHandlers,
    config: &Config,
    id: ConnId,
) -> Result<()> {
    let conn = table.get_mut(id).unwrap();
    debug_assert!(!conn.kind.is_listener(), "listener kinds never dispatch handle_write");
    conn.timestamp_lastwritten = Instant::now();

    if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Connecting) {
        if let Err(e) = crate::dial::take_connect_error(conn) {
            conn.mark_for_close();
            return Err(e);
        }
        return handshake::tls_start_handshake(table, hooks, directory, config, id, false);
    }

    if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Handshaking) {
        hooks.stop_writing(conn);
        return handshake::tls_continue_handshake(table, hooks, directory, config, id);
    }

    let conn = table.get_mut(id).unwrap();
    if conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Open) {
        let mut tls = conn.tls.take().expect("OR-Open conn must carry a tls session");
        let mut flushlen = conn.outbuf_flushlen;
        let outcome = conn.outbuf.flush_to_tls(&mut tls, &mut flushlen);
        conn.outbuf_flushlen = flushlen;
        conn.tls = Some(tls);
        match outcome {
            TlsOutcome::Error | TlsOutcome::Close => {
                conn.mark_for_close();
                return Err(Error::tls_failed("OR write reported error or close"));
            }
            TlsOutcome::WantRead => {
                if !hooks.is_reading(conn) {
                    hooks.stop_writing(conn);
                    conn.wants_to_write = true;
                }
            }
            TlsOutcome::WantWrite => {
                hooks.start_writing(conn);
            }
            TlsOutcome::Done => {}
        }
    } else {
        let fd = conn.fd();
        let mut flushlen = conn.outbuf_flushlen;
        conn.outbuf.flush_to_fd(fd, &mut flushlen)?;
        conn.outbuf_flushlen = flushlen;
    }

    let conn = table.get_mut(id).unwrap();
    if conn.outbuf_flushlen == 0 {
        hooks.stop_writing(conn);
        let kind = conn.kind;
        let handler = handlers.for_kind(kind);
        let conn = table.get_mut(id).unwrap();
        match handler.finished_flushing(conn) {
            Ok(Outcome::Ok) => {}
            Ok(Outcome::Break) => conn.mark_for_close(),
            Err(e) => {
                conn.mark_for_close();
                return Err(e);
            }
        }
    }
    Ok(())
}

/// `write_to_buf(bytes, conn)` (`spec.md` §4.6). Enforces the
/// `max_outbuf_bytes` backpressure cap before appending.
pub fn write_to_buf(table: &mut ConnTable, hooks: &mut dyn EventLoopHooks, config: &Config, id: ConnId, bytes: &[u8]) -> Result<()> {
    let conn = table.get_mut(id).unwrap();
    if conn.marked_for_close || bytes.is_empty() {
        return Ok(());
    }
    if conn.outbuf.len() + bytes.len() > config.max_outbuf_bytes {
        warn!(id = ?id, "outbuf backpressure cap reached, dropping connection");
        conn.mark_for_close();
        return Ok(());
    }

    conn.outbuf.write(bytes);

    let link_padding_defers = config.link_padding && conn.kind == ConnKind::Or && conn.state == ConnState::Or(OrState::Open);
    if link_padding_defers {
        debug!("link padding enabled, deferring outbuf_flushlen to the cell scheduler");
    } else {
        conn.outbuf_flushlen += bytes.len();
        hooks.start_writing(conn);
    }
    Ok(())
}

/// `send_destroy(circuit_id, conn)` (`spec.md` §4.6, §8 scenario 6).
pub fn send_destroy(table: &mut ConnTable, hooks: &mut dyn EventLoopHooks, config: &Config, id: ConnId, circuit_id: u16) -> Result<()> {
    let kind = table.get(id).unwrap().kind;
    if !matches!(kind, ConnKind::Or) {
        table.get_mut(id).unwrap().mark_for_close();
        return Ok(());
    }
    let cell = format_destroy_cell(circuit_id);
    write_to_buf(table, hooks, config, id, &cell)
}

/// Formats a minimal `DESTROY` cell: 2-byte circuit id, 1-byte command
/// (`0` stands in for the real command-byte table, out of scope here),
/// rest zero-padded to a fixed cell size.
fn format_destroy_cell(circuit_id: u16) -> Vec<u8> {
    const CELL_SIZE: usize = 512;
    const DESTROY_COMMAND: u8 = 0;
    let mut cell = vec![0u8; CELL_SIZE];
    cell[0..2].copy_from_slice(&circuit_id.to_be_bytes());
    cell[2] = DESTROY_COMMAND;
    cell
}
