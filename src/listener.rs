//! Listener engine (C5): bind, accept, instantiate the right child kind
//! (`spec.md` §4.3). Socket setup is adapted from Cyclone's
//! `net::TcpListener::bind` (SO_REUSEADDR, non-blocking, `socket2`).

use crate::conn::{ApState, ConnKind, ConnState, Connection, DirState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::eventloop::EventLoopHooks;
use crate::router::RouterDirectory;
use crate::table::{ConnId, ConnTable};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

const MAX_BACKLOG: i32 = 1024;

/// `create_listener(bind_addr, kind)`, `spec.md` §4.3 steps 1-3. On failure
/// the socket is always closed and no record is left in the table.
pub fn create_listener(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    bind_addr: SocketAddr,
    kind: ConnKind,
) -> Result<ConnId> {
    debug_assert!(kind.is_listener(), "create_listener is only valid for listener kinds");

    let domain = if bind_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::bind_failed(bind_addr.to_string(), e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::bind_failed(bind_addr.to_string(), e.to_string()))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::bind_failed(bind_addr.to_string(), e.to_string()))?;
    socket
        .bind(&SockAddr::from(bind_addr))
        .map_err(|e| Error::bind_failed(bind_addr.to_string(), e.to_string()))?;
    socket
        .listen(MAX_BACKLOG)
        .map_err(|e| Error::bind_failed(bind_addr.to_string(), e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::bind_failed(bind_addr.to_string(), e.to_string()))?;

    info!(%bind_addr, ?kind, "listener bound");

    let std_listener: std::net::TcpListener = socket.into();
    let mut conn = Connection::new(kind);
    conn.attach_listener(std_listener);
    conn.address = Some(bind_addr.to_string());
    conn.port = match bind_addr {
        SocketAddr::V4(a) => a.port(),
        SocketAddr::V6(a) => a.port(),
    };

    let id = match table.add(conn) {
        Ok(id) => id,
        Err((err, mut conn)) => {
            warn!(error = %err, "listener table insert failed, closing socket");
            conn.close_socket();
            return Err(err);
        }
    };

    hooks.start_reading(table.get_mut(id).unwrap());
    Ok(id)
}

/// `handle_listener_read(listener, child_kind)`, `spec.md` §4.3 steps 1-4.
/// Returns `Ok(None)` on would-block (no effect), `Ok(Some(id))` for a new
/// child connection, or `Err(ListenerFatal)` on a real accept error — the
/// caller must close the listener in that case.
pub fn handle_listener_read(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    config: &Config,
    listener_id: ConnId,
    child_kind: ConnKind,
) -> Result<Option<ConnId>> {
    let accept_result = table
        .get(listener_id)
        .expect("listener id must be valid")
        .listener()
        .expect("listener connection must carry a TcpListener")
        .accept();

    let (stream, peer_addr) = match accept_result {
        Ok(pair) => pair,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(Error::ListenerFatal { message: e.to_string() }),
    };

    stream.set_nonblocking(true).map_err(Error::from)?;
    if child_kind == ConnKind::Or {
        // Relay cells are latency-sensitive and small; Nagle's algorithm
        // would just add a tick of delay for no coalescing benefit here.
        stream.set_nodelay(true).map_err(Error::from)?;
    }

    let mut child = Connection::new(child_kind);
    child.attach_socket(stream);
    child.address = Some(peer_addr.ip().to_string());
    child.port = peer_addr.port();
    if let std::net::IpAddr::V4(v4) = peer_addr.ip() {
        child.addr = u32::from(v4);
    }

    let child_id = match table.add(child) {
        Ok(id) => id,
        Err((err, mut conn)) => {
            // Table full: close and discard the child, leave the listener alone.
            warn!(error = %err, "connection table full, dropping accepted connection");
            conn.close_socket();
            return Ok(None);
        }
    };

    init_accepted(table, hooks, directory, config, child_id)?;
    debug!(?child_kind, %peer_addr, "accepted connection");
    Ok(Some(child_id))
}

/// `init_accepted(child)`, `spec.md` §4.3 step 3.
fn init_accepted(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    config: &Config,
    child_id: ConnId,
) -> Result<()> {
    let kind = table.get(child_id).unwrap().kind;
    match kind {
        ConnKind::Or => {
            // A failed handshake start marks the conn for close rather than
            // tearing down the listener; surfacing Err here would otherwise
            // look like an accept failure to the caller.
            if let Err(e) = crate::handshake::tls_start_handshake(table, hooks, directory, config, child_id, true) {
                warn!(error = %e, "handshake failed to start for accepted OR conn");
            }
        }
        ConnKind::Ap => {
            table.get_mut(child_id).unwrap().state = ConnState::Ap(ApState::SocksWait);
            hooks.start_reading(table.get_mut(child_id).unwrap());
        }
        ConnKind::Dir => {
            table.get_mut(child_id).unwrap().state = ConnState::Dir(DirState::AwaitingCommand);
            hooks.start_reading(table.get_mut(child_id).unwrap());
        }
        other => {
            return Err(Error::ListenerFatal { message: format!("{other:?} cannot be accepted") });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::eventloop::RecordingHooks;
    use crate::router::FakeDirectory;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};

    #[test]
    fn create_listener_then_accept_empty_is_a_no_op() {
        let mut table = ConnTable::new(None);
        let mut hooks = RecordingHooks::new();
        let mut directory = FakeDirectory::new();
        let config = Config::default();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let id = create_listener(&mut table, &mut hooks, addr, ConnKind::DirListener).unwrap();
        assert_eq!(table.get(id).unwrap().state, ConnState::ListenerReady);

        let result = handle_listener_read(&mut table, &mut hooks, &mut directory, &config, id, ConnKind::Dir).unwrap();
        assert!(result.is_none(), "accept on an empty listener must be a no-op success");
    }

    #[test]
    fn accept_of_real_peer_creates_dir_child_in_awaiting_command() {
        let mut table = ConnTable::new(None);
        let mut hooks = RecordingHooks::new();
        let mut directory = FakeDirectory::new();
        let config = Config::default();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let id = create_listener(&mut table, &mut hooks, addr, ConnKind::DirListener).unwrap();

        let bound_addr = table.get(id).unwrap().listener().unwrap().local_addr().unwrap();

        let _client = TcpStream::connect(bound_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let child_id = handle_listener_read(&mut table, &mut hooks, &mut directory, &config, id, ConnKind::Dir)
            .unwrap()
            .expect("a pending connection must be accepted");
        let child = table.get(child_id).unwrap();
        assert_eq!(child.kind, ConnKind::Dir);
        assert_eq!(child.state, ConnState::Dir(DirState::AwaitingCommand));
        assert!(child.address.is_some());
    }

    #[test]
    fn table_full_drops_accepted_child_without_tearing_down_listener() {
        let mut table = ConnTable::new(Some(1));
        let mut hooks = RecordingHooks::new();
        let mut directory = FakeDirectory::new();
        let config = Config::default();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let id = create_listener(&mut table, &mut hooks, addr, ConnKind::DirListener).unwrap();
        // table is now at capacity (1) with just the listener

        let bound_addr = table.get(id).unwrap().listener().unwrap().local_addr().unwrap();
        let _client = TcpStream::connect(bound_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let result = handle_listener_read(&mut table, &mut hooks, &mut directory, &config, id, ConnKind::Dir).unwrap();
        assert!(result.is_none(), "full table must discard the child, not error");
        assert!(table.get(id).is_some(), "listener itself must remain in the table");
    }
}
