//! Dial engine (C6): non-blocking `connect()` with in-progress semantics
//! (`spec.md` §4.5). Adapted from Cyclone's `net` connect path, generalized
//! to the three-way `Connected`/`Pending`/`Failed` outcome the spec calls
//! for instead of a bare `io::Result`.

use crate::conn::{ConnKind, Connection};
use crate::error::Error;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Outcome of a non-blocking `connect()` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    /// Connected immediately (rare on a loopback-fast path, common in tests).
    Connected,
    /// `EINPROGRESS`: caller keeps state `Connecting` and subscribes to writable.
    Pending,
}

/// `connect(conn, address, addr, port)`. `addr`/`port` are host order per
/// the spec; converted to network order at this boundary only.
pub fn connect(conn: &mut Connection, address: &str, addr: u32, port: u16) -> Result<DialOutcome, Error> {
    let sock_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(addr), port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::connect_failed(address, e.to_string()))?;
    socket.set_nonblocking(true).map_err(|e| Error::connect_failed(address, e.to_string()))?;

    let outcome = match socket.connect(&SockAddr::from(sock_addr)) {
        Ok(()) => DialOutcome::Connected,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || is_in_progress(&e) => DialOutcome::Pending,
        Err(e) => return Err(Error::connect_failed(address, e.to_string())),
    };

    if conn.kind == ConnKind::Or {
        socket.set_nodelay(true).map_err(|e| Error::connect_failed(address, e.to_string()))?;
    }

    let stream: std::net::TcpStream = socket.into();
    conn.attach_socket(stream);
    conn.address = Some(address.to_string());
    conn.addr = addr;
    conn.port = port;

    Ok(outcome)
}

fn is_in_progress(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Resolve a pending non-blocking `connect()` on the first writable event
/// for a `Connecting` conn (`spec.md` §4.1: "on writable: Handshaking ...
/// or close on connect() error"). Reads `SO_ERROR` without taking
/// ownership of the fd — `conn`'s `TcpStream` still owns it.
pub fn take_connect_error(conn: &Connection) -> Result<(), Error> {
    use std::os::unix::io::FromRawFd;
    let borrowed: Socket = unsafe { Socket::from_raw_fd(conn.fd()) };
    let result = borrowed.take_error();
    std::mem::forget(borrowed);
    match result {
        Ok(None) => Ok(()),
        Ok(Some(e)) | Err(e) => Err(Error::connect_failed(conn.address.as_deref().unwrap_or("?"), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnKind;
    use std::net::TcpListener;

    #[test]
    fn connect_to_live_loopback_listener_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ip = match addr.ip() {
            std::net::IpAddr::V4(v4) => u32::from(v4),
            _ => panic!("expected v4"),
        };

        let mut conn = Connection::new(ConnKind::Or);
        let outcome = connect(&mut conn, "127.0.0.1", ip, addr.port()).unwrap();
        assert!(matches!(outcome, DialOutcome::Connected | DialOutcome::Pending));
        assert_eq!(conn.addr, ip);
        assert_eq!(conn.port, addr.port());
        assert!(conn.socket().is_some());
    }

    #[test]
    fn connect_to_unreachable_port_is_pending_not_an_immediate_hard_failure() {
        // A refused connect on a non-blocking socket still reports
        // EINPROGRESS first; the hard ECONNREFUSED only surfaces on the
        // later writable event, which the dial engine itself doesn't poll.
        let mut conn = Connection::new(ConnKind::Or);
        let result = connect(&mut conn, "127.0.0.1", u32::from(Ipv4Addr::LOCALHOST), 1);
        assert!(result.is_ok());
    }
}
