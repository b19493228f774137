//! Connection record (C3) and per-kind state machines (`spec.md` §3, §4.1).

use crate::buf::ByteBuf;
use crate::tls::TlsSession;
use std::fmt;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

/// The one OS descriptor a connection record owns. Listener kinds hold a
/// `TcpListener`, everything else a `TcpStream`; both variants close their
/// fd on drop, which is what gives `Connection` its "exactly one owner,
/// closed once" fd lifetime (`spec.md` §5).
enum Socket {
    None,
    Stream(TcpStream),
    Listener(TcpListener),
}

impl Socket {
    fn raw_fd(&self) -> RawFd {
        match self {
            Socket::None => -1,
            Socket::Stream(s) => s.as_raw_fd(),
            Socket::Listener(l) => l.as_raw_fd(),
        }
    }
}

/// Immutable role tag for a connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    OrListener,
    Or,
    ApListener,
    Ap,
    Exit,
    DirListener,
    Dir,
    DnsWorker,
    CpuWorker,
}

impl ConnKind {
    pub fn is_listener(self) -> bool {
        matches!(self, Self::OrListener | Self::ApListener | Self::DirListener)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrState {
    Connecting,
    Handshaking,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApState {
    SocksWait,
    AwaitingDestInfo,
    WaitingForOrConn,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    WaitingForDestInfo,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirState {
    ConnectingFetch,
    ConnectingUpload,
    ClientSendingFetch,
    ClientSendingUpload,
    ClientReadingFetch,
    ClientReadingUpload,
    AwaitingCommand,
    Writing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
}

/// Kind-specific state. A flat sum type with one variant per kind rather
/// than a shared enum, so an `Or` connection can never be caught in an
/// `ApState` — see the Design Note in `spec.md` §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ListenerReady,
    Or(OrState),
    Ap(ApState),
    Exit(ExitState),
    Dir(DirState),
    Worker(WorkerState),
}

/// Edge-stream fields, present only for `Ap`/`Exit` connections (invariant 4).
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeStreamFields {
    pub stream_id: u16,
    pub next_stream: u16,
    pub cpath_layer: u8,
    pub package_window: i32,
    pub deliver_window: i32,
    pub done_sending: bool,
    pub done_receiving: bool,
}

/// Peer-router descriptor, populated once a relay peer is authenticated.
#[derive(Debug, Clone, Default)]
pub struct RouterIdentity {
    pub nickname: Option<String>,
    pub identity_pkey: Option<Vec<u8>>,
    pub link_pkey: Option<Vec<u8>>,
    pub onion_pkey: Option<Vec<u8>>,
}

/// A connection record: one polymorphic value for every open endpoint
/// (`spec.md` §3.1). Destroyed only by `Engine::reap_marked`, which drops
/// this value and, with it, the socket, TLS session, and buffers.
pub struct Connection {
    pub kind: ConnKind,
    pub state: ConnState,

    socket: Socket,
    pub poll_index: Option<mio::Token>,

    pub inbuf: ByteBuf,
    pub outbuf: ByteBuf,
    pub outbuf_flushlen: usize,
    pub inbuf_reached_eof: bool,

    pub wants_to_read: bool,
    pub wants_to_write: bool,

    pub address: Option<String>,
    pub addr: u32,
    pub port: u16,

    pub tls: Option<TlsSession>,

    /// Set when this OR conn originated from `dial` rather than `accept`;
    /// the handshake driver needs this to pick the right authentication
    /// row (`spec.md` §4.4) and the expected link key to match against.
    pub dialed: bool,
    pub expected_link_key: Option<Vec<u8>>,

    pub identity: RouterIdentity,

    pub bandwidth: u32,
    pub receiver_bucket: i64,

    pub timestamp_created: Instant,
    pub timestamp_lastread: Instant,
    pub timestamp_lastwritten: Instant,

    pub marked_for_close: bool,

    pub edge: Option<EdgeStreamFields>,
}

impl fmt::Debug for Connection {
    // `TlsSession` wraps rustls connection state that isn't `Debug`; print
    // the fields a test failure actually needs instead of deriving.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("address", &self.address)
            .field("marked_for_close", &self.marked_for_close)
            .field("has_tls", &self.tls.is_some())
            .finish()
    }
}

impl Connection {
    /// Construct a fresh connection of `kind` with no socket attached yet.
    /// Listener kinds start in `Ready`; every other kind starts in the
    /// first state of its progression (`spec.md` §4.1).
    pub fn new(kind: ConnKind) -> Self {
        let now = Instant::now();
        let state = match kind {
            ConnKind::OrListener | ConnKind::ApListener | ConnKind::DirListener => ConnState::ListenerReady,
            ConnKind::Or => ConnState::Or(OrState::Connecting),
            ConnKind::Ap => ConnState::Ap(ApState::SocksWait),
            ConnKind::Exit => ConnState::Exit(ExitState::WaitingForDestInfo),
            ConnKind::Dir => ConnState::Dir(DirState::AwaitingCommand),
            ConnKind::DnsWorker | ConnKind::CpuWorker => ConnState::Worker(WorkerState::Idle),
        };
        let edge = matches!(kind, ConnKind::Ap | ConnKind::Exit).then(EdgeStreamFields::default);

        Self {
            kind,
            state,
            socket: Socket::None,
            poll_index: None,
            inbuf: ByteBuf::new(),
            outbuf: ByteBuf::new(),
            outbuf_flushlen: 0,
            inbuf_reached_eof: false,
            wants_to_read: false,
            wants_to_write: false,
            address: None,
            addr: 0,
            port: 0,
            tls: None,
            dialed: false,
            expected_link_key: None,
            identity: RouterIdentity::default(),
            bandwidth: 0,
            receiver_bucket: 0,
            timestamp_created: now,
            timestamp_lastread: now,
            timestamp_lastwritten: now,
            marked_for_close: false,
            edge,
        }
    }

    pub fn attach_socket(&mut self, socket: TcpStream) {
        self.socket = Socket::Stream(socket);
    }

    pub fn attach_listener(&mut self, listener: TcpListener) {
        self.socket = Socket::Listener(listener);
    }

    /// Raw fd, or `-1` if no socket is attached (spec's sentinel convention,
    /// surfaced for parity even though storage is an enum, not an `Option`).
    pub fn fd(&self) -> RawFd {
        self.socket.raw_fd()
    }

    pub fn socket(&self) -> Option<&TcpStream> {
        match &self.socket {
            Socket::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.socket {
            Socket::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn listener(&self) -> Option<&TcpListener> {
        match &self.socket {
            Socket::Listener(l) => Some(l),
            _ => None,
        }
    }

    /// Drop whatever socket this record held, closing its fd.
    pub fn close_socket(&mut self) {
        self.socket = Socket::None;
    }

    /// Sticky close marker (invariant 8): once set, nothing clears it.
    pub fn mark_for_close(&mut self) {
        self.marked_for_close = true;
    }

    pub fn is_or_open(&self) -> bool {
        self.kind == ConnKind::Or && self.state == ConnState::Or(OrState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_kinds_start_and_stay_in_ready() {
        for kind in [ConnKind::OrListener, ConnKind::ApListener, ConnKind::DirListener] {
            let conn = Connection::new(kind);
            assert_eq!(conn.state, ConnState::ListenerReady);
        }
    }

    #[test]
    fn edge_fields_present_only_for_ap_and_exit() {
        assert!(Connection::new(ConnKind::Ap).edge.is_some());
        assert!(Connection::new(ConnKind::Exit).edge.is_some());
        assert!(Connection::new(ConnKind::Or).edge.is_none());
        assert!(Connection::new(ConnKind::Dir).edge.is_none());
    }

    #[test]
    fn fresh_socketless_connection_reports_sentinel_fd() {
        let conn = Connection::new(ConnKind::Or);
        assert_eq!(conn.fd(), -1);
    }

    #[test]
    fn mark_for_close_is_sticky() {
        let mut conn = Connection::new(ConnKind::Dir);
        conn.mark_for_close();
        // nothing in this module can ever clear it again; re-marking is a no-op
        conn.mark_for_close();
        assert!(conn.marked_for_close);
    }
}
