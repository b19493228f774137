//! # relay-conn: the connection subsystem of an onion-routing relay
//!
//! This crate owns every open network endpoint a relay process holds:
//! listener sockets, peer relay links, application-side proxy links,
//! directory links, and worker IPC. Every connection is a single
//! polymorphic [`conn::Connection`] record carrying a kind-specific state
//! machine (§4.1), driven by a non-blocking [`dispatch`] read/write path
//! that forks between plain sockets and a TLS record layer ([`tls`],
//! [`handshake`]), accounted against two-level token buckets
//! ([`ratelimit`]).
//!
//! ## Module map
//!
//! | Module | Component | Responsibility |
//! |---|---|---|
//! | [`buf`] | C1 | FIFO byte buffer backing `inbuf`/`outbuf` |
//! | [`tls`] | C2 | Non-blocking TLS handshake + record I/O |
//! | [`conn`] | C3 | Connection record and per-kind state machines |
//! | [`table`] | C4 | Process-wide connection registry |
//! | [`listener`] | C5 | Bind/accept/instantiate |
//! | [`dial`] | C6 | Non-blocking `connect()` |
//! | [`handshake`] | C7 | TLS handshake driver + peer verification |
//! | [`dispatch`] | C8 | Read/write dispatcher and backpressure |
//! | [`ratelimit`] | C9 | Global + per-link token buckets |
//! | [`invariant`] | C10 | Debug-only cross-field assertions |
//!
//! [`eventloop`] is the seam this subsystem calls through to the poll
//! driver (out of scope, §1); [`protocol`] is the seam the dispatcher
//! calls through to the per-kind cell/SOCKS/directory handlers (also out
//! of scope); [`router`] is the seam into the peer-identity directory.
//! [`retry`] implements the startup/one-second control tick (§4.8).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod buf;
pub mod conn;
pub mod config;
pub mod dial;
pub mod dispatch;
pub mod error;
pub mod eventloop;
pub mod handshake;
pub mod invariant;
pub mod listener;
pub mod protocol;
pub mod ratelimit;
pub mod retry;
pub mod router;
pub mod table;
pub mod tls;

pub use conn::{ConnKind, Connection};
pub use config::Config;
pub use error::{Error, Result};
pub use table::ConnTable;
