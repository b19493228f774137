//! The event-loop/poll-driver boundary (`spec.md` §6): "Subsystem → event
//! loop". The poll driver itself — converting kernel readiness into calls
//! on `handle_read`/`handle_write` — is out of scope (`spec.md` §1); this
//! trait is the seam the dispatcher calls through to toggle interest,
//! grounded in Cyclone's `reactor::Reactor::register`/`reregister` split
//! between "the reactor owns `mio::Poll`" and "callers just ask for
//! interest changes".

use crate::conn::Connection;

pub trait EventLoopHooks {
    fn start_reading(&mut self, conn: &mut Connection);
    fn stop_reading(&mut self, conn: &mut Connection);
    fn start_writing(&mut self, conn: &mut Connection);
    fn stop_writing(&mut self, conn: &mut Connection);
    fn is_reading(&self, conn: &Connection) -> bool;

    /// Register (or re-register) with an explicit interest mask, used by
    /// `create_listener`/`handle_listener_read` which need to name both
    /// interests at once rather than toggling them independently.
    fn watch_events(&mut self, conn: &mut Connection, interests: mio::Interest);
}

/// An in-process bookkeeping implementation with no real `mio::Poll`
/// behind it, sufficient for unit tests and the demo binary: it just
/// records what interest mask each connection currently has.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    reading: std::collections::HashSet<mio::Token>,
    writing: std::collections::HashSet<mio::Token>,
    next_token: usize,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn token_for(&mut self, conn: &mut Connection) -> mio::Token {
        if let Some(t) = conn.poll_index {
            return t;
        }
        let t = mio::Token(self.next_token);
        self.next_token += 1;
        conn.poll_index = Some(t);
        t
    }
}

impl EventLoopHooks for RecordingHooks {
    fn start_reading(&mut self, conn: &mut Connection) {
        let t = self.token_for(conn);
        self.reading.insert(t);
    }

    fn stop_reading(&mut self, conn: &mut Connection) {
        let t = self.token_for(conn);
        self.reading.remove(&t);
    }

    fn start_writing(&mut self, conn: &mut Connection) {
        let t = self.token_for(conn);
        self.writing.insert(t);
    }

    fn stop_writing(&mut self, conn: &mut Connection) {
        let t = self.token_for(conn);
        self.writing.remove(&t);
    }

    fn is_reading(&self, conn: &Connection) -> bool {
        conn.poll_index.is_some_and(|t| self.reading.contains(&t))
    }

    fn watch_events(&mut self, conn: &mut Connection, interests: mio::Interest) {
        let t = self.token_for(conn);
        if interests.is_readable() {
            self.reading.insert(t);
        } else {
            self.reading.remove(&t);
        }
        if interests.is_writable() {
            self.writing.insert(t);
        } else {
            self.writing.remove(&t);
        }
    }
}
