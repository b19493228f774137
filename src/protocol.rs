//! Per-kind protocol handlers (`spec.md` §6): "the circuit layer and
//! per-protocol message handlers ... each exposes `process_inbuf(conn)` and
//! `finished_flushing(conn)` hooks" — out of scope, modeled as a trait with
//! no-op fakes so the dispatcher (C8) can be exercised without a real cell
//! processor, SOCKS handler, or directory request handler.

use crate::conn::Connection;
use crate::error::Result;
use crate::router::RouterDirectory;

/// Whether a protocol hook wants to keep the connection open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Break,
}

pub trait ProtocolHandler {
    fn process_inbuf(&mut self, conn: &mut Connection, directory: &mut dyn RouterDirectory) -> Result<Outcome>;
    fn finished_flushing(&mut self, conn: &mut Connection) -> Result<Outcome>;
}

/// A handler that always reports success without touching the buffers.
/// Used by tests and the demo binary in place of the real OR cell
/// processor / edge-stream processor / directory request handler.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl ProtocolHandler for NoopHandler {
    fn process_inbuf(&mut self, _conn: &mut Connection, _directory: &mut dyn RouterDirectory) -> Result<Outcome> {
        Ok(Outcome::Ok)
    }

    fn finished_flushing(&mut self, _conn: &mut Connection) -> Result<Outcome> {
        Ok(Outcome::Ok)
    }
}

/// Dispatches to one handler per `ConnKind`. The real per-protocol modules
/// (OR cell processor, edge-stream processor, directory handler, worker
/// RPC) plug in here; this crate ships only `NoopHandler` instances.
pub struct ProtocolHandlers {
    pub or: Box<dyn ProtocolHandler>,
    pub ap: Box<dyn ProtocolHandler>,
    pub exit: Box<dyn ProtocolHandler>,
    pub dir: Box<dyn ProtocolHandler>,
    pub dns_worker: Box<dyn ProtocolHandler>,
    pub cpu_worker: Box<dyn ProtocolHandler>,
}

impl Default for ProtocolHandlers {
    fn default() -> Self {
        Self {
            or: Box::new(NoopHandler),
            ap: Box::new(NoopHandler),
            exit: Box::new(NoopHandler),
            dir: Box::new(NoopHandler),
            dns_worker: Box::new(NoopHandler),
            cpu_worker: Box::new(NoopHandler),
        }
    }
}

impl ProtocolHandlers {
    pub fn for_kind(&mut self, kind: crate::conn::ConnKind) -> &mut dyn ProtocolHandler {
        use crate::conn::ConnKind::*;
        match kind {
            Or => self.or.as_mut(),
            Ap => self.ap.as_mut(),
            Exit => self.exit.as_mut(),
            Dir => self.dir.as_mut(),
            DnsWorker => self.dns_worker.as_mut(),
            CpuWorker => self.cpu_worker.as_mut(),
            OrListener | ApListener | DirListener => {
                unreachable!("listener kinds never dispatch process_inbuf/finished_flushing")
            }
        }
    }
}
