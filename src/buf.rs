//! Byte buffer abstraction (C1).
//!
//! The surrounding relay process treats this as an external collaborator
//! (`spec.md` §1); this crate is the one place that collaborator has to be
//! a real, working type. `ByteBuf` is a thin FIFO octet queue over
//! `bytes::BytesMut`, adapted from Cyclone's `net::Buffer`, extended with
//! the non-blocking fd/TLS drain operations the spec's §6 interface lists.

use crate::error::Result;
use crate::tls::{TlsOutcome, TlsSession};
use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

/// FIFO byte queue. `len()` is the number of unread octets.
#[derive(Debug, Default)]
pub struct ByteBuf {
    data: BytesMut,
}

impl ByteBuf {
    pub fn new() -> Self {
        Self { data: BytesMut::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append raw bytes, as `write(bytes, n, buf)` in the spec interface.
    pub fn write(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Copy up to `n` unread bytes into `dst` without consuming them.
    pub fn fetch(&self, dst: &mut [u8], n: usize) -> usize {
        let n = n.min(self.data.len()).min(dst.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        n
    }

    /// Byte offset of the first occurrence of `token`, scanning at most the
    /// first `n` unread bytes, or `None` if not found.
    pub fn find(&self, token: u8, n: usize) -> Option<usize> {
        let n = n.min(self.data.len());
        self.data[..n].iter().position(|&b| b == token)
    }

    /// Drop the first `count` unread bytes (used after a protocol handler
    /// consumes a parsed message out of `inbuf`).
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.advance(count);
    }

    /// Read directly from a raw fd into the buffer, non-blocking.
    ///
    /// Returns `Ok(0)` on EWOULDBLOCK (the spec's `WouldBlock` policy:
    /// swallow, no effect). Sets `*eof` when the peer closed cleanly.
    pub fn read_from_fd(&mut self, fd: RawFd, at_most: usize, eof: &mut bool) -> Result<usize> {
        if at_most == 0 {
            // Budget exhausted (`spec.md` §8 scenario 4): pause without
            // touching the fd rather than issuing a zero-length read.
            return Ok(0);
        }
        use std::os::unix::io::FromRawFd;
        let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });

        let mut tmp = vec![0u8; at_most];
        match file.read(&mut tmp) {
            Ok(0) => {
                *eof = true;
                Ok(0)
            }
            Ok(n) => {
                self.data.put_slice(&tmp[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Drain unread bytes to a raw fd, non-blocking, advancing `flushlen`.
    pub fn flush_to_fd(&mut self, fd: RawFd, flushlen: &mut usize) -> Result<usize> {
        use std::os::unix::io::FromRawFd;
        let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });

        let to_write = (*flushlen).min(self.data.len());
        if to_write == 0 {
            return Ok(0);
        }
        match file.write(&self.data[..to_write]) {
            Ok(n) => {
                self.data.advance(n);
                *flushlen -= n;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Read from a TLS session into the buffer. Mirrors `flush_to_tls`'s
    /// result set so the dispatcher can treat both paths uniformly.
    pub fn read_from_tls(&mut self, session: &mut TlsSession, at_most: usize) -> TlsOutcome {
        if at_most == 0 {
            // Budget exhausted (`spec.md` §8 scenario 4): pause without
            // driving the session rather than issuing a zero-length read.
            return TlsOutcome::Done;
        }
        let mut tmp = vec![0u8; at_most];
        let (outcome, n) = session.read(&mut tmp);
        if n > 0 {
            self.data.put_slice(&tmp[..n]);
        }
        outcome
    }

    /// Drain unread bytes through a TLS session, advancing `flushlen`.
    pub fn flush_to_tls(&mut self, session: &mut TlsSession, flushlen: &mut usize) -> TlsOutcome {
        let to_write = (*flushlen).min(self.data.len());
        if to_write == 0 {
            return TlsOutcome::Done;
        }
        let (outcome, n) = session.flush(&self.data[..to_write]);
        if n > 0 {
            self.data.advance(n);
            *flushlen -= n;
        }
        outcome
    }
}
