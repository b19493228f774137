//! Connection table (C4): process-wide registry with secondary lookups by
//! kind, by `(addr, port)`, and by identity key (`spec.md` §4.2).

use crate::conn::{Connection, ConnKind};
use crate::error::Error;
use std::collections::HashMap;

/// Opaque handle into the table. Stable across `remove`s of other entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(usize);

pub struct ConnTable {
    entries: HashMap<ConnId, Connection>,
    insertion_order: Vec<ConnId>,
    next_id: usize,
    capacity: Option<usize>,
}

impl ConnTable {
    pub fn new(capacity: Option<usize>) -> Self {
        Self { entries: HashMap::new(), insertion_order: Vec::new(), next_id: 0, capacity }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `conn`, failing with `TableFull` if at capacity. On failure
    /// the caller still owns `conn` and must dispose of it (close the
    /// socket) themselves — the table never silently drops a record.
    pub fn add(&mut self, conn: Connection) -> std::result::Result<ConnId, (Error, Connection)> {
        if let Some(cap) = self.capacity {
            if self.entries.len() >= cap {
                return Err((Error::TableFull { capacity: cap }, conn));
            }
        }
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, conn);
        self.insertion_order.push(id);
        Ok(id)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let removed = self.entries.remove(&id);
        if removed.is_some() {
            self.insertion_order.retain(|&x| x != id);
        }
        removed
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.entries.get_mut(&id)
    }

    /// Any one connection of the given kind, or `None`.
    pub fn get_by_type(&self, kind: ConnKind) -> Option<ConnId> {
        self.insertion_order.iter().copied().find(|id| self.entries[id].kind == kind)
    }

    pub fn iter_by_type(&self, kind: ConnKind) -> impl Iterator<Item = ConnId> + '_ {
        self.insertion_order.iter().copied().filter(move |id| self.entries[id].kind == kind)
    }

    /// The one connection with an exact `(addr, port)` match, or `None`.
    /// Among OR-Open connections this is unique by invariant 6.
    pub fn exact_get_by_addr_port(&self, addr: u32, port: u16) -> Option<ConnId> {
        self.insertion_order
            .iter()
            .copied()
            .find(|id| {
                let c = &self.entries[id];
                c.addr == addr && c.port == port
            })
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.insertion_order.iter().copied()
    }
}
