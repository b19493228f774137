//! Router directory collaborator (`spec.md` §6): maps link keys to peer
//! records. Out of scope per `spec.md` §1 ("the router directory that maps
//! identity keys to peer records"); modeled as a trait so the handshake
//! driver and dispatcher can be tested without a real directory.

/// A peer-router descriptor as the directory would hand it back.
#[derive(Debug, Clone)]
pub struct RouterRecord {
    pub nickname: String,
    pub identity_pkey: Vec<u8>,
    pub link_pkey: Vec<u8>,
    pub onion_pkey: Vec<u8>,
    pub bandwidth: u32,
    /// The router's published OR address/port, used for the duplicate-link
    /// check (`connection_exact_get_by_addr_port(router->addr, router->or_port)`
    /// in `original_source/src/or/connection.c`) — distinct from the ephemeral
    /// source port an accepted connection actually arrives on.
    pub addr: u32,
    pub or_port: u16,
}

pub trait RouterDirectory {
    fn get_by_link_pk(&self, link_pkey: &[u8]) -> Option<RouterRecord>;

    /// Mark directory state dirty so routing info refreshes next cycle.
    fn set_dirty(&mut self);

    /// Ask the directory layer to (re)connect any configured peers lacking
    /// a link, as part of the retry tick (`spec.md` §4.8).
    fn retry_connections(&mut self);

    /// Evict a directory source after a failed fetch (`spec.md` §7,
    /// `router_forget_router` in Open Question (d)).
    fn forget(&mut self, addr: u32, port: u16);

    /// Notify the circuit layer that a client-dialed OR link just
    /// authenticated and is ready to carry cells (`spec.md` §4.4, "Client,
    /// Yes" row). A no-op default since most directory implementations in
    /// this crate's tests don't need to observe it.
    fn circuit_n_conn_open(&mut self, _link_pkey: &[u8]) {}
}

/// In-memory directory used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct FakeDirectory {
    by_link_key: std::collections::HashMap<Vec<u8>, RouterRecord>,
    dirty: bool,
    forgotten: Vec<(u32, u16)>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: RouterRecord) {
        self.by_link_key.insert(record.link_pkey.clone(), record);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn forgotten(&self) -> &[(u32, u16)] {
        &self.forgotten
    }
}

impl RouterDirectory for FakeDirectory {
    fn get_by_link_pk(&self, link_pkey: &[u8]) -> Option<RouterRecord> {
        self.by_link_key.get(link_pkey).cloned()
    }

    fn set_dirty(&mut self) {
        self.dirty = true;
    }

    fn retry_connections(&mut self) {}

    fn forget(&mut self, addr: u32, port: u16) {
        self.forgotten.push((addr, port));
    }
}
