//! TLS handshake driver (C7): drives a session to completion across
//! readiness events and authenticates the peer once it reports `Done`
//! (`spec.md` §4.4). Grounded in Cyclone's `reactor` read/write-interest
//! toggling, generalized to the four-row authentication table.

use crate::config::Config;
use crate::conn::{ConnKind, ConnState, Connection, OrState};
use crate::error::{Error, Result};
use crate::eventloop::EventLoopHooks;
use crate::router::RouterDirectory;
use crate::table::{ConnId, ConnTable};
use crate::tls::{TlsOutcome, TlsSession};
use mio::Interest;
use tracing::{debug, warn};

/// `tls_start_handshake(conn, receiving)`. `receiving = true` for an
/// accepted peer (server role), `false` for a conn we dialed (client role).
pub fn tls_start_handshake(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    config: &Config,
    id: ConnId,
    receiving: bool,
) -> Result<()> {
    let conn = table.get_mut(id).expect("handshake id must be valid");
    debug_assert_eq!(conn.kind, ConnKind::Or);

    let session = if receiving {
        let (certs, key) = crate::tls::self_signed_identity();
        TlsSession::new_server(certs, key)?
    } else {
        let server_name = conn.address.clone().unwrap_or_else(|| "relay".to_string());
        if config.onion_router {
            // Relay dialing a relay: mutual auth, so we present our own
            // session cert just as we would if we'd accepted the link.
            let (certs, key) = crate::tls::self_signed_identity();
            TlsSession::new_relay_client(&server_name, certs, key)?
        } else {
            TlsSession::new_client(&server_name)?
        }
    };
    conn.tls = Some(session);
    conn.state = ConnState::Or(OrState::Handshaking);
    conn.dialed = !receiving;
    hooks.start_reading(conn);

    tls_continue_handshake(table, hooks, directory, config, id)
}

/// `tls_continue_handshake(conn)`: advance the TLS session and map its
/// result; `Done` proceeds straight to authentication.
pub fn tls_continue_handshake(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    config: &Config,
    id: ConnId,
) -> Result<()> {
    let conn = table.get_mut(id).expect("handshake id must be valid");
    let mut tls = conn.tls.take().expect("Handshaking conn must carry a tls session");
    let outcome = {
        let socket = conn.socket_mut().expect("Handshaking conn must carry a socket");
        tls.drive_handshake(socket)
    };
    conn.tls = Some(tls);

    match outcome {
        TlsOutcome::Error | TlsOutcome::Close => {
            conn.mark_for_close();
            Err(Error::tls_failed("handshake reported error or close"))
        }
        TlsOutcome::WantRead => {
            hooks.start_reading(conn);
            Ok(())
        }
        TlsOutcome::WantWrite => {
            hooks.watch_events(conn, Interest::READABLE | Interest::WRITABLE);
            Ok(())
        }
        TlsOutcome::Done => tls_finish_handshake(table, hooks, directory, config, id),
    }
}

/// `tls_finish_handshake(conn)`: transition to `Open`, set read-only
/// interest, then authenticate the peer per the four-row table in
/// `spec.md` §4.4. Authentication failure marks the conn for close and
/// dirties the directory, but still returns the transition as having
/// happened (the caller sees an `Err` and reaps on the next tick).
fn tls_finish_handshake(
    table: &mut ConnTable,
    hooks: &mut dyn EventLoopHooks,
    directory: &mut dyn RouterDirectory,
    config: &Config,
    id: ConnId,
) -> Result<()> {
    let conn = table.get_mut(id).expect("handshake id must be valid");
    conn.state = ConnState::Or(OrState::Open);
    hooks.watch_events(conn, Interest::READABLE);

    authenticate_peer(table, id, directory, config)
}

/// The four-row authentication table itself (`spec.md` §4.4), split out so
/// tests can drive it directly against a pre-handshaken pair without
/// re-running TLS. "Local role" is `config.onion_router`: a relay folds
/// both its dial and accept cases into one row; a pure client (onion
/// proxy) only ever dials, so its row applies whenever `dialed` is true.
pub fn authenticate_peer(table: &mut ConnTable, id: ConnId, directory: &mut dyn RouterDirectory, config: &Config) -> Result<()> {
    let conn = table.get(id).expect("authenticate id must be valid");
    let tls = conn.tls.as_ref().expect("authenticated conn must carry a tls session");
    let peer_has_cert = tls.peer_has_cert();
    let link_key = tls.verify();
    let dialed = conn.dialed;
    let expected_link_key = conn.expected_link_key.clone();

    match (config.onion_router, peer_has_cert) {
        (true, true) if !dialed => {
            // Ground truth (`original_source/src/or/connection.c:278-296`):
            // look the router up by link key first — an unrecognized key is
            // rejected outright — then, only for the accepted (not
            // self-initiated) case, reject a second link to a router we're
            // already exactly connected to at its published OR addr/port.
            let link_key = link_key.expect("peer_has_cert implies verify() is Some");
            match directory.get_by_link_pk(&link_key) {
                None => {
                    table.get_mut(id).unwrap().mark_for_close();
                    directory.set_dirty();
                    Err(Error::tls_failed("unknown router for accepted link key"))
                }
                Some(record) => {
                    if table.exact_get_by_addr_port(record.addr, record.or_port).is_some() {
                        table.get_mut(id).unwrap().mark_for_close();
                        directory.set_dirty();
                        warn!(nickname = %record.nickname, "router already connected, dropping duplicate link");
                        return Err(Error::tls_failed("duplicate OR link"));
                    }
                    adopt_identity(table.get_mut(id).unwrap(), &record);
                    debug!(nickname = %record.nickname, "accepted relay peer authenticated");
                    Ok(())
                }
            }
        }
        (true, true) => {
            // Relay dialed another relay: only require an exact match
            // against a previously-recorded link key; with none recorded,
            // adopt whoever the directory says this link key belongs to.
            let link_key = link_key.expect("peer_has_cert implies verify() is Some");
            let record = directory.get_by_link_pk(&link_key);
            let ok = match (&record, expected_link_key.as_deref()) {
                (Some(_), Some(expected)) => link_key == expected,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if ok {
                adopt_identity(table.get_mut(id).unwrap(), &record.unwrap());
                debug!("dialed relay peer authenticated");
                Ok(())
            } else {
                table.get_mut(id).unwrap().mark_for_close();
                directory.set_dirty();
                Err(Error::tls_failed("dialed peer link key mismatch or unknown router"))
            }
        }
        (true, false) if !dialed => {
            let conn = table.get_mut(id).unwrap();
            conn.bandwidth = config.default_bandwidth_op;
            conn.receiver_bucket = config.default_bandwidth_op as i64;
            debug!("accepted OP client, no cert presented");
            Ok(())
        }
        (true, false) => {
            table.get_mut(id).unwrap().mark_for_close();
            directory.set_dirty();
            Err(Error::tls_failed("dialed relay presented no certificate"))
        }
        (false, true) => {
            let link_key = link_key.expect("peer_has_cert implies verify() is Some");
            let record = directory.get_by_link_pk(&link_key);
            let matches = match (&record, expected_link_key.as_deref()) {
                (Some(record), Some(expected)) => record.link_pkey == expected,
                _ => false,
            };
            if matches {
                adopt_identity(table.get_mut(id).unwrap(), &record.unwrap());
                directory.circuit_n_conn_open(&link_key);
                debug!("client authenticated dialed relay, notifying circuit layer");
                Ok(())
            } else {
                table.get_mut(id).unwrap().mark_for_close();
                directory.set_dirty();
                Err(Error::tls_failed("dialed peer link key mismatch"))
            }
        }
        (false, false) => {
            table.get_mut(id).unwrap().mark_for_close();
            directory.set_dirty();
            Err(Error::tls_failed("dialed server presented no certificate"))
        }
    }
}

fn adopt_identity(conn: &mut Connection, record: &crate::router::RouterRecord) {
    conn.identity.nickname = Some(record.nickname.clone());
    conn.identity.identity_pkey = Some(record.identity_pkey.clone());
    conn.identity.link_pkey = Some(record.link_pkey.clone());
    conn.identity.onion_pkey = Some(record.onion_pkey.clone());
    conn.bandwidth = record.bandwidth;
    conn.receiver_bucket = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::router::{FakeDirectory, RouterRecord};
    use crate::tls::self_signed_identity;
    use std::net::{TcpListener, TcpStream};

    /// `mutual`: whether the dialing side also presents a client cert, as
    /// a real relay-to-relay link does (`spec.md` §4.4 treats "Relay" as
    /// presenting a cert on both the dial and accept sides).
    fn handshaken_pair(mutual: bool) -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_sock = TcpStream::connect(addr).unwrap();
        let (server_sock, _) = listener.accept().unwrap();
        server_sock.set_nonblocking(true).unwrap();
        client_sock.set_nonblocking(true).unwrap();

        let (certs, key) = self_signed_identity();
        let mut server = Connection::new(ConnKind::Or);
        server.attach_socket(server_sock);
        server.tls = Some(TlsSession::new_server(certs, key).unwrap());
        server.state = ConnState::Or(OrState::Handshaking);

        let mut client = Connection::new(ConnKind::Or);
        client.attach_socket(client_sock);
        client.tls = Some(if mutual {
            let (client_certs, client_key) = self_signed_identity();
            TlsSession::new_relay_client("relay.example", client_certs, client_key).unwrap()
        } else {
            TlsSession::new_client("relay.example").unwrap()
        });
        client.state = ConnState::Or(OrState::Handshaking);

        for _ in 0..200 {
            let mut server_tls = server.tls.take().unwrap();
            let s = server_tls.drive_handshake(server.socket_mut().unwrap());
            server.tls = Some(server_tls);

            let mut client_tls = client.tls.take().unwrap();
            let c = client_tls.drive_handshake(client.socket_mut().unwrap());
            client.tls = Some(client_tls);

            if s == TlsOutcome::Done && c == TlsOutcome::Done {
                return (server, client);
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("handshake did not converge");
    }

    #[test]
    fn accepted_relay_peer_with_known_link_key_opens_and_adopts_identity() {
        let (server, client) = handshaken_pair(true);
        // The server's view of the peer cert is the client's own leaf, not
        // what the client saw of the server — the router record has to key
        // off what the accepting side will actually extract.
        let link_key = server.tls.as_ref().unwrap().verify().unwrap();
        drop(client);

        let mut table = ConnTable::new(None);
        let id = table.add(server).unwrap();
        let mut directory = FakeDirectory::new();
        directory.insert(RouterRecord {
            nickname: "alice".into(),
            identity_pkey: vec![1],
            link_pkey: link_key,
            onion_pkey: vec![2],
            bandwidth: 4096,
            addr: 0x7f000001,
            or_port: 9001,
        });
        let config = Config { onion_router: true, ..Config::default() };

        authenticate_peer(&mut table, id, &mut directory, &config).unwrap();
        let conn = table.get(id).unwrap();
        assert_eq!(conn.identity.nickname.as_deref(), Some("alice"));
        assert_eq!(conn.bandwidth, 4096);
        assert!(!conn.marked_for_close);
    }

    #[test]
    fn accepted_relay_peer_duplicate_link_is_rejected_after_router_lookup() {
        // Ground truth ordering (`original_source/src/or/connection.c:278-296`):
        // the router lookup must succeed first, then a second link to the
        // same already-connected router (by its published addr/port, not the
        // new link's own ephemeral source port) is dropped as a duplicate.
        let (server, client) = handshaken_pair(true);
        let link_key = server.tls.as_ref().unwrap().verify().unwrap();
        drop(client);

        let mut table = ConnTable::new(None);
        let mut existing = Connection::new(ConnKind::Or);
        existing.addr = 0x7f000001;
        existing.port = 9001;
        table.add(existing).unwrap();

        let id = table.add(server).unwrap();
        let mut directory = FakeDirectory::new();
        directory.insert(RouterRecord {
            nickname: "alice".into(),
            identity_pkey: vec![1],
            link_pkey: link_key,
            onion_pkey: vec![2],
            bandwidth: 4096,
            addr: 0x7f000001,
            or_port: 9001,
        });
        let config = Config { onion_router: true, ..Config::default() };

        let result = authenticate_peer(&mut table, id, &mut directory, &config);
        assert!(result.is_err());
        assert!(table.get(id).unwrap().marked_for_close);
        assert!(directory.is_dirty());
    }

    #[test]
    fn accepted_client_with_no_cert_gets_default_bandwidth() {
        let (server, _client_with_no_cert) = handshaken_pair(false);
        // rustls always presents a client cert only if configured to; the
        // OP-client path is exercised by asserting the no-cert branch's
        // bandwidth assignment directly since our test harness's client
        // never offers a client certificate to the server either way.
        assert!(!server.tls.as_ref().unwrap().peer_has_cert());

        let mut table = ConnTable::new(None);
        let id = table.add(server).unwrap();
        let mut directory = FakeDirectory::new();
        let config = Config { onion_router: true, default_bandwidth_op: 999, ..Config::default() };

        authenticate_peer(&mut table, id, &mut directory, &config).unwrap();
        let conn = table.get(id).unwrap();
        assert_eq!(conn.bandwidth, 999);
        assert_eq!(conn.receiver_bucket, 999);
        assert!(conn.identity.nickname.is_none());
    }

    #[test]
    fn dialed_peer_with_mismatched_link_key_closes_and_dirties_directory() {
        let (_server, client) = handshaken_pair(false);
        let actual_link_key = client.tls.as_ref().unwrap().verify().unwrap();
        let wrong_expected = vec![0xFFu8; 8];

        let mut table = ConnTable::new(None);
        let id = table.add(client).unwrap();
        let mut directory = FakeDirectory::new();
        directory.insert(RouterRecord {
            nickname: "bob".into(),
            identity_pkey: vec![9],
            link_pkey: actual_link_key,
            onion_pkey: vec![9],
            bandwidth: 1000,
            addr: 0x7f000001,
            or_port: 9001,
        });
        let config = Config::default();
        let conn = table.get_mut(id).unwrap();
        conn.dialed = true;
        conn.expected_link_key = Some(wrong_expected);

        let result = authenticate_peer(&mut table, id, &mut directory, &config);
        assert!(result.is_err());
        assert!(table.get(id).unwrap().marked_for_close);
        assert!(directory.is_dirty());
    }

    #[test]
    fn dialed_peer_with_matching_link_key_opens_and_sets_default_bandwidth() {
        let (_server, client) = handshaken_pair(false);
        let actual_link_key = client.tls.as_ref().unwrap().verify().unwrap();

        let mut table = ConnTable::new(None);
        let id = table.add(client).unwrap();
        let mut directory = FakeDirectory::new();
        directory.insert(RouterRecord {
            nickname: "bob".into(),
            identity_pkey: vec![9],
            link_pkey: actual_link_key.clone(),
            onion_pkey: vec![9],
            bandwidth: 1000,
            addr: 0x7f000001,
            or_port: 9001,
        });
        let config = Config::default();
        let conn = table.get_mut(id).unwrap();
        conn.dialed = true;
        conn.expected_link_key = Some(actual_link_key);

        authenticate_peer(&mut table, id, &mut directory, &config).unwrap();
        let conn = table.get(id).unwrap();
        assert!(!conn.marked_for_close);
        assert_eq!(conn.identity.nickname.as_deref(), Some("bob"));
    }
}
