//! TLS session abstraction (C2) and the non-blocking result codes the
//! handshake driver (C7) and dispatcher (C8) switch on.
//!
//! Adapted from Cyclone's `net::TlsTcpStream`/`TlsServerConfig`, collapsed
//! to the five-verb interface `spec.md` §6 describes: `new`, `handshake`,
//! `peer_has_cert`/`verify`, `read`, `flush`.

use crate::error::{Error, Result};
use rustls::client::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientCertVerified, ClientCertVerifier};
use rustls::{Certificate, ClientConnection, DigitallySignedStruct, DistinguishedName, PrivateKey, ServerConnection, ServerName};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::SystemTime;

/// Relay OR links authenticate at the application layer: the handshake
/// driver (C7) extracts the peer's leaf certificate and checks it against
/// the router directory (`spec.md` §4.4), not against a CA chain. These
/// verifiers accept whatever the peer presents — valid, self-signed, or
/// absent — and let the handshake complete so identity can be decided
/// afterwards.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &Certificate,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &Certificate,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        default_signature_schemes()
    }
}

/// Accepts any client certificate, or none at all (an OP client dials in
/// without one, a relay peer presents one) — same rationale as
/// `AcceptAnyServerCert`.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &Certificate,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &Certificate,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        default_signature_schemes()
    }
}

fn default_signature_schemes() -> Vec<rustls::SignatureScheme> {
    use rustls::SignatureScheme::*;
    vec![
        ECDSA_NISTP256_SHA256,
        ECDSA_NISTP384_SHA384,
        ED25519,
        RSA_PSS_SHA256,
        RSA_PSS_SHA384,
        RSA_PSS_SHA512,
        RSA_PKCS1_SHA256,
        RSA_PKCS1_SHA384,
        RSA_PKCS1_SHA512,
    ]
}

/// Outcome of a non-blocking TLS operation. Mirrors the four-way result set
/// `spec.md` §4.4/§4.6 switches on, plus `Done` for "handshake complete" /
/// "record fully processed, no error".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsOutcome {
    Done,
    WantRead,
    WantWrite,
    Error,
    Close,
}

enum Role {
    Client(ClientConnection),
    Server(ServerConnection),
}

/// A TLS session bound to one non-blocking socket.
///
/// Owns no socket itself (the `Connection` record owns the fd); every call
/// takes the underlying `TcpStream` so this type stays a pure protocol
/// engine, matching how the spec treats the TLS library as a collaborator
/// the core drives rather than a thing that owns I/O.
pub struct TlsSession {
    role: Role,
}

impl TlsSession {
    /// `receiving = true` builds a server-role session (we accepted);
    /// `false` builds a client-role session (we dialed) for `server_name`.
    pub fn new_server(cert_chain: Vec<Certificate>, key: PrivateKey) -> Result<Self> {
        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
            .with_single_cert(cert_chain, key)
            .map_err(|e| Error::tls_failed(e.to_string()))?;
        let conn = ServerConnection::new(Arc::new(config)).map_err(|e| Error::tls_failed(e.to_string()))?;
        Ok(Self { role: Role::Server(conn) })
    }

    /// `server_name` only needs to parse as a `ServerName` (SNI is sent but
    /// not trusted for verification); the peer's actual identity is decided
    /// by the handshake driver after `verify()` extracts its leaf cert. Used
    /// for OP clients dialing an OR: we don't present our own identity.
    pub fn new_client(server_name: &str) -> Result<Self> {
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        let name = ServerName::try_from(server_name)
            .map_err(|e| Error::tls_failed(format!("invalid server name {server_name}: {e}")))?;
        let conn = ClientConnection::new(Arc::new(config), name).map_err(|e| Error::tls_failed(e.to_string()))?;
        Ok(Self { role: Role::Client(conn) })
    }

    /// Like `new_client`, but presents `cert_chain`/`key` as a client
    /// certificate: relay-to-relay links are mutually authenticated, so a
    /// relay dialing another relay must identify itself the same way it
    /// would if the roles were reversed.
    pub fn new_relay_client(server_name: &str, cert_chain: Vec<Certificate>, key: PrivateKey) -> Result<Self> {
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| Error::tls_failed(e.to_string()))?;
        let name = ServerName::try_from(server_name)
            .map_err(|e| Error::tls_failed(format!("invalid server name {server_name}: {e}")))?;
        let conn = ClientConnection::new(Arc::new(config), name).map_err(|e| Error::tls_failed(e.to_string()))?;
        Ok(Self { role: Role::Client(conn) })
    }

    fn is_handshaking(&self) -> bool {
        match &self.role {
            Role::Client(c) => c.is_handshaking(),
            Role::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match &self.role {
            Role::Client(c) => c.wants_read(),
            Role::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match &self.role {
            Role::Client(c) => c.wants_write(),
            Role::Server(c) => c.wants_write(),
        }
    }

    /// Drive one step of the handshake against `stream`, which must be
    /// non-blocking. Call repeatedly as readiness events arrive.
    pub fn drive_handshake(&mut self, stream: &mut TcpStream) -> TlsOutcome {
        if !self.is_handshaking() {
            return TlsOutcome::Done;
        }

        if self.wants_read() {
            let read_res = match &mut self.role {
                Role::Client(c) => c.read_tls(stream),
                Role::Server(c) => c.read_tls(stream),
            };
            match read_res {
                Ok(0) => return TlsOutcome::Close,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return TlsOutcome::Error,
            }

            let processed = match &mut self.role {
                Role::Client(c) => c.process_new_packets().map(|_| ()),
                Role::Server(c) => c.process_new_packets().map(|_| ()),
            };
            if processed.is_err() {
                return TlsOutcome::Error;
            }
        }

        if self.wants_write() {
            let write_res = match &mut self.role {
                Role::Client(c) => c.write_tls(stream),
                Role::Server(c) => c.write_tls(stream),
            };
            match write_res {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TlsOutcome::WantWrite,
                Err(_) => return TlsOutcome::Error,
            }
        }

        if !self.is_handshaking() {
            TlsOutcome::Done
        } else if self.wants_write() {
            TlsOutcome::WantWrite
        } else {
            TlsOutcome::WantRead
        }
    }

    /// Whether the peer presented a certificate (client cert for a server
    /// session, server cert for a client session — both always present in
    /// TLS unless client-auth is optional and skipped, which relay links
    /// never do on the server side; OPs simply don't present one).
    pub fn peer_has_cert(&self) -> bool {
        let certs = match &self.role {
            Role::Client(c) => c.peer_certificates(),
            Role::Server(c) => c.peer_certificates(),
        };
        matches!(certs, Some(c) if !c.is_empty())
    }

    /// Extract the peer's leaf certificate DER, used as the relay "link
    /// key" for router lookups. Returns `None` if no cert was presented.
    pub fn verify(&self) -> Option<Vec<u8>> {
        let certs = match &self.role {
            Role::Client(c) => c.peer_certificates(),
            Role::Server(c) => c.peer_certificates(),
        }?;
        certs.first().map(|c| c.0.clone())
    }

    /// Read decrypted application data into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> (TlsOutcome, usize) {
        let reader_result = match &mut self.role {
            Role::Client(c) => c.reader().read(buf),
            Role::Server(c) => c.reader().read(buf),
        };
        match reader_result {
            Ok(0) => (TlsOutcome::Done, 0),
            Ok(n) => (TlsOutcome::Done, n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => (TlsOutcome::WantRead, 0),
            Err(_) => (TlsOutcome::Error, 0),
        }
    }

    /// Encrypt and stage `data` for the peer; returns bytes accepted into
    /// the TLS write buffer (not necessarily yet on the wire).
    pub fn flush(&mut self, data: &[u8]) -> (TlsOutcome, usize) {
        let write_result = match &mut self.role {
            Role::Client(c) => c.writer().write(data),
            Role::Server(c) => c.writer().write(data),
        };
        match write_result {
            Ok(n) => (TlsOutcome::Done, n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => (TlsOutcome::WantWrite, 0),
            Err(_) => (TlsOutcome::Error, 0),
        }
    }

    /// Push any TLS records produced by `flush`/handshaking out to `stream`.
    pub fn drain_to_socket(&mut self, stream: &mut TcpStream) -> TlsOutcome {
        let wants_write = self.wants_write();
        if !wants_write {
            return TlsOutcome::Done;
        }
        let res = match &mut self.role {
            Role::Client(c) => c.write_tls(stream),
            Role::Server(c) => c.write_tls(stream),
        };
        match res {
            Ok(_) => TlsOutcome::Done,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => TlsOutcome::WantWrite,
            Err(_) => TlsOutcome::Error,
        }
    }
}

/// A fresh self-signed leaf cert and key for one OR-link TLS session.
/// Relay TLS certs aren't CA-issued — each link presents its own, and
/// peer identity is decided afterwards by the handshake driver's link-key
/// lookup (`spec.md` §4.4), not by chain validation.
pub fn self_signed_identity() -> (Vec<Certificate>, PrivateKey) {
    let certified = rcgen::generate_simple_self_signed(vec!["relay".into()]).expect("self-signed cert generation");
    let der = certified.cert.der().to_vec();
    let key = certified.key_pair.serialize_der();
    (vec![Certificate(der)], PrivateKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::generate_simple_self_signed;
    use std::net::{TcpListener, TcpStream};

    fn self_signed() -> (Vec<Certificate>, PrivateKey, rcgen::CertifiedKey) {
        let certified = generate_simple_self_signed(vec!["relay.example".into()]).unwrap();
        let der = certified.cert.der().to_vec();
        let key = certified.key_pair.serialize_der();
        (vec![Certificate(der)], PrivateKey(key), certified)
    }

    #[test]
    fn client_server_handshake_completes_and_exposes_peer_cert() {
        let (certs, key, _rc) = self_signed();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_thread = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.set_nonblocking(true).unwrap();
            let mut session = TlsSession::new_server(certs, key).unwrap();
            loop {
                match session.drive_handshake(&mut sock) {
                    TlsOutcome::Done => break,
                    TlsOutcome::Error | TlsOutcome::Close => panic!("server handshake failed"),
                    _ => std::thread::sleep(std::time::Duration::from_millis(5)),
                }
            }
            // no client cert in this test: relay servers accept OP clients too.
            assert!(!session.peer_has_cert());
        });

        let mut client_sock = TcpStream::connect(addr).unwrap();
        client_sock.set_nonblocking(true).unwrap();
        // self-signed, not CA-trusted: only completes because the client
        // verifier defers identity to the application layer, same as a
        // real relay dialing a peer it only knows by link key.
        let mut session = TlsSession::new_client("relay.example").unwrap();
        let mut done = false;
        for _ in 0..200 {
            let outcome = session.drive_handshake(&mut client_sock);
            match outcome {
                TlsOutcome::Done => {
                    done = true;
                    break;
                }
                TlsOutcome::Error | TlsOutcome::Close => panic!("client handshake failed"),
                _ => std::thread::sleep(std::time::Duration::from_millis(5)),
            }
        }
        assert!(done, "handshake did not complete in time");
        assert!(session.peer_has_cert());
        assert!(session.verify().is_some());

        server_thread.join().unwrap();
    }
}
