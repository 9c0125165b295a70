//! Pluggable TLS capability.
//!
//! A [`TlsTransport`] sits between a socket and its byte stream. It never
//! blocks: when it needs the peer to send (or the kernel to drain) it answers
//! `Want`, and the socket suspends the fiber on that direction.
//!
//! The `tls` feature provides a rustls implementation configured from
//! `web.tls`.

use std::io::{self, Read, Write};

/// Byte stream a transport reads records from and writes records to.
pub trait ReadWrite: Read + Write {}

impl<T: Read + Write> ReadWrite for T {}

/// Direction the TLS layer is blocked on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TlsIo<T> {
    Done(T),
    Want(Want),
}

pub trait TlsTransport {
    /// Advances the handshake as far as the stream allows.
    fn handshake(&mut self, io: &mut dyn ReadWrite) -> io::Result<TlsIo<()>>;

    /// Reads decrypted bytes. `Done(0)` is a clean close.
    fn read(&mut self, io: &mut dyn ReadWrite, buf: &mut [u8]) -> io::Result<TlsIo<usize>>;

    /// Queues plaintext and pushes records towards the peer.
    fn write(&mut self, io: &mut dyn ReadWrite, buf: &[u8]) -> io::Result<TlsIo<usize>>;

    /// Pushes any buffered records.
    fn flush(&mut self, io: &mut dyn ReadWrite) -> io::Result<TlsIo<()>>;

    fn alpn(&self) -> Option<Vec<u8>>;
}

#[cfg(feature = "tls")]
pub use self::rustls_impl::{RustlsTransport, client_config, server_config};

#[cfg(feature = "tls")]
mod rustls_impl {
    use std::fs::File;
    use std::io::{self, BufReader, Read, Write};
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::server::WebPkiClientVerifier;
    use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

    use super::{ReadWrite, TlsIo, TlsTransport, Want};
    use crate::config::TlsConfig;
    use crate::error::{Error, Result};

    fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path).map_err(|e| Error::Tls(format!("cannot open {path}: {e}")))?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("invalid certificate {path}: {e}")))
    }

    fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
        let file = File::open(path).map_err(|e| Error::Tls(format!("cannot open {path}: {e}")))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| Error::Tls(format!("invalid key {path}: {e}")))?
            .ok_or_else(|| Error::Tls(format!("no private key in {path}")))
    }

    fn load_roots(path: &str) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("bad authority {path}: {e}")))?;
        }
        Ok(roots)
    }

    pub fn server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>> {
        let cert = config
            .certificate
            .as_deref()
            .ok_or_else(|| Error::Tls("missing certificate".to_string()))?;
        let key = config
            .key
            .as_deref()
            .ok_or_else(|| Error::Tls("missing key".to_string()))?;

        let builder = ServerConfig::builder();
        let builder = match (config.verify_peer, config.authority.as_deref()) {
            (true, Some(authority)) => {
                let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(authority)?))
                    .build()
                    .map_err(|e| Error::Tls(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            _ => builder.with_no_client_auth(),
        };
        let mut server = builder
            .with_single_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| Error::Tls(e.to_string()))?;
        server.alpn_protocols = config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(Arc::new(server))
    }

    pub fn client_config(config: &TlsConfig) -> Result<Arc<ClientConfig>> {
        let authority = config
            .authority
            .as_deref()
            .ok_or_else(|| Error::Tls("missing authority".to_string()))?;
        let mut client = ClientConfig::builder()
            .with_root_certificates(load_roots(authority)?)
            .with_no_client_auth();
        client.alpn_protocols = config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(Arc::new(client))
    }

    pub struct RustlsTransport {
        conn: Connection,
    }

    impl RustlsTransport {
        pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
            let conn = ServerConnection::new(config).map_err(|e| Error::Tls(e.to_string()))?;
            Ok(Self { conn: conn.into() })
        }

        pub fn client(config: Arc<ClientConfig>, peer_name: &str) -> Result<Self> {
            let name = ServerName::try_from(peer_name.to_string())
                .map_err(|e| Error::Tls(format!("bad peer name {peer_name}: {e}")))?;
            let conn = ClientConnection::new(config, name).map_err(|e| Error::Tls(e.to_string()))?;
            Ok(Self { conn: conn.into() })
        }

        /// Feeds one batch of records from the stream. `Ok(false)` is EOF.
        fn fill(&mut self, mut io: &mut dyn ReadWrite) -> io::Result<bool> {
            if self.conn.read_tls(&mut io)? == 0 {
                return Ok(false);
            }
            self.conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(true)
        }
    }

    impl TlsTransport for RustlsTransport {
        fn handshake(&mut self, mut io: &mut dyn ReadWrite) -> io::Result<TlsIo<()>> {
            loop {
                if self.conn.wants_write() {
                    match self.conn.write_tls(&mut io) {
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(TlsIo::Want(Want::Write)),
                        Err(e) => return Err(e),
                    }
                }
                if !self.conn.is_handshaking() {
                    return Ok(TlsIo::Done(()));
                }
                match self.fill(&mut *io) {
                    Ok(true) => {}
                    Ok(false) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(TlsIo::Want(Want::Read)),
                    Err(e) => return Err(e),
                }
            }
        }

        fn read(&mut self, io: &mut dyn ReadWrite, buf: &mut [u8]) -> io::Result<TlsIo<usize>> {
            loop {
                match self.conn.reader().read(buf) {
                    Ok(n) => return Ok(TlsIo::Done(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(TlsIo::Done(0)),
                    Err(e) => return Err(e),
                }
                match self.fill(&mut *io) {
                    Ok(true) => {}
                    Ok(false) => return Ok(TlsIo::Done(0)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(TlsIo::Want(Want::Read)),
                    Err(e) => return Err(e),
                }
            }
        }

        fn write(&mut self, io: &mut dyn ReadWrite, buf: &[u8]) -> io::Result<TlsIo<usize>> {
            if let TlsIo::Want(want) = self.flush(io)? {
                return Ok(TlsIo::Want(want));
            }
            let n = self.conn.writer().write(buf)?;
            // Records not yet on the wire are pushed by the next flush
            let _ = self.flush(io)?;
            Ok(TlsIo::Done(n))
        }

        fn flush(&mut self, mut io: &mut dyn ReadWrite) -> io::Result<TlsIo<()>> {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut io) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(TlsIo::Want(Want::Write)),
                    Err(e) => return Err(e),
                }
            }
            Ok(TlsIo::Done(()))
        }

        fn alpn(&self) -> Option<Vec<u8>> {
            self.conn.alpn_protocol().map(|p| p.to_vec())
        }
    }
}
