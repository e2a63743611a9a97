//! Client-side TLS, built directly on `rustls::ClientConnection`.
//!
//! Structurally this mirrors `kimberlite-server`'s `TlsStream<S>`: a manual
//! record pump (`write_tls`/`read_tls`/`process_new_packets`) driven by the
//! caller rather than hidden behind an async adapter, because the reactor
//! (§4.2) needs `wants_read`/`wants_write` to decide what to register with
//! `mio::Poll`. Protocol version pinning and mandatory server-certificate
//! verification follow the source client's SSL setup: only the configured
//! protocol version is enabled and verification is always `REQUIRED`.

use std::io::{self, Read, Write};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::config::{SslProtocol, SslOptions};
use crate::error::{ClientError, ClientResult};

/// Builds a `rustls::ClientConfig` honoring the subset of `SslOptions` this
/// client surfaces: a custom trust root, optional mutual-TLS client
/// certificate, and a pinned minimum/maximum protocol version.
pub fn build_client_config(options: &SslOptions) -> ClientResult<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    if let Some(ca_certs) = &options.ca_certs {
        for cert in ca_certs {
            root_store
                .add(cert.clone())
                .map_err(|e| ClientError::Tls(e.to_string()))?;
        }
    } else {
        root_store.extend(webpki_roots_or_system());
    }

    let protocol_versions = options.protocol.rustls_versions();
    let builder = ClientConfig::builder_with_protocol_versions(protocol_versions)
        .with_root_certificates(root_store);

    let config = if let (Some(cert_chain), Some(key)) = (&options.client_cert_chain, &options.client_key) {
        builder
            .with_client_auth_cert(cert_chain.clone(), key.clone_key())
            .map_err(|e| ClientError::Tls(e.to_string()))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Placeholder trust-root source when no explicit CA file is configured.
/// Production deployments are expected to supply `ca_certs`; an empty store
/// here simply means "trust nothing", which fails the handshake loudly
/// rather than silently trusting an unspecified root set.
fn webpki_roots_or_system() -> Vec<rustls::pki_types::CertificateDer<'static>> {
    Vec::new()
}

/// A non-blocking TLS session wrapping one `mio::net::TcpStream`.
pub struct TlsSession {
    socket: TcpStream,
    conn: ClientConnection,
}

impl TlsSession {
    pub fn new(socket: TcpStream, config: Arc<ClientConfig>, server_name: rustls::pki_types::ServerName<'static>) -> ClientResult<Self> {
        let conn = ClientConnection::new(config, server_name).map_err(|e| ClientError::Tls(e.to_string()))?;
        Ok(Self { socket, conn })
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Pumps the TLS record layer until the handshake completes or the
    /// socket would block. Returns `Ok(true)` once handshaking is done.
    pub fn drive_handshake(&mut self) -> io::Result<bool> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut self.socket) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
            if self.conn.wants_read() {
                match self.conn.read_tls(&mut self.socket) {
                    Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "tls peer closed during handshake")),
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
            if !self.conn.wants_read() && !self.conn.wants_write() {
                break;
            }
        }
        Ok(!self.conn.is_handshaking())
    }
}

impl Read for TlsSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.conn.wants_read() {
            match self.conn.read_tls(&mut self.socket) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        match self.conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) => Err(e),
        }
    }
}

impl Write for TlsSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl SslProtocol {
    fn rustls_versions(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        match self {
            SslProtocol::Tls12 => &[&rustls::version::TLS12],
            SslProtocol::Tls13 => &[&rustls::version::TLS13],
            SslProtocol::Tls => &[&rustls::version::TLS12, &rustls::version::TLS13],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_client_config_with_defaults() {
        let options = SslOptions::default();
        assert!(build_client_config(&options).is_ok());
    }
}
