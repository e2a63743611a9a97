//! In-memory configuration surface.
//!
//! No file or CLI parsing lives here -- that remains out of scope (see
//! `SPEC_FULL.md` §1) -- but the option groups below match the recognised
//! configuration surface in §6: network, SSL, invocation, and load-balancer
//! settings, built with a `kimberlite-cluster`-style plain constructor +
//! field-setter pattern rather than a file-backed loader.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::load_balancer::{LoadBalancer, RoundRobinLoadBalancer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslProtocol {
    Tls12,
    Tls13,
    /// Negotiate the highest mutually supported of TLS 1.2/1.3.
    Tls,
}

impl Default for SslProtocol {
    fn default() -> Self {
        SslProtocol::Tls
    }
}

#[derive(Clone, Default)]
pub struct SslOptions {
    pub enabled: bool,
    pub protocol: SslProtocol,
    pub ca_certs: Option<Vec<CertificateDer<'static>>>,
    pub client_cert_chain: Option<Vec<CertificateDer<'static>>>,
    pub client_key: Option<PrivateKeyDer<'static>>,
    pub ciphers: Option<Vec<String>>,
}

impl std::fmt::Debug for SslOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SslOptions")
            .field("enabled", &self.enabled)
            .field("protocol", &self.protocol)
            .field("has_ca_certs", &self.ca_certs.is_some())
            .field("mutual_tls", &self.client_cert_chain.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub addresses: Vec<SocketAddr>,
    pub smart_routing: bool,
    pub connection_timeout: Duration,
    pub redo_operation: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["127.0.0.1:5701".parse().unwrap()],
            smart_routing: true,
            connection_timeout: Duration::from_secs(5),
            redo_operation: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvocationConfig {
    pub timeout: Duration,
    pub retry_pause: Duration,
    pub max_backoff: Duration,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retry_pause: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Opaque client credentials, handed unexamined to the authentication
/// handshake (§4.11).
#[derive(Clone)]
pub enum Credentials {
    UsernamePassword { username: String, password: String },
    Token(Vec<u8>),
}

/// Top-level client configuration, built with setter methods mirroring
/// `kimberlite-cluster::ClusterConfig`'s constructor-plus-builder shape.
pub struct ClientConfig {
    pub cluster_name: String,
    pub labels: Vec<String>,
    pub client_name: Option<String>,
    pub credentials: Option<Credentials>,
    pub network: NetworkConfig,
    pub ssl: SslOptions,
    pub invocation: InvocationConfig,
    pub load_balancer: Arc<dyn LoadBalancer>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("cluster_name", &self.cluster_name)
            .field("labels", &self.labels)
            .field("network", &self.network)
            .field("ssl", &self.ssl)
            .field("invocation", &self.invocation)
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cluster_name: "dev".to_string(),
            labels: Vec::new(),
            client_name: None,
            credentials: None,
            network: NetworkConfig::default(),
            ssl: SslOptions::default(),
            invocation: InvocationConfig::default(),
            load_balancer: Arc::new(RoundRobinLoadBalancer::new()),
        }
    }
}

impl ClientConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Self::default()
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.network.addresses = addresses;
        self
    }

    pub fn with_smart_routing(mut self, smart: bool) -> Self {
        self.network.smart_routing = smart;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_ssl(mut self, ssl: SslOptions) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation.timeout = timeout;
        self
    }

    pub fn with_load_balancer(mut self, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        self.load_balancer = load_balancer;
        self
    }
}
