//! Opens, authenticates, pools, and tears down connections to cluster
//! members.
//!
//! Ground truth: `kimberlite-server::connection::Connection` for the
//! non-blocking read/write/frame-decode shape, adapted client-side per
//! `hazelcast/reactor.py`'s `AsyncoreConnection` (preamble-first write,
//! per-socket buffer sizing) and `hazelcast/cluster.py` for the
//! smart-routing "one connection per member" topology.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshlink_types::MemberId;
use meshlink_wire::messages::{self, MESSAGE_TYPE_AUTH_REQUEST, MESSAGE_TYPE_AUTH_RESPONSE,
    MESSAGE_TYPE_MEMBERS_VIEW, MESSAGE_TYPE_PARTITIONS_VIEW};
use meshlink_wire::Frame;
use mio::net::TcpStream;
use mio::Interest;
use rustls::pki_types::ServerName;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{build_auth_request, interpret_auth_response};
use crate::cluster::ClusterService;
use crate::config::{ClientConfig, Credentials, SslOptions};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::invocation::{InvocationService, RoutingMode};
use crate::lifecycle::{LifecycleService, LifecycleState};
use crate::partition::PartitionService;
use crate::reactor::{IoHandler, ReactorHandle};
use crate::tls::TlsSession;

/// Bridges one [`Connection`] into the reactor's `IoHandler` trait, and
/// dispatches frames read off it to the right destination: the
/// invocation service for responses, the cluster/partition services for
/// events.
struct ConnectionIoHandler {
    connection_id: u64,
    connection: Arc<Mutex<Connection>>,
    manager: Arc<ConnectionManagerState>,
}

impl IoHandler for ConnectionIoHandler {
    fn handle_readable(&mut self) {
        let frames = {
            let mut conn = self.connection.lock().unwrap();
            match conn.read() {
                Ok(true) => conn.drain_frames().unwrap_or_default(),
                Ok(false) => {
                    self.manager.on_connection_closed(self.connection_id);
                    return;
                }
                Err(e) => {
                    warn!(connection_id = self.connection_id, error = %e, "read failed");
                    self.manager.on_connection_closed(self.connection_id);
                    return;
                }
            }
        };
        for frame in frames {
            self.manager.dispatch_frame(self.connection_id, frame);
        }
    }

    fn handle_writable(&mut self) {
        let mut conn = self.connection.lock().unwrap();
        if let Err(e) = conn.write() {
            warn!(connection_id = self.connection_id, error = %e, "write failed");
        }
    }

    fn interest(&self) -> Interest {
        self.connection.lock().unwrap().interest()
    }

    fn handle_shutdown(&mut self) {
        self.connection.lock().unwrap().close();
        self.manager.on_connection_closed(self.connection_id);
    }
}

struct ConnectionManagerState {
    client_id: Uuid,
    cluster_name: String,
    credentials: Option<Credentials>,
    labels: Vec<String>,
    smart_routing: bool,
    ssl: SslOptions,
    connection_timeout: Duration,
    reactor: ReactorHandle,
    invocations: Arc<InvocationService>,
    cluster: Arc<ClusterService>,
    partitions: Arc<PartitionService>,
    lifecycle: Arc<LifecycleService>,
    connections: Mutex<std::collections::HashMap<u64, Arc<Mutex<Connection>>>>,
    member_connections: Mutex<BTreeMap<MemberId, u64>>,
    cluster_id: Mutex<Option<Uuid>>,
    live_count_was_zero: AtomicBool,
}

impl ConnectionManagerState {
    fn dispatch_frame(self: &Arc<Self>, connection_id: u64, frame: Frame) {
        match frame.message_type {
            MESSAGE_TYPE_AUTH_RESPONSE => self.invocations.complete(frame),
            MESSAGE_TYPE_MEMBERS_VIEW if frame.is_event() => {
                if let Ok(body) = messages::decode::<messages::MembersViewBody>(&frame.payload) {
                    let members = body
                        .members
                        .into_iter()
                        .map(|m| meshlink_types::MemberInfo {
                            id: MemberId(m.id),
                            address: m.address,
                            lite: m.lite,
                            attributes: m.attributes,
                        })
                        .collect();
                    self.cluster.handle_members_view(body.version, members);
                }
            }
            MESSAGE_TYPE_PARTITIONS_VIEW if frame.is_event() => {
                if let Ok(body) = messages::decode::<messages::PartitionsViewBody>(&frame.payload) {
                    let entries = body.flatten();
                    self.partitions
                        .handle_partitions_view(connection_id, body.version, entries);
                }
            }
            _ => self.invocations.complete(frame),
        }
    }

    fn on_connection_closed(self: &Arc<Self>, connection_id: u64) {
        let (member, remote_address) = {
            let mut connections = self.connections.lock().unwrap();
            let remote_address = connections
                .remove(&connection_id)
                .map(|conn| conn.lock().unwrap().remote_address);
            let mut member_connections = self.member_connections.lock().unwrap();
            let member = member_connections
                .iter()
                .find(|(_, &cid)| cid == connection_id)
                .map(|(m, _)| *m);
            if let Some(m) = member {
                member_connections.remove(&m);
            }
            (member, remote_address)
        };
        self.invocations
            .fail_connection(connection_id, || ClientError::TargetDisconnected);

        if self.connections.lock().unwrap().is_empty() {
            // The connection that just dropped to zero may come back; let a
            // future successful connect fire `Connected` again.
            self.live_count_was_zero.store(true, Ordering::SeqCst);
            self.lifecycle.fire(LifecycleState::Disconnected);
        }
        info!(connection_id, ?member, "connection closed");

        if let Some(address) = remote_address {
            self.spawn_reconnect(address, 0);
        }
    }

    /// Schedules a reconnect attempt to `address` after a capped
    /// exponential backoff, retrying indefinitely (with growing backoff)
    /// until the client is shut down or a connection succeeds.
    ///
    /// The reactor timer only decides *when*; the attempt itself runs on a
    /// fresh thread, not the reactor thread, because `connect` blocks on
    /// `InvocationService::register`'s deferred waiting for the auth
    /// response -- a response only the reactor thread's own event loop can
    /// ever deliver. Running `connect` inline here would deadlock the
    /// reactor against itself.
    fn spawn_reconnect(self: &Arc<Self>, address: SocketAddr, attempt: u32) {
        if !self.lifecycle.is_running() {
            return;
        }
        let delay = self.invocations.backoff_delay(attempt);
        info!(%address, attempt, ?delay, "scheduling reconnect");
        let this = self.clone();
        self.reactor.add_timer(delay, move || {
            if !this.lifecycle.is_running() {
                return;
            }
            let this = this.clone();
            std::thread::spawn(move || match this.connect(address) {
                Ok(connection_id) => {
                    info!(%address, connection_id, "reconnected");
                }
                Err(e) => {
                    warn!(%address, error = %e, "reconnect attempt failed");
                    this.spawn_reconnect(address, attempt + 1);
                }
            });
        });
    }

    fn get_connection(&self, member: &MemberId) -> Option<u64> {
        self.member_connections.lock().unwrap().get(member).copied()
    }

    fn connection_ids(&self) -> Vec<u64> {
        self.connections.lock().unwrap().keys().copied().collect()
    }

    fn resolve_connection(&self, routing: &RoutingMode) -> ClientResult<u64> {
        match routing {
            RoutingMode::Connection(id) => Ok(*id),
            RoutingMode::Member(member) => {
                self.get_connection(member).ok_or(ClientError::TargetDisconnected)
            }
            RoutingMode::Partition(partition_id) => {
                match self.partitions.owner_of_partition(*partition_id) {
                    Some(owner) => self
                        .get_connection(&owner)
                        .ok_or(ClientError::TargetDisconnected),
                    None => self.random_connection(),
                }
            }
            RoutingMode::Random => self.random_connection(),
        }
    }

    /// Picks a connection via the load balancer's current member choice,
    /// falling back to any live connection if that member has none (or the
    /// balancer's list is empty/stale).
    fn random_connection(&self) -> ClientResult<u64> {
        if let Some(member) = self.cluster.load_balancer().next() {
            if let Some(id) = self.get_connection(&member.id) {
                return Ok(id);
            }
        }
        self.connection_ids()
            .first()
            .copied()
            .ok_or(ClientError::TargetDisconnected)
    }

    fn send_frame(&self, connection_id: u64, frame: &Frame) -> ClientResult<()> {
        let connections = self.connections.lock().unwrap();
        let connection = connections
            .get(&connection_id)
            .ok_or(ClientError::TargetDisconnected)?;
        let mut conn = connection.lock().unwrap();
        conn.queue_frame(frame)?;
        conn.write()?;
        Ok(())
    }

    /// The function installed on the invocation service for retries:
    /// resolve a (possibly new) connection for `routing` and send `frame`
    /// on it.
    fn resend(self: &Arc<Self>, routing: &RoutingMode, frame: &Frame) -> ClientResult<u64> {
        let connection_id = self.resolve_connection(routing)?;
        self.send_frame(connection_id, frame)?;
        Ok(connection_id)
    }

    fn open_transport(&self, address: SocketAddr) -> ClientResult<Connection> {
        if !self.ssl.enabled {
            return Ok(Connection::connect_plain(address)?);
        }

        let tls_config = crate::tls::build_client_config(&self.ssl)?;
        let socket = TcpStream::connect(address)?;
        let server_name = ServerName::IpAddress(address.ip().into());
        let mut session = TlsSession::new(socket, tls_config, server_name)?;

        let deadline = Instant::now() + self.connection_timeout;
        loop {
            match session.drive_handshake() {
                Ok(true) => break,
                Ok(false) => {
                    if Instant::now() >= deadline {
                        return Err(ClientError::Tls("handshake timed out".into()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
        Ok(Connection::connect_tls(address, session)?)
    }

    /// Opens a connection to `address` (plain or TLS, per `self.ssl`),
    /// registers it with the reactor, and performs the authentication
    /// handshake. Returns the new connection's id once authenticated.
    fn connect(self: &Arc<Self>, address: SocketAddr) -> ClientResult<u64> {
        let mut connection = self.open_transport(address)?;
        let connection_id = connection.id;
        let credentials = self
            .credentials
            .clone()
            .ok_or_else(|| ClientError::AuthenticationFailed("no credentials configured".into()))?;

        let request = build_auth_request(self.client_id, &self.cluster_name, &credentials, &self.labels);
        let payload = messages::encode(&request)?;
        let correlation_id = self.invocations.next_correlation_id();
        let frame = Frame::new(correlation_id, -1, MESSAGE_TYPE_AUTH_REQUEST, payload);
        connection.queue_frame(&frame)?;

        let connection = Arc::new(Mutex::new(connection));
        self.connections.lock().unwrap().insert(connection_id, connection.clone());

        let handler = ConnectionIoHandler {
            connection_id,
            connection: connection.clone(),
            manager: self.clone(),
        };
        {
            let mut conn = connection.lock().unwrap();
            self.reactor.register(conn.mio_source(), Box::new(handler))?;
        }

        let deferred = self.invocations.register(
            frame,
            RoutingMode::Connection(connection_id),
            self.connection_timeout,
            Some(connection_id),
        );
        let response_frame = deferred.wait(Some(self.connection_timeout))?;
        let response: messages::AuthResponse = messages::decode(&response_frame.payload)?;
        let outcome = interpret_auth_response(response)?;

        self.partitions.check_and_set_partition_count(outcome.partition_count)?;

        let mut cluster_id_guard = self.cluster_id.lock().unwrap();
        let changed = match *cluster_id_guard {
            Some(existing) if existing != outcome.cluster_id => true,
            _ => false,
        };
        *cluster_id_guard = Some(outcome.cluster_id);
        drop(cluster_id_guard);
        if changed {
            warn!("cluster id changed; resetting member list version and partition table");
            self.cluster.clear_member_list_version();
            self.partitions.reset();
        }

        {
            let mut conn = connection.lock().unwrap();
            conn.member_id = Some(MemberId(outcome.member_id));
        }
        self.member_connections
            .lock()
            .unwrap()
            .insert(MemberId(outcome.member_id), connection_id);

        if self.live_count_was_zero.swap(false, Ordering::SeqCst) {
            self.lifecycle.fire(LifecycleState::Connected);
        }

        Ok(connection_id)
    }
}

/// Opens, authenticates, and pools connections to cluster members.
pub struct ConnectionManager {
    state: Arc<ConnectionManagerState>,
}

impl ConnectionManager {
    pub fn new(
        config: &ClientConfig,
        client_id: Uuid,
        reactor: ReactorHandle,
        invocations: Arc<InvocationService>,
        cluster: Arc<ClusterService>,
        partitions: Arc<PartitionService>,
        lifecycle: Arc<LifecycleService>,
    ) -> Self {
        let resend_target = invocations.clone();
        let state = Arc::new(ConnectionManagerState {
            client_id,
            cluster_name: config.cluster_name.clone(),
            credentials: config.credentials.clone(),
            labels: config.labels.clone(),
            smart_routing: config.network.smart_routing,
            ssl: config.ssl.clone(),
            connection_timeout: config.network.connection_timeout,
            reactor,
            invocations,
            cluster,
            partitions,
            lifecycle,
            connections: Mutex::new(std::collections::HashMap::new()),
            member_connections: Mutex::new(BTreeMap::new()),
            cluster_id: Mutex::new(None),
            live_count_was_zero: AtomicBool::new(true),
        });

        let resend_state = state.clone();
        resend_target.set_resend(Arc::new(move |routing: &RoutingMode, frame: &Frame| {
            resend_state.resend(routing, frame)
        }));

        Self { state }
    }

    /// Opens a connection to `address` (plain or TLS, per the configured
    /// `SslOptions`), registers it with the reactor, and performs the
    /// authentication handshake. Returns the new connection's id once
    /// authenticated.
    pub fn connect(&self, address: SocketAddr) -> ClientResult<u64> {
        self.state.connect(address)
    }

    pub fn get_connection(&self, member: &MemberId) -> Option<u64> {
        self.state.get_connection(member)
    }

    pub fn connection_ids(&self) -> Vec<u64> {
        self.state.connection_ids()
    }

    pub fn is_smart_routing(&self) -> bool {
        self.state.smart_routing
    }

    pub fn send_frame(&self, connection_id: u64, frame: &Frame) -> ClientResult<()> {
        self.state.send_frame(connection_id, frame)
    }

    pub fn close_connection(&self, connection_id: u64) {
        if let Some(connection) = self.state.connections.lock().unwrap().get(&connection_id) {
            connection.lock().unwrap().close();
        }
        self.state.on_connection_closed(connection_id);
    }

    pub fn shutdown(&self) {
        let ids: Vec<u64> = self.connection_ids();
        for id in ids {
            self.close_connection(id);
        }
    }
}
