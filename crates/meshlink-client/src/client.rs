//! Composition root (L10): wires together the reactor, connection manager,
//! cluster/partition services, invocation service, and lifecycle service,
//! and exposes the client's public surface.
//!
//! Startup order follows §4.10: lifecycle -> reactor -> connection manager
//! (which authenticates the first connection) -> wait for the initial
//! member list -> STARTED. Shutdown reverses this, best-effort at each
//! stage.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use meshlink_types::{string_partition_strategy, MemberId};
use meshlink_wire::Frame;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::ClusterService;
use crate::config::ClientConfig;
use crate::connection_manager::ConnectionManager;
use crate::error::{ClientError, ClientResult};
use crate::future::Deferred;
use crate::invocation::{InvocationService, RoutingMode};
use crate::lifecycle::LifecycleService;
use crate::partition::{murmur_hash3_x86_32, PartitionService, HASH_SEED};
use crate::reactor::Reactor;

/// A running meshlink client instance.
///
/// Construction performs the full startup sequence and blocks (up to
/// `cluster::INITIAL_LIST_TIMEOUT`) until the initial membership view has
/// been received, matching §4.10's "wait_initial_member_list_fetched"
/// step.
pub struct Client {
    pub id: Uuid,
    reactor: Reactor,
    lifecycle: Arc<LifecycleService>,
    cluster: Arc<ClusterService>,
    partitions: Arc<PartitionService>,
    invocations: Arc<InvocationService>,
    connections: ConnectionManager,
}

impl Client {
    pub fn start(config: ClientConfig) -> ClientResult<Self> {
        let id = Uuid::new_v4();
        let lifecycle = Arc::new(LifecycleService::new());
        lifecycle.start();

        let reactor = Reactor::start()?;
        let cluster = Arc::new(ClusterService::new(config.load_balancer.clone()));
        let partitions = Arc::new(PartitionService::new());
        let invocations = Arc::new(InvocationService::new(
            reactor.handle(),
            config.invocation.retry_pause,
            config.invocation.max_backoff,
        ));
        let connections = ConnectionManager::new(
            &config,
            id,
            reactor.handle(),
            invocations.clone(),
            cluster.clone(),
            partitions.clone(),
            lifecycle.clone(),
        );

        let mut last_err = None;
        for address in &config.network.addresses {
            match connections.connect(*address) {
                Ok(_) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(%address, error = %e, "failed to connect to seed address");
                    last_err = Some(e);
                }
            }
        }
        if let Some(err) = last_err {
            return Err(err);
        }

        cluster.wait_initial_member_list_fetched(crate::cluster::INITIAL_LIST_TIMEOUT)?;

        if config.network.smart_routing {
            for member in cluster.snapshot().members() {
                if connections.get_connection(&member.id).is_none() {
                    if let Err(e) = connections.connect(member.address) {
                        warn!(member_id = %member.id, error = %e, "failed to connect to member");
                    }
                }
            }
        }

        info!(client_id = %id, "client started");

        Ok(Self {
            id,
            reactor,
            lifecycle,
            cluster,
            partitions,
            invocations,
            connections,
        })
    }

    pub fn cluster(&self) -> &ClusterService {
        &self.cluster
    }

    pub fn partitions(&self) -> &PartitionService {
        &self.partitions
    }

    pub fn lifecycle(&self) -> &LifecycleService {
        &self.lifecycle
    }

    /// Computes the partition id a string key would route to, using the
    /// canonical `'@'`-suffix affinity rule before hashing.
    pub fn partition_id_for_key(&self, key: &str) -> ClientResult<u32> {
        let affinity_key = string_partition_strategy(key);
        let hash = murmur_hash3_x86_32(affinity_key.as_bytes(), HASH_SEED);
        self.partitions.partition_id_for(hash)
    }

    /// Invokes `payload` against the partition owning `key`, falling back
    /// to a random connection if the owner is not currently connected.
    pub fn invoke_for_key(
        &self,
        message_type: u16,
        key: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> ClientResult<Deferred<Frame>> {
        let partition_id = self.partition_id_for_key(key)?;
        self.invoke(message_type, RoutingMode::Partition(partition_id), payload, timeout)
    }

    pub fn invoke(
        &self,
        message_type: u16,
        routing: RoutingMode,
        payload: Bytes,
        timeout: Duration,
    ) -> ClientResult<Deferred<Frame>> {
        if !self.lifecycle.is_running() {
            return Err(ClientError::IllegalState("client is not started".into()));
        }
        let connection_id = self.resolve_connection(&routing)?;
        let correlation_id = self.invocations.next_correlation_id();
        let partition_id = match &routing {
            RoutingMode::Partition(p) => *p as i32,
            _ => -1,
        };
        let frame = Frame::new(correlation_id, partition_id, message_type, payload);
        self.connections.send_frame(connection_id, &frame)?;
        Ok(self
            .invocations
            .register(frame, routing, timeout, Some(connection_id)))
    }

    fn resolve_connection(&self, routing: &RoutingMode) -> ClientResult<u64> {
        match routing {
            RoutingMode::Connection(id) => Ok(*id),
            RoutingMode::Member(member) => self
                .connections
                .get_connection(member)
                .ok_or(ClientError::TargetDisconnected),
            RoutingMode::Partition(partition_id) => {
                match self.partitions.owner_of_partition(*partition_id) {
                    Some(owner) => self
                        .connections
                        .get_connection(&owner)
                        .ok_or(ClientError::TargetDisconnected),
                    None => self.random_connection(),
                }
            }
            RoutingMode::Random => self.random_connection(),
        }
    }

    /// Picks a connection via the load balancer's current member choice,
    /// falling back to any live connection if that member has none
    /// connected (or the balancer's cached list is empty).
    fn random_connection(&self) -> ClientResult<u64> {
        if let Some(member) = self.cluster.load_balancer().next() {
            if let Some(id) = self.connections.get_connection(&member.id) {
                return Ok(id);
            }
        }
        self.connections
            .connection_ids()
            .first()
            .copied()
            .ok_or(ClientError::TargetDisconnected)
    }

    pub fn member(&self, id: &MemberId) -> Option<meshlink_types::MemberInfo> {
        self.cluster.member(id)
    }

    pub fn shutdown(mut self) {
        self.lifecycle.shutdown();
        self.connections.shutdown();
        self.reactor.shutdown();
        info!(client_id = %self.id, "client shut down");
    }
}
