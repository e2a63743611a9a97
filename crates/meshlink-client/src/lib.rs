//! Smart client for a partitioned, replicated cluster: connection fabric,
//! membership and partition tracking, and request routing.
//!
//! ```text
//!                       +------------------+
//!                       |   Client (L10)   |
//!                       +--------+---------+
//!                                |
//!     +---------------+---------+---------+----------------+
//!     |               |                   |                |
//! Lifecycle(L9)  ConnectionMgr(L5)   ClusterSvc(L6)   PartitionSvc(L7)
//!                      |                                    |
//!                 Connection(L3)                     LoadBalancer(L8)
//!                      |
//!                  Reactor(L2)
//!                      |
//!                  Future(L1)
//! ```
//!
//! The reactor owns every socket and timer on one dedicated OS thread
//! (§4.2); application threads submit invocations through the client root
//! and block on the returned [`future::Deferred`] or chain continuations.
//! This follows the same "explicit control flow, no async runtime" design
//! this workspace's server-side crates use `mio` for.

pub mod auth;
pub mod client;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod future;
pub mod invocation;
pub mod lifecycle;
pub mod load_balancer;
pub mod partition;
pub mod reactor;
pub mod tls;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
