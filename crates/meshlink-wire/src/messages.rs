//! Structured payloads carried inside a [`crate::Frame`]'s opaque body.
//!
//! Data-structure operation payloads stay opaque to this crate (the caller
//! owns their serialization); only the handful of protocol-internal
//! messages the connection fabric itself must understand are modeled here.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use meshlink_types::MemberId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WireResult;

pub const MESSAGE_TYPE_AUTH_REQUEST: u16 = 1;
pub const MESSAGE_TYPE_AUTH_RESPONSE: u16 = 2;
pub const MESSAGE_TYPE_MEMBERS_VIEW: u16 = 3;
pub const MESSAGE_TYPE_PARTITIONS_VIEW: u16 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub client_id: Uuid,
    pub cluster_name: String,
    pub credentials: Credentials,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credentials {
    UsernamePassword { username: String, password: String },
    Token(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStatus {
    Authenticated,
    CredentialsFailed,
    NotAllowedInCluster,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub status: AuthStatus,
    pub member_id: Uuid,
    pub cluster_id: Uuid,
    pub partition_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberView {
    pub id: Uuid,
    pub address: SocketAddr,
    pub lite: bool,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersViewBody {
    pub version: i64,
    pub members: Vec<MemberView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionsViewBody {
    pub version: i64,
    /// member id -> partitions it owns.
    pub owners: BTreeMap<Uuid, Vec<u32>>,
}

impl PartitionsViewBody {
    pub fn flatten(&self) -> BTreeMap<u32, MemberId> {
        let mut out = BTreeMap::new();
        for (member, partitions) in &self.owners {
            for &partition_id in partitions {
                out.insert(partition_id, MemberId(*member));
            }
        }
        out
    }
}

pub fn encode<T: Serialize>(value: &T) -> WireResult<Bytes> {
    Ok(Bytes::from(postcard::to_allocvec(value)?))
}

pub fn decode<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> WireResult<T> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_view_flattens_owner_map() {
        let m1 = Uuid::from_u128(1);
        let m2 = Uuid::from_u128(2);
        let mut owners = BTreeMap::new();
        owners.insert(m1, vec![0, 1, 2]);
        owners.insert(m2, vec![3]);
        let body = PartitionsViewBody {
            version: 1,
            owners,
        };
        let flat = body.flatten();
        assert_eq!(flat.get(&0), Some(&MemberId(m1)));
        assert_eq!(flat.get(&3), Some(&MemberId(m2)));
        assert_eq!(flat.len(), 4);
    }

    #[test]
    fn auth_request_round_trips_through_postcard() {
        let req = AuthRequest {
            client_id: Uuid::from_u128(42),
            cluster_name: "dev".into(),
            credentials: Credentials::UsernamePassword {
                username: "a".into(),
                password: "b".into(),
            },
            labels: vec!["label-a".into()],
        };
        let bytes = encode(&req).unwrap();
        let decoded: AuthRequest = decode(&bytes).unwrap();
        assert_eq!(decoded.cluster_name, "dev");
    }
}
