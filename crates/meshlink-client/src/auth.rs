//! Client-side authentication handshake (§4.11).
//!
//! The handshake is a single request/response exchange carried over the
//! same framed protocol as every other call. Structurally this mirrors
//! `kimberlite-server::auth`'s builder-style credential configuration, but
//! the client only ever builds a request and interprets a response -- it
//! never issues tokens itself.

use uuid::Uuid;

use meshlink_wire::messages::{AuthRequest, AuthResponse, AuthStatus, Credentials as WireCredentials};

use crate::config::Credentials;
use crate::error::{ClientError, ClientResult};

pub fn build_auth_request(
    client_id: Uuid,
    cluster_name: &str,
    credentials: &Credentials,
    labels: &[String],
) -> AuthRequest {
    let wire_credentials = match credentials {
        Credentials::UsernamePassword { username, password } => WireCredentials::UsernamePassword {
            username: username.clone(),
            password: password.clone(),
        },
        Credentials::Token(bytes) => WireCredentials::Token(bytes.clone()),
    };
    AuthRequest {
        client_id,
        cluster_name: cluster_name.to_string(),
        credentials: wire_credentials,
        labels: labels.to_vec(),
    }
}

/// Outcome of a successful handshake: the member and cluster identities and
/// the cluster-wide partition count.
pub struct AuthOutcome {
    pub member_id: Uuid,
    pub cluster_id: Uuid,
    pub partition_count: u32,
}

pub fn interpret_auth_response(response: AuthResponse) -> ClientResult<AuthOutcome> {
    match response.status {
        AuthStatus::Authenticated => Ok(AuthOutcome {
            member_id: response.member_id,
            cluster_id: response.cluster_id,
            partition_count: response.partition_count,
        }),
        AuthStatus::CredentialsFailed => Err(ClientError::AuthenticationFailed(
            "credentials rejected by cluster".into(),
        )),
        AuthStatus::NotAllowedInCluster => Err(ClientError::NotAllowedInCluster(
            "client is not permitted to join this cluster".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_username_password_request() {
        let creds = Credentials::UsernamePassword {
            username: "svc".into(),
            password: "hunter2".into(),
        };
        let request = build_auth_request(Uuid::from_u128(1), "dev", &creds, &["east".to_string()]);
        assert_eq!(request.cluster_name, "dev");
        assert_eq!(request.labels, vec!["east".to_string()]);
    }

    #[test]
    fn credentials_failed_is_non_retryable_auth_error() {
        let response = AuthResponse {
            status: AuthStatus::CredentialsFailed,
            member_id: Uuid::nil(),
            cluster_id: Uuid::nil(),
            partition_count: 0,
        };
        let err = interpret_auth_response(response).unwrap_err();
        assert!(matches!(err, ClientError::AuthenticationFailed(_)));
    }

    #[test]
    fn authenticated_yields_the_partition_count() {
        let response = AuthResponse {
            status: AuthStatus::Authenticated,
            member_id: Uuid::from_u128(7),
            cluster_id: Uuid::from_u128(8),
            partition_count: 271,
        };
        let outcome = interpret_auth_response(response).unwrap();
        assert_eq!(outcome.partition_count, 271);
    }
}
