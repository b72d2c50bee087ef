//! Bastion session data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTTP status the create call must report
pub const STATUS_ACCEPTED: u16 = 202;

/// Lifecycle state reported by the bastion service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Creating,
    Active,
    Deleting,
    Deleted,
    Failed,
    #[serde(other)]
    Unknown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Active => "ACTIVE",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ephemeral port-forwarding endpoint on a bastion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BastionSession {
    pub id: String,
    pub bastion_id: String,
    pub target_resource_id: String,
    pub target_port: u16,
    /// Private IP the bastion forwards to
    pub target_ip: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub lifecycle_state: SessionState,
    pub ttl_secs: u64,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl BastionSession {
    /// `creation_time + ttl`
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.creation_time + chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle_state == SessionState::Active
    }

    /// Bastion SSH host for a region
    pub fn ssh_host(region: &str) -> String {
        format!("host.bastion.{}.oci.oraclecloud.com", region)
    }

    /// `user@host` endpoint the forwarding client connects to
    pub fn ssh_endpoint(&self, region: &str) -> String {
        format!("{}@{}", self.id, Self::ssh_host(region))
    }
}

/// Payload of a session-create call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub bastion_id: String,
    pub target_resource_id: String,
    pub target_port: u16,
    pub ttl_secs: u64,
    pub public_key: String,
    pub display_name: String,
    /// Deduplicates retries of the same logical request
    ///
    /// Only meaningful for clients that talk to the service directly. The
    /// CLI generates its own `opc-retry-token` for every create call and has
    /// no flag to supply one, so `OciCliBastionApi` does not forward it.
    pub retry_token: String,
    /// Correlates the request in service logs
    pub request_id: String,
}

/// Result of a session-create call
#[derive(Debug, Clone)]
pub struct CreateSessionResponse {
    pub status: u16,
    pub session: Option<BastionSession>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> BastionSession {
        BastionSession {
            id: "ocid1.bastionsession.oc1..abc".into(),
            bastion_id: "ocid1.bastion.oc1..xyz".into(),
            target_resource_id: "ocid1.instance.oc1..i".into(),
            target_port: 22,
            target_ip: Some("10.0.0.5".into()),
            creation_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            lifecycle_state: SessionState::Active,
            ttl_secs: 10800,
            display_name: None,
        }
    }

    #[test]
    fn test_expiration() {
        let s = session();
        assert_eq!(
            s.expires_at(),
            Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap()
        );
        assert!(!s.is_expired_at(Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap()));
        assert!(s.is_expired_at(Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 1).unwrap()));
    }

    #[test]
    fn test_ssh_endpoint() {
        assert_eq!(
            session().ssh_endpoint("us-luke-1"),
            "ocid1.bastionsession.oc1..abc@host.bastion.us-luke-1.oci.oraclecloud.com"
        );
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(
            serde_json::to_string(&SessionState::Creating).unwrap(),
            "\"CREATING\""
        );
        let s: SessionState = serde_json::from_str("\"UPDATING\"").unwrap();
        assert_eq!(s, SessionState::Unknown);
    }
}
