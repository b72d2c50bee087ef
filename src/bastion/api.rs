//! Bastion service seam
//!
//! [`BastionApi`] is the only surface the provisioner needs from the cloud:
//! create a session and fetch its current state. [`OciCliBastionApi`] drives
//! the vendor CLI with security-token auth and parses its JSON output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::compute::{parse_list_output, Compartment, ComputeApi, InstanceSummary, RUNNING_STATE};
use super::types::{
    BastionSession, CreateSessionRequest, CreateSessionResponse, SessionState, STATUS_ACCEPTED,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service call failed ({code:?}): {message}")]
    Service { code: Option<i32>, message: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

/// Session create/get calls against the bastion service
#[async_trait]
pub trait BastionApi: Send + Sync {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ApiError>;

    async fn get_session(&self, session_id: &str) -> Result<BastionSession, ApiError>;
}

/// CLI output envelope: `{"data": {...}}`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CliSession {
    id: String,
    bastion_id: String,
    lifecycle_state: SessionState,
    time_created: DateTime<Utc>,
    session_ttl_in_seconds: u64,
    #[serde(default)]
    display_name: Option<String>,
    target_resource_details: CliTargetDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CliTargetDetails {
    #[serde(default)]
    target_resource_id: Option<String>,
    #[serde(default)]
    target_resource_port: Option<u16>,
    #[serde(default)]
    target_resource_private_ip_address: Option<String>,
}

impl From<CliSession> for BastionSession {
    fn from(s: CliSession) -> Self {
        Self {
            id: s.id,
            bastion_id: s.bastion_id,
            target_resource_id: s.target_resource_details.target_resource_id.unwrap_or_default(),
            target_port: s.target_resource_details.target_resource_port.unwrap_or(22),
            target_ip: s.target_resource_details.target_resource_private_ip_address,
            creation_time: s.time_created,
            lifecycle_state: s.lifecycle_state,
            ttl_secs: s.session_ttl_in_seconds,
            display_name: s.display_name,
        }
    }
}

/// Parse `bastion session create|get` output
pub fn parse_session_output(stdout: &[u8]) -> Result<BastionSession, ApiError> {
    let envelope: Envelope<CliSession> = serde_json::from_slice(stdout)
        .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
    Ok(envelope.data.into())
}

/// [`BastionApi`] backed by the vendor CLI
#[derive(Debug, Clone)]
pub struct OciCliBastionApi {
    program: String,
    profile: String,
    region: String,
}

impl OciCliBastionApi {
    pub fn new(program: impl Into<String>, profile: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            profile: profile.into(),
            region: region.into(),
        }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "--profile".into(),
            self.profile.clone(),
            "--auth".into(),
            "security_token".into(),
            "--region".into(),
            self.region.clone(),
        ]
    }

    /// Arguments for `bastion session create`
    pub fn create_args(&self, request: &CreateSessionRequest) -> Vec<String> {
        let target = serde_json::json!({
            "sessionType": "PORT_FORWARDING",
            "targetResourceId": request.target_resource_id,
            "targetResourcePort": request.target_port,
        });
        let key = serde_json::json!({ "publicKeyContent": request.public_key.trim() });

        let mut args: Vec<String> = vec![
            "bastion".into(),
            "session".into(),
            "create".into(),
            "--bastion-id".into(),
            request.bastion_id.clone(),
            "--target-resource-details".into(),
            target.to_string(),
            "--key-details".into(),
            key.to_string(),
            "--key-type".into(),
            "PUB".into(),
            "--session-ttl".into(),
            request.ttl_secs.to_string(),
            "--display-name".into(),
            request.display_name.clone(),
            "--request-id".into(),
            request.request_id.clone(),
        ];
        args.extend(self.common_args());
        args
    }

    /// Arguments for `bastion session get`
    pub fn get_args(&self, session_id: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "bastion".into(),
            "session".into(),
            "get".into(),
            "--session-id".into(),
            session_id.into(),
        ];
        args.extend(self.common_args());
        args
    }

    /// Arguments for `iam compartment list` over the whole subtree
    pub fn list_compartments_args(&self, tenancy_id: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "iam".into(),
            "compartment".into(),
            "list".into(),
            "--compartment-id".into(),
            tenancy_id.into(),
            "--compartment-id-in-subtree".into(),
            "true".into(),
            "--access-level".into(),
            "ACCESSIBLE".into(),
            "--all".into(),
        ];
        args.extend(self.common_args());
        args
    }

    /// Arguments for `compute instance list` restricted to running instances
    pub fn list_instances_args(&self, compartment_id: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "compute".into(),
            "instance".into(),
            "list".into(),
            "--compartment-id".into(),
            compartment_id.into(),
            "--lifecycle-state".into(),
            RUNNING_STATE.into(),
            "--all".into(),
        ];
        args.extend(self.common_args());
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<Vec<u8>, ApiError> {
        debug!("Executing: {} {}", self.program, args[..3].join(" "));
        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ApiError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ApiError::Service {
                code: output.status.code(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl BastionApi for OciCliBastionApi {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ApiError> {
        let stdout = self.run(self.create_args(request)).await?;
        // The CLI exits non-zero unless the service accepted the request
        Ok(CreateSessionResponse {
            status: STATUS_ACCEPTED,
            session: Some(parse_session_output(&stdout)?),
        })
    }

    async fn get_session(&self, session_id: &str) -> Result<BastionSession, ApiError> {
        let stdout = self.run(self.get_args(session_id)).await?;
        parse_session_output(&stdout)
    }
}

#[async_trait]
impl ComputeApi for OciCliBastionApi {
    async fn list_compartments(&self, tenancy_id: &str) -> Result<Vec<Compartment>, ApiError> {
        let stdout = self.run(self.list_compartments_args(tenancy_id)).await?;
        parse_list_output(&stdout)
    }

    async fn list_instances(&self, compartment_id: &str) -> Result<Vec<InstanceSummary>, ApiError> {
        let stdout = self.run(self.list_instances_args(compartment_id)).await?;
        parse_list_output(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLI_OUTPUT: &str = r#"{
      "data": {
        "bastion-id": "ocid1.bastion.oc1..b",
        "bastion-name": "bastion",
        "display-name": "Session-20240501-1200",
        "id": "ocid1.bastionsession.oc1..s",
        "key-type": "PUB",
        "lifecycle-state": "CREATING",
        "session-ttl-in-seconds": 10800,
        "target-resource-details": {
          "session-type": "PORT_FORWARDING",
          "target-resource-id": "ocid1.instance.oc1..i",
          "target-resource-port": 22,
          "target-resource-private-ip-address": "10.0.0.5"
        },
        "time-created": "2024-05-01T12:00:00.123000+00:00"
      },
      "etag": "abc"
    }"#;

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            bastion_id: "ocid1.bastion.oc1..b".into(),
            target_resource_id: "ocid1.instance.oc1..i".into(),
            target_port: 22,
            ttl_secs: 10800,
            public_key: "ssh-rsa AAAA user@host\n".into(),
            display_name: "Session-20240501-1200".into(),
            retry_token: "r".into(),
            request_id: "q".into(),
        }
    }

    #[test]
    fn test_parse_session_output() {
        let session = parse_session_output(CLI_OUTPUT.as_bytes()).unwrap();
        assert_eq!(session.id, "ocid1.bastionsession.oc1..s");
        assert_eq!(session.lifecycle_state, SessionState::Creating);
        assert_eq!(session.target_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(session.target_port, 22);
        assert_eq!(session.ttl_secs, 10800);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_session_output(b"oops"),
            Err(ApiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_create_args() {
        let api = OciCliBastionApi::new("oci", "OC2_Test", "us-luke-1");
        let args = api.create_args(&request());

        assert_eq!(&args[..3], &["bastion", "session", "create"]);
        let key_idx = args.iter().position(|a| a == "--key-details").unwrap();
        assert_eq!(args[key_idx + 1], r#"{"publicKeyContent":"ssh-rsa AAAA user@host"}"#);
        let target_idx = args
            .iter()
            .position(|a| a == "--target-resource-details")
            .unwrap();
        assert!(args[target_idx + 1].contains("PORT_FORWARDING"));
        assert!(args.windows(2).any(|w| w[0] == "--auth" && w[1] == "security_token"));
        assert!(args.windows(2).any(|w| w[0] == "--request-id" && w[1] == "q"));
    }

    #[test]
    fn test_create_args_leave_retry_token_to_cli() {
        let api = OciCliBastionApi::new("oci", "OC2_Test", "us-luke-1");
        let mut req = request();
        req.retry_token = "retry-7f3a".into();
        let args = api.create_args(&req);

        assert!(!args.iter().any(|a| a.contains("retry-7f3a")));
        assert!(!args.iter().any(|a| a.contains("retry-token")));
    }

    #[test]
    fn test_list_args() {
        let api = OciCliBastionApi::new("oci", "P", "r");
        assert_eq!(
            api.list_instances_args("C")[..8].join(" "),
            "compute instance list --compartment-id C --lifecycle-state RUNNING --all"
        );
        let args = api.list_compartments_args("T");
        assert_eq!(args[..5].join(" "), "iam compartment list --compartment-id T");
        assert!(args.windows(2).any(|w| w[0] == "--compartment-id-in-subtree" && w[1] == "true"));
        assert!(args.windows(2).any(|w| w[0] == "--auth" && w[1] == "security_token"));
    }

    #[test]
    fn test_get_args() {
        let api = OciCliBastionApi::new("oci", "P", "r");
        assert_eq!(
            api.get_args("S")[..5].join(" "),
            "bastion session get --session-id S"
        );
    }
}
