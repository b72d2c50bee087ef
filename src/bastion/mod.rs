//! Bastion Module
//!
//! Ephemeral port-forwarding sessions: data model, the service seam and the
//! provisioner that creates, polls and renews sessions. Instance lookup by
//! display name lives here too since it feeds the session target.

pub mod api;
pub mod compute;
pub mod provisioner;
pub mod types;

pub use api::{ApiError, BastionApi, OciCliBastionApi};
pub use compute::{Compartment, ComputeApi, InstanceDirectory, InstanceSummary};
pub use provisioner::{
    BastionProvisioner, ProvisionConfig, ProvisionError, SessionTarget, INACTIVE_STATE,
};
pub use types::{
    BastionSession, CreateSessionRequest, CreateSessionResponse, SessionState, STATUS_ACCEPTED,
};
