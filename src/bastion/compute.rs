//! Compute instance lookup
//!
//! Sessions target an instance OCID, but people know their machines by
//! display name. [`InstanceDirectory`] walks every accessible compartment of
//! the tenancy and indexes the running instances by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::api::ApiError;

/// Lifecycle filter applied to instance listings
pub const RUNNING_STATE: &str = "RUNNING";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Compartment {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceSummary {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub compartment_id: String,
    pub lifecycle_state: String,
}

/// Listing calls needed to resolve an instance by name
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Accessible compartments below `tenancy_id`, not including the root
    async fn list_compartments(&self, tenancy_id: &str) -> Result<Vec<Compartment>, ApiError>;

    /// Running instances directly in `compartment_id`
    async fn list_instances(&self, compartment_id: &str) -> Result<Vec<InstanceSummary>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    data: Vec<T>,
}

/// Parse a CLI list output; the CLI prints nothing for an empty result
pub fn parse_list_output<T: serde::de::DeserializeOwned>(stdout: &[u8]) -> Result<Vec<T>, ApiError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let envelope: ListEnvelope<T> = serde_json::from_slice(stdout)
        .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
    Ok(envelope.data)
}

/// Running instances of a tenancy keyed by display name
#[derive(Debug, Clone, Default)]
pub struct InstanceDirectory {
    by_name: BTreeMap<String, InstanceSummary>,
}

impl InstanceDirectory {
    /// List the root compartment and every compartment below it
    ///
    /// Instances without a display name are skipped. When two instances share
    /// a name the first one listed wins.
    pub async fn load(api: Arc<dyn ComputeApi>, tenancy_id: &str) -> Result<Self, ApiError> {
        let mut compartment_ids = vec![tenancy_id.to_string()];
        compartment_ids.extend(
            api.list_compartments(tenancy_id)
                .await?
                .into_iter()
                .map(|c| c.id),
        );

        let mut by_name = BTreeMap::new();
        for compartment_id in &compartment_ids {
            debug!("Fetching instances in compartment {}", compartment_id);
            for instance in api.list_instances(compartment_id).await? {
                let Some(name) = instance.display_name.clone() else {
                    continue;
                };
                if by_name.contains_key(&name) {
                    warn!("Duplicate instance name '{}', keeping the first", name);
                    continue;
                }
                by_name.insert(name, instance);
            }
        }

        info!(
            "Retrieved {} compute instances from {} compartments",
            by_name.len(),
            compartment_ids.len()
        );
        Ok(Self { by_name })
    }

    pub fn resolve(&self, display_name: &str) -> Option<&InstanceSummary> {
        self.by_name.get(display_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
