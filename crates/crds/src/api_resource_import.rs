//! APIResourceImport CRD
//!
//! Describes an API resource discovered on one workload cluster and offered
//! for import into the control plane.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use crate::condition::Condition;

/// Group and version of an imported API resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersion {
    /// API group; empty for the core group
    #[serde(default)]
    pub group: String,

    pub version: String,
}

impl GroupVersion {
    /// Group name as used in resource keys (`core` for the empty group).
    pub fn group_or_core(&self) -> &str {
        if self.group.is_empty() { "core" } else { &self.group }
    }
}

/// Whether the resource is namespaced or cluster-scoped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ResourceScope {
    #[default]
    Namespaced,
    Cluster,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "apiresource.kcp.dev",
    version = "v1alpha1",
    kind = "APIResourceImport",
    status = "APIResourceImportStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct APIResourceImportSpec {
    /// Name of the WorkloadCluster this resource was imported from
    pub location: String,

    pub group_version: GroupVersion,

    /// Plural resource name (e.g., "deployments")
    pub plural: String,

    pub kind: String,

    #[serde(default)]
    pub scope: ResourceScope,
}

impl APIResourceImportSpec {
    /// `<plural>.<group>` as accepted by `--resources-to-sync`.
    pub fn group_resource(&self) -> String {
        if self.group_version.group.is_empty() {
            self.plural.clone()
        } else {
            format!("{}.{}", self.plural, self.group_version.group)
        }
    }

    /// Name of the NegotiatedAPIResource shared by all clusters importing this resource.
    pub fn negotiated_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.plural,
            self.group_version.version,
            self.group_version.group_or_core()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct APIResourceImportStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(group: &str, plural: &str) -> APIResourceImportSpec {
        APIResourceImportSpec {
            location: "east".to_string(),
            group_version: GroupVersion { group: group.to_string(), version: "v1".to_string() },
            plural: plural.to_string(),
            kind: "Deployment".to_string(),
            scope: ResourceScope::Namespaced,
        }
    }

    #[test]
    fn test_group_resource() {
        assert_eq!(spec("apps", "deployments").group_resource(), "deployments.apps");
        assert_eq!(spec("", "configmaps").group_resource(), "configmaps");
    }

    #[test]
    fn test_negotiated_name_uses_core_for_empty_group() {
        assert_eq!(spec("apps", "deployments").negotiated_name(), "deployments.v1.apps");
        assert_eq!(spec("", "configmaps").negotiated_name(), "configmaps.v1.core");
    }
}
