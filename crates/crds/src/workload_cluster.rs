//! WorkloadCluster CRD
//!
//! Registers a physical cluster that workloads can be synced to.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use crate::condition::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "workload.kcp.dev",
    version = "v1alpha1",
    kind = "WorkloadCluster",
    status = "WorkloadClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadClusterSpec {
    /// Kubeconfig used to reach the physical cluster
    #[serde(default)]
    pub kubeconfig: String,

    /// Mark the cluster unschedulable for new workloads
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Resources currently synced to this cluster (`<plural>.<group>`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synced_resources: Vec<String>,
}
