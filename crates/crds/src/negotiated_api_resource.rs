//! NegotiatedAPIResource CRD
//!
//! The common schema agreed across every cluster that imports a resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use crate::api_resource_import::{GroupVersion, ResourceScope};
use crate::condition::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "apiresource.kcp.dev",
    version = "v1alpha1",
    kind = "NegotiatedAPIResource",
    status = "NegotiatedAPIResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedAPIResourceSpec {
    pub group_version: GroupVersion,

    pub plural: String,

    pub kind: String,

    #[serde(default)]
    pub scope: ResourceScope,

    /// Publish the negotiated resource as a CRD in the control plane
    #[serde(default)]
    pub publish: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedAPIResourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
