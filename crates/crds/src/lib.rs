//! Cluster Controller CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the workload and API resource
//! families served by the multi-cluster control plane.

pub mod condition;
pub mod workload_cluster;
pub mod api_resource_import;
pub mod negotiated_api_resource;

pub use condition::*;
pub use workload_cluster::*;
pub use api_resource_import::*;
pub use negotiated_api_resource::*;
