//! Prints the CRD manifests for this crate as a multi-document YAML stream.

use crds::{APIResourceImport, NegotiatedAPIResource, WorkloadCluster};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        WorkloadCluster::crd(),
        APIResourceImport::crd(),
        NegotiatedAPIResource::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
