//! Prints the provider's CRDs as a multi-document YAML stream.

use crds::{ExternalLoadBalancer, MicrovmCluster, MicrovmMachine};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        MicrovmCluster::crd(),
        MicrovmMachine::crd(),
        ExternalLoadBalancer::crd(),
    ];

    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }

    Ok(())
}
