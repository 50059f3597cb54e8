//! Build-farm registration descriptor
//!
//! Passive configuration consumed by the external build coordinator: which
//! alias to dispatch to, how many parallel jobs it takes, and which target
//! platforms it can build for. Emitted once during provisioning.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::StateDir;

/// Connection protocol advertised to the coordinator.
pub const BUILD_PROTOCOL: &str = "ssh-ng";

/// Registration record for one build machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRegistration {
    /// SSH alias the coordinator connects to.
    pub host_name: String,
    /// Maximum parallel jobs, matched to the instance vCPU count.
    pub max_jobs: u32,
    /// Connection protocol.
    pub protocol: String,
    /// Features the builder advertises.
    pub supported_features: Vec<String>,
    /// Platform identifiers the builder accepts jobs for.
    pub systems: Vec<String>,
}

impl BuildRegistration {
    /// Registration for one instance with the given platforms.
    pub fn for_instance(alias: &str, cpus: u32, systems: Vec<String>) -> Self {
        Self {
            host_name: alias.to_string(),
            max_jobs: cpus,
            protocol: BUILD_PROTOCOL.to_string(),
            supported_features: vec!["kvm".to_string(), "benchmark".to_string()],
            systems,
        }
    }
}

/// Write the registration descriptor into the working directory.
pub fn write(store: &StateDir, registration: &BuildRegistration) -> Result<()> {
    let path = store.registration();
    store.atomic_write(&path, serde_json::to_string_pretty(registration)?)?;
    debug!("Wrote build registration to {path}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_registration_json_shape() {
        let reg = BuildRegistration::for_instance(
            "builder",
            8,
            vec!["x86_64-linux".to_string(), "aarch64-linux".to_string()],
        );
        let json = serde_json::to_value(&reg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "hostName": "builder",
                "maxJobs": 8,
                "protocol": "ssh-ng",
                "supportedFeatures": ["kvm", "benchmark"],
                "systems": ["x86_64-linux", "aarch64-linux"],
            })
        );
    }
}
