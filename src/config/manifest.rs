// file: src/config/manifest.rs
// version: 1.0.0
// guid: b07d9c45-e2f8-41a3-8b6e-93c50d1f72a8

//! Manifest template structures
//!
//! The template file defines runtime defaults merged into the manifest
//! sidecar at the end of a build; every field can be overridden at VM
//! creation time by the orchestrator.

use crate::{FledgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Supported manifest template schema version.
pub const MANIFEST_SCHEMA_VERSION: &str = "v1";

/// Runtime defaults template for a built artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestTemplate {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub runtime: String,
    pub resources: Option<ResourcesConfig>,
    pub workload: Option<WorkloadConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionConfig>,
    pub cloud_init: Option<CloudInitConfig>,
    pub devices: Option<DevicesConfig>,
}

/// CPU and memory defaults for the guest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub cpu_cores: u32,
    pub memory_mb: u32,
}

/// Workload entrypoint and arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Guest networking defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub expose: Vec<PortConfig>,
}

/// A single exposed port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub port: u32,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub host_port: u32,
}

/// An HTTP action exposed by the workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub path: String,
    pub method: String,
}

/// Cloud-init defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInitConfig {
    #[serde(default)]
    pub datasource: String,
    pub user_data: Option<UserDataConfig>,
    #[serde(default)]
    pub meta_data: BTreeMap<String, String>,
}

/// Cloud-init user data, inline or referenced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDataConfig {
    #[serde(default)]
    pub inline: bool,
    #[serde(default)]
    pub content: String,
}

/// Device passthrough defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    #[serde(default)]
    pub pci_passthrough: Vec<String>,
}

/// Apply default values to a parsed manifest template.
pub fn apply_defaults(template: &mut ManifestTemplate) {
    if template.schema_version.is_empty() {
        template.schema_version = MANIFEST_SCHEMA_VERSION.to_string();
    }

    if template.resources.is_none() {
        template.resources = Some(ResourcesConfig {
            cpu_cores: 1,
            memory_mb: 256,
        });
    }

    if let Some(network) = &mut template.network {
        if network.mode.is_empty() {
            network.mode = "bridged".to_string();
        }
        for port in &mut network.expose {
            if port.protocol.is_empty() {
                port.protocol = "tcp".to_string();
            }
        }
    }
}

/// Validate a manifest template after defaults.
pub fn validate(template: &ManifestTemplate) -> Result<()> {
    if template.schema_version != MANIFEST_SCHEMA_VERSION {
        return Err(FledgeError::config(
            "schema_version",
            format!(
                "unsupported schema_version '{}' (expected \"v1\")",
                template.schema_version
            ),
        ));
    }

    if template.name.is_empty() {
        return Err(FledgeError::config("name", "name is required"));
    }
    if template.version.is_empty() {
        return Err(FledgeError::config("version", "version is required"));
    }
    if template.runtime.is_empty() {
        return Err(FledgeError::config("runtime", "runtime is required"));
    }

    if let Some(resources) = &template.resources {
        if resources.cpu_cores < 1 {
            return Err(FledgeError::config(
                "resources.cpu_cores",
                "resources.cpu_cores must be >= 1",
            ));
        }
        if resources.memory_mb < 128 {
            return Err(FledgeError::config(
                "resources.memory_mb",
                "resources.memory_mb must be >= 128",
            ));
        }
    }

    if let Some(network) = &template.network {
        if !matches!(network.mode.as_str(), "bridged" | "vsock" | "dhcp") {
            return Err(FledgeError::config(
                "network.mode",
                format!(
                    "invalid network.mode '{}' (must be bridged, vsock, or dhcp)",
                    network.mode
                ),
            ));
        }
        for (i, port) in network.expose.iter().enumerate() {
            if port.port < 1 || port.port > 65535 {
                return Err(FledgeError::config(
                    format!("network.expose[{}].port", i),
                    "port must be 1-65535",
                ));
            }
            if !matches!(port.protocol.as_str(), "tcp" | "udp") {
                return Err(FledgeError::config(
                    format!("network.expose[{}].protocol", i),
                    "protocol must be tcp or udp",
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_template() -> ManifestTemplate {
        let mut template: ManifestTemplate = toml::from_str(
            r#"
            name = "nginx"
            version = "1.0.0"
            runtime = "nginx"
            "#,
        )
        .unwrap();
        apply_defaults(&mut template);
        template
    }

    #[test]
    fn test_defaults_applied() {
        let template = minimal_template();

        assert_eq!(template.schema_version, "v1");
        let resources = template.resources.unwrap();
        assert_eq!(resources.cpu_cores, 1);
        assert_eq!(resources.memory_mb, 256);
    }

    #[test]
    fn test_valid_template_passes() {
        assert!(validate(&minimal_template()).is_ok());
    }

    #[test]
    fn test_missing_name_rejected() {
        let mut template = minimal_template();
        template.name.clear();

        let err = validate(&template).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_memory_floor_enforced() {
        let mut template = minimal_template();
        template.resources = Some(ResourcesConfig {
            cpu_cores: 1,
            memory_mb: 64,
        });

        let err = validate(&template).unwrap_err();
        assert!(err.to_string().contains("memory_mb"));
    }

    #[test]
    fn test_network_defaults_and_bounds() {
        let mut template: ManifestTemplate = toml::from_str(
            r#"
            name = "svc"
            version = "0.1.0"
            runtime = "svc"

            [network]
            [[network.expose]]
            port = 8080
            "#,
        )
        .unwrap();
        apply_defaults(&mut template);

        let network = template.network.as_ref().unwrap();
        assert_eq!(network.mode, "bridged");
        assert_eq!(network.expose[0].protocol, "tcp");
        assert!(validate(&template).is_ok());

        let mut bad = template.clone();
        bad.network.as_mut().unwrap().expose[0].port = 70000;
        assert!(validate(&bad).is_err());
    }
}
