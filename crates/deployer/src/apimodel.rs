//! acs-engine API model (`vlabs`) generation.
//!
//! The model is built from the deployer configuration, the service principal
//! and any artifacts built earlier in the run, then written to
//! `<workdir>/kubernetes.json` for the generator tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{AgentOsType, DeployerConfig};
use crate::credentials::Credentials;

/// File name of the generated API model.
pub const API_MODEL_FILE: &str = "kubernetes.json";

/// API model schema version.
pub const API_VERSION: &str = "vlabs";

/// Reserved IPs per node for the Azure CNI.
const IP_ADDRESS_COUNT: u32 = 200;

/// Pre-provision extension that prepares Windows nodes.
const NODE_SETUP_EXTENSION: &str = "node_setup";

/// Where the `node_setup` extension is published.
const NODE_SETUP_ROOT_URL: &str =
    "https://k8swin.blob.core.windows.net/k8s-windows/preprovision_extensions/";

/// Errors writing the API model.
#[derive(Debug, Error)]
pub enum SpecError {
    /// The model could not be serialized.
    #[error("cannot serialize API model: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The model could not be written.
    #[error("cannot write to file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level acs-engine API model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub api_version: String,
    pub location: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub properties: Properties,
}

/// Cluster topology and access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    pub orchestrator_profile: OrchestratorProfile,
    pub master_profile: MasterProfile,
    pub agent_pool_profiles: Vec<AgentPoolProfile>,
    pub linux_profile: LinuxProfile,
    pub windows_profile: WindowsProfile,
    pub service_principal_profile: ServicePrincipalProfile,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension_profiles: Vec<ExtensionProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorProfile {
    pub orchestrator_type: String,
    pub orchestrator_release: String,
    pub kubernetes_config: KubernetesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    pub network_plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_hyperkube_image: Option<String>,
    #[serde(
        rename = "customWindowsPackageURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_windows_package_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterProfile {
    pub count: u32,
    pub dns_prefix: String,
    pub vm_size: String,
    pub ip_address_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPoolProfile {
    pub name: String,
    pub vm_size: String,
    pub count: u32,
    pub os_type: AgentOsType,
    pub availability_profile: String,
    pub ip_address_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_provision_extension: Option<PreProvisionExtension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreProvisionExtension {
    pub name: String,
    pub single_or_all: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxProfile {
    pub admin_username: String,
    pub ssh: Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ssh {
    pub public_keys: Vec<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub key_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsProfile {
    pub admin_username: String,
    pub admin_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipalProfile {
    pub client_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionProfile {
    pub name: String,
    pub version: String,
    #[serde(rename = "rootURL", default, skip_serializing_if = "Option::is_none")]
    pub root_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// Everything the API model is derived from.
#[derive(Debug, Clone, Copy)]
pub struct SpecInputs<'a> {
    /// Resolved deployer configuration.
    pub config: &'a DeployerConfig,
    /// Service principal written into the model.
    pub credentials: &'a Credentials,
    /// Contents of the SSH public key file.
    pub ssh_public_key: &'a str,
    /// Image produced by the hyperkube build, if it ran.
    pub built_hyperkube_image: Option<&'a str>,
    /// Package URL produced by the Windows build, if it ran.
    pub built_windows_package_url: Option<&'a str>,
    /// Creation time recorded in the `date` tag.
    pub timestamp: DateTime<Utc>,
}

/// Configured value if present, otherwise the built one; empty strings count as absent.
fn prefer_configured(configured: Option<&str>, built: Option<&str>) -> Option<String> {
    configured
        .filter(|s| !s.is_empty())
        .or(built.filter(|s| !s.is_empty()))
        .map(ToString::to_string)
}

/// Build the API model.
#[must_use]
pub fn build_spec(inputs: &SpecInputs<'_>) -> ClusterSpec {
    let config = inputs.config;

    let mut tags = BTreeMap::new();
    tags.insert("date".to_string(), inputs.timestamp.to_rfc3339());

    ClusterSpec {
        api_version: API_VERSION.to_string(),
        location: config.location.clone(),
        name: config.resource_name.clone(),
        tags,
        properties: Properties {
            orchestrator_profile: OrchestratorProfile {
                orchestrator_type: "Kubernetes".to_string(),
                orchestrator_release: config.orchestrator_release.clone(),
                kubernetes_config: KubernetesConfig {
                    network_plugin: config.network_plugin.clone(),
                    custom_hyperkube_image: prefer_configured(
                        config.hyperkube_image.as_deref(),
                        inputs.built_hyperkube_image,
                    ),
                    custom_windows_package_url: prefer_configured(
                        config.windows_package_url.as_deref(),
                        inputs.built_windows_package_url,
                    ),
                },
            },
            master_profile: MasterProfile {
                count: 1,
                dns_prefix: config.dns_prefix.clone(),
                vm_size: config.master_vm_size.clone(),
                ip_address_count: IP_ADDRESS_COUNT,
            },
            agent_pool_profiles: vec![AgentPoolProfile {
                name: "agentpool0".to_string(),
                vm_size: config.agent_vm_size.clone(),
                count: config.agent_pool_count,
                os_type: config.agent_os_type,
                availability_profile: "AvailabilitySet".to_string(),
                ip_address_count: IP_ADDRESS_COUNT,
                pre_provision_extension: Some(PreProvisionExtension {
                    name: NODE_SETUP_EXTENSION.to_string(),
                    single_or_all: "all".to_string(),
                }),
                extensions: vec![Extension {
                    name: "winrm".to_string(),
                }],
            }],
            linux_profile: LinuxProfile {
                admin_username: config.admin_username.clone(),
                ssh: Ssh {
                    public_keys: vec![PublicKey {
                        key_data: inputs.ssh_public_key.to_string(),
                    }],
                },
            },
            windows_profile: WindowsProfile {
                admin_username: config.admin_username.clone(),
                admin_password: config.admin_password.clone(),
            },
            service_principal_profile: ServicePrincipalProfile {
                client_id: inputs.credentials.client_id.clone(),
                secret: inputs.credentials.client_secret.clone(),
            },
            extension_profiles: vec![
                ExtensionProfile {
                    name: NODE_SETUP_EXTENSION.to_string(),
                    version: "v1".to_string(),
                    root_url: Some(NODE_SETUP_ROOT_URL.to_string()),
                    script: Some("node_setup.ps1".to_string()),
                },
                ExtensionProfile {
                    name: "winrm".to_string(),
                    version: "v1".to_string(),
                    root_url: None,
                    script: None,
                },
            ],
        },
    }
}

/// Pretty-printed JSON of the model.
///
/// # Errors
/// Returns error if serialization fails.
pub fn render_spec(spec: &ClusterSpec) -> Result<String, SpecError> {
    Ok(serde_json::to_string_pretty(spec)?)
}

/// Write the model to `<dir>/kubernetes.json` with mode `0o644`.
///
/// # Errors
/// Returns error if the file cannot be written.
pub fn write_spec(spec: &ClusterSpec, dir: &Path) -> Result<PathBuf, SpecError> {
    let path = dir.join(API_MODEL_FILE);
    let content = render_spec(spec)?;
    let write_err = |source| SpecError::Write {
        path: path.clone(),
        source,
    };

    std::fs::write(&path, content).map_err(write_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).map_err(write_err)?;
    }

    info!(path = %path.display(), "API model written");
    Ok(path)
}
