//! Deployer configuration types.
//!
//! Flags and environment values are collected once into a [`DeployerConfig`]
//! and handed to the orchestrator; nothing downstream reads flags or the
//! process environment directly.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default Azure region.
pub const DEFAULT_LOCATION: &str = "westus2";

/// Default VM size for masters and agents.
pub const DEFAULT_VM_SIZE: &str = "Standard_D2s_v3";

/// Default orchestrator release handed to acs-engine.
pub const DEFAULT_ORCHESTRATOR_RELEASE: &str = "1.11";

/// Default network plugin.
pub const DEFAULT_NETWORK_PLUGIN: &str = "azure";

/// Default number of agent nodes.
pub const DEFAULT_AGENT_POOL_COUNT: u32 = 2;

/// Script that builds the Windows node package.
pub const DEFAULT_WINDOWS_BUILD_SCRIPT_URL: &str =
    "https://raw.githubusercontent.com/Azure/acs-engine/master/scripts/build-windows-k8s.sh";

/// Configuration problems detected before any side effect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required value was not supplied.
    #[error("no {field} specified")]
    Missing { field: &'static str },

    /// A value was supplied but is not acceptable.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Operating system of the agent pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgentOsType {
    /// Windows nodes.
    #[default]
    Windows,
    /// Linux nodes.
    Linux,
}

impl std::fmt::Display for AgentOsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Windows => write!(f, "Windows"),
            Self::Linux => write!(f, "Linux"),
        }
    }
}

impl std::str::FromStr for AgentOsType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "windows" => Ok(Self::Windows),
            "linux" => Ok(Self::Linux),
            _ => Err(ConfigError::Invalid {
                field: "agent OS type",
                reason: format!("{s}. Options: Windows|Linux"),
            }),
        }
    }
}

/// What happens to the working directory once the cluster is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkdirPolicy {
    /// Leave it for the caller (generated templates, kubeconfigs stay inspectable).
    #[default]
    Keep,
    /// Remove it after a successful `down`.
    RemoveOnDown,
}

/// Full deployer configuration.
#[derive(Debug, Clone)]
pub struct DeployerConfig {
    // Cluster identity
    /// Azure deployment name; generated when empty.
    pub resource_name: String,
    /// Resource group holding every cluster resource; derived when empty.
    pub resource_group: String,
    /// Azure region.
    pub location: String,
    /// Master DNS prefix; defaults to the resource name.
    pub dns_prefix: String,

    // Topology
    /// VM size of the master.
    pub master_vm_size: String,
    /// VM size of the agents.
    pub agent_vm_size: String,
    /// Number of agent nodes.
    pub agent_pool_count: u32,
    /// Agent OS.
    pub agent_os_type: AgentOsType,
    /// Kubernetes release.
    pub orchestrator_release: String,
    /// Network plugin.
    pub network_plugin: String,

    // Access
    /// Admin username for Linux and Windows nodes.
    pub admin_username: String,
    /// Admin password for Windows nodes.
    pub admin_password: String,
    /// SSH public key installed on Linux nodes; defaults to `~/.ssh/id_rsa.pub`.
    pub ssh_public_key_path: Option<PathBuf>,
    /// TOML file with the service principal and storage account.
    pub credentials_path: Option<PathBuf>,

    // Pre-supplied inputs (skip the matching stage when set)
    /// Existing API model; skips generating one.
    pub api_model_path: Option<PathBuf>,
    /// Custom hyperkube image; skips the control plane image build.
    pub hyperkube_image: Option<String>,
    /// Windows node package URL; skips the worker package build.
    pub windows_package_url: Option<String>,

    // Generator tool
    /// Where to download acs-engine from; `acs-engine` on `PATH` otherwise.
    pub engine_download_url: Option<String>,
    /// Expected SHA-256 of the acs-engine archive.
    pub engine_checksum: Option<String>,
    /// Build script for the Windows node package.
    pub windows_build_script_url: String,

    // Build environment
    /// CI build number; tags the image and names the package.
    pub build_number: String,
    /// Container registry the image is pushed to.
    pub registry: String,
    /// Blob container the package is uploaded to.
    pub storage_container: String,

    // Paths
    /// Home directory: downloads, build outputs and the working directory live here.
    pub home_dir: PathBuf,
    /// Working directory lifecycle.
    pub workdir_policy: WorkdirPolicy,
}

impl DeployerConfig {
    /// Create config with the stock defaults rooted at `home_dir`.
    #[must_use]
    pub fn with_defaults(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            resource_name: String::new(),
            resource_group: String::new(),
            location: DEFAULT_LOCATION.into(),
            dns_prefix: String::new(),
            master_vm_size: DEFAULT_VM_SIZE.into(),
            agent_vm_size: DEFAULT_VM_SIZE.into(),
            agent_pool_count: DEFAULT_AGENT_POOL_COUNT,
            agent_os_type: AgentOsType::default(),
            orchestrator_release: DEFAULT_ORCHESTRATOR_RELEASE.into(),
            network_plugin: DEFAULT_NETWORK_PLUGIN.into(),
            admin_username: String::new(),
            admin_password: String::new(),
            ssh_public_key_path: None,
            credentials_path: None,
            api_model_path: None,
            hyperkube_image: None,
            windows_package_url: None,
            engine_download_url: None,
            engine_checksum: None,
            windows_build_script_url: DEFAULT_WINDOWS_BUILD_SCRIPT_URL.into(),
            build_number: String::new(),
            registry: String::new(),
            storage_container: String::new(),
            home_dir: home_dir.into(),
            workdir_policy: WorkdirPolicy::default(),
        }
    }

    /// Fill in derived defaults and reject configuration that cannot bring a
    /// cluster up.
    ///
    /// Idempotent: resolving an already resolved config returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first missing or invalid field.
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        self.clear_blank_inputs();
        self.require_credentials()?;

        if self.resource_name.is_empty() {
            self.resource_name = format!("kubetest-{}", uuid::Uuid::new_v4());
        }
        if self.resource_group.is_empty() {
            self.resource_group = format!("{}-rg", self.resource_name);
        }
        if self.dns_prefix.is_empty() {
            self.dns_prefix.clone_from(&self.resource_name);
        }
        if self.ssh_public_key_path.is_none() {
            self.ssh_public_key_path = Some(self.home_dir.join(".ssh").join("id_rsa.pub"));
        }
        if self.admin_username.is_empty() {
            return Err(ConfigError::Missing {
                field: "admin username",
            });
        }
        if self.admin_password.is_empty() {
            return Err(ConfigError::Missing {
                field: "admin password",
            });
        }
        if self.agent_pool_count == 0 {
            return Err(ConfigError::Invalid {
                field: "agent pool count",
                reason: "must be at least 1".into(),
            });
        }

        // Inputs the build stages need, checked here so nothing has run yet.
        if self.hyperkube_image.is_none() {
            if self.build_number.is_empty() {
                return Err(ConfigError::Missing {
                    field: "build number (BUILD_NUMBER) for the hyperkube build",
                });
            }
            if self.registry.is_empty() {
                return Err(ConfigError::Missing {
                    field: "container registry (REGISTRY) for the hyperkube build",
                });
            }
        }
        if self.windows_package_url.is_none() {
            if self.build_number.is_empty() {
                return Err(ConfigError::Missing {
                    field: "build number (BUILD_NUMBER) for the Windows package build",
                });
            }
            if self.storage_container.is_empty() {
                return Err(ConfigError::Missing {
                    field: "storage container (AZ_STORAGE_CONTAINER_NAME) \
                            for the Windows package upload",
                });
            }
        }

        Ok(self)
    }

    /// Resolve configuration for an existing cluster (`down`, `status`).
    ///
    /// Only the credentials and the cluster identity are needed. Names are
    /// never generated: a resource group is derived from an explicit resource
    /// name, and with neither supplied there is nothing to act on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the credentials path or both the
    /// resource group and resource name are absent.
    pub fn resolve_existing(mut self) -> Result<Self, ConfigError> {
        self.clear_blank_inputs();
        self.require_credentials()?;

        self.resource_name = self.resource_name.trim().to_string();
        self.resource_group = self.resource_group.trim().to_string();
        if self.resource_group.is_empty() {
            if self.resource_name.is_empty() {
                return Err(ConfigError::Missing {
                    field: "resource group or resource name",
                });
            }
            self.resource_group = format!("{}-rg", self.resource_name);
        }
        if self.dns_prefix.is_empty() {
            self.dns_prefix.clone_from(&self.resource_name);
        }

        Ok(self)
    }

    fn clear_blank_inputs(&mut self) {
        for value in [
            &mut self.api_model_path,
            &mut self.ssh_public_key_path,
            &mut self.credentials_path,
        ] {
            if value.as_deref().is_some_and(|p| p.as_os_str().is_empty()) {
                *value = None;
            }
        }
        for value in [
            &mut self.hyperkube_image,
            &mut self.windows_package_url,
            &mut self.engine_download_url,
            &mut self.engine_checksum,
        ] {
            if value.as_deref().is_some_and(|s| s.trim().is_empty()) {
                *value = None;
            }
        }
    }

    fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.credentials_path.is_none() {
            return Err(ConfigError::Missing {
                field: "credentials file path",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> DeployerConfig {
        let mut config = DeployerConfig::with_defaults("/home/prow");
        config.credentials_path = Some(PathBuf::from("/etc/azure/creds.toml"));
        config.admin_username = "azureuser".into();
        config.admin_password = "P@ssw0rd1".into();
        config.hyperkube_image = Some("registry/img:v9".into());
        config.windows_package_url = Some("https://blob/win.zip".into());
        config
    }

    #[test]
    fn test_resolve_derives_names() {
        let config = minimal().resolve().unwrap();
        assert!(config.resource_name.starts_with("kubetest-"));
        assert_eq!(config.resource_group, format!("{}-rg", config.resource_name));
        assert_eq!(config.dns_prefix, config.resource_name);
        assert_eq!(
            config.ssh_public_key_path,
            Some(PathBuf::from("/home/prow/.ssh/id_rsa.pub"))
        );
    }

    #[test]
    fn test_resolve_keeps_explicit_names() {
        let mut config = minimal();
        config.resource_name = "e2e".into();
        config.resource_group = "shared-rg".into();
        let config = config.resolve().unwrap();
        assert_eq!(config.resource_name, "e2e");
        assert_eq!(config.resource_group, "shared-rg");
        assert_eq!(config.dns_prefix, "e2e");
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let once = minimal().resolve().unwrap();
        let twice = once.clone().resolve().unwrap();
        assert_eq!(once.resource_name, twice.resource_name);
        assert_eq!(once.resource_group, twice.resource_group);
    }

    #[test]
    fn test_missing_credentials_path() {
        let mut config = minimal();
        config.credentials_path = Some(PathBuf::new());
        assert_eq!(
            config.resolve().unwrap_err(),
            ConfigError::Missing {
                field: "credentials file path"
            }
        );
    }

    #[test]
    fn test_missing_admin_fields() {
        let mut config = minimal();
        config.admin_username.clear();
        assert!(config.resolve().unwrap_err().to_string().contains("admin username"));

        let mut config = minimal();
        config.admin_password.clear();
        assert!(config.resolve().unwrap_err().to_string().contains("admin password"));
    }

    #[test]
    fn test_builds_require_build_environment() {
        let mut config = minimal();
        config.hyperkube_image = Some("  ".into());
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("BUILD_NUMBER"));

        let mut config = minimal();
        config.windows_package_url = None;
        config.build_number = "42".into();
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("AZ_STORAGE_CONTAINER_NAME"));
    }

    #[test]
    fn test_resolve_existing_needs_only_identity() {
        let mut config = DeployerConfig::with_defaults("/home/prow");
        config.credentials_path = Some(PathBuf::from("/etc/azure/creds.toml"));
        config.resource_group = "e2e-rg".into();

        let config = config.resolve_existing().unwrap();
        assert_eq!(config.resource_group, "e2e-rg");
        assert!(config.admin_username.is_empty());
        assert!(config.ssh_public_key_path.is_none());
    }

    #[test]
    fn test_resolve_existing_derives_group_from_name() {
        let mut config = DeployerConfig::with_defaults("/home/prow");
        config.credentials_path = Some(PathBuf::from("/etc/azure/creds.toml"));
        config.resource_name = "e2e".into();

        let config = config.resolve_existing().unwrap();
        assert_eq!(config.resource_group, "e2e-rg");
        assert_eq!(config.dns_prefix, "e2e");
    }

    #[test]
    fn test_resolve_existing_never_invents_a_group() {
        let mut config = minimal();
        config.resource_name = "  ".into();
        assert_eq!(
            config.resolve_existing().unwrap_err(),
            ConfigError::Missing {
                field: "resource group or resource name"
            }
        );
    }

    #[test]
    fn test_resolve_existing_requires_credentials() {
        let mut config = DeployerConfig::with_defaults("/home/prow");
        config.resource_group = "e2e-rg".into();
        assert_eq!(
            config.resolve_existing().unwrap_err(),
            ConfigError::Missing {
                field: "credentials file path"
            }
        );
    }

    #[test]
    fn test_agent_os_type_parsing() {
        assert_eq!("windows".parse::<AgentOsType>().unwrap(), AgentOsType::Windows);
        assert_eq!("Linux".parse::<AgentOsType>().unwrap(), AgentOsType::Linux);
        assert!("solaris".parse::<AgentOsType>().is_err());
    }
}
