//! Command line flags.
//!
//! Flag names follow the `--acsengine-*` convention used by e2e jobs. Job
//! definitions carry over except for the archive checksum, which is SHA-256
//! and passed as `--acsengine-sha256-sum`; the old MD5 flag is not accepted.

use std::path::PathBuf;

use clap::Args;

use crate::config::{
    AgentOsType, ConfigError, DeployerConfig, WorkdirPolicy, DEFAULT_AGENT_POOL_COUNT,
    DEFAULT_LOCATION, DEFAULT_NETWORK_PLUGIN, DEFAULT_ORCHESTRATOR_RELEASE, DEFAULT_VM_SIZE,
    DEFAULT_WINDOWS_BUILD_SCRIPT_URL,
};

/// Cluster flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct DeployerArgs {
    /// Azure deployment name (default: kubetest-<uuid>).
    #[arg(long = "acsengine-resource-name", default_value = "")]
    pub resource_name: String,

    /// Azure resource group (default: <resource name>-rg).
    #[arg(long = "acsengine-resourcegroup-name", default_value = "")]
    pub resource_group: String,

    /// Azure region.
    #[arg(long = "acsengine-location", default_value = DEFAULT_LOCATION)]
    pub location: String,

    /// Master VM size.
    #[arg(long = "acsengine-mastervmsize", default_value = DEFAULT_VM_SIZE)]
    pub master_vm_size: String,

    /// Agent VM size.
    #[arg(long = "acsengine-agentvmsize", default_value = DEFAULT_VM_SIZE)]
    pub agent_vm_size: String,

    /// Admin username for all nodes.
    #[arg(long = "acsengine-admin-username", default_value = "")]
    pub admin_username: String,

    /// Admin password for Windows nodes.
    #[arg(long = "acsengine-admin-password", default_value = "", hide_default_value = true)]
    pub admin_password: String,

    /// Number of agent nodes.
    #[arg(long = "acsengine-agentpoolcount", default_value_t = DEFAULT_AGENT_POOL_COUNT)]
    pub agent_pool_count: u32,

    /// Agent OS (Windows|Linux).
    #[arg(long = "acsengine-agentOSType", default_value = "Windows")]
    pub agent_os_type: AgentOsType,

    /// Existing API model; skips generating one.
    #[arg(long = "acsengine-template")]
    pub api_model_path: Option<PathBuf>,

    /// Master DNS prefix (default: the resource name).
    #[arg(long = "acsengine-dnsprefix", default_value = "")]
    pub dns_prefix: String,

    /// Download URL of an acs-engine release archive.
    #[arg(long = "acsengine-download-url")]
    pub engine_download_url: Option<String>,

    /// SHA-256 of the acs-engine archive.
    #[arg(long = "acsengine-sha256-sum")]
    pub engine_checksum: Option<String>,

    /// SSH public key for Linux nodes (default: ~/.ssh/id_rsa.pub).
    #[arg(long = "acsengine-public-key")]
    pub ssh_public_key_path: Option<PathBuf>,

    /// Windows node package URL; skips building one.
    #[arg(long = "acsengine-win-binaries-url")]
    pub windows_package_url: Option<String>,

    /// Hyperkube image; skips building one.
    #[arg(long = "acsengine-hyperkube-url")]
    pub hyperkube_image: Option<String>,

    /// Credentials file for Azure.
    #[arg(long = "acsengine-creds")]
    pub credentials_path: Option<PathBuf>,

    /// Kubernetes release for acs-engine.
    #[arg(long = "acsengine-orchestratorRelease", default_value = DEFAULT_ORCHESTRATOR_RELEASE)]
    pub orchestrator_release: String,

    /// Script that builds the Windows node package.
    #[arg(long = "acsengine-winZipBuildScript", default_value = DEFAULT_WINDOWS_BUILD_SCRIPT_URL)]
    pub windows_build_script_url: String,

    /// Network plugin.
    #[arg(long = "acsengine-networkPlugin", default_value = DEFAULT_NETWORK_PLUGIN)]
    pub network_plugin: String,

    /// CI build number used to tag built artifacts.
    #[arg(long, env = "BUILD_NUMBER", default_value = "")]
    pub build_number: String,

    /// Registry the hyperkube image is pushed to.
    #[arg(long, env = "REGISTRY", default_value = "")]
    pub registry: String,

    /// Blob container the Windows package is uploaded to.
    #[arg(long, env = "AZ_STORAGE_CONTAINER_NAME", default_value = "")]
    pub storage_container: String,

    /// Directory for downloads, builds and the working directory (default: $HOME).
    #[arg(long)]
    pub home_dir: Option<PathBuf>,

    /// Remove the working directory after a successful teardown.
    #[arg(long)]
    pub cleanup_workdir: bool,
}

impl DeployerArgs {
    /// Convert the flags into a configuration.
    ///
    /// # Errors
    /// Returns error if no home directory is given or known.
    pub fn into_config(self) -> Result<DeployerConfig, ConfigError> {
        let home_dir = self
            .home_dir
            .or_else(dirs::home_dir)
            .ok_or(ConfigError::Missing {
                field: "home directory",
            })?;

        let mut config = DeployerConfig::with_defaults(home_dir);
        config.resource_name = self.resource_name;
        config.resource_group = self.resource_group;
        config.location = self.location;
        config.dns_prefix = self.dns_prefix;
        config.master_vm_size = self.master_vm_size;
        config.agent_vm_size = self.agent_vm_size;
        config.agent_pool_count = self.agent_pool_count;
        config.agent_os_type = self.agent_os_type;
        config.orchestrator_release = self.orchestrator_release;
        config.network_plugin = self.network_plugin;
        config.admin_username = self.admin_username;
        config.admin_password = self.admin_password;
        config.ssh_public_key_path = self.ssh_public_key_path;
        config.credentials_path = self.credentials_path;
        config.api_model_path = self.api_model_path;
        config.hyperkube_image = self.hyperkube_image;
        config.windows_package_url = self.windows_package_url;
        config.engine_download_url = self.engine_download_url;
        config.engine_checksum = self.engine_checksum;
        config.windows_build_script_url = self.windows_build_script_url;
        config.build_number = self.build_number;
        config.registry = self.registry;
        config.storage_container = self.storage_container;
        config.workdir_policy = if self.cleanup_workdir {
            WorkdirPolicy::RemoveOnDown
        } else {
            WorkdirPolicy::Keep
        };
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        args: DeployerArgs,
    }

    #[test]
    fn test_defaults_match_stock_config() {
        let cli = TestCli::try_parse_from(["acs-deployer", "--home-dir", "/home/prow"]).unwrap();
        let config = cli.args.into_config().unwrap();
        let stock = DeployerConfig::with_defaults("/home/prow");

        assert_eq!(config.location, stock.location);
        assert_eq!(config.master_vm_size, stock.master_vm_size);
        assert_eq!(config.agent_pool_count, stock.agent_pool_count);
        assert_eq!(config.agent_os_type, AgentOsType::Windows);
        assert_eq!(config.orchestrator_release, "1.11");
        assert_eq!(config.network_plugin, "azure");
        assert_eq!(config.windows_build_script_url, stock.windows_build_script_url);
        assert_eq!(config.workdir_policy, WorkdirPolicy::Keep);
        assert!(config.hyperkube_image.is_none());
    }

    #[test]
    fn test_flags_are_carried_over() {
        let cli = TestCli::try_parse_from([
            "acs-deployer",
            "--home-dir",
            "/home/prow",
            "--acsengine-admin-username",
            "azureuser",
            "--acsengine-agentOSType",
            "linux",
            "--acsengine-hyperkube-url",
            "registry/img:v9",
            "--acsengine-creds",
            "/etc/azure/creds.toml",
            "--acsengine-agentpoolcount",
            "4",
            "--cleanup-workdir",
        ])
        .unwrap();
        let config = cli.args.into_config().unwrap();

        assert_eq!(config.admin_username, "azureuser");
        assert_eq!(config.agent_os_type, AgentOsType::Linux);
        assert_eq!(config.hyperkube_image.as_deref(), Some("registry/img:v9"));
        assert_eq!(config.credentials_path, Some(PathBuf::from("/etc/azure/creds.toml")));
        assert_eq!(config.agent_pool_count, 4);
        assert_eq!(config.workdir_policy, WorkdirPolicy::RemoveOnDown);
    }

    #[test]
    fn test_invalid_os_type_is_rejected() {
        let result =
            TestCli::try_parse_from(["acs-deployer", "--acsengine-agentOSType", "solaris"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_checksum_flag_is_sha256_only() {
        let digest = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        let cli = TestCli::try_parse_from(["acs-deployer", "--acsengine-sha256-sum", digest])
            .unwrap();
        assert_eq!(cli.args.engine_checksum.as_deref(), Some(digest));

        let err = TestCli::try_parse_from([
            "acs-deployer",
            "--acsengine-md5-sum",
            "d41d8cd98f00b204e9800998ecf8427e",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
