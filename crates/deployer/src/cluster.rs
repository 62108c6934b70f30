//! Cluster lifecycle: bring an acs-engine cluster up, query it, tear it down.
//!
//! [`Cluster::up`] runs the stages in a fixed order and stops at the first
//! failure. Nothing is rolled back: a failure in a later stage leaves the
//! uploads, downloads and resource group of earlier stages in place.
//!
//! ```text
//! ClientReady
//!     | build hyperkube image      (skipped with --acsengine-hyperkube-url)
//!     | build Windows package      (skipped with --acsengine-win-binaries-url)
//!     v
//! ArtifactsBuilt
//!     | write kubernetes.json      (skipped with --acsengine-template)
//!     v
//! SpecGenerated
//!     | fetch acs-engine           (only with --acsengine-download-url)
//!     | acs-engine generate
//!     v
//! DeploymentExpanded
//!     | export KUBECONFIG
//!     | ensure group, validate, deploy
//!     v
//! ClusterUp ---- down ----> TornDown
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::apimodel::{build_spec, write_spec, SpecInputs};
use crate::artifacts::{ArtifactBuilder, BlobStore};
use crate::config::{DeployerConfig, WorkdirPolicy};
use crate::credentials::Credentials;
use crate::deploy::{DeploymentExecutor, ResourceManager};
use crate::error::{ClusterError, Result};
use crate::expand::{find_kubeconfig, DeploymentArtifacts, Expander, GENERATOR_BINARY};
use crate::fetch::Fetcher;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};

/// Marks the run as a conformance run for the e2e framework.
pub const CONFORMANCE_TEST_ENV: &str = "KUBERNETES_CONFORMANCE_TEST";

/// Names the cloud provider for the e2e framework.
pub const CONFORMANCE_PROVIDER_ENV: &str = "KUBERNETES_CONFORMANCE_PROVIDER";

/// Points kubectl and the e2e framework at the new cluster.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// External capabilities the lifecycle depends on.
pub struct Capabilities {
    /// Resource Manager.
    pub arm: Box<dyn ResourceManager>,
    /// Artifact storage; `None` when no storage account is configured.
    pub blobs: Option<Box<dyn BlobStore>>,
    /// Remote file downloads.
    pub fetcher: Box<dyn Fetcher>,
    /// External commands.
    pub runner: Box<dyn CommandRunner>,
}

/// Where the cluster is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPhase {
    Uninitialized,
    ClientReady,
    ArtifactsBuilt,
    SpecGenerated,
    DeploymentExpanded,
    ClusterUp,
    TornDown,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "Uninitialized",
            Self::ClientReady => "ClientReady",
            Self::ArtifactsBuilt => "ArtifactsBuilt",
            Self::SpecGenerated => "SpecGenerated",
            Self::DeploymentExpanded => "DeploymentExpanded",
            Self::ClusterUp => "ClusterUp",
            Self::TornDown => "TornDown",
        };
        f.write_str(name)
    }
}

/// One acs-engine cluster and everything derived while bringing it up.
pub struct Cluster {
    config: DeployerConfig,
    credentials: Credentials,
    caps: Capabilities,
    phase: ClusterPhase,
    workdir: Option<PathBuf>,
    ssh_public_key: Option<String>,
    hyperkube_image: Option<String>,
    windows_package_url: Option<String>,
    api_model_path: Option<PathBuf>,
    artifacts: Option<DeploymentArtifacts>,
    kubeconfig: Option<PathBuf>,
    exports: BTreeMap<String, String>,
}

impl Cluster {
    /// Prepare a cluster for `up`: read the SSH key and create the working directory.
    ///
    /// # Errors
    /// Returns error if the configuration cannot bring a cluster up, the SSH
    /// key cannot be read or the working directory cannot be created.
    pub fn new(
        config: DeployerConfig,
        credentials: Credentials,
        caps: Capabilities,
    ) -> Result<Self> {
        let mut cluster = Self::from_resolved(config.resolve()?, credentials, caps);

        if cluster.config.api_model_path.is_none() {
            let path = cluster
                .config
                .ssh_public_key_path
                .clone()
                .unwrap_or_else(|| cluster.config.home_dir.join(".ssh").join("id_rsa.pub"));
            let key = std::fs::read_to_string(&path)
                .map_err(|source| ClusterError::SshKey { path, source })?;
            cluster.ssh_public_key = Some(key.trim().to_string());
        }

        cluster.create_workdir()?;
        Ok(cluster)
    }

    /// Attach to an existing cluster for `down` or status queries.
    ///
    /// Only credentials and a resource group (or a resource name to derive it
    /// from) are required. No working directory is created.
    ///
    /// # Errors
    /// Returns [`ClusterError::Config`] if the credentials path is missing or
    /// no resource group can be determined.
    pub fn connect(
        config: DeployerConfig,
        credentials: Credentials,
        caps: Capabilities,
    ) -> Result<Self> {
        Ok(Self::from_resolved(config.resolve_existing()?, credentials, caps))
    }

    fn from_resolved(config: DeployerConfig, credentials: Credentials, caps: Capabilities) -> Self {
        info!(
            resource_group = %config.resource_group,
            name = %config.resource_name,
            location = %config.location,
            "Azure client ready"
        );

        let mut exports = BTreeMap::new();
        exports.insert(CONFORMANCE_TEST_ENV.to_string(), "yes".to_string());
        exports.insert(CONFORMANCE_PROVIDER_ENV.to_string(), "azure".to_string());

        Self {
            api_model_path: config.api_model_path.clone(),
            config,
            credentials,
            caps,
            phase: ClusterPhase::ClientReady,
            workdir: None,
            ssh_public_key: None,
            hyperkube_image: None,
            windows_package_url: None,
            artifacts: None,
            kubeconfig: None,
            exports,
        }
    }

    /// Use an existing kubeconfig for status queries.
    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.set_kubeconfig(path.into());
        self
    }

    fn set_kubeconfig(&mut self, path: PathBuf) {
        self.exports
            .insert(KUBECONFIG_ENV.to_string(), path.display().to_string());
        self.kubeconfig = Some(path);
    }

    fn create_workdir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.workdir {
            return Ok(dir.clone());
        }
        let dir = self
            .config
            .home_dir
            .join(format!("acs-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).map_err(|source| ClusterError::Workdir {
            path: dir.clone(),
            source,
        })?;
        info!(workdir = %dir.display(), "Working directory created");
        self.workdir = Some(dir.clone());
        Ok(dir)
    }

    #[must_use]
    pub fn phase(&self) -> ClusterPhase {
        self.phase
    }

    #[must_use]
    pub fn config(&self) -> &DeployerConfig {
        &self.config
    }

    /// Working directory holding the API model and generated files.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Kubeconfig of the cluster, once known.
    #[must_use]
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    #[must_use]
    pub fn artifacts(&self) -> Option<&DeploymentArtifacts> {
        self.artifacts.as_ref()
    }

    /// Environment the test tooling needs to reach the cluster.
    #[must_use]
    pub fn exports(&self) -> &BTreeMap<String, String> {
        &self.exports
    }

    /// Write [`Cluster::exports`] into this process's environment.
    ///
    /// Mutating the environment races with any other thread reading it, so
    /// call this only while nothing else runs concurrently, typically from
    /// single-threaded code before or after the async runtime. Child processes
    /// started through [`Cluster::run_with_exports`] get the exports without it.
    pub fn apply_exports(&self) {
        for (key, value) in &self.exports {
            std::env::set_var(key, value);
        }
    }

    /// Bring the cluster up.
    ///
    /// # Errors
    /// Returns the first stage failure; earlier stages are not undone.
    pub async fn up(&mut self) -> Result<()> {
        let workdir = self.create_workdir()?;
        info!(
            name = %self.config.resource_name,
            workdir = %workdir.display(),
            "Bringing cluster up"
        );

        self.build_artifacts().await?;
        self.phase = ClusterPhase::ArtifactsBuilt;

        let api_model = self.generate_spec(&workdir)?;
        self.phase = ClusterPhase::SpecGenerated;

        let generator = self.generator().await?;
        let expander = Expander::new(self.caps.runner.as_ref(), self.caps.fetcher.as_ref());
        let artifacts = expander
            .expand(&generator, &api_model, &workdir)
            .await
            .map_err(ClusterError::Expansion)?;
        self.phase = ClusterPhase::DeploymentExpanded;

        let kubeconfig = find_kubeconfig(&workdir).map_err(ClusterError::Expansion)?;
        info!(kubeconfig = %kubeconfig.display(), "Kubeconfig located");
        self.set_kubeconfig(kubeconfig);

        DeploymentExecutor::new(self.caps.arm.as_ref())
            .execute(
                &self.config.resource_group,
                &self.config.location,
                &self.config.resource_name,
                &artifacts,
            )
            .await?;
        self.artifacts = Some(artifacts);
        self.phase = ClusterPhase::ClusterUp;

        info!(resource_group = %self.config.resource_group, "Cluster is up");
        Ok(())
    }

    async fn build_artifacts(&mut self) -> Result<()> {
        let builder = ArtifactBuilder::new(
            &self.config,
            self.caps.runner.as_ref(),
            self.caps.fetcher.as_ref(),
            self.caps.blobs.as_deref(),
        );

        if self.config.hyperkube_image.is_none() {
            let image = builder
                .build_control_plane_image()
                .await
                .map_err(ClusterError::ControlPlaneImage)?;
            self.hyperkube_image = Some(image);
        } else {
            info!("Custom hyperkube image configured; skipping build");
        }

        if self.config.windows_package_url.is_none() {
            let url = builder
                .build_worker_package()
                .await
                .map_err(ClusterError::WorkerPackage)?;
            self.windows_package_url = Some(url);
        } else {
            info!("Custom Windows package configured; skipping build");
        }

        Ok(())
    }

    fn generate_spec(&mut self, workdir: &Path) -> Result<PathBuf> {
        if let Some(path) = &self.api_model_path {
            info!(path = %path.display(), "Using supplied API model");
            return Ok(path.clone());
        }

        let spec = build_spec(&SpecInputs {
            config: &self.config,
            credentials: &self.credentials,
            ssh_public_key: self.ssh_public_key.as_deref().unwrap_or_default(),
            built_hyperkube_image: self.hyperkube_image.as_deref(),
            built_windows_package_url: self.windows_package_url.as_deref(),
            timestamp: Utc::now(),
        });
        let path = write_spec(&spec, workdir)?;
        self.api_model_path = Some(path.clone());
        Ok(path)
    }

    async fn generator(&self) -> Result<PathBuf> {
        let Some(url) = &self.config.engine_download_url else {
            return Ok(PathBuf::from(GENERATOR_BINARY));
        };

        let cwd = std::env::current_dir().map_err(|source| ClusterError::Workdir {
            path: PathBuf::from("."),
            source,
        })?;
        Expander::new(self.caps.runner.as_ref(), self.caps.fetcher.as_ref())
            .fetch_generator(
                url,
                self.config.engine_checksum.as_deref(),
                &self.config.home_dir,
                &cwd,
            )
            .await
            .map_err(ClusterError::GeneratorFetch)
    }

    /// Delete the resource group.
    ///
    /// # Errors
    /// Returns [`ClusterError::Teardown`] carrying the cloud error unchanged.
    pub async fn down(&mut self) -> Result<()> {
        let resource_group = self.config.resource_group.clone();
        info!(resource_group = %resource_group, "Tearing cluster down");

        self.caps
            .arm
            .delete_resource_group(&resource_group)
            .await
            .map_err(|source| ClusterError::Teardown {
                resource_group: resource_group.clone(),
                source,
            })?;
        self.phase = ClusterPhase::TornDown;

        match (&self.workdir, self.config.workdir_policy) {
            (Some(dir), WorkdirPolicy::RemoveOnDown) => {
                std::fs::remove_dir_all(dir).map_err(|source| ClusterError::Workdir {
                    path: dir.clone(),
                    source,
                })?;
                info!(workdir = %dir.display(), "Working directory removed");
                self.workdir = None;
            }
            (Some(dir), WorkdirPolicy::Keep) => {
                info!(workdir = %dir.display(), "Working directory kept");
            }
            (None, _) => {}
        }

        Ok(())
    }

    /// Check that the cluster answers and has at least one node.
    ///
    /// # Errors
    /// Returns [`ClusterError::NotReady`] if no kubeconfig is known or no node is listed.
    pub async fn is_up(&self) -> Result<usize> {
        let Some(kubeconfig) = &self.kubeconfig else {
            return Err(ClusterError::NotReady("no kubeconfig".to_string()));
        };

        let command = CommandSpec::new("kubectl")
            .args(["get", "nodes", "--no-headers"])
            .env(KUBECONFIG_ENV, kubeconfig.display().to_string());
        let output = self.caps.runner.run(&command).await?;

        let nodes = output.stdout.lines().filter(|l| !l.trim().is_empty()).count();
        if nodes == 0 {
            warn!(kubeconfig = %kubeconfig.display(), "Cluster reports no nodes");
            return Err(ClusterError::NotReady("no nodes registered".to_string()));
        }

        info!(nodes, "Cluster is reachable");
        Ok(nodes)
    }

    /// Run a command with [`Cluster::exports`] in its environment.
    ///
    /// # Errors
    /// Returns error if the command fails.
    pub async fn run_with_exports(&self, command: CommandSpec) -> Result<CommandOutput> {
        let command = command.envs(&self.exports);
        Ok(self.caps.runner.run(&command).await?)
    }

    /// Prepare for a test run. Nothing is needed beyond `up`.
    ///
    /// # Errors
    /// Never fails.
    pub fn test_setup(&self) -> Result<()> {
        Ok(())
    }

    /// Collect node logs into `_local_dir`.
    ///
    /// # Errors
    /// Always returns [`ClusterError::Unsupported`].
    pub fn dump_cluster_logs(&self, _local_dir: &Path) -> Result<()> {
        Err(ClusterError::Unsupported("dumping cluster logs"))
    }

    /// When the cluster was created.
    ///
    /// # Errors
    /// Always returns [`ClusterError::Unsupported`].
    pub fn cluster_created(&self) -> Result<chrono::DateTime<Utc>> {
        Err(ClusterError::Unsupported("querying cluster creation time"))
    }
}
