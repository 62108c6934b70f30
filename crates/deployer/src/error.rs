//! Errors surfaced by the cluster lifecycle.
//!
//! Each variant names the stage that failed and keeps the underlying error as
//! its source, so the first fatal error reaches the caller with its context.

use std::path::PathBuf;

use kubetest_cloud::CloudProviderError;
use thiserror::Error;

use crate::apimodel::SpecError;
use crate::artifacts::ArtifactError;
use crate::config::ConfigError;
use crate::credentials::CredentialsError;
use crate::deploy::DeployError;
use crate::expand::ExpansionError;
use crate::fetch::FetchError;
use crate::process::ProcessError;

/// Result alias for lifecycle operations.
pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error("cannot read SSH public key {path}: {source}")]
    SshKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("working directory {path}: {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot create Azure client: {0}")]
    Client(#[source] CloudProviderError),

    #[error("cannot create HTTP client: {0}")]
    HttpClient(#[source] FetchError),

    #[error("building hyperkube image: {0}")]
    ControlPlaneImage(#[source] ArtifactError),

    #[error("building Windows package: {0}")]
    WorkerPackage(#[source] ArtifactError),

    #[error("generating API model: {0}")]
    Spec(#[from] SpecError),

    #[error("getting acs-engine: {0}")]
    GeneratorFetch(#[source] ExpansionError),

    #[error("expanding deployment: {0}")]
    Expansion(#[source] ExpansionError),

    #[error("deploying cluster: {0}")]
    Deploy(#[from] DeployError),

    /// Resource group deletion failed; the cloud error is kept as is.
    #[error("deleting resource group {resource_group}: {source}")]
    Teardown {
        resource_group: String,
        #[source]
        source: CloudProviderError,
    },

    /// The cluster is not reachable or has no nodes.
    #[error("cluster not ready: {0}")]
    NotReady(String),

    /// The operation exists on the lifecycle surface but is not implemented.
    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl ClusterError {
    /// Name of the stage that failed.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Credentials(_) | Self::SshKey { .. } => "configuration",
            Self::Workdir { .. } => "working directory",
            Self::Client(_) | Self::HttpClient(_) => "client setup",
            Self::ControlPlaneImage(_) => "control plane image",
            Self::WorkerPackage(_) => "worker package",
            Self::Spec(_) => "api model",
            Self::GeneratorFetch(_) => "generator fetch",
            Self::Expansion(_) => "expansion",
            Self::Deploy(_) => "deployment",
            Self::Teardown { .. } => "teardown",
            Self::NotReady(_) => "status",
            Self::Unsupported(_) => "unsupported",
            Self::Process(_) => "process",
        }
    }
}
