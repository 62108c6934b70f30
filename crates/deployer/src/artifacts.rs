//! Build artifacts referenced by the API model.
//!
//! Two artifacts can be produced from the tree under test:
//!
//! - a **hyperkube image**, pushed by `hack/dev-push-hyperkube.sh`
//! - a **Windows node package**, built by a downloaded script and uploaded
//!   to blob storage
//!
//! Neither build is retried; only the script download retries on its own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kubetest_cloud::CloudProviderError;
use thiserror::Error;
use tracing::info;

use crate::config::DeployerConfig;
use crate::fetch::{Download, FetchError, Fetcher};
use crate::process::{make_executable, CommandRunner, CommandSpec, ProcessError};

#[cfg(test)]
use mockall::automock;

/// Script that builds and pushes the hyperkube image, relative to the tree under test.
pub const HYPERKUBE_PUSH_SCRIPT: &str = "hack/dev-push-hyperkube.sh";

/// Local name of the downloaded Windows package build script.
pub const WINDOWS_BUILD_SCRIPT: &str = "build-win-zip.sh";

/// Folder the Windows package is built in, under the home directory.
pub const WINDOWS_BUILD_DIR: &str = "winbuild";

/// Attempts for the build script download.
const SCRIPT_FETCH_ATTEMPTS: u32 = 2;

/// Errors producing a build artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// A build script exited unsuccessfully or could not be started.
    #[error("{artifact} build failed: {source}")]
    Build {
        artifact: &'static str,
        #[source]
        source: ProcessError,
    },

    /// The build script could not be downloaded.
    #[error("cannot get build script: {0}")]
    Fetch(#[from] FetchError),

    /// The build script could not be made executable.
    #[error("cannot make {path} executable: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No blob store is available for the upload.
    #[error("no storage account configured for uploading {0}")]
    NoBlobStore(PathBuf),

    /// The package upload failed.
    #[error("failed to upload {path}: {source}")]
    Upload {
        path: PathBuf,
        #[source]
        source: CloudProviderError,
    },
}

/// Capability to store a file and get back a public URL.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload `path` into `container`, returning the blob URL.
    async fn upload(&self, path: &Path, container: &str) -> Result<String, CloudProviderError>;
}

/// Produces the hyperkube image and the Windows node package.
pub struct ArtifactBuilder<'a> {
    config: &'a DeployerConfig,
    runner: &'a dyn CommandRunner,
    fetcher: &'a dyn Fetcher,
    blobs: Option<&'a dyn BlobStore>,
}

impl<'a> ArtifactBuilder<'a> {
    /// Create a builder over the given capabilities.
    #[must_use]
    pub fn new(
        config: &'a DeployerConfig,
        runner: &'a dyn CommandRunner,
        fetcher: &'a dyn Fetcher,
        blobs: Option<&'a dyn BlobStore>,
    ) -> Self {
        Self {
            config,
            runner,
            fetcher,
            blobs,
        }
    }

    /// Image reference the hyperkube push produces.
    #[must_use]
    pub fn hyperkube_image(registry: &str, version: &str) -> String {
        format!("{registry}/hyperkube-amd64:{version}")
    }

    /// Build and push hyperkube, returning the image reference.
    ///
    /// The script sees `VERSION` (the build number) and `REGISTRY`.
    ///
    /// # Errors
    /// Returns [`ArtifactError::Build`] if the script fails.
    pub async fn build_control_plane_image(&self) -> Result<String, ArtifactError> {
        let version = &self.config.build_number;
        let registry = &self.config.registry;

        let command = CommandSpec::new(HYPERKUBE_PUSH_SCRIPT)
            .env("VERSION", version)
            .env("REGISTRY", registry);
        self.runner
            .run(&command)
            .await
            .map_err(|source| ArtifactError::Build {
                artifact: "hyperkube image",
                source,
            })?;

        let image = Self::hyperkube_image(registry, version);
        info!(image = %image, "Custom hyperkube image pushed");
        Ok(image)
    }

    /// Build the Windows node package and upload it, returning its URL.
    ///
    /// # Errors
    /// Returns an error if the script download, the build or the upload fails.
    pub async fn build_worker_package(&self) -> Result<String, ArtifactError> {
        let home = &self.config.home_dir;
        let package_name = format!("{}.zip", self.config.build_number);
        let build_dir = home.join(WINDOWS_BUILD_DIR);
        let package_path = home.join(&package_name);
        info!(package = %package_name, "Building Windows node package");

        let script = self.fetch_build_script().await?;

        let command = CommandSpec::new(script.display().to_string())
            .arg("-u")
            .arg(&package_name)
            .arg("-z")
            .arg(build_dir.display().to_string());
        self.runner
            .run(&command)
            .await
            .map_err(|source| ArtifactError::Build {
                artifact: "Windows package",
                source,
            })?;

        let blobs = self
            .blobs
            .ok_or_else(|| ArtifactError::NoBlobStore(package_path.clone()))?;
        info!(path = %package_path.display(), "Uploading Windows node package");
        let url = blobs
            .upload(&package_path, &self.config.storage_container)
            .await
            .map_err(|source| ArtifactError::Upload {
                path: package_path.clone(),
                source,
            })?;

        info!(url = %url, "Custom Windows package uploaded");
        Ok(url)
    }

    async fn fetch_build_script(&self) -> Result<PathBuf, ArtifactError> {
        let path = self.config.home_dir.join(WINDOWS_BUILD_SCRIPT);
        let download = Download::new(
            &self.config.windows_build_script_url,
            &path,
            SCRIPT_FETCH_ATTEMPTS,
        );
        self.fetcher.fetch(&download).await?;

        make_executable(&path).map_err(|source| ArtifactError::Permissions {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
