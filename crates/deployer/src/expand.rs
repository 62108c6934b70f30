//! Expansion of the API model into ARM deployment artifacts.
//!
//! The acs-engine generator turns `kubernetes.json` into a deployment
//! template, its parameters and one kubeconfig per location.

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::fetch::{Download, FetchError, Fetcher};
use crate::process::{CommandRunner, CommandSpec, ProcessError};

/// Generator binary name, resolved on `PATH` when nothing is downloaded.
pub const GENERATOR_BINARY: &str = "acs-engine";

/// Local file name of the downloaded generator archive.
pub const GENERATOR_ARCHIVE: &str = "acs-engine.tar.gz";

/// Deployment template written by the generator.
pub const TEMPLATE_FILE: &str = "azuredeploy.json";

/// Deployment parameters written by the generator.
pub const PARAMETERS_FILE: &str = "azuredeploy.parameters.json";

/// Directory of generated kubeconfigs, under the output directory.
pub const KUBECONFIG_DIR: &str = "kubeconfig";

const GENERATOR_FETCH_ATTEMPTS: u32 = 2;

/// Errors expanding the API model.
#[derive(Debug, Error)]
pub enum ExpansionError {
    /// The generator archive could not be downloaded.
    #[error("cannot download acs-engine: {0}")]
    Fetch(#[from] FetchError),

    /// The generator archive could not be unpacked.
    #[error("cannot extract {archive}: {source}")]
    Extract {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The generator exited unsuccessfully.
    #[error("failed to generate ARM templates: {source}")]
    Generate {
        #[source]
        source: ProcessError,
    },

    /// A generated file is missing or unreadable.
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A generated file is not valid JSON.
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The parameters document has no `parameters` object.
    #[error("{0} has no parameters object")]
    MissingParameters(PathBuf),

    /// No kubeconfig was generated.
    #[error("no kubeconfig found in {0}")]
    Kubeconfig(PathBuf),
}

/// Template and parameters of one deployment, kept as opaque JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentArtifacts {
    /// ARM template.
    pub template: Value,
    /// Value of the parameters document's top-level `parameters` field.
    pub parameters: Value,
}

/// Runs the generator and collects what it produced.
pub struct Expander<'a> {
    runner: &'a dyn CommandRunner,
    fetcher: &'a dyn Fetcher,
}

impl<'a> Expander<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, fetcher: &'a dyn Fetcher) -> Self {
        Self { runner, fetcher }
    }

    /// Download the generator archive to `download_dir` and unpack it into
    /// `extract_dir`, stripping the archive's top directory.
    ///
    /// Returns the path of the unpacked binary.
    ///
    /// # Errors
    /// Returns error if the download or the extraction fails.
    pub async fn fetch_generator(
        &self,
        url: &str,
        checksum: Option<&str>,
        download_dir: &Path,
        extract_dir: &Path,
    ) -> Result<PathBuf, ExpansionError> {
        let archive = download_dir.join(GENERATOR_ARCHIVE);
        let download = Download::new(url, &archive, GENERATOR_FETCH_ATTEMPTS)
            .with_checksum(checksum.map(ToString::to_string));
        self.fetcher.fetch(&download).await?;

        let src = archive.clone();
        let dest = extract_dir.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_stripped(&src, &dest))
            .await
            .map_err(std::io::Error::other)
            .and_then(|result| result)
            .map_err(|source| ExpansionError::Extract {
                archive: archive.clone(),
                source,
            })?;

        let binary = extract_dir.join(GENERATOR_BINARY);
        info!(binary = %binary.display(), "acs-engine unpacked");
        Ok(binary)
    }

    /// Run `<binary> generate <spec> --output-directory <output_dir>`.
    ///
    /// # Errors
    /// Returns [`ExpansionError::Generate`] if the generator fails.
    pub async fn generate(
        &self,
        binary: &Path,
        spec_path: &Path,
        output_dir: &Path,
    ) -> Result<(), ExpansionError> {
        let command = CommandSpec::new(binary.display().to_string())
            .arg("generate")
            .arg(spec_path.display().to_string())
            .arg("--output-directory")
            .arg(output_dir.display().to_string());
        self.runner
            .run(&command)
            .await
            .map_err(|source| ExpansionError::Generate { source })?;
        Ok(())
    }

    /// Generate and load the deployment artifacts.
    ///
    /// # Errors
    /// Returns error if generation fails or its output cannot be loaded.
    pub async fn expand(
        &self,
        binary: &Path,
        spec_path: &Path,
        output_dir: &Path,
    ) -> Result<DeploymentArtifacts, ExpansionError> {
        info!(
            spec = %spec_path.display(),
            output = %output_dir.display(),
            "Generating ARM template"
        );
        self.generate(binary, spec_path, output_dir).await?;
        load_artifacts(output_dir)
    }
}

/// Unpack a `.tar.gz` into `dest`, dropping the first path component of
/// every entry. Entries that would land outside `dest` are skipped.
fn unpack_stripped(archive: &Path, dest: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));

    for entry in tarball.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if !stripped.components().all(|c| matches!(c, Component::Normal(_))) {
            debug!(entry = %path.display(), "Skipping archive entry outside destination");
            continue;
        }

        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<Value, ExpansionError> {
    let content = std::fs::read_to_string(path).map_err(|source| ExpansionError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ExpansionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the template and parameters the generator wrote to `output_dir`.
///
/// # Errors
/// Returns error if either file is missing or malformed.
pub fn load_artifacts(output_dir: &Path) -> Result<DeploymentArtifacts, ExpansionError> {
    let template = read_json(&output_dir.join(TEMPLATE_FILE))?;

    let parameters_path = output_dir.join(PARAMETERS_FILE);
    let parameters = match read_json(&parameters_path)? {
        Value::Object(mut document) => document.remove("parameters"),
        _ => None,
    }
    .filter(Value::is_object)
    .ok_or(ExpansionError::MissingParameters(parameters_path))?;

    debug!(output = %output_dir.display(), "Deployment artifacts loaded");
    Ok(DeploymentArtifacts {
        template,
        parameters,
    })
}

/// First kubeconfig (by file name) under `<output_dir>/kubeconfig`.
///
/// # Errors
/// Returns [`ExpansionError::Kubeconfig`] if the directory is missing or empty.
pub fn find_kubeconfig(output_dir: &Path) -> Result<PathBuf, ExpansionError> {
    let dir = output_dir.join(KUBECONFIG_DIR);
    let entries = std::fs::read_dir(&dir).map_err(|_| ExpansionError::Kubeconfig(dir.clone()))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    paths.sort();

    paths
        .into_iter()
        .next()
        .ok_or(ExpansionError::Kubeconfig(dir))
}
