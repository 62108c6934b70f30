//! Lifecycle of acs-engine Kubernetes clusters on Azure for e2e runs.
//!
//! A run goes through these steps:
//!
//! 1. **Artifacts** - optionally build a hyperkube image and a Windows node package
//! 2. **API model** - write `kubernetes.json` for acs-engine
//! 3. **Expansion** - run `acs-engine generate` and load the ARM template
//! 4. **Deployment** - ensure the resource group, validate, deploy
//!
//! Teardown deletes the resource group.
//!
//! ```rust,ignore
//! use acs_deployer::{Capabilities, Cluster, Credentials};
//!
//! let credentials = Credentials::load(&creds_path)?;
//! let caps = Capabilities::azure(&credentials)?;
//! let mut cluster = Cluster::new(config, credentials, caps)?;
//! cluster.up().await?;
//! for (key, value) in cluster.exports() {
//!     println!("export {key}={value}");
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod apimodel;
pub mod artifacts;
pub mod azure;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod error;
pub mod expand;
pub mod fetch;
pub mod process;

pub use artifacts::{ArtifactBuilder, BlobStore};
pub use cli::DeployerArgs;
pub use cluster::{Capabilities, Cluster, ClusterPhase};
pub use config::{AgentOsType, DeployerConfig, WorkdirPolicy};
pub use credentials::Credentials;
pub use deploy::{DeployError, DeploymentExecutor, ResourceManager};
pub use error::{ClusterError, Result};
pub use expand::{DeploymentArtifacts, Expander};
pub use fetch::{Download, Fetcher, HttpFetcher};
pub use process::{CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
