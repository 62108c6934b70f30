//! acs-deployer - bring acs-engine clusters up and down on Azure.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use acs_deployer::{
    Capabilities, Cluster, CommandSpec, Credentials, DeployerArgs, DeployerConfig,
};

/// acs-deployer - Kubernetes e2e clusters on Azure via acs-engine.
#[derive(Parser)]
#[command(name = "acs-deployer", version)]
#[command(about = "Provision and tear down acs-engine clusters on Azure")]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t)]
    log_format: LogFormat,

    #[command(flatten)]
    args: DeployerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build artifacts, generate the template and deploy the cluster.
    Up,

    /// Delete the cluster's resource group.
    Down,

    /// Check that the cluster has ready nodes.
    Status {
        /// Kubeconfig of the cluster.
        #[arg(long, env = "KUBECONFIG")]
        kubeconfig: PathBuf,
    },

    /// Bring the cluster up, run a test command, then tear it down.
    Run {
        /// Shell command to run against the cluster.
        #[arg(long)]
        test_command: Option<String>,

        /// Leave the cluster running afterwards.
        #[arg(long)]
        keep_cluster: bool,
    },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,acs_deployer=debug,kubetest_cloud=debug")
        } else {
            EnvFilter::new("warn,acs_deployer=info,kubetest_cloud=info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Load credentials and capabilities. The configuration is left unresolved:
/// `up` and `down` each resolve what they need when the cluster is built.
fn load(args: DeployerArgs) -> Result<(DeployerConfig, Credentials, Capabilities)> {
    let config = args.into_config().context("Invalid configuration")?;
    let creds_path = config
        .credentials_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .context("No credentials file path specified")?;
    let credentials = Credentials::load(&creds_path)?;
    let caps = Capabilities::azure(&credentials)?;
    Ok((config, credentials, caps))
}

async fn up(cluster: &mut Cluster) -> Result<()> {
    cluster.up().await.context("Cluster creation failed")?;

    // Printed for the calling job to source; this process exits right after.
    for (key, value) in cluster.exports() {
        println!("export {key}={value}");
    }
    if let Some(workdir) = cluster.workdir() {
        println!("Working directory: {}", workdir.display());
    }
    Ok(())
}

async fn run(
    mut cluster: Cluster,
    test_command: Option<String>,
    keep_cluster: bool,
) -> Result<()> {
    let mut result = up(&mut cluster).await;

    if result.is_ok() {
        if let Some(command) = test_command {
            info!(command = %command, "Running tests");
            result = cluster
                .run_with_exports(CommandSpec::new("sh").arg("-c").arg(command))
                .await
                .map(|_| ())
                .context("Test command failed");
        }
    }

    if keep_cluster {
        warn!(resource_group = %cluster.config().resource_group, "Keeping cluster");
    } else if let Err(e) = cluster.down().await {
        error!(error = %e, "Teardown failed");
        if result.is_ok() {
            result = Err(e).context("Cluster teardown failed");
        }
    }

    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let (config, credentials, caps) = load(cli.args)?;

    match cli.command {
        Commands::Up => {
            let mut cluster = Cluster::new(config, credentials, caps)?;
            up(&mut cluster).await
        }
        Commands::Down => {
            let mut cluster = Cluster::connect(config, credentials, caps)?;
            cluster.down().await.context("Cluster teardown failed")
        }
        Commands::Status { kubeconfig } => {
            let cluster =
                Cluster::connect(config, credentials, caps)?.with_kubeconfig(kubeconfig);
            let nodes = cluster.is_up().await?;
            println!("Cluster is up with {nodes} node(s)");
            Ok(())
        }
        Commands::Run {
            test_command,
            keep_cluster,
        } => {
            let cluster = Cluster::new(config, credentials, caps)?;
            run(cluster, test_command, keep_cluster).await
        }
    }
}
