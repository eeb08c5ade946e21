//! Merges desired MongoDB resources into an Ops Manager automation config
//! stored on disk.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use om_automation::{
    Deployment,
    document::semantically_equal,
    options::AgentVersionOptions,
    sync::{self, DeploymentStore, FileStore, FileStoreError, ProjectKey, ProjectLocks},
};
use snafu::{ResultExt, Snafu};

use crate::change::Change;

mod change;
mod desired;
mod logging;

/// Environment variable holding the log filter directives, e.g. `OM_MERGE_LOG=debug`.
const LOG_ENV: &str = "OM_MERGE_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to load the desired state"))]
    LoadDesiredState { source: desired::Error },

    #[snafu(display("failed to update the automation config"))]
    UpdateDeployment { source: sync::Error },

    #[snafu(display("failed to read the automation config"))]
    ReadDeployment { source: FileStoreError },

    #[snafu(display("failed to apply the change"))]
    ApplyChange { source: change::Error },

    #[snafu(display("failed to serialize the automation config"))]
    SerializeDeployment { source: om_automation::document::Error },

    #[snafu(display("failed to print the result"))]
    PrintResult { source: serde_json::Error },
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// The automation config to read and update, as JSON.
    #[arg(long, env = "OM_MERGE_DEPLOYMENT", value_name = "FILE")]
    deployment: PathBuf,

    /// Print the resulting automation config instead of writing it.
    #[arg(long)]
    dry_run: bool,

    /// Ops Manager project the automation config belongs to.
    #[arg(long, env = "OM_MERGE_PROJECT", default_value = "default")]
    project: String,

    /// Ops Manager organization of the project.
    #[arg(long, env = "OM_MERGE_ORGANIZATION", default_value = "default")]
    organization: String,

    /// Also write JSON logs into files in DIRECTORY.
    #[arg(long, env = "OM_MERGE_LOG_DIRECTORY", value_name = "DIRECTORY")]
    log_directory: Option<PathBuf>,

    #[clap(flatten)]
    agent_versions: AgentVersionOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Merge a standalone mongod.
    Standalone(DesiredStateArgs),

    /// Merge a replica set and its processes.
    ReplicaSet(DesiredStateArgs),

    /// Merge a sharded cluster: mongos processes, config server and shards.
    ShardedCluster(ShardedClusterArgs),

    /// Remove a replica set, its processes and their agents.
    RemoveReplicaSet { name: String },

    /// Remove a sharded cluster together with all of its processes.
    RemoveShardedCluster { name: String },

    /// Apply changes to the `auth`, `tls` and `ldap` sections.
    ApplyConfig(DesiredStateArgs),

    /// Print the JSON patch turning the automation config into OTHER.
    Diff {
        #[arg(value_name = "OTHER")]
        other: PathBuf,
    },
}

#[derive(Debug, Args)]
struct DesiredStateArgs {
    /// The desired state, as YAML or JSON.
    #[arg(value_name = "FILE")]
    desired: PathBuf,
}

#[derive(Debug, Args)]
struct ShardedClusterArgs {
    #[clap(flatten)]
    desired: DesiredStateArgs,

    /// Delete the replica sets of shards that were drained by a previous merge.
    #[arg(long)]
    finalizing: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    logging::initialize_logging(LOG_ENV, cli.log_directory.as_deref()).context(InitializeLoggingSnafu)?;

    let store = FileStore::new(
        &cli.deployment,
        ProjectKey::new(&cli.project, &cli.organization),
    );

    let change = match cli.command {
        Command::Diff { other } => return diff(&store, &other).await,
        Command::Standalone(args) => Change::Standalone(load(&args).await?),
        Command::ReplicaSet(args) => Change::ReplicaSet(load(&args).await?),
        Command::ShardedCluster(args) => Change::ShardedCluster {
            spec: load(&args.desired).await?,
            finalizing: args.finalizing,
        },
        Command::RemoveReplicaSet { name } => Change::RemoveReplicaSet(name),
        Command::RemoveShardedCluster { name } => Change::RemoveShardedCluster(name),
        Command::ApplyConfig(args) => Change::ApplyConfig(load(&args).await?),
    };

    if cli.dry_run {
        let mut deployment = store.read_deployment().await.context(ReadDeploymentSnafu)?;
        change
            .apply(&mut deployment, &cli.agent_versions)
            .context(ApplyChangeSnafu)?;
        return print_json(&deployment);
    }

    let locks = ProjectLocks::new();
    let written = sync::read_update_deployment(&store, &locks, |deployment| {
        change.apply(deployment, &cli.agent_versions)
    })
    .await
    .context(UpdateDeploymentSnafu)?;

    if !written {
        tracing::info!(path = %store.path().display(), "automation config is already up to date");
    }
    Ok(())
}

async fn load<T: serde::de::DeserializeOwned>(args: &DesiredStateArgs) -> Result<T, Error> {
    desired::load(&args.desired).await.context(LoadDesiredStateSnafu)
}

async fn diff(store: &FileStore, other: &std::path::Path) -> Result<(), Error> {
    let current = store.read_deployment().await.context(ReadDeploymentSnafu)?;
    let other = FileStore::new(other, store.project_key())
        .read_deployment()
        .await
        .context(ReadDeploymentSnafu)?;

    let current = current.to_value().context(SerializeDeploymentSnafu)?;
    let other = other.to_value().context(SerializeDeploymentSnafu)?;
    if semantically_equal(&current, &other) {
        tracing::info!("automation configs are equal");
        return Ok(());
    }

    let patch = json_patch::diff(&current, &other);
    let output = serde_json::to_string_pretty(&patch).context(PrintResultSnafu)?;
    println!("{output}");
    Ok(())
}

fn print_json(deployment: &Deployment) -> Result<(), Error> {
    let output = serde_json::to_string_pretty(deployment).context(PrintResultSnafu)?;
    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_sharded_cluster_merge() {
        let cli = Cli::parse_from([
            "om-merge",
            "--deployment",
            "automation-config.json",
            "--dry-run",
            "sharded-cluster",
            "sc.yaml",
            "--finalizing",
        ]);

        assert!(cli.dry_run);
        assert_eq!(cli.agent_versions, AgentVersionOptions::default());
        assert!(matches!(
            cli.command,
            Command::ShardedCluster(ShardedClusterArgs { ref desired, finalizing: true })
                if desired.desired == PathBuf::from("sc.yaml")
        ));
    }

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
