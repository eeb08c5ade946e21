use om_automation::{
    AutomationConfig, Deployment,
    automation_config::{self, Ldap},
    deployment, document,
    options::AgentVersionOptions,
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{info, warn};

use crate::desired::{ConfigSpec, ReplicaSetSpec, ShardedClusterSpec, Standalone};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build the desired processes of {name:?}"))]
    BuildDesiredState {
        source: document::Error,
        name: String,
    },

    #[snafu(display("failed to merge {name:?} into the deployment"))]
    Merge {
        source: deployment::Error,
        name: String,
    },

    #[snafu(display("failed to register monitoring and backup agents"))]
    RegisterAgents { source: deployment::Error },

    #[snafu(display("failed to apply the automation config sections"))]
    ApplyConfig { source: automation_config::Error },

    #[snafu(display("failed to configure the prometheus endpoint"))]
    ConfigurePrometheus { source: document::Error },

    #[snafu(display("{path:?} is not of the form <section>.<key>"))]
    InvalidUnsetPath { path: String },

    #[snafu(display("{path:?} does not name a known field"))]
    UnknownField { path: String },
}

/// A single change to the automation config, run inside a read-modify-write cycle.
#[derive(Debug)]
pub enum Change {
    Standalone(Standalone),
    ReplicaSet(ReplicaSetSpec),
    ShardedCluster {
        spec: ShardedClusterSpec,
        finalizing: bool,
    },
    RemoveReplicaSet(String),
    RemoveShardedCluster(String),
    ApplyConfig(ConfigSpec),
}

impl Change {
    pub fn apply(&self, deployment: &mut Deployment, agents: &AgentVersionOptions) -> Result<(), Error> {
        match self {
            Self::Standalone(standalone) => {
                let name = &standalone.host.name;
                let process = standalone
                    .process()
                    .context(BuildDesiredStateSnafu { name })?;
                deployment
                    .merge_standalone(&process, &standalone.history())
                    .context(MergeSnafu { name })?;
                register_agents(deployment, agents, standalone.settings.ca_file_path())
            }
            Self::ReplicaSet(spec) => {
                let name = &spec.name;
                let existing_ids = if spec.multi_cluster {
                    Some(
                        deployment
                            .replica_set_process_ids(name)
                            .context(MergeSnafu { name })?,
                    )
                } else {
                    None
                };
                let desired = spec
                    .replica_set(existing_ids.as_ref())
                    .context(BuildDesiredStateSnafu { name })?;
                deployment
                    .merge_replica_set(&desired, &spec.members.history())
                    .context(MergeSnafu { name })?;
                register_agents(deployment, agents, spec.settings.ca_file_path())
            }
            Self::ShardedCluster { spec, finalizing } => {
                let name = &spec.name;
                let options = spec
                    .merge_options(*finalizing)
                    .context(BuildDesiredStateSnafu { name })?;
                let draining = deployment
                    .merge_sharded_cluster(&options)
                    .context(MergeSnafu { name })?;
                if draining {
                    info!(
                        cluster.name = %name,
                        "shards are draining, merge again with --finalizing once the balancer moved their data"
                    );
                }
                register_agents(deployment, agents, spec.settings.ca_file_path())
            }
            Self::RemoveReplicaSet(name) => deployment
                .remove_replica_set_by_name(name)
                .context(MergeSnafu { name }),
            Self::RemoveShardedCluster(name) => deployment
                .remove_sharded_cluster_by_name(name)
                .context(MergeSnafu { name }),
            Self::ApplyConfig(spec) => apply_config(deployment, spec),
        }
    }
}

fn register_agents(
    deployment: &mut Deployment,
    agents: &AgentVersionOptions,
    ca_file_path: Option<&str>,
) -> Result<(), Error> {
    deployment
        .add_monitoring_and_backup(agents, ca_file_path)
        .context(RegisterAgentsSnafu)
}

fn apply_config(deployment: &mut Deployment, spec: &ConfigSpec) -> Result<(), Error> {
    let mut config = AutomationConfig::from_deployment(deployment.clone()).context(ApplyConfigSnafu)?;

    if let Some(auth) = &spec.auth {
        config.auth.update_from(auth);
    }
    if let Some(tls) = &spec.tls {
        config.agent_ssl.update_from(tls);
    }
    if let Some(ldap) = &spec.ldap {
        config.ldap.get_or_insert_with(Ldap::default).update_from(ldap);
    }

    for path in &spec.unset {
        let (section, key) = path.split_once('.').context(InvalidUnsetPathSnafu { path })?;
        let known = match section {
            "auth" => config.auth.delete_field(key),
            "tls" => config.agent_ssl.delete_field(key),
            "ldap" => match &mut config.ldap {
                Some(ldap) => ldap.delete_field(key),
                None => Ldap::default().delete_field(key),
            },
            _ => false,
        };
        ensure!(known, UnknownFieldSnafu { path });
    }

    for user in &spec.remove_users {
        if !config.auth.remove_user(&user.user, &user.db) {
            warn!(user.name = %user.user, user.db = %user.db, "user to remove does not exist");
        }
    }

    if let Some(download_base) = &spec.download_base {
        config.set_options_download_base(download_base);
    }
    if let Some(base_url) = &spec.agent_base_url {
        config.set_base_url_for_agents(base_url);
    }

    let mut updated = config.into_deployment().context(ApplyConfigSnafu)?;
    if let Some(prometheus) = &spec.prometheus {
        updated
            .configure_prometheus(prometheus)
            .context(ConfigurePrometheusSnafu)?;
    }
    *deployment = updated;
    Ok(())
}
