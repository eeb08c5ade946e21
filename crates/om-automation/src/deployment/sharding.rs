//! Merging and removing sharded clusters.

use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info};

use super::{
    Deployment, InvalidDocumentSnafu, Result, ShardedClusterNotFoundSnafu,
    UnexpectedMongosProcessTypeSnafu,
};
use crate::{
    process::{ArgsHistory, ClusterRole, Process, ProcessType},
    replica_set::ReplicaSetWithProcesses,
    sharded_cluster::ShardedCluster,
};

/// Matches replica set names of the form `<cluster>-<shard number>`.
static SHARD_REPLICA_SET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<cluster>.+)-[0-9]+$").expect("failed to compile shard replica set regex")
});

/// The operator's desired state of a sharded cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShardedClusterMergeOptions {
    pub name: String,
    pub mongos_processes: Vec<Process>,
    pub config_server: ReplicaSetWithProcesses,
    pub shards: Vec<ReplicaSetWithProcesses>,

    pub mongos_args: ArgsHistory,
    pub config_server_args: ArgsHistory,
    pub shard_args: ArgsHistory,

    /// Set once the shards removed from the cluster have been drained, their
    /// replica sets are deleted on the next merge.
    pub finalizing: bool,
}

impl Deployment {
    /// Merges the mongos processes, the config server and the shards of a
    /// sharded cluster, in this order.
    ///
    /// Shards removed from the cluster are not deleted right away. Their
    /// replica sets are put into the cluster's `draining` list first and only
    /// removed by a merge with [`ShardedClusterMergeOptions::finalizing`] set.
    /// Returns `true` while shards are scheduled for removal.
    pub fn merge_sharded_cluster(&mut self, options: &ShardedClusterMergeOptions) -> Result<bool> {
        for process in &options.mongos_processes {
            let process_type = process.process_type().context(InvalidDocumentSnafu)?;
            ensure!(process_type == ProcessType::Mongos, UnexpectedMongosProcessTypeSnafu {
                name: process.name().context(InvalidDocumentSnafu)?,
                cluster: &options.name,
            });
        }

        self.atomically(|deployment| {
            deployment.merge_mongos_processes(options)?;
            deployment.merge_config_server(options)?;
            deployment.merge_shards(options)
        })
    }

    fn merge_mongos_processes(&mut self, options: &ShardedClusterMergeOptions) -> Result<()> {
        let desired_names = options
            .mongos_processes
            .iter()
            .map(Process::name)
            .collect::<Result<HashSet<_>, _>>()
            .context(InvalidDocumentSnafu)?;

        let redundant = self
            .mongos_process_names(&options.name)?
            .into_iter()
            .filter(|name| !desired_names.contains(name.as_str()))
            .collect::<Vec<_>>();
        if !redundant.is_empty() {
            self.remove_processes(&redundant)
                .context(InvalidDocumentSnafu)?;
            debug!(
                cluster.name = %options.name,
                removed = ?redundant,
                "removed redundant mongos processes"
            );
        }

        let existing = self.mongos_process_names(&options.name)?.len();
        if existing > 0 && existing < options.mongos_processes.len() {
            self.copy_first_process_to_new_positions(&options.mongos_processes, existing)
                .context(InvalidDocumentSnafu)?;
        }

        for process in &options.mongos_processes {
            let mut process = process.clone();
            process.set_cluster(&options.name);
            self.merge_process(&process, &options.mongos_args)
                .context(InvalidDocumentSnafu)?;
        }
        Ok(())
    }

    fn merge_config_server(&mut self, options: &ShardedClusterMergeOptions) -> Result<()> {
        let config_server = with_cluster_role(&options.config_server, ClusterRole::ConfigServer)?;
        self.merge_replica_set_in_place(&config_server, &options.config_server_args)
    }

    fn merge_shards(&mut self, options: &ShardedClusterMergeOptions) -> Result<bool> {
        for shard in &options.shards {
            let shard = with_cluster_role(shard, ClusterRole::Shard)?;
            self.merge_replica_set_in_place(&shard, &options.shard_args)?;
        }

        let desired = ShardedCluster::new(
            &options.name,
            options.config_server.name(),
            options.shards.iter().map(ReplicaSetWithProcesses::name),
        );
        let Some(index) = self
            .sharded_clusters()
            .iter()
            .position(|cluster| cluster.name == options.name)
        else {
            self.sharded_clusters_mut().push(desired);
            debug!(cluster.name = %options.name, "added sharded cluster missing from deployment");
            return Ok(false);
        };

        let removed = self.sharded_clusters_mut()[index].merge_from(&desired);
        debug!(
            cluster.name = %options.name,
            removed_shards = ?removed,
            "merged sharded cluster into existing one"
        );
        self.handle_shards_removal(index, options.finalizing)
    }

    /// Drives the two phases of shard removal for the cluster at `index`.
    fn handle_shards_removal(&mut self, index: usize, finalizing: bool) -> Result<bool> {
        let removed = self.replica_sets_removed_from_cluster(&self.sharded_clusters()[index]);
        let cluster = &mut self.sharded_clusters_mut()[index];

        if finalizing {
            cluster.remove_draining();
        } else if !removed.is_empty() {
            cluster.add_to_draining(removed.iter().map(String::as_str));
            info!(
                cluster.name = cluster.name.as_str(),
                draining = ?cluster.draining(),
                "shards are scheduled for removal"
            );
            return Ok(true);
        }

        for replica_set in &removed {
            self.remove_replica_set_in_place(replica_set)?;
        }
        if !removed.is_empty() {
            info!(
                replica_sets = ?removed,
                "removed replica sets of shards removed from sharded cluster"
            );
        }
        Ok(false)
    }

    /// Replica sets that look like shards of `cluster` but are not referenced by it anymore.
    pub(crate) fn replica_sets_removed_from_cluster(&self, cluster: &ShardedCluster) -> Vec<String> {
        let referenced = cluster.replica_set_names();
        self.replica_sets()
            .iter()
            .map(|replica_set| replica_set.name.as_str())
            .filter(|name| !referenced.contains(name) && is_shard_of(&cluster.name, name))
            .map(str::to_owned)
            .collect()
    }

    /// Removes a sharded cluster with its shards, config server and mongos processes.
    pub fn remove_sharded_cluster_by_name(&mut self, name: &str) -> Result<()> {
        self.atomically(|deployment| {
            let index = deployment
                .sharded_clusters()
                .iter()
                .position(|cluster| cluster.name == name)
                .context(ShardedClusterNotFoundSnafu { name })?;
            let cluster = deployment.sharded_clusters_mut().remove(index);

            for replica_set in cluster.replica_set_names() {
                if deployment.replica_set(replica_set).is_some() {
                    deployment.remove_replica_set_in_place(replica_set)?;
                }
            }

            let mongos = deployment.mongos_process_names(name)?;
            deployment
                .remove_processes(&mongos)
                .context(InvalidDocumentSnafu)?;

            info!(cluster.name = name, shards = cluster.shards.len(), "removed sharded cluster");
            Ok(())
        })
    }

    /// Names of the mongos processes assigned to the cluster `name`.
    pub fn mongos_process_names(&self, name: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for process in self.processes() {
            let process_type = process.process_type().context(InvalidDocumentSnafu)?;
            if process_type == ProcessType::Mongos && process.cluster() == Some(name) {
                names.push(process.name().context(InvalidDocumentSnafu)?.to_owned());
            }
        }
        Ok(names)
    }

    /// Processes of the shard at `shard_index`, empty for unknown clusters or shards.
    pub fn shard_process_names(&self, name: &str, shard_index: usize) -> Result<Vec<String>> {
        let Some(shard) = self
            .sharded_cluster(name)
            .and_then(|cluster| cluster.shards.get(shard_index))
        else {
            return Ok(Vec::new());
        };
        self.replica_set_process_names(&shard.rs)
    }

    pub fn config_server_process_names(&self, name: &str) -> Result<Vec<String>> {
        match self.sharded_cluster(name) {
            Some(cluster) => self.replica_set_process_names(&cluster.config_server_replica),
            None => Ok(Vec::new()),
        }
    }

    /// All processes of a sharded cluster: shards, config server and mongos.
    pub(crate) fn sharded_cluster_process_names(&self, name: &str) -> Result<Vec<String>> {
        let Some(cluster) = self.sharded_cluster(name) else {
            return Ok(Vec::new());
        };

        let mut names = Vec::new();
        for shard in &cluster.shards {
            names.extend(self.replica_set_process_names(&shard.rs)?);
        }
        names.extend(self.config_server_process_names(name)?);
        names.extend(self.mongos_process_names(name)?);
        Ok(names)
    }
}

fn with_cluster_role(
    replica_set: &ReplicaSetWithProcesses,
    role: ClusterRole,
) -> Result<ReplicaSetWithProcesses> {
    let mut replica_set = replica_set.clone();
    for process in &mut replica_set.processes {
        process
            .set_cluster_role(role)
            .context(InvalidDocumentSnafu)?;
    }
    Ok(replica_set)
}

fn is_shard_of(cluster: &str, replica_set: &str) -> bool {
    SHARD_REPLICA_SET_REGEX
        .captures(replica_set)
        .is_some_and(|captures| &captures["cluster"] == cluster)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        deployment::{Error, ErrorKind, ResourceKind, tests::replica_set},
        document,
        options::AgentVersionOptions,
    };

    fn mongos(name: &str, count: usize) -> Vec<Process> {
        (0..count)
            .map(|i| {
                let name = format!("{name}-mongos-{i}");
                Process::new_mongos(&name, &format!("{name}.example.com"), "6.0.5")
            })
            .collect()
    }

    fn cluster(name: &str, shards: usize, mongos_count: usize) -> ShardedClusterMergeOptions {
        ShardedClusterMergeOptions {
            name: name.to_owned(),
            mongos_processes: mongos(name, mongos_count),
            config_server: replica_set(&format!("{name}-config"), 3),
            shards: (0..shards)
                .map(|i| replica_set(&format!("{name}-{i}"), 3))
                .collect(),
            ..ShardedClusterMergeOptions::default()
        }
    }

    fn merge(deployment: &mut Deployment, options: &ShardedClusterMergeOptions) -> bool {
        deployment
            .merge_sharded_cluster(options)
            .expect("sharded cluster merges")
    }

    fn shard_replica_sets(deployment: &Deployment) -> usize {
        deployment
            .replica_sets()
            .iter()
            .filter(|rs| !rs.name.ends_with("-config"))
            .count()
    }

    #[rstest]
    #[case("electron", "electron-0", true)]
    #[case("electron", "electron-12", true)]
    #[case("electron", "electron-config", false)]
    #[case("my-cluster", "my-cluster-1", true)]
    #[case("my", "my-cluster-1", false)]
    #[case("electron", "electron", false)]
    fn shard_replica_set_names(#[case] cluster: &str, #[case] replica_set: &str, #[case] expected: bool) {
        assert_eq!(is_shard_of(cluster, replica_set), expected);
    }

    #[test]
    fn new_cluster_is_added() {
        let mut deployment = Deployment::new();

        assert!(!merge(&mut deployment, &cluster("sc", 2, 2)));

        assert_eq!(deployment.processes().len(), 2 + 3 + 2 * 3);
        assert_eq!(deployment.replica_sets().len(), 3);
        let sharded = deployment.sharded_cluster("sc").expect("added");
        assert_eq!(sharded.config_server_replica, "sc-config");
        assert_eq!(sharded.replica_set_names(), ["sc-0", "sc-1", "sc-config"]);

        let config = deployment.process("sc-config-0").expect("valid").expect("exists");
        assert_eq!(config.cluster_role(), Some("configsvr"));
        let shard = deployment.process("sc-1-2").expect("valid").expect("exists");
        assert_eq!(shard.cluster_role(), Some("shardsvr"));
        let router = deployment.process("sc-mongos-1").expect("valid").expect("exists");
        assert_eq!(router.cluster(), Some("sc"));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut deployment = Deployment::new();
        merge(&mut deployment, &cluster("sc", 3, 2));
        let once = deployment.to_value().expect("serializable");

        merge(&mut deployment, &cluster("sc", 3, 2));

        assert!(document::semantically_equal(
            &once,
            &deployment.to_value().expect("serializable")
        ));
    }

    #[test]
    fn shards_are_removed_in_two_phases() {
        let mut deployment = Deployment::new();
        merge(&mut deployment, &cluster("sc", 5, 2));
        assert_eq!(shard_replica_sets(&deployment), 5);

        let mut options = cluster("sc", 3, 2);
        assert!(merge(&mut deployment, &options));
        assert!(merge(&mut deployment, &options));

        assert_eq!(shard_replica_sets(&deployment), 5);
        assert_eq!(deployment.replica_sets().len(), 6);
        assert_eq!(deployment.processes().len(), 2 + 3 + 5 * 3);
        let sharded = deployment.sharded_cluster("sc").expect("exists");
        assert_eq!(sharded.shards.len(), 3);
        assert_eq!(sharded.draining(), ["sc-3", "sc-4"]);
        assert_eq!(deployment.number_of_excess_processes("sc").expect("valid"), 0);

        options.finalizing = true;
        assert!(!merge(&mut deployment, &options));

        assert_eq!(shard_replica_sets(&deployment), 3);
        assert_eq!(deployment.replica_sets().len(), 4);
        assert_eq!(deployment.processes().len(), 2 + 3 + 3 * 3);
        let sharded = deployment.sharded_cluster("sc").expect("exists");
        assert!(sharded.draining.is_none());
        assert!(deployment.replica_set("sc-4").is_none());
        assert!(deployment.process("sc-4-0").expect("valid").is_none());
    }

    #[test]
    fn removed_shards_lose_their_agents() {
        let mut deployment = Deployment::new();
        merge(&mut deployment, &cluster("sc", 2, 1));
        deployment
            .add_monitoring_and_backup(&AgentVersionOptions::default(), None)
            .expect("valid");
        assert_eq!(deployment.backup_versions().len(), 1 + 3 + 2 * 3);

        let mut options = cluster("sc", 1, 1);
        merge(&mut deployment, &options);
        options.finalizing = true;
        merge(&mut deployment, &options);

        assert_eq!(deployment.backup_versions().len(), 1 + 3 + 3);
        assert_eq!(deployment.monitoring_versions().len(), 1 + 3 + 3);
    }

    #[test]
    fn mongos_scale_up_copies_ops_manager_changes() {
        let mut deployment = Deployment::new();
        merge(&mut deployment, &cluster("sc", 1, 2));
        let first = deployment
            .processes()
            .iter()
            .position(|p| p.name().ok() == Some("sc-mongos-0"))
            .expect("mongos exists");
        let mut patched = deployment.processes()[first].as_object().clone();
        patched.insert("logRotate".to_owned(), json!({"sizeThresholdMB": 1000}));
        deployment.processes_mut()[first] = Process::from(patched);

        merge(&mut deployment, &cluster("sc", 1, 3));

        let added = deployment.process("sc-mongos-2").expect("valid").expect("copied");
        assert_eq!(
            added.log_rotate().expect("valid").cloned().map(serde_json::Value::Object),
            Some(json!({"sizeThresholdMB": 1000}))
        );
        assert_eq!(added.hostname().expect("valid"), "sc-mongos-2.example.com");
        assert_eq!(added.cluster(), Some("sc"));
    }

    #[test]
    fn mongos_scale_down_removes_processes() {
        let mut deployment = Deployment::new();
        merge(&mut deployment, &cluster("sc", 1, 3));

        merge(&mut deployment, &cluster("sc", 1, 1));

        assert_eq!(deployment.mongos_process_names("sc").expect("valid"), ["sc-mongos-0"]);
    }

    #[test]
    fn mongod_in_mongos_list_is_rejected() {
        let mut deployment = Deployment::new();
        merge(&mut deployment, &cluster("sc", 1, 1));
        let before = deployment.clone();

        let mut options = cluster("sc", 2, 1);
        options
            .mongos_processes
            .push(Process::new_mongod("sc-mongos-1", "sc-mongos-1.example.com", "6.0.5"));
        let error = deployment
            .merge_sharded_cluster(&options)
            .expect_err("mongod is no mongos");

        assert!(matches!(
            &error,
            Error::UnexpectedMongosProcessType { name, cluster } if name == "sc-mongos-1" && cluster == "sc"
        ));
        assert_eq!(error.kind(), ErrorKind::Logical);
        assert_eq!(deployment, before);
    }

    #[test]
    fn process_names_of_cluster() {
        let mut deployment = Deployment::new();
        merge(&mut deployment, &cluster("sc", 2, 1));

        assert_eq!(deployment.shard_process_names("sc", 1).expect("valid"), [
            "sc-1-0", "sc-1-1", "sc-1-2"
        ]);
        assert!(deployment.shard_process_names("sc", 2).expect("valid").is_empty());
        assert_eq!(
            deployment
                .process_names(ResourceKind::ShardedCluster, "sc")
                .expect("valid")
                .len(),
            2 * 3 + 3 + 1
        );
        assert!(
            deployment
                .process_belongs_to_resource("sc-config-2", "sc")
                .expect("valid")
        );
    }

    #[test]
    fn remove_sharded_cluster() {
        let mut deployment = Deployment::new();
        merge(&mut deployment, &cluster("sc", 2, 2));
        crate::deployment::tests::merge_replica_set(&mut deployment, "other", 1);

        deployment
            .remove_sharded_cluster_by_name("sc")
            .expect("cluster exists");

        assert!(deployment.sharded_clusters().is_empty());
        assert_eq!(deployment.all_process_names().expect("valid"), ["other-0"]);
        assert_eq!(deployment.replica_sets().len(), 1);

        let error = deployment
            .remove_sharded_cluster_by_name("sc")
            .expect_err("already removed");
        assert!(matches!(error, Error::ShardedClusterNotFound { .. }));
    }
}
