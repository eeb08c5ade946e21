//! The automation config [`Deployment`] and the merge operations on it.
//!
//! A deployment is read from Ops Manager, the operator's desired processes,
//! replica sets and sharded clusters are merged into it and the result is
//! written back. Everything the operator does not own is preserved.
//!
//! Operations touching more than one entity work on a copy of the document
//! and only replace the deployment once every step succeeded, so a failed
//! merge never leaves a partially merged document behind.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info};

use crate::{
    document::{self, DeserializeSnafu, Object, SerializeSnafu},
    process::{ArgsHistory, Process},
    replica_set::{ReplicaSet, ReplicaSetWithProcesses},
    sharded_cluster::ShardedCluster,
    tls::{CA_FILE_PATH, ClientCertificateMode},
};

mod agents;
mod sharding;

pub use sharding::ShardedClusterMergeOptions;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("the automation config is malformed"))]
    InvalidDocument { source: document::Error },

    #[snafu(display("replica set {name:?} does not exist"))]
    ReplicaSetNotFound { name: String },

    #[snafu(display("process {name:?} does not exist"))]
    ProcessNotFound { name: String },

    #[snafu(display("sharded cluster {name:?} does not exist"))]
    ShardedClusterNotFound { name: String },

    #[snafu(display("replica set {replica_set:?} has no members named {members:?}"))]
    MembersNotFound {
        replica_set: String,
        members: Vec<String>,
    },

    #[snafu(display(
        "process {name:?} of sharded cluster {cluster:?} must have processType \"mongos\""
    ))]
    UnexpectedMongosProcessType { name: String, cluster: String },

    #[snafu(display("failed to parse version {version:?} of process {name:?}"))]
    InvalidVersion {
        source: semver::Error,
        name: String,
        version: String,
    },
}

/// Distinguishes defects in the document from merges that were refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The document (or a desired entity) does not have the expected shape.
    InvalidDocument,

    /// The document is well-formed, but the requested change cannot be applied to it.
    Logical,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDocument { .. } | Self::InvalidVersion { .. } => ErrorKind::InvalidDocument,
            Self::ReplicaSetNotFound { .. }
            | Self::ProcessNotFound { .. }
            | Self::ShardedClusterNotFound { .. }
            | Self::MembersNotFound { .. }
            | Self::UnexpectedMongosProcessType { .. } => ErrorKind::Logical,
        }
    }
}

/// The kinds of resources processes can belong to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ResourceKind {
    Standalone,
    ReplicaSet,
    ShardedCluster,
}

/// A custom role from the top-level `roles` list.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CustomRole {
    pub role: String,
    pub db: String,

    #[serde(flatten)]
    pub other: Object,
}

/// The automation config document.
///
/// The collections the merge engine works with are decoded into typed views,
/// every other top-level key is kept as is.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Deployment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    processes: Option<Vec<Process>>,

    #[serde(rename = "replicaSets", default, skip_serializing_if = "Option::is_none")]
    replica_sets: Option<Vec<ReplicaSet>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    sharding: Option<Vec<ShardedCluster>>,

    #[serde(rename = "monitoringVersions", default, skip_serializing_if = "Option::is_none")]
    monitoring_versions: Option<Vec<Object>>,

    #[serde(rename = "backupVersions", default, skip_serializing_if = "Option::is_none")]
    backup_versions: Option<Vec<Object>>,

    #[serde(flatten)]
    other: Object,
}

impl Deployment {
    /// Creates the document for a project that has no automation config yet.
    pub fn new() -> Self {
        let mut other = Object::new();
        other.insert("auth".to_owned(), json!({}));
        other.insert(
            "tls".to_owned(),
            json!({
                "clientCertificateMode": ClientCertificateMode::Optional.as_ref(),
                "CAFilePath": CA_FILE_PATH,
            }),
        );

        Self {
            processes: Some(Vec::new()),
            replica_sets: Some(Vec::new()),
            sharding: Some(Vec::new()),
            monitoring_versions: Some(Vec::new()),
            backup_versions: Some(Vec::new()),
            other,
        }
    }

    pub fn from_value(value: Value) -> Result<Self, document::Error> {
        serde_json::from_value(value).context(DeserializeSnafu { what: "deployment" })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, document::Error> {
        serde_json::from_slice(bytes).context(DeserializeSnafu { what: "deployment" })
    }

    /// Returns the canonical JSON form of the document.
    pub fn to_value(&self) -> Result<Value, document::Error> {
        serde_json::to_value(self).context(SerializeSnafu { what: "deployment" })
    }

    pub fn processes(&self) -> &[Process] {
        self.processes.as_deref().unwrap_or_default()
    }

    pub fn processes_mut(&mut self) -> &mut Vec<Process> {
        self.processes.get_or_insert_with(Vec::new)
    }

    pub fn replica_sets(&self) -> &[ReplicaSet] {
        self.replica_sets.as_deref().unwrap_or_default()
    }

    pub fn replica_sets_mut(&mut self) -> &mut Vec<ReplicaSet> {
        self.replica_sets.get_or_insert_with(Vec::new)
    }

    pub fn sharded_clusters(&self) -> &[ShardedCluster] {
        self.sharding.as_deref().unwrap_or_default()
    }

    pub fn sharded_clusters_mut(&mut self) -> &mut Vec<ShardedCluster> {
        self.sharding.get_or_insert_with(Vec::new)
    }

    pub fn monitoring_versions(&self) -> &[Object] {
        self.monitoring_versions.as_deref().unwrap_or_default()
    }

    pub fn backup_versions(&self) -> &[Object] {
        self.backup_versions.as_deref().unwrap_or_default()
    }

    /// Top-level keys not modelled by [`Deployment`], such as `auth`, `tls` or `options`.
    pub fn other(&self) -> &Object {
        &self.other
    }

    pub fn section(&self, key: &str) -> Result<Option<&Object>, document::Error> {
        document::get_map(&self.other, key)
    }

    pub fn section_mut(&mut self, key: &str) -> Result<Option<&mut Object>, document::Error> {
        document::get_map_mut(&mut self.other, key)
    }

    pub(crate) fn set_section(&mut self, key: &str, section: Object) {
        self.set_other(key, Value::Object(section));
    }

    pub(crate) fn set_other(&mut self, key: &str, value: Value) {
        self.other.insert(key.to_owned(), value);
    }

    pub fn process(&self, name: &str) -> Result<Option<&Process>, document::Error> {
        for process in self.processes() {
            if process.name()? == name {
                return Ok(Some(process));
            }
        }
        Ok(None)
    }

    fn process_position(&self, name: &str) -> Result<Option<usize>, document::Error> {
        for (index, process) in self.processes().iter().enumerate() {
            if process.name()? == name {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    pub fn replica_set(&self, name: &str) -> Option<&ReplicaSet> {
        self.replica_sets().iter().find(|rs| rs.name == name)
    }

    pub fn replica_set_mut(&mut self, name: &str) -> Option<&mut ReplicaSet> {
        self.replica_sets_mut().iter_mut().find(|rs| rs.name == name)
    }

    pub fn sharded_cluster(&self, name: &str) -> Option<&ShardedCluster> {
        self.sharded_clusters()
            .iter()
            .find(|cluster| cluster.name == name)
    }

    /// The config version maintained by Ops Manager, `-1` for documents that were never saved.
    pub fn version(&self) -> i64 {
        self.other
            .get("version")
            .and_then(document::as_i64)
            .unwrap_or(-1)
    }

    /// Version of the agents, set once Ops Manager updated them for the first time.
    pub fn agent_version(&self) -> Option<&str> {
        document::read_path(&self.other, &["agentVersion", "name"]).and_then(Value::as_str)
    }

    pub fn roles(&self) -> Result<Vec<CustomRole>, document::Error> {
        match self.other.get("roles") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(roles) => {
                serde_json::from_value(roles.clone()).context(DeserializeSnafu { what: "roles" })
            }
        }
    }

    pub fn set_roles(&mut self, roles: &[CustomRole]) -> Result<(), document::Error> {
        let roles = serde_json::to_value(roles).context(SerializeSnafu { what: "roles" })?;
        self.other.insert("roles".to_owned(), roles);
        Ok(())
    }

    /// Runs `operation` on a copy of the deployment and keeps the result only if it succeeds.
    pub(crate) fn atomically<T>(&mut self, operation: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mut draft = self.clone();
        let output = operation(&mut draft)?;
        *self = draft;
        Ok(output)
    }

    /// Merges a standalone process. An existing process of the same name is
    /// merged via [`Process::merge_from`], otherwise the process is added.
    pub fn merge_standalone(&mut self, desired: &Process, args: &ArgsHistory) -> Result<()> {
        self.atomically(|deployment| {
            deployment
                .merge_process(desired, args)
                .context(InvalidDocumentSnafu)
        })
    }

    pub(crate) fn merge_process(&mut self, desired: &Process, args: &ArgsHistory) -> Result<(), document::Error> {
        let name = desired.name()?;
        match self.process_position(name)? {
            Some(index) => {
                self.processes_mut()[index].merge_from(desired, args)?;
                debug!(process.name = name, "merged process into existing one");
            }
            None => {
                self.processes_mut().push(desired.clone());
                debug!(process.name = name, "added process missing from deployment");
            }
        }
        Ok(())
    }

    /// Merges a replica set and its processes.
    ///
    /// Members dropped from the replica set are removed from the deployment
    /// together with their processes and agent registrations. Afterwards at
    /// most [`MAX_VOTING_MEMBERS`](crate::replica_set::MAX_VOTING_MEMBERS)
    /// members keep their vote.
    pub fn merge_replica_set(&mut self, desired: &ReplicaSetWithProcesses, args: &ArgsHistory) -> Result<()> {
        self.atomically(|deployment| deployment.merge_replica_set_in_place(desired, args))
    }

    pub(crate) fn merge_replica_set_in_place(
        &mut self,
        desired: &ReplicaSetWithProcesses,
        args: &ArgsHistory,
    ) -> Result<()> {
        let name = desired.name();

        let observed_members = self
            .replica_set(name)
            .map(|rs| rs.members.len())
            .filter(|observed| desired.replica_set.members.len() > *observed);
        if let Some(observed_members) = observed_members {
            self.copy_first_process_to_new_positions(&desired.processes, observed_members)
                .context(InvalidDocumentSnafu)?;
        }

        for process in &desired.processes {
            self.merge_process(process, args)
                .context(InvalidDocumentSnafu)?;
        }

        match self.replica_set_mut(name) {
            None => {
                self.replica_sets_mut().push(desired.replica_set.clone());
                debug!(replica_set.name = name, "added replica set missing from deployment");
            }
            Some(observed) => {
                let removed = observed
                    .merge_from(&desired.replica_set)
                    .context(InvalidDocumentSnafu)?;
                debug!(replica_set.name = name, "merged replica set into existing one");

                if !removed.is_empty() {
                    self.remove_processes(&removed)
                        .context(InvalidDocumentSnafu)?;
                    debug!(
                        replica_set.name = name,
                        removed = ?removed,
                        "removed processes that are no longer replica set members"
                    );
                }
            }
        }

        if let Some(replica_set) = self.replica_set_mut(name) {
            replica_set.limit_voting_members();
        }
        Ok(())
    }

    /// Removes a process together with its agent registrations.
    pub fn remove_process_by_name(&mut self, name: &str) -> Result<()> {
        let exists = self
            .process(name)
            .context(InvalidDocumentSnafu)?
            .is_some();
        ensure!(exists, ProcessNotFoundSnafu { name });

        self.atomically(|deployment| {
            deployment
                .remove_processes(&[name.to_owned()])
                .context(InvalidDocumentSnafu)
        })
    }

    /// Removes a replica set, its processes and their agent registrations.
    pub fn remove_replica_set_by_name(&mut self, name: &str) -> Result<()> {
        self.atomically(|deployment| deployment.remove_replica_set_in_place(name))
    }

    pub(crate) fn remove_replica_set_in_place(&mut self, name: &str) -> Result<()> {
        let index = self
            .replica_sets()
            .iter()
            .position(|rs| rs.name == name)
            .context(ReplicaSetNotFoundSnafu { name })?;

        let replica_set = self.replica_sets_mut().remove(index);
        let members = replica_set
            .member_names()
            .context(InvalidDocumentSnafu)?
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        self.remove_processes(&members)
            .context(InvalidDocumentSnafu)?;

        info!(replica_set.name = name, members = members.len(), "removed replica set");
        Ok(())
    }

    /// Removes processes by name, skipping unknown names.
    pub(crate) fn remove_processes(&mut self, names: &[String]) -> Result<(), document::Error> {
        self.remove_monitoring_and_backup(names)?;

        let mut kept = Vec::with_capacity(self.processes().len());
        for process in self.processes() {
            let name = process.name()?;
            if !names.iter().any(|removed| removed == name) {
                kept.push(process.clone());
            }
        }
        *self.processes_mut() = kept;
        Ok(())
    }

    /// Takes away the votes and priority of the given replica set members.
    pub fn mark_rs_members_unvoted(&mut self, replica_set: &str, members: &[&str]) -> Result<()> {
        let rs = self
            .replica_set_mut(replica_set)
            .context(ReplicaSetNotFoundSnafu { name: replica_set })?;

        let existing = rs
            .member_names()
            .context(InvalidDocumentSnafu)?
            .into_iter()
            .collect::<HashSet<_>>();
        let missing = members
            .iter()
            .filter(|member| !existing.contains(**member))
            .map(|member| (*member).to_owned())
            .collect::<Vec<_>>();
        ensure!(missing.is_empty(), MembersNotFoundSnafu {
            replica_set,
            members: missing,
        });

        for name in members {
            if let Some(member) = rs.find_member_mut(name).context(InvalidDocumentSnafu)? {
                member.set_votes(0);
                member.set_priority(0.0);
            }
        }
        Ok(())
    }

    pub fn disable_processes(&mut self, names: &[&str]) -> Result<()> {
        let mut positions = Vec::with_capacity(names.len());
        for name in names {
            let position = self
                .process_position(name)
                .context(InvalidDocumentSnafu)?
                .context(ProcessNotFoundSnafu { name: *name })?;
            positions.push(position);
        }

        let processes = self.processes_mut();
        for position in positions {
            processes[position].set_disabled(true);
        }
        Ok(())
    }

    pub fn all_process_names(&self) -> Result<Vec<&str>> {
        self.processes()
            .iter()
            .map(Process::name)
            .collect::<Result<_, _>>()
            .context(InvalidDocumentSnafu)
    }

    /// Names of the processes belonging to the resource `name`.
    pub fn process_names(&self, kind: ResourceKind, name: &str) -> Result<Vec<String>> {
        match kind {
            ResourceKind::Standalone => Ok(vec![name.to_owned()]),
            ResourceKind::ReplicaSet => self.replica_set_process_names(name),
            ResourceKind::ShardedCluster => self.sharded_cluster_process_names(name),
        }
    }

    fn replica_set_process_names(&self, name: &str) -> Result<Vec<String>> {
        let Some(replica_set) = self.replica_set(name) else {
            return Ok(Vec::new());
        };
        Ok(replica_set
            .member_names()
            .context(InvalidDocumentSnafu)?
            .into_iter()
            .map(str::to_owned)
            .collect())
    }

    pub fn process_belongs_to_resource(&self, process: &str, resource: &str) -> Result<bool> {
        for kind in [
            ResourceKind::ShardedCluster,
            ResourceKind::ReplicaSet,
            ResourceKind::Standalone,
        ] {
            if self
                .process_names(kind, resource)?
                .iter()
                .any(|name| name == process)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Counts the processes in the deployment that do not belong to `resource`.
    ///
    /// Replica sets of shards that are being removed from the sharded
    /// cluster `resource` count as belonging to it.
    pub fn number_of_excess_processes(&self, resource: &str) -> Result<usize> {
        let mut excess: usize = 0;
        for process in self.all_process_names()? {
            if !self.process_belongs_to_resource(process, resource)? {
                excess += 1;
            }
        }

        if let Some(cluster) = self.sharded_cluster(resource) {
            for replica_set in self.replica_sets_removed_from_cluster(cluster) {
                excess = excess.saturating_sub(self.replica_set_process_names(&replica_set)?.len());
            }
        }
        Ok(excess)
    }

    /// Member ids of the replica set `name`, keyed by process name.
    pub fn replica_set_process_ids(&self, name: &str) -> Result<IndexMap<String, i64>> {
        let Some(replica_set) = self.replica_set(name) else {
            return Ok(IndexMap::new());
        };

        let mut ids = IndexMap::new();
        for member in &replica_set.members {
            let host = member.host().context(InvalidDocumentSnafu)?;
            let id = member.id().context(InvalidDocumentSnafu)?;
            ids.insert(host.to_owned(), id);
        }
        Ok(ids)
    }

    /// The lowest major version of all processes, taking the feature
    /// compatibility version into account where it is set. `0` for an empty deployment.
    pub fn minimum_major_version(&self) -> Result<u64> {
        let mut minimum: Option<semver::Version> = None;
        for process in self.processes() {
            let name = process.name().context(InvalidDocumentSnafu)?;
            let fcv = process
                .feature_compatibility_version()
                .context(InvalidDocumentSnafu)?
                .filter(|fcv| !fcv.is_empty());
            let version = match fcv {
                Some(fcv) => format!("{}.0", fcv.trim_end_matches("-ent")),
                None => process
                    .version()
                    .context(InvalidDocumentSnafu)?
                    .trim_end_matches("-ent")
                    .to_owned(),
            };

            let parsed = semver::Version::parse(&version).context(InvalidVersionSnafu {
                name,
                version: &version,
            })?;
            if minimum.as_ref().is_none_or(|minimum| parsed <= *minimum) {
                minimum = Some(parsed);
            }
        }
        Ok(minimum.map_or(0, |version| version.major))
    }

    pub fn all_processes_are_tls_enabled(&self) -> Result<bool> {
        for process in self.processes() {
            if !process.is_tls_enabled().context(InvalidDocumentSnafu)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn any_process_has_internal_cluster_authentication(&self) -> bool {
        self.processes()
            .iter()
            .any(Process::has_internal_cluster_authentication)
    }

    /// Configures the deployment wide TLS settings. Without a CA file TLS is disabled.
    pub fn configure_tls(&mut self, ca_file_path: Option<&str>) -> Result<()> {
        match ca_file_path {
            Some(ca_file_path) => {
                document::read_or_create_map(&mut self.other, "tls")
                    .context(InvalidDocumentSnafu)?
                    .insert("CAFilePath".to_owned(), json!(ca_file_path));
            }
            None => {
                let mut tls = Object::new();
                tls.insert(
                    "clientCertificateMode".to_owned(),
                    json!(ClientCertificateMode::Optional.as_ref()),
                );
                self.set_section("tls", tls);
            }
        }
        Ok(())
    }

    /// Whether applying the desired TLS setting turns TLS off for a deployment that has it on.
    pub fn tls_configuration_will_be_disabled(&self, tls_enabled: bool) -> bool {
        let currently_enabled = document::read_path(&self.other, &["tls", "CAFilePath"])
            .is_some_and(|ca_file| !ca_file.is_null());
        currently_enabled && !tls_enabled
    }

    /// Enables internal cluster authentication for the named processes. Unknown names are skipped.
    pub fn configure_internal_cluster_authentication(
        &mut self,
        names: &[&str],
        cluster_auth_mode: &str,
        cluster_file: Option<&str>,
    ) -> Result<()> {
        for name in names {
            let Some(position) = self.process_position(name).context(InvalidDocumentSnafu)? else {
                continue;
            };
            self.processes_mut()[position]
                .configure_cluster_auth_mode(cluster_auth_mode, cluster_file)
                .context(InvalidDocumentSnafu)?;
        }
        Ok(())
    }

    /// The cluster file of the first of the named processes present in the deployment.
    pub fn internal_cluster_file_path(&self, names: &[&str]) -> Result<Option<String>> {
        for name in names {
            let Some(process) = self.process(name).context(InvalidDocumentSnafu)? else {
                continue;
            };
            if !process.is_tls_enabled().context(InvalidDocumentSnafu)? {
                return Ok(None);
            }
            return Ok(process.cluster_file().map(str::to_owned));
        }
        Ok(None)
    }

    /// Points the named processes at a new cluster file, but only if they
    /// already use a different one. While recovering the file is always written.
    pub fn set_internal_cluster_file_path_if_changed(
        &mut self,
        names: &[&str],
        cluster_file: &str,
        cluster_auth_mode: &str,
        is_recovering: bool,
    ) -> Result<()> {
        let current = self.internal_cluster_file_path(names)?;
        let changed = current
            .as_deref()
            .is_some_and(|current| !current.is_empty() && current != cluster_file);
        if is_recovering || changed {
            debug!(
                cluster_file.previous = ?current,
                cluster_file.new = cluster_file,
                "updating internal cluster file"
            );
            self.configure_internal_cluster_authentication(names, cluster_auth_mode, Some(cluster_file))?;
        }
        Ok(())
    }
}
