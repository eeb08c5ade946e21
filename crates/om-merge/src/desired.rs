//! Desired state files, read as YAML (or JSON, which is valid YAML).

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use om_automation::{
    automation_config::{AgentSsl, Auth, Ldap},
    deployment::ShardedClusterMergeOptions,
    document::{self, Object},
    process::{ArgsHistory, Process, ProcessType},
    prometheus::PrometheusOptions,
    replica_set::{MemberOptions, ReplicaSet, ReplicaSetWithProcesses},
    tls::{CA_FILE_PATH, PEM_KEY_FILE_PATH, TlsMode},
};
use serde::{Deserialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read desired state from {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse desired state from {path:?}"))]
    ParseFile {
        source: serde_yaml::Error,
        path: PathBuf,
    },
}

pub async fn load<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let contents = tokio::fs::read(path).await.context(ReadFileSnafu { path })?;
    serde_yaml::from_slice(&contents).context(ParseFileSnafu { path })
}

/// Settings shared by every process of a resource.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSettings {
    pub version: String,
    pub feature_compatibility_version: Option<String>,
    pub tls: Option<TlsSettings>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub mode: TlsMode,
    pub certificate_key_file: Option<String>,
    pub ca_file_path: Option<String>,
}

impl ProcessSettings {
    /// The CA the agents are pointed at, `None` without TLS.
    pub fn ca_file_path(&self) -> Option<&str> {
        self.tls
            .as_ref()
            .filter(|tls| tls.mode != TlsMode::Disabled)
            .map(|tls| tls.ca_file_path.as_deref().unwrap_or(CA_FILE_PATH))
    }

    fn build(&self, process_type: ProcessType, host: &Host, args: &Object) -> Result<Process, document::Error> {
        let process = match process_type {
            ProcessType::Mongod => Process::new_mongod(&host.name, &host.hostname, &self.version),
            ProcessType::Mongos => Process::new_mongos(&host.name, &host.hostname, &self.version),
        };
        let mut process = process.with_args(args)?;
        if let Some(fcv) = &self.feature_compatibility_version {
            process = process.with_feature_compatibility_version(fcv);
        }
        if let Some(tls) = &self.tls {
            let key_file = tls.certificate_key_file.as_deref().unwrap_or(PEM_KEY_FILE_PATH);
            process.configure_tls(tls.mode, key_file)?;
        }
        Ok(process)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub name: String,
    pub hostname: String,

    /// Replica set member settings, ignored for standalones and mongos.
    #[serde(default)]
    pub member: MemberOptions,
}

/// Processes of one part of a resource and the `args2_6` they are started with.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    #[serde(default)]
    pub args: Object,

    /// The `args` of the previous run. Leaves missing from `args` are removed.
    #[serde(default)]
    pub previous_args: Object,

    #[serde(default)]
    pub hosts: Vec<Host>,
}

impl Component {
    pub fn history(&self) -> ArgsHistory {
        ArgsHistory {
            current: self.args.clone(),
            previous: self.previous_args.clone(),
        }
    }

    fn processes(&self, settings: &ProcessSettings, process_type: ProcessType) -> Result<Vec<Process>, document::Error> {
        self.hosts
            .iter()
            .map(|host| settings.build(process_type, host, &self.args))
            .collect()
    }

    /// Builds the replica set. With `existing_ids`, member ids are allocated
    /// for a replica set spanning several clusters.
    fn replica_set(
        &self,
        name: &str,
        settings: &ProcessSettings,
        existing_ids: Option<&IndexMap<String, i64>>,
    ) -> Result<ReplicaSetWithProcesses, document::Error> {
        let processes = self.processes(settings, ProcessType::Mongod)?;
        let options = self
            .hosts
            .iter()
            .map(|host| host.member.clone())
            .collect::<Vec<_>>();
        let replica_set = ReplicaSet::new(name, &settings.version);
        match existing_ids {
            Some(ids) => ReplicaSetWithProcesses::new_multi_cluster(replica_set, processes, &options, ids),
            None => ReplicaSetWithProcesses::new(replica_set, processes, &options),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Standalone {
    #[serde(flatten)]
    pub settings: ProcessSettings,

    #[serde(flatten)]
    pub host: Host,

    #[serde(default)]
    pub args: Object,

    #[serde(default)]
    pub previous_args: Object,
}

impl Standalone {
    pub fn process(&self) -> Result<Process, document::Error> {
        self.settings.build(ProcessType::Mongod, &self.host, &self.args)
    }

    pub fn history(&self) -> ArgsHistory {
        ArgsHistory {
            current: self.args.clone(),
            previous: self.previous_args.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    pub name: String,

    #[serde(flatten)]
    pub settings: ProcessSettings,

    #[serde(flatten)]
    pub members: Component,

    /// Keeps the member ids already in use and allocates new ones above them.
    #[serde(default)]
    pub multi_cluster: bool,
}

impl ReplicaSetSpec {
    pub fn replica_set(&self, existing_ids: Option<&IndexMap<String, i64>>) -> Result<ReplicaSetWithProcesses, document::Error> {
        self.members.replica_set(&self.name, &self.settings, existing_ids)
    }
}

/// A sharded cluster. The config server replica set is named
/// `<name>-config`, shard replica sets `<name>-<index>`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardedClusterSpec {
    pub name: String,

    #[serde(flatten)]
    pub settings: ProcessSettings,

    pub mongos: Component,
    pub config_server: Component,

    #[serde(default)]
    pub shards: Vec<Component>,
}

impl ShardedClusterSpec {
    pub fn config_server_name(&self) -> String {
        format!("{name}-config", name = self.name)
    }

    pub fn shard_name(&self, index: usize) -> String {
        format!("{name}-{index}", name = self.name)
    }

    pub fn merge_options(&self, finalizing: bool) -> Result<ShardedClusterMergeOptions, document::Error> {
        let shards = self
            .shards
            .iter()
            .enumerate()
            .map(|(index, shard)| shard.replica_set(&self.shard_name(index), &self.settings, None))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ShardedClusterMergeOptions {
            name: self.name.clone(),
            mongos_processes: self.mongos.processes(&self.settings, ProcessType::Mongos)?,
            config_server: self.config_server.replica_set(
                &self.config_server_name(),
                &self.settings,
                None,
            )?,
            shards,
            mongos_args: self.mongos.history(),
            config_server_args: self.config_server.history(),
            shard_args: self.shards.first().map(Component::history).unwrap_or_default(),
            finalizing,
        })
    }
}

/// Changes to the deployment wide sections: `auth`, `tls`, `ldap`, `prometheus` and `options`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    pub auth: Option<Auth>,
    pub tls: Option<AgentSsl>,
    pub ldap: Option<Ldap>,

    /// Keys to remove, written as `<section>.<key>`, for example `tls.CAFilePath`.
    #[serde(default)]
    pub unset: Vec<String>,

    #[serde(default)]
    pub remove_users: Vec<UserRef>,

    /// Replaces the `prometheus` section.
    pub prometheus: Option<PrometheusOptions>,

    /// Directory the agents download MongoDB binaries into.
    pub download_base: Option<String>,

    /// Where monitoring and backup agents download their binaries from.
    pub agent_base_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    pub user: String,
    pub db: String,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use om_automation::automation_config::Field;

    use super::*;

    #[test]
    fn replica_set_spec() {
        let spec: ReplicaSetSpec = serde_yaml::from_str(indoc! {"
            name: rs0
            version: 6.0.5
            tls:
              mode: requireTLS
            args:
              net:
                maxIncomingConnections: 200
            hosts:
              - name: rs0-0
                hostname: rs0-0.rs0-svc.mongodb.svc.cluster.local
              - name: rs0-1
                hostname: rs0-1.rs0-svc.mongodb.svc.cluster.local
                member:
                  votes: 0
                  priority: 0
        "})
        .expect("valid desired state");

        let desired = spec.replica_set(None).expect("valid processes");

        assert_eq!(spec.settings.ca_file_path(), Some(CA_FILE_PATH));
        assert_eq!(desired.processes.len(), 2);
        assert!(desired.processes[0].is_tls_enabled().expect("valid process"));
        assert_eq!(desired.processes[1].replica_set_name(), Some("rs0"));
        assert_eq!(desired.replica_set.members[1].votes(), 0);
        assert_eq!(desired.replica_set.voting_members(), 1);
    }

    #[test]
    fn sharded_cluster_spec() {
        let spec: ShardedClusterSpec = serde_yaml::from_str(indoc! {"
            name: sc
            version: 7.0.2
            featureCompatibilityVersion: '7.0'
            mongos:
              hosts:
                - {name: sc-mongos-0, hostname: sc-mongos-0.example.com}
            configServer:
              hosts:
                - {name: sc-config-0, hostname: sc-config-0.example.com}
            shards:
              - hosts:
                  - {name: sc-0-0, hostname: sc-0-0.example.com}
              - hosts:
                  - {name: sc-1-0, hostname: sc-1-0.example.com}
        "})
        .expect("valid desired state");

        let options = spec.merge_options(true).expect("valid processes");

        assert!(options.finalizing);
        assert_eq!(options.config_server.name(), "sc-config");
        assert_eq!(
            options.shards.iter().map(ReplicaSetWithProcesses::name).collect::<Vec<_>>(),
            ["sc-0", "sc-1"]
        );
        assert_eq!(
            options.mongos_processes[0].process_type().expect("valid"),
            ProcessType::Mongos
        );
        assert_eq!(
            options.shards[1].processes[0]
                .feature_compatibility_version()
                .expect("valid"),
            Some("7.0")
        );
        assert_eq!(spec.settings.ca_file_path(), None);
    }

    #[test]
    fn config_spec() {
        let spec: ConfigSpec = serde_yaml::from_str(indoc! {"
            auth:
              disabled: false
              autoAuthMechanisms: [SCRAM-SHA-256]
              usersWanted:
                - user: app
                  db: admin
                  roles:
                    - {role: readWrite, db: app}
            tls:
              clientCertificateMode: REQUIRED
            unset: [tls.CAFilePath]
            removeUsers:
              - {user: legacy, db: admin}
            prometheus:
              username: prom
              passwordHash: hash
              passwordSalt: salt
              port: 9999
            downloadBase: /var/lib/mongodb-mms-automation
        "})
        .expect("valid desired state");

        let auth = spec.auth.expect("auth is set");
        assert!(auth.is_enabled());
        assert!(auth.has_user("app", "admin"));
        assert_eq!(auth.auto_user, Field::Unset);
        assert!(spec.tls.is_some());
        assert_eq!(spec.unset, ["tls.CAFilePath"]);
        assert_eq!(spec.remove_users, [UserRef {
            user: "legacy".to_owned(),
            db: "admin".to_owned()
        }]);
        let prometheus = spec.prometheus.expect("prometheus is set");
        assert_eq!(prometheus.port, Some(9999));
        assert_eq!(prometheus.tls_pem_file, None);
        assert_eq!(spec.download_base.as_deref(), Some("/var/lib/mongodb-mms-automation"));
        assert_eq!(spec.agent_base_url, None);
    }

    #[tokio::test]
    async fn json_files_are_loaded() {
        let dir = tempfile::tempdir().expect("temporary directory");
        let path = dir.path().join("standalone.json");
        tokio::fs::write(
            &path,
            r#"{"name": "single", "hostname": "single.example.com", "version": "6.0.5"}"#,
        )
        .await
        .expect("file is written");

        let standalone: Standalone = load(&path).await.expect("valid file");

        assert_eq!(standalone.host.hostname, "single.example.com");
        assert!(standalone.args.is_empty());
    }

    #[tokio::test]
    async fn missing_files_are_reported() {
        let dir = tempfile::tempdir().expect("temporary directory");

        let result = load::<Standalone>(&dir.path().join("missing.yaml")).await;

        assert!(matches!(result, Err(Error::ReadFile { .. })));
    }
}
