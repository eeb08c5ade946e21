//! The [`Process`] view over an entry of the `processes` list.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::OptionExt;

use crate::{
    document::{self, InvalidValueSnafu, Object},
    tls::{INTERNAL_CLUSTER_AUTH_PATH, KEY_FILE_FIELD, LEGACY_KEY_FILE_FIELD, TlsMode},
};

type Result<T, E = document::Error> = std::result::Result<T, E>;

pub const DEFAULT_PORT: u16 = 27017;
pub const DEFAULT_DB_PATH: &str = "/data";
pub const DEFAULT_LOG_PATH: &str = "/var/log/mongodb-mms-automation/mongodb.log";
pub const AUTH_SCHEMA_VERSION: i64 = 5;

const ARGS: &str = "args2_6";

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::AsRefStr, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ProcessType {
    Mongod,
    Mongos,
}

/// Value of `args2_6.sharding.clusterRole`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::AsRefStr, strum::Display, strum::EnumString)]
pub enum ClusterRole {
    #[strum(serialize = "configsvr")]
    ConfigServer,

    #[strum(serialize = "shardsvr")]
    Shard,
}

/// The operator-owned `args2_6` trees of the current and of the previous
/// reconciliation. Leaves that only exist in `previous` are removed on merge.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ArgsHistory {
    pub current: Object,
    pub previous: Object,
}

/// A single mongod or mongos process of the deployment.
///
/// Only the fields this crate manages are accessed, everything else is kept
/// as sent by Ops Manager.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Process(Object);

impl From<Object> for Process {
    fn from(object: Object) -> Self {
        Self(object)
    }
}

impl From<Process> for Object {
    fn from(process: Process) -> Self {
        process.0
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{name:?} (hostname: {hostname}, version: {version})",
            name = display_field(&self.0, "name"),
            hostname = display_field(&self.0, "hostname"),
            version = display_field(&self.0, "version")
        )
    }
}

impl Process {
    /// Creates a mongod process storing its data in [`DEFAULT_DB_PATH`] and
    /// logging to [`DEFAULT_LOG_PATH`].
    pub fn new_mongod(name: &str, hostname: &str, version: &str) -> Self {
        Self::new(ProcessType::Mongod, name, hostname, version, json!({
            "net": {"port": DEFAULT_PORT},
            "storage": {"dbPath": DEFAULT_DB_PATH},
            "systemLog": {"destination": "file", "path": DEFAULT_LOG_PATH},
        }))
    }

    pub fn new_mongos(name: &str, hostname: &str, version: &str) -> Self {
        Self::new(ProcessType::Mongos, name, hostname, version, json!({
            "net": {"port": DEFAULT_PORT},
            "systemLog": {"destination": "file", "path": DEFAULT_LOG_PATH},
        }))
    }

    fn new(process_type: ProcessType, name: &str, hostname: &str, version: &str, args: Value) -> Self {
        let mut process = Object::new();
        process.insert("name".to_owned(), json!(name));
        process.insert("hostname".to_owned(), json!(hostname));
        process.insert("processType".to_owned(), json!(process_type.as_ref()));
        process.insert("version".to_owned(), json!(version));
        process.insert("authSchemaVersion".to_owned(), json!(AUTH_SCHEMA_VERSION));
        if let Some(fcv) = derive_feature_compatibility_version(version) {
            process.insert("featureCompatibilityVersion".to_owned(), json!(fcv));
        }
        process.insert(ARGS.to_owned(), args);
        Self(process)
    }

    /// Deep merges user provided mongod configuration into `args2_6`.
    pub fn with_args(mut self, config: &Object) -> Result<Self> {
        document::deep_merge(self.args_mut()?, config);
        Ok(self)
    }

    pub fn with_feature_compatibility_version(mut self, fcv: &str) -> Self {
        self.0
            .insert("featureCompatibilityVersion".to_owned(), json!(fcv));
        self
    }

    pub fn as_object(&self) -> &Object {
        &self.0
    }

    pub fn name(&self) -> Result<&str> {
        document::require_str(&self.0, "name")
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.0.insert("name".to_owned(), json!(name));
    }

    pub fn hostname(&self) -> Result<&str> {
        document::require_str(&self.0, "hostname")
    }

    pub fn version(&self) -> Result<&str> {
        document::require_str(&self.0, "version")
    }

    pub fn process_type(&self) -> Result<ProcessType> {
        let value = document::require_str(&self.0, "processType")?;
        ProcessType::from_str(value).ok().context(InvalidValueSnafu {
            field: "processType",
            value,
        })
    }

    pub fn feature_compatibility_version(&self) -> Result<Option<&str>> {
        document::get_str(&self.0, "featureCompatibilityVersion")
    }

    pub fn is_disabled(&self) -> bool {
        self.0
            .get("disabled")
            .and_then(Value::as_bool)
            .unwrap_or_default()
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.0.insert("disabled".to_owned(), json!(disabled));
    }

    pub fn alias(&self) -> Option<&str> {
        self.0.get("alias").and_then(Value::as_str)
    }

    pub(crate) fn remove_alias(&mut self) {
        self.0.remove("alias");
    }

    /// Name of the sharded cluster a mongos belongs to.
    pub fn cluster(&self) -> Option<&str> {
        self.0.get("cluster").and_then(Value::as_str)
    }

    pub fn set_cluster(&mut self, cluster_name: &str) {
        self.0.insert("cluster".to_owned(), json!(cluster_name));
    }

    pub fn log_rotate(&self) -> Result<Option<&Object>> {
        document::get_map(&self.0, "logRotate")
    }

    pub fn args(&self) -> Result<Option<&Object>> {
        document::get_map(&self.0, ARGS)
    }

    pub fn args_mut(&mut self) -> Result<&mut Object> {
        document::read_or_create_map(&mut self.0, ARGS)
    }

    fn arg(&self, path: &[&str]) -> Option<&Value> {
        self.0
            .get(ARGS)
            .and_then(Value::as_object)
            .and_then(|args| document::read_path(args, path))
    }

    fn set_arg(&mut self, section: &str, key: &str, value: Value) -> Result<()> {
        document::read_or_create_map(self.args_mut()?, section)?.insert(key.to_owned(), value);
        Ok(())
    }

    pub fn replica_set_name(&self) -> Option<&str> {
        self.arg(&["replication", "replSetName"])
            .and_then(Value::as_str)
    }

    pub fn set_replica_set_name(&mut self, name: &str) -> Result<()> {
        self.set_arg("replication", "replSetName", json!(name))
    }

    pub fn cluster_role(&self) -> Option<&str> {
        self.arg(&["sharding", "clusterRole"]).and_then(Value::as_str)
    }

    pub fn set_cluster_role(&mut self, role: ClusterRole) -> Result<()> {
        self.set_arg("sharding", "clusterRole", json!(role.as_ref()))
    }

    pub fn db_path(&self) -> Option<&str> {
        self.arg(&["storage", "dbPath"]).and_then(Value::as_str)
    }

    pub fn set_db_path(&mut self, db_path: &str) -> Result<()> {
        self.set_arg("storage", "dbPath", json!(db_path))
    }

    pub fn log_path(&self) -> Option<&str> {
        self.arg(&["systemLog", "path"]).and_then(Value::as_str)
    }

    pub fn set_log_path(&mut self, log_path: &str) -> Result<()> {
        let system_log = document::read_or_create_map(self.args_mut()?, "systemLog")?;
        system_log.insert("destination".to_owned(), json!("file"));
        system_log.insert("path".to_owned(), json!(log_path));
        Ok(())
    }

    pub fn wired_tiger_cache(&self) -> Option<f64> {
        self.arg(&["storage", "wiredTiger", "engineConfig", "cacheSizeGB"])
            .and_then(document::as_f64)
    }

    /// Sets the WiredTiger cache size. Ignored for mongos processes, which have no storage engine.
    pub fn set_wired_tiger_cache(&mut self, cache_size_gb: f64) -> Result<()> {
        if self.process_type()? != ProcessType::Mongod {
            return Ok(());
        }
        let storage = document::read_or_create_map(self.args_mut()?, "storage")?;
        let wired_tiger = document::read_or_create_map(storage, "wiredTiger")?;
        document::read_or_create_map(wired_tiger, "engineConfig")?
            .insert("cacheSizeGB".to_owned(), json!(cache_size_gb));
        Ok(())
    }

    /// Returns `args2_6.net.tls`, if present.
    pub fn tls_config(&self) -> Result<Option<&Object>> {
        let Some(args) = self.args()? else {
            return Ok(None);
        };
        let Some(net) = document::get_map(args, "net")? else {
            return Ok(None);
        };
        document::get_map(net, "tls")
    }

    pub fn ensure_tls_config(&mut self) -> Result<&mut Object> {
        let net = document::read_or_create_map(self.args_mut()?, "net")?;
        document::read_or_create_map(net, "tls")
    }

    /// Sets the TLS mode and points the process at its certificate key file.
    ///
    /// An existing legacy `PEMKeyFile` entry is kept as the only key setting,
    /// unless both names are present, in which case `certificateKeyFile` wins.
    pub fn configure_tls(&mut self, mode: TlsMode, key_file: &str) -> Result<()> {
        let tls = self.ensure_tls_config()?;
        tls.insert("mode".to_owned(), json!(mode.as_ref()));

        if mode == TlsMode::Disabled {
            tls.remove(KEY_FILE_FIELD);
            tls.remove(LEGACY_KEY_FILE_FIELD);
            return Ok(());
        }

        let has_legacy = tls.contains_key(LEGACY_KEY_FILE_FIELD);
        let has_current = tls.contains_key(KEY_FILE_FIELD);
        if has_legacy && !has_current {
            tls.insert(LEGACY_KEY_FILE_FIELD.to_owned(), json!(key_file));
        } else {
            tls.insert(KEY_FILE_FIELD.to_owned(), json!(key_file));
            tls.remove(LEGACY_KEY_FILE_FIELD);
        }
        Ok(())
    }

    /// A process counts as TLS enabled as soon as it has a certificate key file configured.
    pub fn is_tls_enabled(&self) -> Result<bool> {
        Ok(self.tls_config()?.is_some_and(|tls| {
            tls.contains_key(KEY_FILE_FIELD) || tls.contains_key(LEGACY_KEY_FILE_FIELD)
        }))
    }

    pub fn cluster_file(&self) -> Option<&str> {
        self.arg(&["net", "tls", "clusterFile"])
            .and_then(Value::as_str)
    }

    pub fn cluster_auth_mode(&self) -> Option<&str> {
        self.arg(&["security", "clusterAuthMode"])
            .and_then(Value::as_str)
    }

    pub fn has_internal_cluster_authentication(&self) -> bool {
        self.cluster_auth_mode().is_some_and(|mode| !mode.is_empty())
    }

    /// Enables x509 internal cluster authentication. Other modes are ignored.
    ///
    /// Without an explicit `cluster_file` the per-process file below
    /// [`INTERNAL_CLUSTER_AUTH_PATH`] is used.
    pub fn configure_cluster_auth_mode(
        &mut self,
        cluster_auth_mode: &str,
        cluster_file: Option<&str>,
    ) -> Result<()> {
        if !cluster_auth_mode.eq_ignore_ascii_case("x509") {
            return Ok(());
        }

        let cluster_file = match cluster_file {
            Some(path) if !path.is_empty() => path.to_owned(),
            _ => format!("{INTERNAL_CLUSTER_AUTH_PATH}{name}-pem", name = self.name()?),
        };
        self.set_arg("security", "clusterAuthMode", json!("x509"))?;
        self.ensure_tls_config()?
            .insert("clusterFile".to_owned(), json!(cluster_file));
        Ok(())
    }

    /// Merges the operator's view of this process into the one read from Ops Manager.
    ///
    /// Top level keys of `desired` replace the observed ones, `args2_6` is
    /// merged recursively and cleaned from leaves the operator stopped
    /// setting. The TLS section is fully owned by the operator: it is
    /// replaced when `desired` sets a mode and removed otherwise.
    pub fn merge_from(&mut self, desired: &Self, history: &ArgsHistory) -> Result<()> {
        for (key, value) in &desired.0 {
            if key != ARGS {
                self.0.insert(key.clone(), value.clone());
            }
        }

        if let Some(desired_args) = desired.args()? {
            document::deep_merge(self.args_mut()?, desired_args);
        }
        document::remove_fields_based_on_desired_and_previous(
            self.args_mut()?,
            &history.current,
            &history.previous,
        );

        let desired_tls = desired
            .tls_config()?
            .and_then(|tls| tls.get("mode").map(|mode| (tls, mode)));
        match desired_tls {
            Some((desired_tls, mode)) => {
                let tls = self.ensure_tls_config()?;
                for (key, value) in desired_tls {
                    tls.insert(key.clone(), value.clone());
                }
                if tls.contains_key(LEGACY_KEY_FILE_FIELD) && tls.contains_key(KEY_FILE_FIELD) {
                    tls.remove(LEGACY_KEY_FILE_FIELD);
                }
                if mode.as_str() == Some(TlsMode::Disabled.as_ref()) {
                    tls.remove(LEGACY_KEY_FILE_FIELD);
                    tls.remove(KEY_FILE_FIELD);
                }
            }
            None => {
                if let Some(net) = document::get_map_mut(self.args_mut()?, "net")? {
                    net.remove("tls");
                }
            }
        }
        Ok(())
    }
}

fn display_field<'a>(object: &'a Object, key: &str) -> &'a str {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
}

/// Derives `major.minor` from a MongoDB version such as `6.0.5-ent`.
fn derive_feature_compatibility_version(version: &str) -> Option<String> {
    let version = semver::Version::parse(version.trim_end_matches("-ent")).ok()?;
    Some(format!("{}.{}", version.major, version.minor))
}
