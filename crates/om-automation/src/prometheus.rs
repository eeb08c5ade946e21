//! The `prometheus` section, which makes the automation agent serve metrics
//! of the deployment.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use tracing::info;

use crate::{
    deployment::Deployment,
    document::{self, DeserializeSnafu, SerializeSnafu},
};

pub const PROMETHEUS_SECTION: &str = "prometheus";

/// The agent binds the metrics endpoint to all interfaces.
pub const LISTEN_ADDRESS: &str = "0.0.0.0";

pub const DEFAULT_PORT: u16 = 9216;

pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Directory the PEM files for serving metrics over HTTPS are mounted to.
pub const SECRET_VOLUME_MOUNT_PATH: &str = "/var/lib/mongodb-automation/secrets/prometheus";

const MODE: &str = "opsManager";

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::AsRefStr,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

/// How the metrics endpoint should be exposed.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusOptions {
    /// User scrapers authenticate as with basic auth.
    pub username: String,

    /// Hash and salt of the scrape user's password, as computed for SCRAM-SHA-256.
    pub password_hash: String,
    pub password_salt: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub metrics_path: Option<String>,

    /// File name of the PEM below [`SECRET_VOLUME_MOUNT_PATH`]. Metrics are
    /// served over HTTPS when it is set.
    #[serde(default)]
    pub tls_pem_file: Option<String>,
}

/// The `prometheus` section as the agents read it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prometheus {
    pub enabled: bool,
    pub username: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password_hash: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password_salt: String,

    pub scheme: Scheme,

    #[serde(default)]
    pub tls_pem_path: String,

    #[serde(default)]
    pub tls_pem_password: String,

    pub mode: String,
    pub listen_address: String,
    pub metrics_path: String,
}

impl Prometheus {
    /// An enabled endpoint serving plain HTTP on the default port and path.
    pub fn new(username: &str) -> Self {
        Self {
            enabled: true,
            username: username.to_owned(),
            password_hash: String::new(),
            password_salt: String::new(),
            scheme: Scheme::Http,
            tls_pem_path: String::new(),
            tls_pem_password: String::new(),
            mode: MODE.to_owned(),
            listen_address: format!("{LISTEN_ADDRESS}:{DEFAULT_PORT}"),
            metrics_path: DEFAULT_METRICS_PATH.to_owned(),
        }
    }

    pub fn from_options(options: &PrometheusOptions) -> Self {
        let mut prometheus = Self::new(&options.username);

        if let Some(pem_file) = &options.tls_pem_file {
            prometheus.tls_pem_path = format!("{SECRET_VOLUME_MOUNT_PATH}/{pem_file}");
            prometheus.scheme = Scheme::Https;
        }
        prometheus.password_hash.clone_from(&options.password_hash);
        prometheus.password_salt.clone_from(&options.password_salt);

        if let Some(port) = options.port.filter(|port| *port > 0) {
            prometheus.listen_address = format!("{LISTEN_ADDRESS}:{port}");
        }
        if let Some(metrics_path) = options.metrics_path.as_deref().filter(|path| !path.is_empty()) {
            metrics_path.clone_into(&mut prometheus.metrics_path);
        }
        prometheus
    }
}

impl Deployment {
    /// Replaces the `prometheus` section with one built from `options` and returns it.
    pub fn configure_prometheus(&mut self, options: &PrometheusOptions) -> Result<Prometheus, document::Error> {
        let prometheus = Prometheus::from_options(options);
        let value = serde_json::to_value(&prometheus).context(SerializeSnafu {
            what: PROMETHEUS_SECTION,
        })?;
        self.set_other(PROMETHEUS_SECTION, value);

        info!(
            prometheus.scheme = %prometheus.scheme,
            prometheus.listen_address = %prometheus.listen_address,
            "configured prometheus endpoint"
        );
        Ok(prometheus)
    }

    pub fn prometheus(&self) -> Result<Option<Prometheus>, document::Error> {
        match self.other().get(PROMETHEUS_SECTION) {
            None | Some(Value::Null) => Ok(None),
            Some(section) => serde_json::from_value(section.clone())
                .map(Some)
                .context(DeserializeSnafu {
                    what: PROMETHEUS_SECTION,
                }),
        }
    }
}
