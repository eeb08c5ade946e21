use serde::{Deserialize, Serialize};

/// Default location of the CA file inside the database containers.
pub const CA_FILE_PATH: &str = "/mongodb-automation/ca.pem";

/// Default location of the server certificate and key.
pub const PEM_KEY_FILE_PATH: &str = "/mongodb-automation/server.pem";

/// Directory holding one `<process>-pem` file per process for x509 internal cluster authentication.
pub const INTERNAL_CLUSTER_AUTH_PATH: &str = "/mongodb-automation/cluster-auth/";

/// Legacy name of the certificate key file setting (`net.ssl.PEMKeyFile`, deprecated since MongoDB 4.2).
pub const LEGACY_KEY_FILE_FIELD: &str = "PEMKeyFile";

pub const KEY_FILE_FIELD: &str = "certificateKeyFile";

/// Value of `args2_6.net.tls.mode`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    strum::AsRefStr,
    strum::Display,
    strum::EnumString,
)]
pub enum TlsMode {
    #[serde(rename = "requireTLS")]
    #[strum(serialize = "requireTLS")]
    Require,

    #[serde(rename = "preferTLS")]
    #[strum(serialize = "preferTLS")]
    Prefer,

    #[serde(rename = "allowTLS")]
    #[strum(serialize = "allowTLS")]
    Allow,

    #[default]
    #[serde(rename = "disabled")]
    #[strum(serialize = "disabled")]
    Disabled,
}

/// Value of the deployment wide `tls.clientCertificateMode`.
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
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ClientCertificateMode {
    #[default]
    Optional,
    Required,
}
