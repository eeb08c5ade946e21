//! Typed overlays for the deployment wide sections of the automation config.
//!
//! [`AutomationConfig`] wraps a [`Deployment`] and exposes its `auth`, `tls`
//! and `ldap` sections as typed structs. Changes made to the typed structs are
//! written back with [`AutomationConfig::apply`], which only touches the keys
//! the overlays model.
//!
//! The top-level settings a headless agent needs (`version`, `options`,
//! `mongoDbVersions` and the agents' `baseUrl`) are written directly.

use educe::Educe;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use snafu::{ResultExt, Snafu};

use crate::{
    deployment::Deployment,
    document::{self, Object},
    tls::ClientCertificateMode,
};

mod auth;
mod field;
mod headless;
mod ldap;
pub(crate) mod overlay;

pub use auth::{
    AUTOMATION_AGENT_KEY_FILE_PATH, AUTOMATION_AGENT_USER, AUTOMATION_AGENT_WINDOWS_KEY_FILE_PATH,
    Auth, DEFAULT_AUTO_AUTH_MECHANISM, MongoDbUser, Role, ScramShaCreds,
};
pub use field::Field;
pub use headless::{BuildConfig, MongoDbVersionConfig};
pub use ldap::Ldap;
pub use overlay::Overlay;

use overlay::overlay_fields;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to serialize field {key:?}"))]
    SerializeField {
        source: serde_json::Error,
        key: String,
    },

    #[snafu(display("failed to read the {section:?} section"))]
    DeserializeSection {
        source: serde_json::Error,
        section: &'static str,
    },

    #[snafu(display("the automation config is malformed"))]
    InvalidDocument { source: document::Error },
}

const AUTH_SECTION: &str = "auth";
const TLS_SECTION: &str = "tls";
const LDAP_SECTION: &str = "ldap";

/// TLS settings the agents use when talking to the deployment (the `tls` section).
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct AgentSsl {
    #[serde(rename = "CAFilePath", default)]
    pub ca_file_path: Field<String>,

    #[serde(rename = "autoPEMKeyFilePath", default)]
    pub auto_pem_key_file_path: Field<String>,

    #[serde(rename = "clientCertificateMode", default)]
    pub client_certificate_mode: Field<ClientCertificateMode>,
}

overlay_fields!(AgentSsl {
    ca_file_path => "CAFilePath",
    auto_pem_key_file_path => "autoPEMKeyFilePath",
    client_certificate_mode => "clientCertificateMode",
});

impl AgentSsl {
    pub fn update_from(&mut self, other: &Self) {
        self.update_fields_from(other);
    }
}

impl Overlay for AgentSsl {
    fn apply_to(&self, section: &mut Object) -> Result<()> {
        self.apply_fields(section)
    }
}

/// A [`Deployment`] together with typed views of its `auth`, `tls` and `ldap` sections.
///
/// Two configs compare equal when their typed sections are equal, the
/// wrapped deployment is ignored.
#[derive(Educe)]
#[educe(Clone, Debug, PartialEq)]
pub struct AutomationConfig {
    #[educe(PartialEq(ignore))]
    deployment: Deployment,

    pub auth: Auth,
    pub agent_ssl: AgentSsl,
    pub ldap: Option<Ldap>,
}

impl AutomationConfig {
    /// Wraps a fresh deployment of a project that was never configured.
    pub fn new(deployment: Deployment) -> Self {
        Self {
            deployment,
            auth: Auth::default_for_new_project(),
            agent_ssl: AgentSsl::default(),
            ldap: None,
        }
    }

    /// Reads the typed sections out of `deployment`.
    pub fn from_deployment(deployment: Deployment) -> Result<Self> {
        let auth = read_section(&deployment, AUTH_SECTION)?.unwrap_or_default();
        let agent_ssl = read_section(&deployment, TLS_SECTION)?.unwrap_or_default();
        let ldap = read_section(&deployment, LDAP_SECTION)?;

        Ok(Self {
            deployment,
            auth,
            agent_ssl,
            ldap,
        })
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Writes the typed sections into the wrapped deployment.
    ///
    /// A section missing from the deployment is only created when its overlay
    /// carries something besides the defaults. Nothing is written if any
    /// section fails.
    pub fn apply(&mut self) -> Result<()> {
        let mut deployment = self.deployment.clone();
        self.write_sections(&mut deployment)?;
        self.deployment = deployment;
        Ok(())
    }

    /// Applies the typed sections and returns the resulting deployment.
    pub fn into_deployment(mut self) -> Result<Deployment> {
        self.apply()?;
        Ok(self.deployment)
    }

    /// Compares the typed sections as they would end up on the wire.
    ///
    /// Both sides are applied to a copy of their deployment and read back, so
    /// that a [`Field::Delete`] and an absent key, or a `None` user and a
    /// missing one, compare equal.
    pub fn equals_without_deployment(&self, other: &Self) -> Result<bool> {
        Ok(self.normalized()? == other.normalized()?)
    }

    fn normalized(&self) -> Result<Self> {
        let mut deployment = self.deployment.clone();
        self.write_sections(&mut deployment)?;
        Self::from_deployment(deployment)
    }

    fn write_sections(&self, deployment: &mut Deployment) -> Result<()> {
        write_section(deployment, AUTH_SECTION, &self.auth, self.auth != Auth::default())?;
        write_section(
            deployment,
            TLS_SECTION,
            &self.agent_ssl,
            self.agent_ssl != AgentSsl::default(),
        )?;
        if let Some(ldap) = &self.ldap {
            write_section(deployment, LDAP_SECTION, ldap, true)?;
        }
        Ok(())
    }
}

fn read_section<T: DeserializeOwned>(deployment: &Deployment, section: &'static str) -> Result<Option<T>> {
    let Some(object) = deployment.section(section).context(InvalidDocumentSnafu)? else {
        return Ok(None);
    };
    serde_json::from_value(Value::Object(object.clone()))
        .map(Some)
        .context(DeserializeSectionSnafu { section })
}

fn write_section(
    deployment: &mut Deployment,
    key: &str,
    overlay: &impl Overlay,
    create_if_missing: bool,
) -> Result<()> {
    match deployment.section_mut(key).context(InvalidDocumentSnafu)? {
        Some(section) => overlay.apply_to(section),
        None if create_if_missing => {
            let mut section = Object::new();
            overlay.apply_to(&mut section)?;
            deployment.set_section(key, section);
            Ok(())
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;
    use crate::tls::CA_FILE_PATH;

    fn automation_config() -> AutomationConfig {
        let deployment = Deployment::from_slice(
            indoc! {r#"
                {
                    "processes": [],
                    "replicaSets": [],
                    "sharding": [],
                    "auth": {
                        "disabled": false,
                        "authoritativeSet": false,
                        "autoUser": "mms-automation-agent",
                        "autoAuthMechanisms": ["SCRAM-SHA-256"],
                        "autoAuthMechanism": "SCRAM-SHA-256",
                        "usersWanted": [
                            {
                                "user": "alice",
                                "db": "admin",
                                "mechanisms": [],
                                "roles": [{"role": "root", "db": "admin"}],
                                "authenticationRestrictions": [],
                                "scramSha256Creds": {
                                    "iterationCount": 15000,
                                    "salt": "c2FsdA==",
                                    "serverKey": "c2VydmVy",
                                    "storedKey": "c3RvcmVk"
                                },
                                "omOnly": "kept"
                            }
                        ],
                        "usersDeleted": []
                    },
                    "tls": {
                        "CAFilePath": "/mongodb-automation/ca.pem",
                        "clientCertificateMode": "OPTIONAL"
                    },
                    "options": {"downloadBase": "/var/lib/mongodb-mms-automation"}
                }
            "#}
            .as_bytes(),
        )
        .expect("valid deployment");
        AutomationConfig::from_deployment(deployment).expect("valid sections")
    }

    fn section(config: &AutomationConfig, key: &str) -> Value {
        Value::Object(
            config
                .deployment()
                .section(key)
                .expect("valid document")
                .cloned()
                .unwrap_or_default(),
        )
    }

    #[test]
    fn sections_are_read() {
        let config = automation_config();

        assert!(config.auth.is_enabled());
        assert_eq!(config.auth.auto_auth_mechanism.as_str(), Some("SCRAM-SHA-256"));
        assert_eq!(config.agent_ssl.ca_file_path.as_str(), Some(CA_FILE_PATH));
        assert_eq!(
            config.agent_ssl.client_certificate_mode,
            Field::Set(ClientCertificateMode::Optional)
        );
        assert_eq!(config.ldap, None);

        let alice = config.auth.get_user("alice", "admin").expect("alice is read").1;
        assert_eq!(alice.roles, [Some(Role::new("root", "admin"))]);
        assert_eq!(
            alice.scram_sha256_creds.as_ref().map(|creds| creds.iteration_count),
            Some(15000)
        );
    }

    #[test]
    fn deleted_ca_file_path_is_removed() {
        let mut config = automation_config();
        config.agent_ssl.ca_file_path = Field::Delete;

        config.apply().expect("applies");

        assert_eq!(section(&config, "tls"), json!({"clientCertificateMode": "OPTIONAL"}));
    }

    #[test]
    fn unknown_keys_survive() {
        let mut config = automation_config();
        config.auth.auto_auth_mechanisms = Field::Set(vec!["MONGODB-X509".to_owned()]);

        let deployment = config.into_deployment().expect("applies");
        let auth = deployment.section("auth").expect("valid").expect("present");

        assert_eq!(auth.get("usersDeleted"), Some(&json!([])));
        assert_eq!(auth["usersWanted"][0]["omOnly"], json!("kept"));
        assert_eq!(auth.get("autoAuthMechanisms"), Some(&json!(["MONGODB-X509"])));
        assert_eq!(
            deployment.other().get("options"),
            Some(&json!({"downloadBase": "/var/lib/mongodb-mms-automation"}))
        );
    }

    #[test]
    fn cleared_scram_credentials_are_removed() {
        let mut config = automation_config();
        let mut alice = config.auth.get_user("alice", "admin").expect("present").1.clone();
        alice.scram_sha256_creds = None;
        config.auth.ensure_user(alice);

        config.apply().expect("applies");

        let users = section(&config, "auth")["usersWanted"].clone();
        assert_eq!(
            users,
            json!([{
                "user": "alice",
                "db": "admin",
                "mechanisms": [],
                "roles": [{"role": "root", "db": "admin"}],
                "authenticationRestrictions": [],
                "omOnly": "kept"
            }])
        );
    }

    #[test]
    fn ldap_is_merged_into_existing_section() {
        let mut deployment = Deployment::new();
        deployment.set_section(
            "ldap",
            document::tests::object(json!({"servers": "old:636", "bindMethod": "simple", "omOnly": 1})),
        );
        let mut config = AutomationConfig::from_deployment(deployment).expect("valid");

        let ldap = config.ldap.get_or_insert_with(Ldap::default);
        ldap.servers = "ldap.example.com:636".to_owned().into();
        ldap.timeout_ms = 10_000.into();
        ldap.bind_method = Field::Delete;
        config.apply().expect("applies");

        assert_eq!(
            section(&config, "ldap"),
            json!({"servers": "ldap.example.com:636", "omOnly": 1, "timeoutMS": 10000})
        );
    }

    #[test]
    fn missing_sections_are_only_created_when_set() {
        let mut config = AutomationConfig::from_deployment(Deployment::default()).expect("valid");

        config.apply().expect("applies");
        assert_eq!(config.deployment().section("auth").expect("valid"), None);
        assert_eq!(config.deployment().section("ldap").expect("valid"), None);

        config.auth.enable();
        config.apply().expect("applies");
        assert_eq!(section(&config, "auth"), json!({"disabled": false}));
    }

    #[test]
    fn new_project_auth_is_written() {
        let config = AutomationConfig::new(Deployment::new());

        let deployment = config.into_deployment().expect("applies");

        assert_eq!(
            deployment.section("auth").expect("valid").and_then(|auth| auth.get("autoUser")),
            Some(&json!(AUTOMATION_AGENT_USER))
        );
        assert_eq!(
            deployment.section("auth").expect("valid").and_then(|auth| auth.get("usersWanted")),
            Some(&json!([]))
        );
    }

    #[test]
    fn equality_ignores_the_deployment() {
        let left = automation_config();
        let mut right = automation_config();
        right.deployment = Deployment::new();

        assert_eq!(left, right);

        right.auth.auto_user = "someone-else".to_owned().into();
        assert_ne!(left, right);
    }

    #[test]
    fn equality_compares_the_wire_form() {
        let left = automation_config();
        let mut right = automation_config();
        right.agent_ssl.auto_pem_key_file_path = Field::Delete;

        assert_ne!(left, right);
        assert!(left.equals_without_deployment(&right).expect("applies"));

        right.agent_ssl.ca_file_path = Field::Delete;
        assert!(!left.equals_without_deployment(&right).expect("applies"));
    }

    #[test]
    fn applying_read_sections_changes_nothing() {
        let mut config = automation_config();
        let before = config.deployment().to_value().expect("serializable");

        config.apply().expect("applies");

        assert_eq!(config.deployment().to_value().expect("serializable"), before);
    }
}
