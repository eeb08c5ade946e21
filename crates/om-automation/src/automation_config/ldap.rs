use serde::Deserialize;

use super::{
    Field, Result,
    overlay::{Overlay, overlay_fields},
};
use crate::document::Object;

/// The `ldap` section, read by the agents to configure LDAP authentication
/// and authorization on every process.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ldap {
    /// Comma separated `host:port` list.
    #[serde(default)]
    pub servers: Field<String>,

    /// `tls` or `none`.
    #[serde(default)]
    pub transport_security: Field<String>,

    #[serde(rename = "validateLDAPServerConfig", default)]
    pub validate_ldap_server_config: Field<bool>,

    #[serde(default)]
    pub bind_query_user: Field<String>,

    #[serde(default)]
    pub bind_query_password: Field<String>,

    /// PEM encoded CA the agents write to disk for `transportSecurity: tls`.
    #[serde(rename = "CAFileContents", default)]
    pub ca_file_contents: Field<String>,

    #[serde(default)]
    pub authz_query_template: Field<String>,

    #[serde(rename = "userToDNMapping", default)]
    pub user_to_dn_mapping: Field<String>,

    #[serde(rename = "timeoutMS", default)]
    pub timeout_ms: Field<i64>,

    #[serde(default)]
    pub user_cache_invalidation_interval: Field<i64>,

    #[serde(default)]
    pub bind_method: Field<String>,

    #[serde(default)]
    pub bind_sasl_mechanisms: Field<String>,
}

overlay_fields!(Ldap {
    servers => "servers",
    transport_security => "transportSecurity",
    validate_ldap_server_config => "validateLDAPServerConfig",
    bind_query_user => "bindQueryUser",
    bind_query_password => "bindQueryPassword",
    ca_file_contents => "CAFileContents",
    authz_query_template => "authzQueryTemplate",
    user_to_dn_mapping => "userToDNMapping",
    timeout_ms => "timeoutMS",
    user_cache_invalidation_interval => "userCacheInvalidationInterval",
    bind_method => "bindMethod",
    bind_sasl_mechanisms => "bindSaslMechanisms",
});

impl Ldap {
    pub fn update_from(&mut self, other: &Self) {
        self.update_fields_from(other);
    }
}

impl Overlay for Ldap {
    fn apply_to(&self, section: &mut Object) -> Result<()> {
        self.apply_fields(section)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_names_are_read() {
        let ldap: Ldap = serde_json::from_value(json!({
            "servers": "ldap.example.com:636",
            "transportSecurity": "tls",
            "validateLDAPServerConfig": true,
            "CAFileContents": "-----BEGIN CERTIFICATE-----",
            "userToDNMapping": "[]",
            "timeoutMS": 10000,
            "userCacheInvalidationInterval": 30,
            "bindSaslMechanisms": null
        }))
        .expect("valid ldap section");

        assert_eq!(ldap.transport_security.as_str(), Some("tls"));
        assert_eq!(ldap.validate_ldap_server_config, Field::Set(true));
        assert_eq!(ldap.user_to_dn_mapping.as_str(), Some("[]"));
        assert_eq!(ldap.timeout_ms, Field::Set(10_000));
        assert_eq!(ldap.user_cache_invalidation_interval, Field::Set(30));
        assert_eq!(ldap.bind_sasl_mechanisms, Field::Unset);
        assert!(ldap.ca_file_contents.as_set().is_some());
    }

    #[test]
    fn update_from_keeps_unset_fields() {
        let mut ldap = Ldap {
            servers: "old:636".to_owned().into(),
            bind_query_user: "cn=admin".to_owned().into(),
            ..Ldap::default()
        };
        let mut other = Ldap {
            servers: "new:636".to_owned().into(),
            ..Ldap::default()
        };
        assert!(other.delete_field("bindQueryUser"));

        ldap.update_from(&other);

        assert_eq!(ldap.servers.as_str(), Some("new:636"));
        assert_eq!(ldap.bind_query_user, Field::Delete);
    }
}
