//! The `auth` section: deployment authentication and the users managed by the agents.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    Field, Result,
    overlay::{self, Overlay, apply_field, null_as_default, overlay_fields, write_optional, write_value},
};
use crate::document::{self, Object};

/// Where the automation agent keeps its key file inside the container.
pub const AUTOMATION_AGENT_KEY_FILE_PATH: &str = "/var/lib/mongodb-mms-automation/authentication/keyfile";

pub const AUTOMATION_AGENT_WINDOWS_KEY_FILE_PATH: &str = "%SystemDrive%\\MMSAutomation\\versions\\keyfile";

pub const AUTOMATION_AGENT_USER: &str = "mms-automation-agent";

pub const DEFAULT_AUTO_AUTH_MECHANISM: &str = "MONGODB-CR";

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Auth {
    /// Users the agents create on every deployment of the project. A `None`
    /// entry removes the user stored at that position.
    #[serde(rename = "usersWanted", default)]
    pub users: Field<Vec<Option<MongoDbUser>>>,

    #[serde(default)]
    pub disabled: Field<bool>,

    /// Whether users not listed in `usersWanted` are removed from the deployments.
    #[serde(rename = "authoritativeSet", default)]
    pub authoritative_set: Field<bool>,

    /// Mechanisms the automation agent is able to authenticate with.
    #[serde(rename = "autoAuthMechanisms", default)]
    pub auto_auth_mechanisms: Field<Vec<String>>,

    /// The mechanism the automation agent currently authenticates with.
    #[serde(rename = "autoAuthMechanism", default)]
    pub auto_auth_mechanism: Field<String>,

    #[serde(rename = "deploymentAuthMechanisms", default)]
    pub deployment_auth_mechanisms: Field<Vec<String>>,

    /// The automation agent user. With x509 this is the subject of the agent certificate.
    #[serde(rename = "autoUser", default)]
    pub auto_user: Field<String>,

    /// Contents of the key file used for internal cluster authentication.
    #[serde(default)]
    pub key: Field<String>,

    #[serde(rename = "keyfile", default)]
    pub key_file: Field<String>,

    #[serde(rename = "keyfileWindows", default)]
    pub key_file_windows: Field<String>,

    #[serde(rename = "autoPwd", default)]
    pub auto_password: Field<String>,

    /// Set while the agent password is rotated.
    #[serde(rename = "newAutoPwd", default)]
    pub new_auto_password: Field<String>,

    #[serde(rename = "autoLdapGroupDN", default)]
    pub auto_ldap_group_dn: Field<String>,
}

overlay_fields!(Auth {
    disabled => "disabled",
    authoritative_set => "authoritativeSet",
    auto_auth_mechanisms => "autoAuthMechanisms",
    auto_auth_mechanism => "autoAuthMechanism",
    deployment_auth_mechanisms => "deploymentAuthMechanisms",
    auto_user => "autoUser",
    key => "key",
    key_file => "keyfile",
    key_file_windows => "keyfileWindows",
    auto_password => "autoPwd",
    new_auto_password => "newAutoPwd",
    auto_ldap_group_dn => "autoLdapGroupDN",
});

impl Auth {
    /// Authentication settings of a project nobody configured yet: disabled,
    /// authoritative and without users.
    pub fn default_for_new_project() -> Self {
        Self {
            users: Field::Set(Vec::new()),
            disabled: true.into(),
            authoritative_set: true.into(),
            auto_auth_mechanisms: Field::Set(Vec::new()),
            auto_auth_mechanism: DEFAULT_AUTO_AUTH_MECHANISM.to_owned().into(),
            deployment_auth_mechanisms: Field::Set(Vec::new()),
            auto_user: AUTOMATION_AGENT_USER.to_owned().into(),
            key_file: AUTOMATION_AGENT_KEY_FILE_PATH.to_owned().into(),
            key_file_windows: AUTOMATION_AGENT_WINDOWS_KEY_FILE_PATH.to_owned().into(),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled.as_set() == Some(&false)
    }

    pub fn enable(&mut self) {
        self.disabled = false.into();
    }

    pub fn users(&self) -> &[Option<MongoDbUser>] {
        self.users.as_set().map_or(&[], Vec::as_slice)
    }

    pub fn add_user(&mut self, user: MongoDbUser) {
        self.users.get_or_insert_default().push(Some(user));
    }

    /// Returns the position and the user with the given name and database.
    pub fn get_user(&self, username: &str, database: &str) -> Option<(usize, &MongoDbUser)> {
        self.users()
            .iter()
            .enumerate()
            .find_map(|(index, user)| match user {
                Some(user) if user.username == username && user.database == database => {
                    Some((index, user))
                }
                _ => None,
            })
    }

    pub fn has_user(&self, username: &str, database: &str) -> bool {
        self.get_user(username, database).is_some()
    }

    /// Replaces the user with the same name and database, or appends it.
    pub fn ensure_user(&mut self, user: MongoDbUser) {
        match self.get_user(&user.username, &user.database) {
            Some((index, _)) => self.users.get_or_insert_default()[index] = Some(user),
            None => self.add_user(user),
        }
    }

    /// Marks the user for removal. The slot stays in place so that positions
    /// of the other users do not change. Returns `false` for unknown users.
    pub fn remove_user(&mut self, username: &str, database: &str) -> bool {
        let Some((index, _)) = self.get_user(username, database) else {
            return false;
        };
        self.users.get_or_insert_default()[index] = None;
        true
    }

    /// Takes over every field set in `other`. Users of `other` are ensured one by one.
    pub fn update_from(&mut self, other: &Self) {
        self.update_fields_from(other);
        for user in other.users().iter().flatten() {
            self.ensure_user(user.clone());
        }
    }
}

impl Overlay for Auth {
    fn apply_to(&self, section: &mut Object) -> Result<()> {
        self.apply_fields(section)?;

        match &self.users {
            Field::Unset => {}
            Field::Delete => {
                section.remove("usersWanted");
            }
            Field::Set(users) => {
                let merged = overlay::merge_keyed_list(
                    section.get("usersWanted"),
                    users,
                    MongoDbUser::key,
                    |element| wire_key(element, "user"),
                    MongoDbUser::write_to,
                )?;
                section.insert("usersWanted".to_owned(), Value::Array(merged));
            }
        }
        Ok(())
    }
}

/// A user managed by the automation agents.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct MongoDbUser {
    #[serde(default, deserialize_with = "null_as_default")]
    pub mechanisms: Vec<String>,

    /// A `None` entry removes the role stored at that position.
    #[serde(default, deserialize_with = "null_as_default")]
    pub roles: Vec<Option<Role>>,

    #[serde(rename = "user")]
    pub username: String,

    #[serde(rename = "db")]
    pub database: String,

    #[serde(
        rename = "authenticationRestrictions",
        default,
        deserialize_with = "null_as_default"
    )]
    pub authentication_restrictions: Vec<Value>,

    /// Clear text password the agents derive the credentials from.
    #[serde(rename = "initPwd", default)]
    pub init_password: Field<String>,

    #[serde(rename = "scramSha256Creds", default)]
    pub scram_sha256_creds: Option<ScramShaCreds>,

    #[serde(rename = "scramSha1Creds", default)]
    pub scram_sha1_creds: Option<ScramShaCreds>,
}

impl MongoDbUser {
    pub fn new(username: &str, database: &str) -> Self {
        Self {
            username: username.to_owned(),
            database: database.to_owned(),
            ..Self::default()
        }
    }

    pub fn add_role(&mut self, role: Role) {
        self.roles.push(Some(role));
    }

    fn key(&self) -> (String, String) {
        (self.username.clone(), self.database.clone())
    }

    fn write_to(&self, element: &mut Object) -> Result<()> {
        let roles = overlay::merge_keyed_list(
            element.get("roles"),
            &self.roles,
            Role::key,
            |role| wire_key(role, "role"),
            Role::write_to,
        )?;

        write_value(element, "mechanisms", &self.mechanisms)?;
        element.insert("roles".to_owned(), Value::Array(roles));
        element.insert("user".to_owned(), json!(self.username));
        element.insert("db".to_owned(), json!(self.database));
        write_value(element, "authenticationRestrictions", &self.authentication_restrictions)?;
        apply_field(element, "initPwd", &self.init_password)?;
        write_optional(element, "scramSha256Creds", self.scram_sha256_creds.as_ref())?;
        write_optional(element, "scramSha1Creds", self.scram_sha1_creds.as_ref())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Role {
    pub role: String,

    #[serde(rename = "db")]
    pub database: String,
}

impl Role {
    pub fn new(role: &str, database: &str) -> Self {
        Self {
            role: role.to_owned(),
            database: database.to_owned(),
        }
    }

    fn key(&self) -> (String, String) {
        (self.role.clone(), self.database.clone())
    }

    fn write_to(&self, element: &mut Object) -> Result<()> {
        element.insert("role".to_owned(), json!(self.role));
        element.insert("db".to_owned(), json!(self.database));
        Ok(())
    }
}

/// SCRAM credentials derived from a user's password.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScramShaCreds {
    pub iteration_count: i64,
    pub salt: String,
    pub server_key: String,
    pub stored_key: String,
}

/// Reads the `(<name_key>, db)` pair identifying list elements on the wire.
fn wire_key(element: &Object, name_key: &str) -> Option<(String, String)> {
    let name = document::get_str(element, name_key).ok().flatten()?;
    let database = document::get_str(element, "db").ok().flatten()?;
    Some((name.to_owned(), database.to_owned()))
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn section() -> Object {
        serde_json::from_str(indoc! {r#"
            {
                "autoAuthMechanisms": ["SCRAM-SHA-256", "SCRAM-SHA-1"],
                "usersWanted": [
                    {
                        "user": "alice",
                        "db": "admin",
                        "mechanisms": [],
                        "authenticationRestrictions": [],
                        "roles": [
                            {"role": "root", "db": "admin"},
                            {"role": "readWrite", "db": "app"},
                            {"role": "read", "db": "reporting"}
                        ],
                        "pwdUpdatedAt": "2024-01-01"
                    },
                    {
                        "user": "bob",
                        "db": "admin",
                        "mechanisms": [],
                        "authenticationRestrictions": [],
                        "roles": [{"role": "read", "db": "app"}],
                        "pwdUpdatedAt": "2024-02-02"
                    }
                ]
            }
        "#})
        .expect("valid JSON")
    }

    fn read(section: &Object) -> Auth {
        serde_json::from_value(Value::Object(section.clone())).expect("valid auth section")
    }

    fn users(section: &Object) -> Vec<(String, Option<String>)> {
        section["usersWanted"]
            .as_array()
            .expect("a list")
            .iter()
            .map(|user| {
                (
                    user["user"].as_str().unwrap_or_default().to_owned(),
                    user.get("pwdUpdatedAt")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                )
            })
            .collect()
    }

    fn role_names(user: &Value) -> Vec<&str> {
        user["roles"]
            .as_array()
            .expect("a list")
            .iter()
            .filter_map(|role| role["role"].as_str())
            .collect()
    }

    #[rstest]
    fn read_users_apply_unchanged(mut section: Object) {
        let expected = section.clone();

        read(&section).apply_to(&mut section).expect("applies");

        assert_eq!(Value::Object(section), Value::Object(expected));
    }

    #[rstest]
    fn renamed_user_is_a_new_user(mut section: Object) {
        let mut auth = read(&section);
        if let Field::Set(users) = &mut auth.users {
            users[0].as_mut().expect("alice").username = "alicia".to_owned();
        }

        auth.apply_to(&mut section).expect("applies");

        assert_eq!(users(&section), [
            ("alicia".to_owned(), None),
            ("bob".to_owned(), Some("2024-02-02".to_owned())),
        ]);
    }

    #[test]
    fn new_user_does_not_inherit_credentials_of_a_replaced_user() {
        let mut section: Object = serde_json::from_str(indoc! {r#"
            {
                "usersWanted": [
                    {
                        "user": "bob",
                        "db": "admin",
                        "mechanisms": [],
                        "roles": [{"role": "read", "db": "app"}],
                        "authenticationRestrictions": [],
                        "scramSha256Creds": {
                            "iterationCount": 15000,
                            "salt": "bob-salt",
                            "serverKey": "bob-server-key",
                            "storedKey": "bob-stored-key"
                        },
                        "pwdUpdatedAt": "2024-02-02"
                    }
                ]
            }
        "#})
        .expect("valid JSON");
        let auth = Auth {
            users: Field::Set(vec![Some(MongoDbUser::new("carol", "admin"))]),
            ..Auth::default()
        };

        auth.apply_to(&mut section).expect("applies");

        assert_eq!(
            Value::Object(section),
            json!({
                "usersWanted": [{
                    "user": "carol",
                    "db": "admin",
                    "mechanisms": [],
                    "roles": [],
                    "authenticationRestrictions": []
                }]
            })
        );
    }

    #[rstest]
    fn prepended_user_does_not_take_over_roles(mut section: Object) {
        let mut auth = read(&section);
        if let Field::Set(users) = &mut auth.users {
            users.insert(0, Some(MongoDbUser::new("carol", "admin")));
        }

        auth.apply_to(&mut section).expect("applies");

        assert_eq!(users(&section), [
            ("carol".to_owned(), None),
            ("alice".to_owned(), Some("2024-01-01".to_owned())),
            ("bob".to_owned(), Some("2024-02-02".to_owned())),
        ]);
        assert!(role_names(&section["usersWanted"][0]).is_empty());
        assert_eq!(role_names(&section["usersWanted"][1]), ["root", "readWrite", "read"]);
    }

    #[rstest]
    fn removed_user_does_not_shift_the_others(mut section: Object) {
        let mut auth = read(&section);
        assert!(auth.remove_user("alice", "admin"));

        auth.apply_to(&mut section).expect("applies");

        assert_eq!(users(&section), [("bob".to_owned(), Some("2024-02-02".to_owned()))]);
        assert_eq!(role_names(&section["usersWanted"][0]), ["read"]);
    }

    #[rstest]
    fn removed_and_cleared_roles(mut section: Object) {
        let mut auth = read(&section);
        if let Field::Set(users) = &mut auth.users {
            users[0].as_mut().expect("alice").roles[1] = None;
            users[1].as_mut().expect("bob").roles.clear();
        }

        auth.apply_to(&mut section).expect("applies");

        assert_eq!(role_names(&section["usersWanted"][0]), ["root", "read"]);
        assert!(role_names(&section["usersWanted"][1]).is_empty());
    }

    #[rstest]
    fn lists_are_replaced(mut section: Object) {
        let mut auth = read(&section);
        auth.auto_auth_mechanisms = Field::Set(vec!["MONGODB-X509".to_owned()]);

        auth.apply_to(&mut section).expect("applies");

        assert_eq!(section["autoAuthMechanisms"], serde_json::json!(["MONGODB-X509"]));
    }

    #[rstest]
    fn added_user_is_appended(mut section: Object) {
        let mut auth = read(&section);
        auth.ensure_user(MongoDbUser::new("dave", "$external"));

        auth.apply_to(&mut section).expect("applies");

        assert_eq!(users(&section).len(), 3);
        assert_eq!(section["usersWanted"][2]["db"], serde_json::json!("$external"));
    }

    #[rstest]
    fn users_deleted_then_added(mut section: Object) {
        let mut auth = read(&section);
        auth.remove_user("alice", "admin");
        auth.remove_user("bob", "admin");
        auth.apply_to(&mut section).expect("applies");
        assert!(users(&section).is_empty());

        let mut auth = read(&section);
        auth.add_user(MongoDbUser::new("erin", "admin"));
        auth.apply_to(&mut section).expect("applies");

        assert_eq!(users(&section), [("erin".to_owned(), None)]);
    }

    #[test]
    fn new_project_defaults() {
        let auth = Auth::default_for_new_project();

        assert!(!auth.is_enabled());
        assert_eq!(auth.auto_auth_mechanism.as_str(), Some(DEFAULT_AUTO_AUTH_MECHANISM));
        assert_eq!(auth.auto_user.as_str(), Some(AUTOMATION_AGENT_USER));
        assert_eq!(auth.key_file.as_str(), Some(AUTOMATION_AGENT_KEY_FILE_PATH));
        assert!(auth.users().is_empty());
    }

    #[test]
    fn user_helpers() {
        let mut auth = Auth::default();
        auth.add_user(MongoDbUser::new("alice", "admin"));
        auth.add_user(MongoDbUser::new("bob", "admin"));

        let mut updated = MongoDbUser::new("alice", "admin");
        updated.add_role(Role::new("readWrite", "app"));
        auth.ensure_user(updated.clone());
        auth.ensure_user(MongoDbUser::new("carol", "$external"));

        assert_eq!(auth.get_user("alice", "admin"), Some((0, &updated)));
        assert_eq!(auth.users().len(), 3);

        assert!(auth.remove_user("bob", "admin"));
        assert!(!auth.remove_user("bob", "admin"));
        assert_eq!(auth.users()[1], None);
        assert!(auth.has_user("carol", "$external"));
    }

    #[rstest]
    #[case("autoUser", true)]
    #[case("keyfile", true)]
    #[case("usersWanted", false)]
    #[case("unknown", false)]
    fn delete_field_by_wire_key(#[case] key: &str, #[case] known: bool) {
        let mut auth = Auth::default();
        assert_eq!(auth.delete_field(key), known);
    }

    #[test]
    fn update_from_only_takes_set_fields() {
        let mut auth = Auth::default_for_new_project();
        let mut other = Auth::default();
        other.enable();
        other.add_user(MongoDbUser::new("alice", "admin"));

        auth.update_from(&other);

        assert!(auth.is_enabled());
        assert_eq!(auth.auto_user.as_str(), Some(AUTOMATION_AGENT_USER));
        assert!(auth.has_user("alice", "admin"));
    }
}
