//! Top-level settings a headless agent reads from its cluster config file
//! instead of receiving them from Ops Manager.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::ResultExt;

use super::{AutomationConfig, DeserializeSectionSnafu, Result, SerializeFieldSnafu};

const VERSION: &str = "version";
const OPTIONS: &str = "options";
const MONGODB_VERSIONS: &str = "mongoDbVersions";

/// A MongoDB version the agent is allowed to download, with its builds.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MongoDbVersionConfig {
    pub name: String,

    #[serde(default)]
    pub builds: Vec<BuildConfig>,
}

/// One downloadable build of a MongoDB version.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub platform: String,
    pub url: String,
    pub git_version: String,
    pub architecture: String,
    pub flavor: String,
    pub min_os_version: String,
    pub max_os_version: String,

    #[serde(default)]
    pub modules: Vec<String>,
}

impl AutomationConfig {
    pub fn set_version(&mut self, version: i64) -> &mut Self {
        self.deployment.set_other(VERSION, json!(version));
        self
    }

    /// Replaces the `options` section, which only carries the download directory.
    pub fn set_options_download_base(&mut self, download_base: &str) -> &mut Self {
        self.deployment
            .set_other(OPTIONS, json!({ "downloadBase": download_base }));
        self
    }

    pub fn set_mongodb_versions(&mut self, versions: &[MongoDbVersionConfig]) -> Result<&mut Self> {
        let versions = serde_json::to_value(versions).context(SerializeFieldSnafu { key: MONGODB_VERSIONS })?;
        self.deployment.set_other(MONGODB_VERSIONS, versions);
        Ok(self)
    }

    pub fn mongodb_versions(&self) -> Result<Vec<MongoDbVersionConfig>> {
        match self.deployment.other().get(MONGODB_VERSIONS) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(versions) => serde_json::from_value(versions.clone()).context(DeserializeSectionSnafu {
                section: MONGODB_VERSIONS,
            }),
        }
    }

    pub fn set_base_url_for_agents(&mut self, base_url: &str) -> &mut Self {
        self.deployment.set_agents_base_url(base_url);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deployment::Deployment,
        options::AgentVersionOptions,
        process::{ArgsHistory, Process},
    };

    fn version(name: &str) -> MongoDbVersionConfig {
        MongoDbVersionConfig {
            name: name.to_owned(),
            builds: vec![BuildConfig {
                platform: "linux".to_owned(),
                url: format!("/mongodb-linux-x86_64-ubuntu2204-{name}.tgz"),
                git_version: "0123abcd".to_owned(),
                architecture: "amd64".to_owned(),
                flavor: "ubuntu".to_owned(),
                min_os_version: "22.04".to_owned(),
                max_os_version: "23.04".to_owned(),
                modules: Vec::new(),
            }],
        }
    }

    #[test]
    fn headless_settings_are_written() {
        let mut config = AutomationConfig::new(Deployment::new());

        config
            .set_version(3)
            .set_options_download_base("/var/lib/mongodb-mms-automation")
            .set_mongodb_versions(&[version("6.0.5"), version("7.0.2")])
            .expect("serializable");

        let deployment = config.deployment();
        assert_eq!(deployment.version(), 3);
        assert_eq!(
            deployment.other()[OPTIONS],
            json!({"downloadBase": "/var/lib/mongodb-mms-automation"})
        );
        assert_eq!(
            config.mongodb_versions().expect("valid"),
            [version("6.0.5"), version("7.0.2")]
        );
        assert_eq!(
            deployment.other()[MONGODB_VERSIONS][0]["builds"][0]["gitVersion"],
            json!("0123abcd")
        );
    }

    #[test]
    fn missing_mongodb_versions_are_empty() {
        let config = AutomationConfig::new(Deployment::new());
        assert!(config.mongodb_versions().expect("valid").is_empty());
    }

    #[test]
    fn agents_get_the_base_url() {
        let mut deployment = Deployment::new();
        deployment
            .merge_standalone(
                &Process::new_mongod("single", "single.example.com", "6.0.5"),
                &ArgsHistory::default(),
            )
            .expect("merges");
        deployment
            .add_monitoring_and_backup(&AgentVersionOptions::default(), None)
            .expect("valid");
        let mut config = AutomationConfig::new(deployment);

        config.set_base_url_for_agents("https://downloads.example.com");

        let deployment = config.deployment();
        for agent in deployment
            .monitoring_versions()
            .iter()
            .chain(deployment.backup_versions())
        {
            assert_eq!(agent["baseUrl"], json!("https://downloads.example.com"));
        }
        assert_eq!(deployment.backup_versions().len(), 1);
    }
}
