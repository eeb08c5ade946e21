//! Monitoring and backup agent registrations (`monitoringVersions`, `backupVersions`).

use serde_json::{Value, json};
use snafu::ResultExt;
use tracing::{debug, info};

use super::{Deployment, InvalidDocumentSnafu, Result};
use crate::{
    document::{self, Object},
    options::AgentVersionOptions,
    tls::LEGACY_KEY_FILE_FIELD,
};

impl Deployment {
    /// Registers a monitoring and a backup agent for every host of the deployment.
    ///
    /// With `tls_ca_file_path` set, monitoring agents are told to connect
    /// over TLS and to trust the given CA.
    pub fn add_monitoring_and_backup(
        &mut self,
        versions: &AgentVersionOptions,
        tls_ca_file_path: Option<&str>,
    ) -> Result<()> {
        if self.processes().is_empty() {
            return Ok(());
        }
        self.add_monitoring(&versions.monitoring_agent_version, tls_ca_file_path)?;
        self.add_backup(&versions.backup_agent_version)
    }

    pub fn add_monitoring(&mut self, version: &str, tls_ca_file_path: Option<&str>) -> Result<()> {
        let mut agents = self.monitoring_versions().to_vec();

        for process in self.processes() {
            let hostname = process.hostname().context(InvalidDocumentSnafu)?;
            let index = match position_of_host(&agents, hostname) {
                Some(index) => index,
                None => {
                    agents.push(new_agent(hostname, version));
                    debug!(
                        host = hostname,
                        tls = tls_ca_file_path.is_some(),
                        "added monitoring agent configuration"
                    );
                    agents.len() - 1
                }
            };

            if let Some(ca_file_path) = tls_ca_file_path {
                let mut params = Object::new();
                params.insert("useSslForAllConnections".to_owned(), json!("true"));
                params.insert("sslTrustedServerCertificates".to_owned(), json!(ca_file_path));
                let legacy_key_file = process
                    .tls_config()
                    .context(InvalidDocumentSnafu)?
                    .and_then(|tls| tls.get(LEGACY_KEY_FILE_FIELD))
                    .and_then(Value::as_str);
                if let Some(key_file) = legacy_key_file {
                    params.insert("sslClientCertificate".to_owned(), json!(key_file));
                }
                agents[index].insert("additionalParams".to_owned(), Value::Object(params));
            }
        }

        self.monitoring_versions = Some(agents);
        Ok(())
    }

    pub fn add_backup(&mut self, version: &str) -> Result<()> {
        let mut agents = self.backup_versions().to_vec();

        for process in self.processes() {
            let hostname = process.hostname().context(InvalidDocumentSnafu)?;
            if position_of_host(&agents, hostname).is_none() {
                agents.push(new_agent(hostname, version));
                debug!(host = hostname, "added backup agent configuration");
            }
        }

        self.backup_versions = Some(agents);
        Ok(())
    }

    /// Drops the agent registrations of the hosts of the named processes.
    pub fn remove_monitoring_and_backup(&mut self, names: &[String]) -> Result<(), document::Error> {
        let mut hostnames = Vec::new();
        for process in self.processes() {
            let name = process.name()?;
            if names.iter().any(|removed| removed == name) {
                hostnames.push(process.hostname()?.to_owned());
            }
        }
        if hostnames.is_empty() {
            return Ok(());
        }

        let keep = |agent: &Object| {
            agent
                .get("hostname")
                .and_then(Value::as_str)
                .is_none_or(|hostname| !hostnames.iter().any(|removed| removed == hostname))
        };
        let monitoring = self
            .monitoring_versions()
            .iter()
            .filter(|&agent| keep(agent))
            .cloned()
            .collect::<Vec<_>>();
        let backup = self
            .backup_versions()
            .iter()
            .filter(|&agent| keep(agent))
            .cloned()
            .collect::<Vec<_>>();

        let removed_backups = self.backup_versions().len() - backup.len();
        if removed_backups < hostnames.len() {
            info!(
                hosts = ?hostnames,
                "not every host had a backup agent configuration to remove"
            );
        }

        self.monitoring_versions = Some(monitoring);
        self.backup_versions = Some(backup);
        Ok(())
    }

    /// Makes every monitoring and backup agent download from `base_url`.
    pub fn set_agents_base_url(&mut self, base_url: &str) {
        let agents = self
            .monitoring_versions
            .iter_mut()
            .flatten()
            .chain(self.backup_versions.iter_mut().flatten());
        for agent in agents {
            agent.insert("baseUrl".to_owned(), json!(base_url));
        }
    }
}

fn position_of_host(agents: &[Object], hostname: &str) -> Option<usize> {
    agents
        .iter()
        .position(|agent| agent.get("hostname").and_then(Value::as_str) == Some(hostname))
}

fn new_agent(hostname: &str, version: &str) -> Object {
    let mut agent = Object::new();
    agent.insert("hostname".to_owned(), json!(hostname));
    agent.insert("name".to_owned(), json!(version));
    agent
}
