//! Settings for values the merge engine writes on its own.

/// Version new monitoring agents are registered with. The automation agent
/// upgrades them to the version Ops Manager ships.
pub const MONITORING_AGENT_DEFAULT_VERSION: &str = "11.12.0.7388-1";

pub const BACKUP_AGENT_DEFAULT_VERSION: &str = "11.12.0.7388-1";

#[cfg_attr(
    feature = "clap",
    doc = r#"
```
# use om_automation::options::AgentVersionOptions;
use clap::Parser;

#[derive(Parser)]
struct Cli {
    #[clap(flatten)]
    agent_versions: AgentVersionOptions,
}
```
"#
)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentVersionOptions {
    /// Version used when registering a monitoring agent for a new host.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "VERSION", default_value = MONITORING_AGENT_DEFAULT_VERSION)
    )]
    pub monitoring_agent_version: String,

    /// Version used when registering a backup agent for a new host.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "VERSION", default_value = BACKUP_AGENT_DEFAULT_VERSION)
    )]
    pub backup_agent_version: String,
}

impl Default for AgentVersionOptions {
    fn default() -> Self {
        Self {
            monitoring_agent_version: MONITORING_AGENT_DEFAULT_VERSION.to_owned(),
            backup_agent_version: BACKUP_AGENT_DEFAULT_VERSION.to_owned(),
        }
    }
}
