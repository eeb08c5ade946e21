//! Sharded clusters (`sharding`) and their shards.

use std::collections::HashSet;

use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::document::Object;

/// An entry of the `sharding` list. Ops Manager specific fields such as
/// `collections` or `managedSharding` are kept in [`Self::other`].
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ShardedCluster {
    pub name: String,

    #[serde(rename = "configServerReplica")]
    pub config_server_replica: String,

    #[serde(default)]
    pub shards: Vec<Shard>,

    /// Replica sets of removed shards whose data is still being migrated away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draining: Option<Vec<String>>,

    #[serde(flatten)]
    pub other: Object,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Shard {
    #[serde(rename = "_id")]
    pub id: String,

    pub rs: String,

    #[serde(flatten)]
    pub other: Object,
}

impl Shard {
    /// The operator names each shard after its replica set.
    pub fn new(replica_set_name: &str) -> Self {
        Self {
            id: replica_set_name.to_owned(),
            rs: replica_set_name.to_owned(),
            other: Object::new(),
        }
    }
}

impl ShardedCluster {
    pub fn new<'a>(
        name: &str,
        config_server_replica: &str,
        shard_replica_sets: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            config_server_replica: config_server_replica.to_owned(),
            shards: shard_replica_sets.into_iter().map(Shard::new).collect(),
            draining: None,
            other: Object::new(),
        }
    }

    /// Merges the operator's cluster into this one. Shards are matched by
    /// `_id` and sorted by it afterwards. Returns the ids of shards that are no
    /// longer part of the cluster.
    pub fn merge_from(&mut self, desired: &Self) -> Vec<String> {
        self.name.clone_from(&desired.name);
        self.config_server_replica
            .clone_from(&desired.config_server_replica);

        let observed: IndexMap<&str, &Shard> = self
            .shards
            .iter()
            .map(|shard| (shard.id.as_str(), shard))
            .collect();
        let desired_ids: HashSet<&str> = desired.shards.iter().map(|s| s.id.as_str()).collect();

        let removed = observed
            .keys()
            .filter(|id| !desired_ids.contains(**id))
            .map(|id| (*id).to_owned())
            .collect();

        let merged = desired
            .shards
            .iter()
            .map(|desired_shard| match observed.get(desired_shard.id.as_str()) {
                Some(observed_shard) => Shard {
                    id: desired_shard.id.clone(),
                    rs: desired_shard.rs.clone(),
                    other: observed_shard.other.clone(),
                },
                None => desired_shard.clone(),
            })
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect();
        self.shards = merged;

        removed
    }

    /// Replica sets referenced by the cluster: all shards plus the config server.
    pub fn replica_set_names(&self) -> Vec<&str> {
        self.shards
            .iter()
            .map(|shard| shard.rs.as_str())
            .chain(std::iter::once(self.config_server_replica.as_str()))
            .collect()
    }

    pub fn draining(&self) -> &[String] {
        self.draining.as_deref().unwrap_or_default()
    }

    /// Appends replica sets to `draining`, skipping those already listed.
    pub fn add_to_draining<'a>(&mut self, replica_sets: impl IntoIterator<Item = &'a str>) {
        let draining = self.draining.get_or_insert_with(Vec::new);
        for replica_set in replica_sets {
            if !draining.iter().any(|existing| existing == replica_set) {
                draining.push(replica_set.to_owned());
            }
        }
    }

    pub fn remove_draining(&mut self) {
        self.draining = None;
    }
}
