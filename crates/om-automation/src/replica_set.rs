//! Replica sets (`replicaSets`) and their members.

use std::collections::{BTreeMap, HashSet};

use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::OptionExt;
use tracing::warn;

use crate::{
    document::{self, MissingFieldSnafu, Object, UnexpectedTypeSnafu},
    process::Process,
    scale::allocate_member_ids,
};

type Result<T, E = document::Error> = std::result::Result<T, E>;

/// MongoDB refuses replica set configurations with more voting members than this.
pub const MAX_VOTING_MEMBERS: usize = 7;

/// Replica sets created for MongoDB 3.2.0 and newer use protocol version 1.
const PROTOCOL_VERSION_1_SINCE: semver::Version = semver::Version::new(3, 2, 0);

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReplicaSet {
    #[serde(rename = "_id")]
    pub name: String,

    #[serde(default)]
    pub members: Vec<ReplicaSetMember>,

    #[serde(flatten)]
    pub other: Object,
}

impl ReplicaSet {
    pub fn new(name: &str, version: &str) -> Self {
        let mut other = Object::new();
        match semver::Version::parse(version.trim_end_matches("-ent")) {
            Ok(version) if version >= PROTOCOL_VERSION_1_SINCE => {
                other.insert("protocolVersion".to_owned(), json!("1"));
            }
            Ok(_) => {}
            Err(error) => {
                warn!(version, %error, "failed to parse MongoDB version, leaving protocolVersion unset");
            }
        }

        Self {
            name: name.to_owned(),
            members: Vec::new(),
            other,
        }
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.other.get("protocolVersion").and_then(Value::as_str)
    }

    pub fn member_names(&self) -> Result<Vec<&str>> {
        self.members.iter().map(ReplicaSetMember::host).collect()
    }

    pub fn find_member_mut(&mut self, host: &str) -> Result<Option<&mut ReplicaSetMember>> {
        for member in &mut self.members {
            if member.host()? == host {
                return Ok(Some(member));
            }
        }
        Ok(None)
    }

    /// Adds `process` as a member. Without an explicit `id` the member gets
    /// the id following the last member's one.
    pub fn add_member(&mut self, process: &Process, id: Option<i64>, options: &MemberOptions) -> Result<()> {
        let id = match (id, self.members.last()) {
            (Some(id), _) => id,
            (None, Some(last)) => last.id()? + 1,
            (None, None) => 0,
        };
        self.members
            .push(ReplicaSetMember::new(id, process.name()?, options));
        Ok(())
    }

    /// Merges the operator's replica set into this one, which was read from Ops Manager.
    ///
    /// The desired member list wins: members are matched by `host`, matched
    /// members keep any additional fields Ops Manager set on them. Returns the
    /// hosts of the members that are no longer part of the replica set.
    pub fn merge_from(&mut self, desired: &Self) -> Result<Vec<String>> {
        let mut observed_by_host = IndexMap::new();
        for member in &self.members {
            observed_by_host.insert(member.host()?, member);
        }

        let mut merged = Vec::with_capacity(desired.members.len());
        let mut desired_hosts = HashSet::new();
        for desired_member in &desired.members {
            let host = desired_member.host()?;
            desired_hosts.insert(host);

            let member = match observed_by_host.get(host) {
                Some(observed) => {
                    let mut member = (*observed).clone();
                    member.merge_from(desired_member)?;
                    member
                }
                None => desired_member.clone(),
            };
            merged.push((member.id()?, member));
        }

        let removed = observed_by_host
            .keys()
            .filter(|host| !desired_hosts.contains(*host))
            .map(|host| (*host).to_owned())
            .collect();

        self.name.clone_from(&desired.name);
        if let Some(protocol_version) = desired.other.get("protocolVersion") {
            self.other
                .insert("protocolVersion".to_owned(), protocol_version.clone());
        }
        self.members = merged
            .into_iter()
            .sorted_by_key(|(id, _)| *id)
            .map(|(_, member)| member)
            .collect();

        Ok(removed)
    }

    /// Walks the members in order and strips votes and priority from every
    /// member after the [`MAX_VOTING_MEMBERS`]th voting one. Members that
    /// already have no vote are never given one.
    pub fn limit_voting_members(&mut self) {
        let mut voting_members = 0;
        for member in &mut self.members {
            if member.votes() > 0 {
                voting_members += 1;
            }
            if voting_members > MAX_VOTING_MEMBERS {
                member.set_votes(0);
                member.set_priority(0.0);
            }
        }
    }

    pub fn voting_members(&self) -> usize {
        self.members
            .iter()
            .filter(|member| member.votes() > 0)
            .count()
    }
}

/// A member of a replica set. Ops Manager may add fields to members
/// (`arbiterOnly`, `secondaryDelaySecs`, ...), those are kept.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReplicaSetMember(Object);

impl From<Object> for ReplicaSetMember {
    fn from(object: Object) -> Self {
        Self(object)
    }
}

impl ReplicaSetMember {
    pub fn new(id: i64, host: &str, options: &MemberOptions) -> Self {
        let mut member = Self(Object::new());
        member.0.insert("_id".to_owned(), json!(id));
        member.0.insert("host".to_owned(), json!(host));
        member.set_votes(options.votes());
        member.set_priority(options.priority());
        member.set_tags(&options.tags);
        member.set_horizons(&options.horizons);
        member
    }

    pub fn as_object(&self) -> &Object {
        &self.0
    }

    pub fn id(&self) -> Result<i64> {
        let value = self.0.get("_id").context(MissingFieldSnafu { field: "_id" })?;
        document::as_i64(value).context(UnexpectedTypeSnafu {
            field: "_id",
            expected: "an integer",
        })
    }

    /// The member's host, which is the name of its process.
    pub fn host(&self) -> Result<&str> {
        document::require_str(&self.0, "host")
    }

    /// Members without an explicit `votes` field vote, as in MongoDB.
    pub fn votes(&self) -> i64 {
        self.0.get("votes").and_then(document::as_i64).unwrap_or(1)
    }

    pub fn set_votes(&mut self, votes: i64) {
        self.0.insert("votes".to_owned(), json!(votes));
    }

    pub fn priority(&self) -> f64 {
        self.0
            .get("priority")
            .and_then(document::as_f64)
            .unwrap_or(1.0)
    }

    pub fn set_priority(&mut self, priority: f64) {
        self.0.insert("priority".to_owned(), json!(priority));
    }

    pub fn tags(&self) -> Option<&Object> {
        self.0.get("tags").and_then(Value::as_object)
    }

    pub fn set_tags(&mut self, tags: &BTreeMap<String, String>) {
        self.0.insert("tags".to_owned(), json!(tags));
    }

    pub fn horizons(&self) -> Option<&Object> {
        self.0.get("horizons").and_then(Value::as_object)
    }

    /// Sets the split horizon config, an empty one removes the field.
    pub fn set_horizons(&mut self, horizons: &BTreeMap<String, String>) {
        if horizons.is_empty() {
            self.0.remove("horizons");
        } else {
            self.0.insert("horizons".to_owned(), json!(horizons));
        }
    }

    fn merge_from(&mut self, desired: &Self) -> Result<()> {
        self.0.insert("host".to_owned(), json!(desired.host()?));
        self.0.insert("_id".to_owned(), json!(desired.id()?));
        self.set_votes(desired.votes());
        self.set_priority(desired.priority());
        self.0.insert(
            "tags".to_owned(),
            desired
                .tags()
                .map_or_else(|| json!({}), |tags| Value::Object(tags.clone())),
        );
        match desired.horizons() {
            Some(horizons) if !horizons.is_empty() => {
                self.0
                    .insert("horizons".to_owned(), Value::Object(horizons.clone()));
            }
            _ => {
                self.0.remove("horizons");
            }
        }
        Ok(())
    }
}

/// Per member settings of a replica set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberOptions {
    pub votes: Option<i64>,
    pub priority: Option<f64>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub horizons: BTreeMap<String, String>,
}

impl MemberOptions {
    pub fn votes(&self) -> i64 {
        self.votes.unwrap_or(1)
    }

    pub fn priority(&self) -> f64 {
        self.priority.unwrap_or(1.0)
    }
}

/// The operator's desired replica set together with the processes backing its members.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplicaSetWithProcesses {
    pub replica_set: ReplicaSet,
    pub processes: Vec<Process>,
}

impl ReplicaSetWithProcesses {
    /// Builds the replica set with member ids counting up from 0 in process order.
    pub fn new(replica_set: ReplicaSet, processes: Vec<Process>, member_options: &[MemberOptions]) -> Result<Self> {
        Self::assemble(replica_set, processes, member_options, None)
    }

    /// Builds a replica set spanning several Kubernetes clusters.
    ///
    /// Processes listed in `existing_ids` keep their member id, new processes
    /// get ids above every id in use.
    pub fn new_multi_cluster(
        replica_set: ReplicaSet,
        processes: Vec<Process>,
        member_options: &[MemberOptions],
        existing_ids: &IndexMap<String, i64>,
    ) -> Result<Self> {
        let names = processes
            .iter()
            .map(Process::name)
            .collect::<Result<Vec<_>>>()?;
        let ids = allocate_member_ids(&names, existing_ids);
        Self::assemble(replica_set, processes, member_options, Some(&ids))
    }

    fn assemble(
        mut replica_set: ReplicaSet,
        mut processes: Vec<Process>,
        member_options: &[MemberOptions],
        ids: Option<&[i64]>,
    ) -> Result<Self> {
        let default_options = MemberOptions::default();
        replica_set.members.clear();

        for (index, process) in processes.iter_mut().enumerate() {
            process.set_replica_set_name(&replica_set.name)?;
            let options = member_options.get(index).unwrap_or(&default_options);
            let id = ids.and_then(|ids| ids.get(index).copied());
            replica_set.add_member(process, id, options)?;
        }

        Ok(Self {
            replica_set,
            processes,
        })
    }

    pub fn name(&self) -> &str {
        &self.replica_set.name
    }
}
