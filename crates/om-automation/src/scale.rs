//! Helpers used when replica sets or mongos sets grow.

use indexmap::IndexMap;
use tracing::debug;

use crate::{
    deployment::Deployment,
    document,
    process::Process,
};

/// Picks member ids for `names`, keeping the id of every name already in
/// `existing_ids`. New names get consecutive ids starting above the highest
/// id in use, so ids of removed members are never handed out again.
pub fn allocate_member_ids(names: &[&str], existing_ids: &IndexMap<String, i64>) -> Vec<i64> {
    let mut next_id = existing_ids.values().max().map_or(0, |max| max + 1);
    names
        .iter()
        .map(|name| match existing_ids.get(*name) {
            Some(id) => *id,
            None => {
                let id = next_id;
                next_id += 1;
                id
            }
        })
        .collect()
}

impl Deployment {
    /// Seeds the processes at `desired[first_new..]` with a copy of an existing process.
    ///
    /// The template is the first process of `desired` that already exists in
    /// the deployment. Copies get the new process name and lose their alias,
    /// the following merge then overwrites everything the operator owns. This
    /// way changes made in Ops Manager to existing members (log rotation,
    /// backup settings, ...) reach the new members as well. Returns how many
    /// copies were added.
    pub fn copy_first_process_to_new_positions(
        &mut self,
        desired: &[Process],
        first_new: usize,
    ) -> Result<usize, document::Error> {
        let mut template = None;
        for process in desired {
            if let Some(existing) = self.process(process.name()?)? {
                template = Some(existing.clone());
                break;
            }
        }
        let Some(template) = template else {
            debug!("no existing process to copy from, new processes are merged from scratch");
            return Ok(0);
        };

        let mut copied = 0;
        for process in desired.iter().skip(first_new) {
            let name = process.name()?;
            if self.process(name)?.is_some() {
                continue;
            }

            let mut copy = template.clone();
            copy.set_name(name);
            copy.remove_alias();
            self.processes_mut().push(copy);
            copied += 1;
            debug!(
                template.name = template.name()?,
                process.name = name,
                "added copy of existing process"
            );
        }
        Ok(copied)
    }
}
