//! Instance groups: a display/ordering tree over a session's instances.
//!
//! Pruning never edits a tree in place. It builds fresh nodes so the pre- and
//! post-validation trees share nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupPhase {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phase: GroupPhase,
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub sub_groups: Vec<InstanceGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub execution_order: usize,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub created: DateTime<Utc>,
}

impl InstanceGroup {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            name: name.to_string(),
            phase: GroupPhase::Pending,
            instances: Vec::new(),
            sub_groups: Vec::new(),
            parent_id: None,
            execution_order: 0,
            depends_on: Vec::new(),
            created: Utc::now(),
        }
    }

    /// Attach `child` as a sub-group, taking ownership and setting its parent.
    pub fn add_sub_group(&mut self, mut child: InstanceGroup) {
        child.parent_id = Some(self.id.clone());
        self.sub_groups.push(child);
    }

    /// Every instance id referenced by this group and its descendants.
    pub fn all_instances(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.instances.iter().map(String::as_str).collect();
        for sub in &self.sub_groups {
            out.extend(sub.all_instances());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.sub_groups.iter().all(InstanceGroup::is_empty)
    }
}

/// Drop instance references not in `known`, drop groups left with nothing,
/// then drop `depends_on` edges naming groups that no longer exist.
pub fn prune_groups(groups: &[InstanceGroup], known: &HashSet<&str>) -> Vec<InstanceGroup> {
    let pruned: Vec<InstanceGroup> = groups
        .iter()
        .filter_map(|g| prune_node(g, known))
        .collect();

    let mut surviving = HashSet::new();
    collect_ids(&pruned, &mut surviving);
    pruned
        .into_iter()
        .map(|g| drop_dangling_deps(g, &surviving))
        .collect()
}

fn prune_node(group: &InstanceGroup, known: &HashSet<&str>) -> Option<InstanceGroup> {
    let instances: Vec<String> = group
        .instances
        .iter()
        .filter(|id| known.contains(id.as_str()))
        .cloned()
        .collect();
    let sub_groups: Vec<InstanceGroup> = group
        .sub_groups
        .iter()
        .filter_map(|sub| prune_node(sub, known))
        .collect();

    if instances.is_empty() && sub_groups.is_empty() {
        return None;
    }

    Some(InstanceGroup {
        id: group.id.clone(),
        name: group.name.clone(),
        phase: group.phase,
        instances,
        sub_groups,
        parent_id: group.parent_id.clone(),
        execution_order: group.execution_order,
        depends_on: group.depends_on.clone(),
        created: group.created,
    })
}

fn collect_ids(groups: &[InstanceGroup], out: &mut HashSet<String>) {
    for g in groups {
        out.insert(g.id.clone());
        collect_ids(&g.sub_groups, out);
    }
}

fn drop_dangling_deps(mut group: InstanceGroup, surviving: &HashSet<String>) -> InstanceGroup {
    group.depends_on.retain(|dep| surviving.contains(dep));
    group.sub_groups = group
        .sub_groups
        .into_iter()
        .map(|sub| drop_dangling_deps(sub, surviving))
        .collect();
    group
}
