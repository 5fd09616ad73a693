//! Proposal graph: explicit and branch-stacking dependencies, plus predicted
//! conflicts from overlapping changed files.

use crate::host::ProposalInfo;
use crate::state::machine::ProposalStatus;
use mergeloop_core::ProposalId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalNode {
    pub id: ProposalId,
    #[serde(default)]
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
    pub status: ProposalStatus,
    pub depends_on: BTreeSet<ProposalId>,
    pub conflicts_with: BTreeSet<ProposalId>,
    pub changed_files: BTreeSet<String>,
    /// Why the node ended in its current status, when that needs explaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProposalNode {
    pub fn from_info(info: &ProposalInfo) -> Self {
        Self {
            id: info.id,
            title: info.title.clone(),
            source_branch: info.source_branch.clone(),
            target_branch: info.target_branch.clone(),
            status: ProposalStatus::Pending,
            depends_on: BTreeSet::new(),
            conflicts_with: BTreeSet::new(),
            changed_files: info.changed_files.iter().cloned().collect(),
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle in component {}", fmt_ids(.members))]
    Cycle { members: Vec<ProposalId> },
}

fn fmt_ids(ids: &[ProposalId]) -> String {
    let parts: Vec<String> = ids.iter().map(|id| format!("#{id}")).collect();
    format!("[{}]", parts.join(", "))
}

/// Two proposals predicted to conflict, `a < b`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictPair {
    pub a: ProposalId,
    pub b: ProposalId,
    pub files: Vec<String>,
}

/// A connected component left out of scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExcludedComponent {
    pub members: Vec<ProposalId>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalGraph {
    /// Every in-scope proposal, sorted by id.
    pub nodes: Vec<ProposalNode>,
    pub conflicts: Vec<ConflictPair>,
    pub excluded: Vec<ExcludedComponent>,
}

impl ProposalGraph {
    pub fn node(&self, id: ProposalId) -> Option<&ProposalNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_excluded(&self, id: ProposalId) -> bool {
        self.excluded.iter().any(|c| c.members.contains(&id))
    }

    pub fn conflicts(&self, a: ProposalId, b: ProposalId) -> bool {
        self.node(a).is_some_and(|n| n.conflicts_with.contains(&b))
    }
}

/// Build the graph for the in-scope proposals.
///
/// `explicit` maps a proposal to the proposals it must merge after; ids that
/// are not in scope are ignored. A proposal targeting another in-scope
/// proposal's source branch depends on it. A dependency cycle excludes its
/// whole connected component; everything else stays schedulable.
pub fn build_graph(
    proposals: &[ProposalInfo],
    explicit: &BTreeMap<ProposalId, Vec<ProposalId>>,
) -> ProposalGraph {
    let mut nodes: BTreeMap<ProposalId, ProposalNode> = BTreeMap::new();
    for info in proposals {
        nodes
            .entry(info.id)
            .or_insert_with(|| ProposalNode::from_info(info));
    }

    // Explicit edges
    for (id, deps) in explicit {
        if !nodes.contains_key(id) {
            continue;
        }
        for dep in deps {
            if !nodes.contains_key(dep) {
                warn!(proposal = id, dependency = dep, "ignoring dependency on out-of-scope proposal");
                continue;
            }
            if let Some(node) = nodes.get_mut(id) {
                node.depends_on.insert(*dep);
            }
        }
    }

    // Stacked branches
    let by_source: BTreeMap<String, ProposalId> = nodes
        .values()
        .map(|n| (n.source_branch.clone(), n.id))
        .collect();
    for node in nodes.values_mut() {
        if let Some(&parent) = by_source.get(&node.target_branch) {
            if parent != node.id {
                node.depends_on.insert(parent);
            }
        }
    }

    // File-overlap conflicts
    let ids: Vec<ProposalId> = nodes.keys().copied().collect();
    let mut conflicts = Vec::new();
    for (i, &a) in ids.iter().enumerate() {
        for &b in &ids[i + 1..] {
            let files: Vec<String> = nodes[&a]
                .changed_files
                .intersection(&nodes[&b].changed_files)
                .cloned()
                .collect();
            if !files.is_empty() {
                conflicts.push(ConflictPair { a, b, files });
            }
        }
    }
    for pair in &conflicts {
        if let Some(n) = nodes.get_mut(&pair.a) {
            n.conflicts_with.insert(pair.b);
        }
        if let Some(n) = nodes.get_mut(&pair.b) {
            n.conflicts_with.insert(pair.a);
        }
    }

    let excluded = cyclic_components(&nodes)
        .into_iter()
        .map(|members| {
            let reason = GraphError::Cycle {
                members: members.clone(),
            }
            .to_string();
            warn!(%reason, "excluding proposals from scheduling");
            ExcludedComponent { members, reason }
        })
        .collect();

    ProposalGraph {
        nodes: nodes.into_values().collect(),
        conflicts,
        excluded,
    }
}

/// Components (undirected, over dependency edges) that contain a node Kahn's
/// algorithm cannot order.
fn cyclic_components(nodes: &BTreeMap<ProposalId, ProposalNode>) -> Vec<Vec<ProposalId>> {
    let mut in_degree: BTreeMap<ProposalId, usize> =
        nodes.iter().map(|(id, n)| (*id, n.depends_on.len())).collect();
    let mut dependents: BTreeMap<ProposalId, Vec<ProposalId>> = BTreeMap::new();
    for node in nodes.values() {
        for dep in &node.depends_on {
            dependents.entry(*dep).or_default().push(node.id);
        }
    }

    let mut queue: VecDeque<ProposalId> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut ordered = BTreeSet::new();
    while let Some(id) = queue.pop_front() {
        ordered.insert(id);
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }
    if ordered.len() == nodes.len() {
        return Vec::new();
    }

    // Undirected adjacency over dependency edges
    let mut adjacent: BTreeMap<ProposalId, BTreeSet<ProposalId>> = BTreeMap::new();
    for node in nodes.values() {
        for dep in &node.depends_on {
            adjacent.entry(node.id).or_default().insert(*dep);
            adjacent.entry(*dep).or_default().insert(node.id);
        }
    }

    let mut visited = BTreeSet::new();
    let mut components = Vec::new();
    for &start in nodes.keys() {
        if visited.contains(&start) {
            continue;
        }
        let mut members = Vec::new();
        let mut stack = vec![start];
        visited.insert(start);
        while let Some(id) = stack.pop() {
            members.push(id);
            for next in adjacent.get(&id).into_iter().flatten() {
                if visited.insert(*next) {
                    stack.push(*next);
                }
            }
        }
        if members.iter().any(|id| !ordered.contains(id)) {
            members.sort_unstable();
            components.push(members);
        }
    }
    components
}
