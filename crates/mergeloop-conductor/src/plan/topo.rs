use crate::plan::graph::{ConflictPair, ExcludedComponent, ProposalGraph};
use mergeloop_core::ProposalId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Merge order for one orchestration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergePlan {
    /// Flattened batches; every dependency precedes its dependents.
    pub order: Vec<ProposalId>,
    /// Groups with no dependency or predicted conflict between members.
    pub batches: Vec<Vec<ProposalId>>,
    pub conflict_pairs: Vec<ConflictPair>,
    pub excluded: Vec<ExcludedComponent>,
}

impl MergePlan {
    pub fn position(&self, id: ProposalId) -> Option<usize> {
        self.order.iter().position(|&x| x == id)
    }

    pub fn batch_of(&self, id: ProposalId) -> Option<usize> {
        self.batches.iter().position(|b| b.contains(&id))
    }

    /// Plain-text rendering for dry runs and logs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.order.is_empty() {
            out.push_str("Nothing to merge.\n");
        }
        for (i, batch) in self.batches.iter().enumerate() {
            let ids: Vec<String> = batch.iter().map(|id| format!("#{id}")).collect();
            let _ = writeln!(out, "Batch {}: {}", i + 1, ids.join(", "));
        }
        for pair in &self.conflict_pairs {
            let _ = writeln!(
                out,
                "Conflict: #{} <-> #{} ({})",
                pair.a,
                pair.b,
                pair.files.join(", ")
            );
        }
        for component in &self.excluded {
            let _ = writeln!(out, "Excluded: {}", component.reason);
        }
        out
    }
}

/// Layer the schedulable proposals with Kahn's algorithm and split each layer
/// into conflict-free batches, first fit in ascending id order.
pub fn plan_merges(graph: &ProposalGraph) -> MergePlan {
    let schedulable: BTreeSet<ProposalId> = graph
        .nodes
        .iter()
        .map(|n| n.id)
        .filter(|id| !graph.is_excluded(*id))
        .collect();

    let mut in_degree: BTreeMap<ProposalId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<ProposalId, Vec<ProposalId>> = BTreeMap::new();
    for node in graph.nodes.iter().filter(|n| schedulable.contains(&n.id)) {
        let deps = node
            .depends_on
            .iter()
            .filter(|d| schedulable.contains(d))
            .count();
        in_degree.insert(node.id, deps);
        for dep in node.depends_on.iter().filter(|d| schedulable.contains(d)) {
            dependents.entry(*dep).or_default().push(node.id);
        }
    }

    let mut layer: Vec<ProposalId> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut batches: Vec<Vec<ProposalId>> = Vec::new();

    while !layer.is_empty() {
        layer.sort_unstable();

        let mut layer_batches: Vec<Vec<ProposalId>> = Vec::new();
        for &id in &layer {
            let slot = layer_batches
                .iter()
                .position(|b| b.iter().all(|&other| !graph.conflicts(id, other)));
            match slot {
                Some(i) => layer_batches[i].push(id),
                None => layer_batches.push(vec![id]),
            }
        }
        batches.extend(layer_batches);

        let mut next = Vec::new();
        for id in &layer {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        layer = next;
    }

    MergePlan {
        order: batches.iter().flatten().copied().collect(),
        batches,
        conflict_pairs: graph.conflicts.clone(),
        excluded: graph.excluded.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ProposalInfo;
    use crate::plan::graph::build_graph;

    fn info(id: ProposalId, files: &[&str]) -> ProposalInfo {
        ProposalInfo {
            id,
            title: String::new(),
            source_branch: format!("branch-{id}"),
            target_branch: "main".into(),
            changed_files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn deps(pairs: &[(ProposalId, &[ProposalId])]) -> BTreeMap<ProposalId, Vec<ProposalId>> {
        pairs.iter().map(|(id, d)| (*id, d.to_vec())).collect()
    }

    fn assert_dependencies_respected(graph: &ProposalGraph, plan: &MergePlan) {
        for node in &graph.nodes {
            let Some(pos) = plan.position(node.id) else {
                continue;
            };
            for dep in &node.depends_on {
                let dep_pos = plan.position(*dep).expect("dependency scheduled");
                assert!(dep_pos < pos, "#{dep} must precede #{}", node.id);
            }
        }
    }

    #[test]
    fn dependency_conflict_scenario() {
        // P1 no deps, P2 depends on P1, P3 overlaps files with P1.
        let proposals = vec![
            info(1, &["src/core.rs"]),
            info(2, &["src/api.rs"]),
            info(3, &["src/core.rs", "docs.md"]),
        ];
        let graph = build_graph(&proposals, &deps(&[(2, &[1])]));
        let plan = plan_merges(&graph);

        assert!(plan.position(1).unwrap() < plan.position(2).unwrap());
        assert_ne!(plan.batch_of(1), plan.batch_of(3));
        assert_eq!(plan.batches, vec![vec![1], vec![3], vec![2]]);
        assert_eq!(plan.order, vec![1, 3, 2]);
        assert_dependencies_respected(&graph, &plan);
    }

    #[test]
    fn independent_proposals_share_a_batch_in_id_order() {
        let proposals = vec![info(9, &["c"]), info(4, &["a"]), info(6, &["b"])];
        let plan = plan_merges(&build_graph(&proposals, &BTreeMap::new()));
        assert_eq!(plan.batches, vec![vec![4, 6, 9]]);
    }

    #[test]
    fn conflicting_layer_splits_first_fit() {
        // 1-2 and 2-3 conflict; 1 and 3 do not.
        let proposals = vec![info(1, &["x"]), info(2, &["x", "y"]), info(3, &["y"])];
        let plan = plan_merges(&build_graph(&proposals, &BTreeMap::new()));
        assert_eq!(plan.batches, vec![vec![1, 3], vec![2]]);
    }

    #[test]
    fn diamond_ordering() {
        let proposals = vec![info(1, &[]), info(2, &[]), info(3, &[]), info(4, &[])];
        let graph = build_graph(&proposals, &deps(&[(2, &[1]), (3, &[1]), (4, &[2, 3])]));
        let plan = plan_merges(&graph);
        assert_eq!(plan.batches, vec![vec![1], vec![2, 3], vec![4]]);
        assert_dependencies_respected(&graph, &plan);
    }

    #[test]
    fn excluded_components_are_left_out() {
        let proposals = vec![info(1, &[]), info(2, &[]), info(3, &[])];
        let graph = build_graph(&proposals, &deps(&[(1, &[2]), (2, &[1])]));
        let plan = plan_merges(&graph);
        assert_eq!(plan.order, vec![3]);
        assert_eq!(plan.excluded[0].members, vec![1, 2]);
        assert!(plan.render().contains("Excluded: dependency cycle"));
    }

    #[test]
    fn larger_graph_respects_every_edge() {
        let proposals: Vec<ProposalInfo> = (1..=8)
            .map(|id| {
                let files: &[&str] = if id % 2 == 0 { &["shared.rs"] } else { &[] };
                info(id, files)
            })
            .collect();
        let graph = build_graph(
            &proposals,
            &deps(&[(8, &[1, 3]), (5, &[2]), (3, &[2, 6]), (7, &[5, 8])]),
        );
        let plan = plan_merges(&graph);
        assert_eq!(plan.order.len(), 8);
        assert_dependencies_respected(&graph, &plan);
        for batch in &plan.batches {
            for &a in batch {
                for &b in batch {
                    assert!(a == b || !graph.conflicts(a, b));
                }
            }
        }
    }

    #[test]
    fn render_lists_batches_and_conflicts() {
        let proposals = vec![info(1, &["a.rs"]), info(2, &["a.rs"])];
        let text = plan_merges(&build_graph(&proposals, &BTreeMap::new())).render();
        assert!(text.contains("Batch 1: #1"));
        assert!(text.contains("Batch 2: #2"));
        assert!(text.contains("Conflict: #1 <-> #2 (a.rs)"));
    }
}
