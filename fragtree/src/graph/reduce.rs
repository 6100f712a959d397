/*! Reductions which shrink a graph without changing its best colorful subtree score.

[`vertex_upper_bounds`] bounds the score the subtree below each fragment can add. The
children of a fragment in a colorful tree have pairwise distinct colors, so for every
child color it takes the best loss into that color plus the bound of its target, and
sums the positive ones. A loss whose weight plus the bound of its target is negative
would lower any tree using it, so [`reduce_graph`] removes it together with every
fragment left unreachable.
*/
use std::collections::HashMap;

use identity_hash::BuildIdentityHasher;
use tracing::trace;

use crate::scorer::ScoreType;

use super::{Color, FGraph, GraphError, ROOT};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ReductionStats {
    pub losses_removed: usize,
    pub fragments_removed: usize,
    /// No colorful subtree of the graph scores more than this, root score included
    pub upper_bound: ScoreType,
}

/// The most each fragment's subtree can add to a tree's score
pub fn vertex_upper_bounds(graph: &FGraph) -> Vec<ScoreType> {
    let n = graph.number_of_fragments();
    let mut bounds: Vec<ScoreType> = vec![0.0; n];
    let mut best_by_color: HashMap<Color, ScoreType, BuildIdentityHasher<Color>> =
        HashMap::default();
    // Losses ascend in fragment id, so every child is bounded before its parents
    for v in (0..n).rev() {
        best_by_color.clear();
        for e in graph.outgoing(v) {
            let loss = graph.loss(*e);
            let gain = loss.weight + bounds[loss.target];
            best_by_color
                .entry(graph.fragment(loss.target).color)
                .and_modify(|best| *best = best.max(gain))
                .or_insert(gain);
        }
        bounds[v] = best_by_color.values().map(|best| best.max(0.0)).sum();
    }
    bounds
}

/// An upper bound on the score of any colorful subtree of `graph`
pub fn tree_upper_bound(graph: &FGraph) -> ScoreType {
    graph.root_score() + vertex_upper_bounds(graph)[ROOT]
}

/// Remove every loss that cannot be part of an optimal tree, and the fragments this
/// disconnects. Losses which could only add zero are kept, so equally scoring trees
/// explaining more peaks survive.
pub fn reduce_graph(graph: FGraph) -> Result<(FGraph, ReductionStats), GraphError> {
    let bounds = vertex_upper_bounds(&graph);
    let upper_bound = graph.root_score() + bounds[ROOT];
    let keep: Vec<bool> = graph
        .losses()
        .iter()
        .map(|loss| loss.weight + bounds[loss.target] >= 0.0)
        .collect();
    let fragments = graph.number_of_fragments();
    let losses = graph.number_of_losses();

    let reduced = graph.retain_losses(&keep)?;
    let stats = ReductionStats {
        losses_removed: losses - reduced.number_of_losses(),
        fragments_removed: fragments - reduced.number_of_fragments(),
        upper_bound,
    };
    trace!(
        "Reduced graph of {} by {} losses and {} fragments, bounded by {upper_bound:0.3}",
        reduced.candidate(),
        stats.losses_removed,
        stats.fragments_removed
    );
    Ok((reduced, stats))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formula::MolecularFormula;
    use crate::graph::test::{make_chain_graph, make_shared_color_graph};
    use crate::solver::test::make_random_graph;
    use crate::solver::{DynamicProgrammingSolver, SolveOptions, TreeSolver};

    #[test]
    fn test_upper_bounds() {
        let g = make_chain_graph();
        assert_eq!(vertex_upper_bounds(&g), vec![4.0, 2.5, 0.5, 0.0]);
        assert_eq!(tree_upper_bound(&g), 4.0);

        let g = make_shared_color_graph();
        let bounds = vertex_upper_bounds(&g);
        assert_eq!(bounds[1], 3.0);
        assert_eq!(bounds[2], 0.0);
        assert_eq!(bounds[ROOT], 3.5);
    }

    #[test]
    fn test_dominated_losses_removed() {
        let (g, stats) = reduce_graph(make_shared_color_graph()).unwrap();
        g.validate().unwrap();
        assert_eq!(stats.losses_removed, 1);
        assert_eq!(stats.fragments_removed, 0);
        assert_eq!(stats.upper_bound, 3.5);
        assert!(g.find_loss(2, 3).is_none());
        assert!(g.find_loss(1, 3).is_some());

        let mut g = make_chain_graph();
        let f = |s: &str| -> MolecularFormula { s.parse().unwrap() };
        let leaf = g.add_fragment(f("C6H6O3"), 4, None, 0.0).unwrap();
        g.add_loss(ROOT, leaf, -1.0).unwrap();
        let (g, stats) = reduce_graph(g).unwrap();
        g.validate().unwrap();
        assert_eq!(stats.losses_removed, 1);
        assert_eq!(stats.fragments_removed, 1);
        assert_eq!(g.number_of_colors(), 4);
    }

    #[test]
    fn test_reduction_keeps_optimum() {
        let dp = DynamicProgrammingSolver::default();
        let options = SolveOptions::default();
        for seed in 0..10 {
            let g = make_random_graph(seed, 7, 2);
            let full = dp.solve(&g, &options).unwrap();
            let (reduced, stats) = reduce_graph(g).unwrap();
            reduced.validate().unwrap();
            let best = dp.solve(&reduced, &options).unwrap();
            assert!(
                (full.score() - best.score()).abs() < 1e-9,
                "seed {seed}: {} != {}",
                full.score(),
                best.score()
            );
            assert!(best.score() <= stats.upper_bound + 1e-9);
        }
    }
}
