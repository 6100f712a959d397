/*! A greedy critical path heuristic for the colorful subtree problem.

Starting from the root-only tree, every round finds the heaviest path which leaves
the current tree, passes only through fragments whose colors are not yet used, and
never repeats a color along the way. The whole path is attached when its gain is
positive. The rounds stop once no path has a positive gain.

The heuristic never scores below the root score and is never better than an exact
solver on the same graph.
*/
use tracing::debug;

use crate::graph::{FGraph, FragmentId, LossId};
use crate::scorer::ScoreType;
use crate::tree::FTree;

use super::{SolveOptions, TreeSolver, TreeSolverError};

#[derive(Debug, Clone, Default)]
pub struct CriticalPathSolver {}

impl CriticalPathSolver {
    pub const NAME: &'static str = "heuristic";

    pub fn new() -> Self {
        Self {}
    }

    /// Walk the predecessor chain of `v` and check whether any fragment on it
    /// already carries `color`
    fn path_has_color(
        graph: &FGraph,
        predecessor: &[Option<LossId>],
        in_tree: &[bool],
        mut v: FragmentId,
        color: usize,
    ) -> bool {
        loop {
            if in_tree[v] {
                return false;
            }
            if graph.fragment(v).color == color {
                return true;
            }
            match predecessor[v] {
                Some(e) => v = graph.loss(e).source,
                None => return false,
            }
        }
    }

    /// Compute the best gain of every path ending in each fragment outside the tree,
    /// returning the gain and the loss entering each fragment along its best path
    fn best_paths(
        graph: &FGraph,
        in_tree: &[bool],
        used_colors: &[bool],
    ) -> (Vec<ScoreType>, Vec<Option<LossId>>) {
        let n = graph.number_of_fragments();
        let mut best = vec![ScoreType::NEG_INFINITY; n];
        let mut predecessor: Vec<Option<LossId>> = vec![None; n];

        // Edges always ascend in fragment id, so every source is final before its targets.
        for v in 0..n {
            if in_tree[v] {
                continue;
            }
            let color = graph.fragment(v).color;
            if used_colors[color] {
                continue;
            }
            for e in graph.incoming(v).iter().copied() {
                let loss = graph.loss(e);
                let u = loss.source;
                let candidate = if in_tree[u] {
                    loss.weight
                } else if best[u].is_finite()
                    && !Self::path_has_color(graph, &predecessor, in_tree, u, color)
                {
                    best[u] + loss.weight
                } else {
                    continue;
                };
                if candidate > best[v] {
                    best[v] = candidate;
                    predecessor[v] = Some(e);
                }
            }
        }
        (best, predecessor)
    }

    fn grow(&self, graph: &FGraph, options: &SolveOptions) -> Vec<LossId> {
        let n = graph.number_of_fragments();
        let mut in_tree = vec![false; n];
        in_tree[graph.root().id] = true;
        let mut used_colors = vec![false; graph.number_of_colors()];
        used_colors[graph.root().color] = true;
        let mut selected: Vec<LossId> = Vec::new();

        loop {
            if options.is_expired() {
                debug!(
                    "Critical path search stopped at its deadline with {} losses",
                    selected.len()
                );
                break;
            }
            let (best, predecessor) = Self::best_paths(graph, &in_tree, &used_colors);

            let mut end: Option<FragmentId> = None;
            let mut end_gain = 0.0;
            for (v, gain) in best.iter().copied().enumerate() {
                if gain > end_gain {
                    end_gain = gain;
                    end = Some(v);
                }
            }
            let Some(end) = end else {
                break;
            };

            let mut path = Vec::new();
            let mut v = end;
            while !in_tree[v] {
                let Some(e) = predecessor[v] else {
                    break;
                };
                path.push(e);
                v = graph.loss(e).source;
            }
            for e in path.into_iter().rev() {
                let target = graph.loss(e).target;
                in_tree[target] = true;
                used_colors[graph.fragment(target).color] = true;
                selected.push(e);
            }
        }
        selected
    }
}

impl TreeSolver for CriticalPathSolver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_exact(&self) -> bool {
        false
    }

    /// Grow a tree greedily. When the deadline passes between rounds, the tree grown
    /// so far is returned since it is already a valid solution.
    fn solve(&self, graph: &FGraph, options: &SolveOptions) -> Result<FTree, TreeSolverError> {
        let selected = self.grow(graph, options);
        FTree::from_losses(graph, &selected, Self::NAME).map_err(|e| {
            TreeSolverError::InvalidSolution {
                solver: Self::NAME.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::formula::MolecularFormula;
    use crate::graph::test::{make_chain_graph, make_shared_color_graph};
    use crate::graph::ROOT;
    use crate::solver::test::{check_tree, make_random_graph};

    #[test]
    fn test_chain() {
        let g = make_chain_graph();
        let tree = CriticalPathSolver::new()
            .solve(&g, &SolveOptions::default())
            .unwrap();
        check_tree(&g, &tree);
        assert!((tree.score() - 4.0).abs() < 1e-9);
        assert_eq!(tree.solver, "heuristic");
    }

    #[test]
    fn test_path_through_negative_edge() {
        let f = |s: &str| -> MolecularFormula { s.parse().unwrap() };
        let mut g = FGraph::new(f("C6H12O6"), 0.0);
        let a = g.add_fragment(f("C6H10O5"), 1, None, 0.0).unwrap();
        let b = g.add_fragment(f("C6H8O4"), 2, None, 0.0).unwrap();
        g.add_loss(ROOT, a, -1.0).unwrap();
        g.add_loss(a, b, 3.0).unwrap();
        let tree = CriticalPathSolver::new()
            .solve(&g, &SolveOptions::default())
            .unwrap();
        check_tree(&g, &tree);
        assert_eq!(tree.number_of_losses(), 2);
        assert!((tree.score() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_only_negative() {
        let f = |s: &str| -> MolecularFormula { s.parse().unwrap() };
        let mut g = FGraph::new(f("C6H12O6"), 1.0);
        let a = g.add_fragment(f("C6H10O5"), 1, None, 0.0).unwrap();
        g.add_loss(ROOT, a, -0.5).unwrap();
        let tree = CriticalPathSolver::new()
            .solve(&g, &SolveOptions::default())
            .unwrap();
        assert!(tree.is_trivial());
        assert_eq!(tree.score(), 1.0);
    }

    #[test]
    fn test_shared_color() {
        let g = make_shared_color_graph();
        let tree = CriticalPathSolver::new()
            .solve(&g, &SolveOptions::default())
            .unwrap();
        check_tree(&g, &tree);
        assert!((tree.score() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_random_graphs_are_valid() {
        let solver = CriticalPathSolver::new();
        for seed in 0..20 {
            let g = make_random_graph(seed, 6, 3);
            let tree = solver.solve(&g, &SolveOptions::default()).unwrap();
            check_tree(&g, &tree);
        }
    }

    #[test]
    fn test_expired_deadline() {
        let g = make_chain_graph();
        let options = SolveOptions::default().with_deadline(Some(Instant::now()));
        let tree = CriticalPathSolver::new().solve(&g, &options).unwrap();
        assert!(tree.is_trivial());
    }
}
