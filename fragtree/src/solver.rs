/*! The tree solver contract and its backends.

A [`TreeSolver`] finds a maximum weight colorful subtree of an [`FGraph`]: an out-tree
rooted at the graph's root that uses each color at most once. Every backend returns
at least the trivial root-only tree, so its score never drops below the root score.

Backends:
- [`heuristic::CriticalPathSolver`], a greedy critical path heuristic
- [`dp::DynamicProgrammingSolver`], exact but exponential in the number of colors
- [`ilp::IntegerProgrammingSolver`], exact via an integer linear program

[`registry::SolverRegistry`] resolves an ordered list of backend names into a
[`registry::SolverSelection`].
*/
use std::fmt::Debug;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::graph::FGraph;
use crate::tree::FTree;

pub mod dp;
pub mod heuristic;
pub mod ilp;
pub mod registry;

pub use dp::DynamicProgrammingSolver;
pub use heuristic::CriticalPathSolver;
pub use ilp::{IntegerProgrammingSolver, LinearSolverKind};
pub use registry::{BackendParams, ConfigurationError, SolverConfig, SolverRegistry, SolverSelection};

/// Per-call options for [`TreeSolver::solve`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolveOptions {
    /// The point in time after which the solver should give up
    pub deadline: Option<Instant>,
}

impl SolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_time_limit(self, limit: Duration) -> Self {
        self.with_deadline(Some(Instant::now() + limit))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeSolverError {
    #[error("{solver} did not finish before its deadline")]
    Timeout { solver: String },
    #[error("{solver} cannot solve this graph: {reason}")]
    Unsupported { solver: String, reason: String },
    #[error("{solver} failed: {message}")]
    Backend { solver: String, message: String },
    #[error("{solver} produced an invalid solution: {reason}")]
    InvalidSolution { solver: String, reason: String },
}

impl TreeSolverError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Compute the maximum colorful subtree of a candidate graph.
pub trait TreeSolver: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Whether this solver guarantees an optimal tree when it finishes
    fn is_exact(&self) -> bool;

    /// Whether calls into this solver must not overlap, as with single-instance
    /// or per-process licensed libraries
    fn requires_serialization(&self) -> bool {
        false
    }

    /// Whether this solver can handle `graph` within its size limits
    fn supports(&self, _graph: &FGraph) -> bool {
        true
    }

    fn solve(&self, graph: &FGraph, options: &SolveOptions) -> Result<FTree, TreeSolverError>;
}

/// Tolerance for comparing tree scores across backends
pub const SCORE_EPSILON: f64 = 1e-9;

/// Relative disagreement between a backend's reported optimum and the rebuilt tree's
/// score beyond which the solution is rejected
pub const SCORE_TOLERANCE: f64 = 1e-4;

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::formula::MolecularFormula;
    use crate::graph::{Color, FragmentId, ROOT};

    /// Check the structural guarantees every backend must uphold
    pub(crate) fn check_tree(graph: &FGraph, tree: &FTree) {
        let rescored = tree.validate_against(graph).unwrap();
        assert!((rescored - tree.score()).abs() < 1e-6);
        let mut colors: Vec<Color> = tree.colors().collect();
        let n = colors.len();
        colors.sort();
        colors.dedup();
        assert_eq!(colors.len(), n, "A color was used twice");
        assert_eq!(tree.root().graph_id, ROOT);
        assert!(tree.score() >= graph.root_score() - SCORE_EPSILON);
    }

    /// A small deterministic pseudo-random layered graph with shared colors
    pub(crate) fn make_random_graph(seed: u64, n_colors: usize, per_color: usize) -> FGraph {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let mut next = move || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f64) / ((1u64 << 31) as f64)
        };
        let root: MolecularFormula = "C20H30O10".parse().unwrap();
        let mut graph = FGraph::new(root, 0.25);
        let mut ids: Vec<FragmentId> = Vec::new();
        for color in 1..=n_colors {
            for _ in 0..per_color {
                let id = graph
                    .add_fragment(MolecularFormula::empty(), color, None, 0.0)
                    .unwrap();
                ids.push(id);
            }
        }
        for &v in ids.iter() {
            graph.add_loss(ROOT, v, next() * 4.0 - 2.5).unwrap();
        }
        for (i, &u) in ids.iter().enumerate() {
            for &v in ids[i + 1..].iter() {
                if graph.fragment(u).color == graph.fragment(v).color {
                    continue;
                }
                if next() < 0.55 {
                    graph.add_loss(u, v, next() * 5.0 - 2.0).unwrap();
                }
            }
        }
        graph
    }
}
