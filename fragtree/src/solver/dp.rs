/*! An exact dynamic programming solver over color subsets.

For a fragment $`v`$ and a set of colors $`S`$ not containing $`c(v)`$, let
$`W(v, S)`$ be the best weight of a subtree rooted at $`v`$ whose non-root fragments
use exactly the colors in $`S`$. Then $`W(v, \emptyset) = 0`$ and

```math
W(v, S) = \max\begin{cases}
    w(v, u) + W(u, S \setminus \{c(u)\}) & (v, u) \in E, c(u) \in S \\
    W(v, S_1) + W(v, S \setminus S_1) & S_1 \subsetneq S, \min(S) \in S_1
\end{cases}
```

Fragments are visited in descending id, so every child's table is complete before
its parents read it. The best tree scores $`\max(0, \max_S W(r, S))`$ over the root's
score. Runtime grows as $`O(3^k)`$ per fragment in the number of colors $`k`$, which is
why graphs with more than [`DynamicProgrammingSolver::max_colors`] are declined.

Every fragment keeps a table of $`2^k`$ scores and back pointers, 24 bytes per cell.
That is 96 KiB per fragment at the default of 12 colors and 1.5 MiB at
[`MAX_COLORS_LIMIT`].
*/
use tracing::trace;

use crate::graph::{FGraph, FragmentId, LossId, ROOT};
use crate::scorer::ScoreType;
use crate::tree::FTree;

use super::{SolveOptions, TreeSolver, TreeSolverError, SCORE_TOLERANCE};

/// The largest number of non-root colors the solver can ever be configured for.
/// Tables grow as `2^k` per fragment, so this stays well below the width of a mask.
pub const MAX_COLORS_LIMIT: usize = 16;

/// How the best value of a table cell was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Infeasible,
    Leaf,
    Edge(LossId),
    Split(u32),
}

#[derive(Debug, Clone)]
pub struct DynamicProgrammingSolver {
    max_colors: usize,
}

impl Default for DynamicProgrammingSolver {
    fn default() -> Self {
        Self { max_colors: 12 }
    }
}

impl DynamicProgrammingSolver {
    pub const NAME: &'static str = "dp";

    /// Create a solver accepting graphs with up to `max_colors` non-root colors,
    /// clamped to [`MAX_COLORS_LIMIT`]
    pub fn new(max_colors: usize) -> Self {
        Self {
            max_colors: max_colors.min(MAX_COLORS_LIMIT),
        }
    }

    pub fn max_colors(&self) -> usize {
        self.max_colors
    }

    fn timeout() -> TreeSolverError {
        TreeSolverError::Timeout {
            solver: Self::NAME.to_string(),
        }
    }

    #[inline(always)]
    fn color_bit(graph: &FGraph, v: FragmentId) -> u32 {
        1 << (graph.fragment(v).color - 1)
    }

    fn fill_tables(
        &self,
        graph: &FGraph,
        n_colors: usize,
        options: &SolveOptions,
    ) -> Result<(Vec<Vec<ScoreType>>, Vec<Vec<Step>>), TreeSolverError> {
        let n = graph.number_of_fragments();
        let width = 1usize << n_colors;
        let mut values: Vec<Vec<ScoreType>> = vec![Vec::new(); n];
        let mut steps: Vec<Vec<Step>> = vec![Vec::new(); n];

        for v in (0..n).rev() {
            if options.is_expired() {
                return Err(Self::timeout());
            }
            let own_bit = if v == ROOT { 0 } else { Self::color_bit(graph, v) };
            let mut value = vec![ScoreType::NEG_INFINITY; width];
            let mut step = vec![Step::Infeasible; width];
            value[0] = 0.0;
            step[0] = Step::Leaf;

            for s in 1..width as u32 {
                if s & own_bit != 0 {
                    continue;
                }
                let mut best = ScoreType::NEG_INFINITY;
                let mut best_step = Step::Infeasible;

                for e in graph.outgoing(v).iter().copied() {
                    let loss = graph.loss(e);
                    let bit = Self::color_bit(graph, loss.target);
                    if s & bit == 0 {
                        continue;
                    }
                    let rest = values[loss.target][(s ^ bit) as usize];
                    if !rest.is_finite() {
                        continue;
                    }
                    let candidate = loss.weight + rest;
                    if candidate > best {
                        best = candidate;
                        best_step = Step::Edge(e);
                    }
                }

                let low = s & s.wrapping_neg();
                let others = s ^ low;
                if others != 0 {
                    // Every proper subset of `others`, each joined with the lowest color
                    let mut sub = (others - 1) & others;
                    loop {
                        let s1 = low | sub;
                        let s2 = s ^ s1;
                        let a = value[s1 as usize];
                        let b = value[s2 as usize];
                        if a.is_finite() && b.is_finite() && a + b > best {
                            best = a + b;
                            best_step = Step::Split(s1);
                        }
                        if sub == 0 {
                            break;
                        }
                        sub = (sub - 1) & others;
                    }
                }

                value[s as usize] = best;
                step[s as usize] = best_step;
            }
            values[v] = value;
            steps[v] = step;
        }
        Ok((values, steps))
    }

    fn backtrack(
        graph: &FGraph,
        steps: &[Vec<Step>],
        mask: u32,
    ) -> Result<Vec<LossId>, TreeSolverError> {
        let mut selected = Vec::new();
        let mut stack = vec![(ROOT, mask)];
        while let Some((v, s)) = stack.pop() {
            match steps[v][s as usize] {
                Step::Leaf => {}
                Step::Edge(e) => {
                    let target = graph.loss(e).target;
                    selected.push(e);
                    stack.push((target, s ^ Self::color_bit(graph, target)));
                }
                Step::Split(s1) => {
                    stack.push((v, s1));
                    stack.push((v, s ^ s1));
                }
                Step::Infeasible => {
                    return Err(TreeSolverError::InvalidSolution {
                        solver: Self::NAME.to_string(),
                        reason: format!("backtracking reached an infeasible state at fragment {v}"),
                    })
                }
            }
        }
        Ok(selected)
    }
}

impl TreeSolver for DynamicProgrammingSolver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_exact(&self) -> bool {
        true
    }

    fn supports(&self, graph: &FGraph) -> bool {
        graph.number_of_colors().saturating_sub(1) <= self.max_colors
    }

    fn solve(&self, graph: &FGraph, options: &SolveOptions) -> Result<FTree, TreeSolverError> {
        let n_colors = graph.number_of_colors().saturating_sub(1);
        if n_colors > self.max_colors {
            return Err(TreeSolverError::Unsupported {
                solver: Self::NAME.to_string(),
                reason: format!(
                    "{n_colors} colors exceeds the limit of {}",
                    self.max_colors
                ),
            });
        }
        if n_colors == 0 {
            return Ok(FTree::trivial(graph, Self::NAME));
        }

        let (values, steps) = self.fill_tables(graph, n_colors, options)?;

        let mut best = 0.0;
        let mut best_mask = 0u32;
        for (s, value) in values[ROOT].iter().copied().enumerate() {
            if value > best {
                best = value;
                best_mask = s as u32;
            }
        }
        trace!(
            "Best colorful subtree weight {best} over color mask {best_mask:#b} for {}",
            graph.candidate()
        );

        let selected = Self::backtrack(graph, &steps, best_mask)?;
        let tree = FTree::from_losses(graph, &selected, Self::NAME).map_err(|e| {
            TreeSolverError::InvalidSolution {
                solver: Self::NAME.to_string(),
                reason: e.to_string(),
            }
        })?;
        let expected = graph.root_score() + best;
        if (tree.score() - expected).abs() > SCORE_TOLERANCE * expected.abs().max(1.0) {
            return Err(TreeSolverError::InvalidSolution {
                solver: Self::NAME.to_string(),
                reason: format!(
                    "tree scores {} but the table optimum is {expected}",
                    tree.score()
                ),
            });
        }
        Ok(tree)
    }
}
