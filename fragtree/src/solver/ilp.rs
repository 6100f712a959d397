/*! An exact integer linear programming solver.

Every loss $`e`$ gets a binary variable $`x_e`$. The program is

```math
\begin{aligned}
\max \quad & \sum_e w_e x_e \\
\text{s.t.} \quad & \sum_{e \in \delta^-(C)} x_e \le 1 & \forall C \ne C_r \\
& x_f \le \sum_{e \in \delta^-(v)} x_e & \forall v \ne r, f \in \delta^+(v)
\end{aligned}
```

where $`\delta^-(C)`$ are the losses entering any fragment of color class $`C`$. The
color constraint also bounds every fragment to a single parent, and because losses
always ascend in fragment id the graph has no cycles. Every feasible assignment is
therefore a colorful out-tree of the root and no connectivity cuts are needed.

The bundled pure-Rust [`microlp`](good_lp::microlp) backend is always available. The
`highs` and `coin_cbc` features add native backends.
*/
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use good_lp::{
    constraint, variable, Constraint, Expression, ProblemVariables, Solution, SolverModel,
    Variable,
};
use tracing::{debug, warn};

use crate::graph::{FGraph, LossId, ROOT};
use crate::scorer::ScoreType;
use crate::tree::FTree;

use super::{SolveOptions, TreeSolver, TreeSolverError, SCORE_EPSILON, SCORE_TOLERANCE};

/// The linear programming library to hand the model to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinearSolverKind {
    MicroLp,
    #[cfg(feature = "highs")]
    Highs,
    #[cfg(feature = "coin_cbc")]
    Cbc,
}

impl LinearSolverKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MicroLp => "microlp",
            #[cfg(feature = "highs")]
            Self::Highs => "highs",
            #[cfg(feature = "coin_cbc")]
            Self::Cbc => "cbc",
        }
    }
}

#[derive(Debug, Clone)]
struct ProgramSolution {
    selected: Vec<LossId>,
    objective: ScoreType,
}

/// A self-contained copy of the parts of a graph the program needs, so the model
/// can be built on whichever thread solves it
#[derive(Debug, Clone)]
struct LossProgram {
    weights: Vec<ScoreType>,
    color_in: Vec<Vec<LossId>>,
    fragment_in: Vec<Vec<LossId>>,
    fragment_out: Vec<Vec<LossId>>,
}

impl LossProgram {
    fn from_graph(graph: &FGraph) -> Self {
        let weights = graph.losses().iter().map(|l| l.weight).collect();
        let mut color_in = vec![Vec::new(); graph.number_of_colors()];
        for loss in graph.losses() {
            color_in[graph.fragment(loss.target).color].push(loss.id);
        }
        let fragment_in = (0..graph.number_of_fragments())
            .map(|v| graph.incoming(v).to_vec())
            .collect();
        let fragment_out = (0..graph.number_of_fragments())
            .map(|v| graph.outgoing(v).to_vec())
            .collect();
        Self {
            weights,
            color_in,
            fragment_in,
            fragment_out,
        }
    }

    fn formulate(&self) -> (ProblemVariables, Vec<Variable>, Expression, Vec<Constraint>) {
        let mut vars = ProblemVariables::new();
        let x: Vec<Variable> = self
            .weights
            .iter()
            .map(|_| vars.add(variable().binary()))
            .collect();
        let objective: Expression = x
            .iter()
            .zip(self.weights.iter())
            .map(|(xi, w)| *w * *xi)
            .sum();

        let mut constraints = Vec::new();
        for entering in self.color_in.iter().skip(1) {
            if entering.len() < 2 {
                continue;
            }
            let total: Expression = entering.iter().map(|e| x[*e]).sum();
            constraints.push(constraint!(total <= 1.0));
        }
        for (v, out) in self.fragment_out.iter().enumerate() {
            if v == ROOT || out.is_empty() {
                continue;
            }
            for f in out.iter() {
                let child = x[*f];
                let parent: Expression = self.fragment_in[v].iter().map(|e| x[*e]).sum();
                constraints.push(constraint!(child <= parent));
            }
        }
        (vars, x, objective, constraints)
    }

    /// Solve `model`, returning the selected losses and the objective value the
    /// backend reports for them
    fn finish<M>(
        mut model: M,
        constraints: Vec<Constraint>,
        x: &[Variable],
        objective: Expression,
    ) -> Result<ProgramSolution, String>
    where
        M: SolverModel,
        M::Error: std::fmt::Display,
    {
        for c in constraints {
            model.add_constraint(c);
        }
        let solution = model.solve().map_err(|e| e.to_string())?;
        let selected = x
            .iter()
            .enumerate()
            .filter(|(_, xi)| solution.value(**xi) > 0.5)
            .map(|(i, _)| i)
            .collect();
        Ok(ProgramSolution {
            selected,
            objective: solution.eval(objective),
        })
    }

    fn solve_microlp(&self) -> Result<ProgramSolution, String> {
        let (vars, x, objective, constraints) = self.formulate();
        let reported = objective.clone();
        let model = vars.maximise(objective).using(good_lp::microlp);
        Self::finish(model, constraints, &x, reported)
    }

    /// Solve with a backend that enforces `time_limit` itself
    #[cfg_attr(
        not(any(feature = "highs", feature = "coin_cbc")),
        allow(unused_variables)
    )]
    fn solve_native(
        &self,
        kind: LinearSolverKind,
        time_limit: Option<Duration>,
    ) -> Result<ProgramSolution, String> {
        match kind {
            LinearSolverKind::MicroLp => self.solve_microlp(),
            #[cfg(feature = "highs")]
            LinearSolverKind::Highs => {
                use good_lp::solvers::WithTimeLimit;
                let (vars, x, objective, constraints) = self.formulate();
                let reported = objective.clone();
                let mut model = vars.maximise(objective).using(good_lp::highs);
                if let Some(limit) = time_limit {
                    model = model.with_time_limit(limit.as_secs_f64());
                }
                Self::finish(model, constraints, &x, reported)
            }
            #[cfg(feature = "coin_cbc")]
            LinearSolverKind::Cbc => {
                use good_lp::solvers::WithTimeLimit;
                let (vars, x, objective, constraints) = self.formulate();
                let reported = objective.clone();
                let mut model = vars.maximise(objective).using(good_lp::coin_cbc);
                model.set_parameter("log", "0");
                if let Some(limit) = time_limit {
                    model = model.with_time_limit(limit.as_secs_f64());
                }
                Self::finish(model, constraints, &x, reported)
            }
        }
    }
}

#[derive(Debug)]
struct DetachedSlots {
    free: Receiver<()>,
    release: Sender<()>,
    capacity: usize,
}

struct SlotPermit {
    release: Sender<()>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let _ = self.release.send(());
    }
}

impl DetachedSlots {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (release, free) = bounded(capacity);
        for _ in 0..capacity {
            let _ = release.send(());
        }
        Self {
            free,
            release,
            capacity,
        }
    }

    /// Wait up to `timeout` for a free permit
    fn acquire(&self, timeout: Duration) -> Option<SlotPermit> {
        self.free.recv_timeout(timeout).ok().map(|_| SlotPermit {
            release: self.release.clone(),
        })
    }

    fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }
}

fn default_detached_limit() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone)]
pub struct IntegerProgrammingSolver {
    kind: LinearSolverKind,
    name: String,
    detached: Arc<DetachedSlots>,
}

impl Default for IntegerProgrammingSolver {
    fn default() -> Self {
        Self::new(LinearSolverKind::MicroLp)
    }
}

impl IntegerProgrammingSolver {
    pub fn new(kind: LinearSolverKind) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            detached: Arc::new(DetachedSlots::new(default_detached_limit())),
        }
    }

    /// Limit how many `microlp` solves may run on helper threads at once, counting
    /// solves whose caller already timed out. Clones share the same limit.
    pub fn with_max_detached(mut self, limit: usize) -> Self {
        self.detached = Arc::new(DetachedSlots::new(limit));
        self
    }

    /// The number of helper threads still solving, including abandoned ones
    pub fn running_detached(&self) -> usize {
        self.detached.in_use()
    }

    pub fn kind(&self) -> LinearSolverKind {
        self.kind
    }

    fn backend_error(&self, message: String) -> TreeSolverError {
        TreeSolverError::Backend {
            solver: self.name.clone(),
            message,
        }
    }

    fn timeout(&self) -> TreeSolverError {
        TreeSolverError::Timeout {
            solver: self.name.clone(),
        }
    }

    /// Compare the objective the backend reported with the score of the tree rebuilt
    /// from its selected losses
    fn check_objective(&self, tree: &FTree, reported: ScoreType) -> Result<(), TreeSolverError> {
        let gap = (tree.score() - reported).abs();
        if gap > SCORE_TOLERANCE * reported.abs().max(1.0) {
            return Err(TreeSolverError::InvalidSolution {
                solver: self.name.clone(),
                reason: format!(
                    "rebuilt tree scores {} but the program reported {reported}",
                    tree.score()
                ),
            });
        } else if gap > SCORE_EPSILON {
            warn!(
                "{} solution for {} differs from its rebuilt tree by {gap:e}",
                self.name, tree.formula
            );
        }
        Ok(())
    }

    /// `microlp` has no time limit of its own, so it runs on a helper thread while
    /// this one waits for at most the remaining time. A solve that outlives its
    /// deadline is abandoned and its result discarded, but it keeps its permit
    /// until it ends. No new helper starts while every permit is taken.
    fn solve_detached(
        &self,
        program: LossProgram,
        options: &SolveOptions,
    ) -> Result<ProgramSolution, TreeSolverError> {
        let Some(remaining) = options.remaining() else {
            return program.solve_microlp().map_err(|e| self.backend_error(e));
        };
        let Some(permit) = self.detached.acquire(remaining) else {
            debug!(
                "No free {} solve slot before the deadline ({} running)",
                self.name,
                self.detached.in_use()
            );
            return Err(self.timeout());
        };
        let Some(remaining) = options.remaining().filter(|r| !r.is_zero()) else {
            return Err(self.timeout());
        };
        let (sender, receiver) = bounded(1);
        thread::Builder::new()
            .name(format!("{}-solve", self.name))
            .spawn(move || {
                let _permit = permit;
                let _ = sender.send(program.solve_microlp());
            })
            .map_err(|e| self.backend_error(e.to_string()))?;

        match receiver.recv_timeout(remaining) {
            Ok(result) => result.map_err(|e| self.backend_error(e)),
            Err(RecvTimeoutError::Timeout) => {
                debug!("Abandoning {} solve after {remaining:?}", self.name);
                Err(self.timeout())
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.backend_error("solver thread exited without a result".to_string()))
            }
        }
    }
}

impl TreeSolver for IntegerProgrammingSolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_exact(&self) -> bool {
        true
    }

    fn requires_serialization(&self) -> bool {
        match self.kind {
            LinearSolverKind::MicroLp => false,
            #[cfg(feature = "highs")]
            LinearSolverKind::Highs => false,
            #[cfg(feature = "coin_cbc")]
            LinearSolverKind::Cbc => true,
        }
    }

    fn solve(&self, graph: &FGraph, options: &SolveOptions) -> Result<FTree, TreeSolverError> {
        if graph.number_of_losses() == 0 {
            return Ok(FTree::trivial(graph, self.name.clone()));
        }
        if options.is_expired() {
            return Err(self.timeout());
        }
        let program = LossProgram::from_graph(graph);

        let solution = match self.kind {
            LinearSolverKind::MicroLp => self.solve_detached(program, options)?,
            #[allow(unreachable_patterns)]
            _ => {
                let result = program
                    .solve_native(self.kind, options.remaining())
                    .map_err(|e| self.backend_error(e));
                if options.is_expired() {
                    return Err(self.timeout());
                }
                result?
            }
        };

        let reported = graph.root_score() + solution.objective;
        let tree = FTree::from_losses(graph, &solution.selected, self.name.clone()).map_err(|e| {
            TreeSolverError::InvalidSolution {
                solver: self.name.clone(),
                reason: e.to_string(),
            }
        })?;
        self.check_objective(&tree, reported)?;
        Ok(tree)
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::graph::test::{make_chain_graph, make_shared_color_graph};
    use crate::solver::dp::DynamicProgrammingSolver;
    use crate::solver::test::{check_tree, make_random_graph};

    #[test]
    fn test_chain() {
        let g = make_chain_graph();
        let tree = IntegerProgrammingSolver::default()
            .solve(&g, &SolveOptions::default())
            .unwrap();
        check_tree(&g, &tree);
        assert!((tree.score() - 4.0).abs() < 1e-6);
        assert_eq!(tree.solver, "microlp");
    }

    #[test]
    fn test_shared_color() {
        let g = make_shared_color_graph();
        let tree = IntegerProgrammingSolver::default()
            .solve(&g, &SolveOptions::default())
            .unwrap();
        check_tree(&g, &tree);
        assert!((tree.score() - 3.5).abs() < 1e-6);
    }

    #[test]
    fn test_agrees_with_dp() {
        let ilp = IntegerProgrammingSolver::default();
        let dp = DynamicProgrammingSolver::default();
        let options = SolveOptions::default();
        for seed in 0..10 {
            let g = make_random_graph(seed, 6, 2);
            let a = ilp.solve(&g, &options).unwrap();
            let b = dp.solve(&g, &options).unwrap();
            check_tree(&g, &a);
            assert!(
                (a.score() - b.score()).abs() < 1e-6,
                "seed {seed}: {} != {}",
                a.score(),
                b.score()
            );
        }
    }

    #[test]
    fn test_objective_gap_rejected() {
        let g = make_chain_graph();
        let solver = IntegerProgrammingSolver::default();
        let tree = FTree::from_losses(&g, &[0, 1, 2], "microlp").unwrap();
        assert!(solver.check_objective(&tree, 4.0).is_ok());
        assert!(solver.check_objective(&tree, 4.0 + 1e-7).is_ok());
        assert!(matches!(
            solver.check_objective(&tree, 4.5),
            Err(TreeSolverError::InvalidSolution { .. })
        ));
    }

    #[test]
    fn test_busy_slots_time_out() {
        let g = make_chain_graph();
        let solver = IntegerProgrammingSolver::default().with_max_detached(1);
        let held = solver.detached.acquire(Duration::from_secs(1)).unwrap();
        assert_eq!(solver.running_detached(), 1);

        let options = SolveOptions::default().with_time_limit(Duration::from_millis(30));
        let err = solver.solve(&g, &options).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(solver.running_detached(), 1);

        drop(held);
        assert_eq!(solver.running_detached(), 0);
        let options = SolveOptions::default().with_time_limit(Duration::from_secs(30));
        let tree = solver.solve(&g, &options).unwrap();
        assert!((tree.score() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_abandoned_solves_stay_bounded() {
        let g = make_random_graph(7, 40, 4);
        let solver = IntegerProgrammingSolver::default().with_max_detached(2);
        let shared = solver.clone();
        for _ in 0..6 {
            let options = SolveOptions::default().with_time_limit(Duration::from_millis(20));
            match shared.solve(&g, &options) {
                Ok(tree) => check_tree(&g, &tree),
                Err(e) => assert!(e.is_timeout(), "{e}"),
            }
            assert!(solver.running_detached() <= 2);
        }
    }

    #[test]
    fn test_expired_deadline() {
        let g = make_chain_graph();
        let options = SolveOptions::default().with_deadline(Some(Instant::now()));
        let err = IntegerProgrammingSolver::default()
            .solve(&g, &options)
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
