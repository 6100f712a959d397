/*! Rank candidate formulas for one spectrum by the score of their best fragmentation tree.

[`compute_best`] runs in three stages:
1. A worker pool builds every candidate's [`FGraph`] and a heuristic tree for it,
   streaming the results through a bounded queue to the calling thread.
2. The calling thread records every heuristic result and keeps the best graphs for
   exact solving. When none of the best heuristic trees explain the spectrum well,
   the tree size bonus is raised and the first stage repeated.
3. A second set of workers reduces the kept graphs and solves them exactly. A failed
   or timed out solve keeps the candidate's heuristic tree. Once the wanted number of
   results is known, a graph whose score bound cannot reach the worst of them is
   skipped.

How much exact solving happens depends on the precursor m/z, see [`ExactMode`].
*/
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use itertools::Itertools;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::formula::{CandidateFormula, MolecularFormula};
use crate::graph::{
    build_graph, reduce_graph, tree_upper_bound, FGraph, FormulaValidator, GraphBuildOutcome,
    GraphBuilderParams, RdbeValidator,
};
use crate::scorer::{FragmentScorer, ScoreType};
use crate::solver::{
    ConfigurationError, CriticalPathSolver, SolveOptions, SolverSelection, TreeSolver,
    SCORE_EPSILON,
};
use crate::spectrum::ProcessedSpectrum;
use crate::tree::FTree;

/// How a spectrum's candidates are solved, chosen by its precursor m/z
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExactMode {
    /// Solve every feasible candidate exactly
    All,
    /// Solve only the best candidates by heuristic score exactly
    Triage,
    /// Keep the heuristic trees
    HeuristicOnly,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ComputeConfig {
    /// The number of results wanted
    pub number_of_results: usize,
    /// How many graphs beyond `number_of_results` triage keeps for exact solving
    pub triage_extra: usize,
    /// Workers building graphs. Zero uses every available core.
    pub threads: usize,
    /// Workers solving trees exactly. Zero uses the same number as `threads`.
    pub exact_threads: usize,
    pub graph_queue_size: usize,
    pub exact_queue_size: usize,
    /// The time limit in seconds for a single exact solve
    pub tree_timeout: Option<f64>,
    /// The time limit in seconds for a whole spectrum
    pub instance_timeout: Option<f64>,
    pub heuristic_only_above_mz: f64,
    pub heuristic_triage_above_mz: f64,
    pub builder: GraphBuilderParams,
    /// Raise the tree size bonus while the best heuristic trees explain too little
    pub adapt_tree_size: bool,
    pub tree_size_step: ScoreType,
    pub max_tree_size_increase: ScoreType,
    pub min_explained_intensity: f64,
    pub max_explained_peaks: usize,
    /// Remove losses which cannot be part of an optimal tree before solving exactly
    pub reduce_graphs: bool,
    /// Skip exact solves whose score bound falls below the worst wanted result
    pub prune_by_bound: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            number_of_results: 10,
            triage_extra: 10,
            threads: 0,
            exact_threads: 0,
            graph_queue_size: 256,
            exact_queue_size: 16,
            tree_timeout: None,
            instance_timeout: None,
            heuristic_only_above_mz: 650.0,
            heuristic_triage_above_mz: 300.0,
            builder: GraphBuilderParams::default(),
            adapt_tree_size: true,
            tree_size_step: 0.5,
            max_tree_size_increase: 3.0,
            min_explained_intensity: 0.7,
            max_explained_peaks: 15,
            reduce_graphs: true,
            prune_by_bound: true,
        }
    }
}

impl ComputeConfig {
    pub fn exact_mode(&self, precursor_mz: f64) -> ExactMode {
        if precursor_mz >= self.heuristic_only_above_mz {
            ExactMode::HeuristicOnly
        } else if precursor_mz >= self.heuristic_triage_above_mz {
            ExactMode::Triage
        } else {
            ExactMode::All
        }
    }

    /// The number of graphs kept for exact solving in triage
    pub fn triage_size(&self) -> usize {
        self.number_of_results.saturating_add(self.triage_extra)
    }

    pub fn tree_timeout(&self) -> Option<Duration> {
        self.tree_timeout
            .and_then(|t| Duration::try_from_secs_f64(t).ok())
    }

    pub fn instance_timeout(&self) -> Option<Duration> {
        self.instance_timeout
            .and_then(|t| Duration::try_from_secs_f64(t).ok())
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |name: &'static str, reason: String| {
            Err(ConfigurationError::InvalidParameter { name, reason })
        };
        if self.graph_queue_size == 0 {
            return invalid("graph_queue_size", "must be at least 1".into());
        }
        if self.exact_queue_size == 0 {
            return invalid("exact_queue_size", "must be at least 1".into());
        }
        if !(self.heuristic_only_above_mz >= self.heuristic_triage_above_mz) {
            return invalid(
                "heuristic_only_above_mz",
                format!(
                    "{} is below heuristic_triage_above_mz {}",
                    self.heuristic_only_above_mz, self.heuristic_triage_above_mz
                ),
            );
        }
        for (name, value) in [
            ("tree_timeout", self.tree_timeout),
            ("instance_timeout", self.instance_timeout),
        ] {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return invalid(name, format!("{value} is not a valid number of seconds"));
                }
            }
        }
        if self.adapt_tree_size && !(self.tree_size_step > 0.0) {
            return invalid(
                "tree_size_step",
                format!("{} must be positive", self.tree_size_step),
            );
        }
        if !self.builder.tree_size_bonus.is_finite() {
            return invalid(
                "builder.tree_size_bonus",
                format!("{} is not finite", self.builder.tree_size_bonus),
            );
        }
        Ok(())
    }

    fn create_threadpool(&self) -> Result<rayon::ThreadPool, ComputeError> {
        let num_threads = if self.threads > 0 {
            self.threads
        } else {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };
        debug!("Using {} threads to build graphs", num_threads);
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?)
    }

    fn exact_workers(&self) -> usize {
        if self.exact_threads > 0 {
            self.exact_threads
        } else if self.threads > 0 {
            self.threads
        } else {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Failed to create the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum CandidateStatus {
    /// Solved to optimality by the named backend
    Exact { solver: String },
    /// Solved only by the heuristic, as decided by [`ExactMode`] or triage
    Heuristic,
    /// The exact solve failed, the heuristic tree was kept
    FailedWithFallback { reason: String },
    /// No graph could be built for the candidate
    Excluded { reason: String },
}

/// The outcome for one candidate formula
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CandidateResult {
    pub formula: MolecularFormula,
    pub status: CandidateStatus,
    pub tree: Option<FTree>,
    /// The realized score, the better of the exact and heuristic trees. Excluded
    /// candidates score negative infinity.
    pub score: ScoreType,
    pub heuristic_score: Option<ScoreType>,
    pub unexplained_peaks: usize,
    pub prior_score: f64,
}

impl CandidateResult {
    fn from_heuristic(candidate: &CandidateFormula, tree: FTree) -> Self {
        Self {
            formula: candidate.formula,
            status: CandidateStatus::Heuristic,
            score: tree.score(),
            heuristic_score: Some(tree.score()),
            unexplained_peaks: tree.unexplained_peaks(),
            prior_score: candidate.prior_score,
            tree: Some(tree),
        }
    }

    fn excluded(candidate: &CandidateFormula, reason: String) -> Self {
        Self {
            formula: candidate.formula,
            status: CandidateStatus::Excluded { reason },
            tree: None,
            score: ScoreType::NEG_INFINITY,
            heuristic_score: None,
            unexplained_peaks: 0,
            prior_score: candidate.prior_score,
        }
    }

    /// Replace the heuristic tree with an exact one unless the heuristic tree is
    /// numerically better
    fn accept_exact(&mut self, tree: FTree) {
        let solver = tree.solver.clone();
        let keep_heuristic = self
            .heuristic_score
            .is_some_and(|h| h > tree.score() + SCORE_EPSILON);
        if keep_heuristic {
            debug!(
                "Heuristic tree for {} scores above the {solver} tree ({:?} > {})",
                self.formula,
                self.heuristic_score,
                tree.score()
            );
        } else {
            self.score = tree.score();
            self.unexplained_peaks = tree.unexplained_peaks();
            self.tree = Some(tree);
        }
        self.status = CandidateStatus::Exact { solver };
    }

    pub fn is_excluded(&self) -> bool {
        matches!(self.status, CandidateStatus::Excluded { .. })
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.status, CandidateStatus::Exact { .. })
    }
}

/// Order results best first: higher score, then fewer unexplained peaks, then formula
pub fn rank_order(a: &CandidateResult, b: &CandidateResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.unexplained_peaks.cmp(&b.unexplained_peaks))
        .then_with(|| a.formula.hill_cmp(&b.formula))
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComputeStats {
    pub candidates: usize,
    pub graphs_built: usize,
    pub excluded: usize,
    pub exact_solved: usize,
    pub fallbacks: usize,
    pub fragments: usize,
    pub losses: usize,
    pub tree_size_rounds: usize,
    /// Exact solves skipped because their score bound could not reach the results
    pub pruned: usize,
    pub losses_reduced: usize,
}

impl Add for ComputeStats {
    type Output = ComputeStats;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for ComputeStats {
    fn add_assign(&mut self, rhs: Self) {
        self.candidates += rhs.candidates;
        self.graphs_built += rhs.graphs_built;
        self.excluded += rhs.excluded;
        self.exact_solved += rhs.exact_solved;
        self.fallbacks += rhs.fallbacks;
        self.fragments += rhs.fragments;
        self.losses += rhs.losses;
        self.tree_size_rounds += rhs.tree_size_rounds;
        self.pruned += rhs.pruned;
        self.losses_reduced += rhs.losses_reduced;
    }
}

impl Sum for ComputeStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |a, b| a + b)
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComputeResult {
    /// Every candidate with a tree, best first
    pub ranked: Vec<CandidateResult>,
    pub excluded: Vec<CandidateResult>,
    pub stats: ComputeStats,
}

impl ComputeResult {
    pub fn best(&self) -> Option<&CandidateResult> {
        self.ranked.first()
    }
}

type ResultMap = Mutex<BTreeMap<MolecularFormula, CandidateResult>>;

fn lock_results(results: &ResultMap) -> MutexGuard<'_, BTreeMap<MolecularFormula, CandidateResult>> {
    results.lock().unwrap_or_else(|e| e.into_inner())
}

/// The score of the `k`-th best realized result, or negative infinity while there are
/// fewer than `k`
fn kth_best_score(results: &BTreeMap<MolecularFormula, CandidateResult>, k: usize) -> ScoreType {
    if k == 0 {
        return ScoreType::NEG_INFINITY;
    }
    let mut scores: Vec<ScoreType> = results
        .values()
        .filter(|r| !r.is_excluded())
        .map(|r| r.score)
        .collect();
    if scores.len() < k {
        return ScoreType::NEG_INFINITY;
    }
    let (_, kth, _) = scores.select_nth_unstable_by(k - 1, |a, b| b.total_cmp(a));
    *kth
}

/// The score a candidate must be able to reach to enter the wanted results. It only
/// ever rises, shared between the exact solver workers as the bits of an `f64`.
#[derive(Debug)]
struct LowerBound {
    bits: AtomicU64,
}

impl LowerBound {
    fn new() -> Self {
        Self {
            bits: AtomicU64::new(ScoreType::NEG_INFINITY.to_bits()),
        }
    }

    fn get(&self) -> ScoreType {
        ScoreType::from_bits(self.bits.load(AtomicOrdering::Acquire))
    }

    fn raise(&self, score: ScoreType) {
        let raised = self
            .bits
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |bits| {
                (score > ScoreType::from_bits(bits)).then_some(score.to_bits())
            });
        if let Ok(previous) = raised {
            trace!(
                "Raised the lower bound from {} to {score}",
                ScoreType::from_bits(previous)
            );
        }
    }
}

enum GraphStageItem {
    Built {
        candidate: CandidateFormula,
        graph: FGraph,
        tree: FTree,
    },
    Excluded {
        candidate: CandidateFormula,
        reason: String,
    },
}

/// A graph waiting for an exact solve, ordered by its heuristic score
#[derive(Debug)]
struct TriageEntry {
    score: ScoreType,
    candidate: CandidateFormula,
    graph: FGraph,
}

impl PartialEq for TriageEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TriageEntry {}

impl PartialOrd for TriageEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TriageEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.candidate.formula.cmp(&self.candidate.formula))
    }
}

fn graph_and_heuristic(
    spectrum: &ProcessedSpectrum,
    candidate: &CandidateFormula,
    scorer: &dyn FragmentScorer,
    validator: &dyn FormulaValidator,
    builder: &GraphBuilderParams,
    heuristic: &CriticalPathSolver,
) -> GraphStageItem {
    let graph = match build_graph(spectrum, candidate, scorer, validator, builder) {
        Ok(GraphBuildOutcome::Graph(graph)) => graph,
        Ok(GraphBuildOutcome::NoCandidates(reason)) => {
            trace!("Excluding {}: {reason}", candidate.formula);
            return GraphStageItem::Excluded {
                candidate: *candidate,
                reason: reason.to_string(),
            };
        }
        Err(e) => {
            warn!("Failed to build a graph for {}: {e}", candidate.formula);
            return GraphStageItem::Excluded {
                candidate: *candidate,
                reason: e.to_string(),
            };
        }
    };
    let tree = heuristic
        .solve(&graph, &SolveOptions::default())
        .unwrap_or_else(|e| {
            warn!("Heuristic failed for {}, using the root alone: {e}", candidate.formula);
            FTree::trivial(&graph, CriticalPathSolver::NAME)
        });
    GraphStageItem::Built {
        candidate: *candidate,
        graph,
        tree,
    }
}

/// Build every candidate's graph and heuristic tree on `pool`, record the heuristic
/// results and return the best `keep` graphs, best first.
#[tracing::instrument(skip_all, level = "debug", fields(tree_size_bonus = builder.tree_size_bonus))]
#[allow(clippy::too_many_arguments)]
fn graph_stage(
    pool: &rayon::ThreadPool,
    spectrum: &ProcessedSpectrum,
    candidates: &[CandidateFormula],
    scorer: &dyn FragmentScorer,
    validator: &dyn FormulaValidator,
    builder: &GraphBuilderParams,
    heuristic: &CriticalPathSolver,
    queue_size: usize,
    keep: usize,
    results: &ResultMap,
) -> (Vec<TriageEntry>, ComputeStats) {
    let (sender, receiver) = bounded(queue_size);
    let mut heap: BinaryHeap<Reverse<TriageEntry>> = BinaryHeap::new();
    let mut stats = ComputeStats {
        candidates: candidates.len(),
        ..Default::default()
    };

    thread::scope(|scope| {
        scope.spawn(move || {
            pool.install(|| {
                candidates
                    .par_iter()
                    .for_each_with(sender, |sender, candidate| {
                        let item = graph_and_heuristic(
                            spectrum, candidate, scorer, validator, builder, heuristic,
                        );
                        if let Err(e) = sender.send(item) {
                            warn!("Failed to send graph for {}: {e}", candidate.formula);
                        }
                    })
            })
        });

        for item in receiver.iter() {
            match item {
                GraphStageItem::Built {
                    candidate,
                    graph,
                    tree,
                } => {
                    stats.graphs_built += 1;
                    stats.fragments += graph.number_of_fragments();
                    stats.losses += graph.number_of_losses();
                    let score = tree.score();
                    lock_results(results)
                        .insert(candidate.formula, CandidateResult::from_heuristic(&candidate, tree));
                    if keep > 0 {
                        heap.push(Reverse(TriageEntry {
                            score,
                            candidate,
                            graph,
                        }));
                        if heap.len() > keep {
                            heap.pop();
                        }
                    }
                }
                GraphStageItem::Excluded { candidate, reason } => {
                    stats.excluded += 1;
                    lock_results(results)
                        .insert(candidate.formula, CandidateResult::excluded(&candidate, reason));
                }
            }
        }
    });

    let entries = heap.into_sorted_vec().into_iter().map(|e| e.0).collect();
    (entries, stats)
}

/// Whether any of the best five heuristic trees explains enough of the spectrum
fn is_well_explained(results: &ResultMap, config: &ComputeConfig) -> bool {
    let map = lock_results(results);
    let mut best: Vec<&CandidateResult> = map.values().filter(|r| r.tree.is_some()).collect();
    if best.is_empty() {
        return true;
    }
    best.sort_by(|a, b| rank_order(a, b));
    best.iter().take(5).filter_map(|r| r.tree.as_ref()).any(|tree| {
        let wanted_peaks = tree
            .peaks_considered()
            .saturating_sub(2)
            .min(config.max_explained_peaks);
        tree.explained_intensity() >= config.min_explained_intensity
            && tree.number_of_fragments().saturating_sub(1) >= wanted_peaks
    })
}

fn solve_exact(
    entry: TriageEntry,
    selection: &SolverSelection,
    config: &ComputeConfig,
    instance_deadline: Option<Instant>,
    bound: &LowerBound,
    results: &ResultMap,
) -> ComputeStats {
    let TriageEntry {
        candidate, graph, ..
    } = entry;
    let formula = candidate.formula;
    let mut stats = ComputeStats::default();
    let now = Instant::now();

    let outcome = if instance_deadline.is_some_and(|d| now >= d) {
        Err("instance timeout".to_string())
    } else {
        let reduced = if config.reduce_graphs {
            reduce_graph(graph).map(|(graph, reduction)| {
                stats.losses_reduced += reduction.losses_removed;
                (graph, reduction.upper_bound)
            })
        } else {
            let upper_bound = tree_upper_bound(&graph);
            Ok((graph, upper_bound))
        };
        match reduced {
            Ok((_, upper_bound))
                if config.prune_by_bound && upper_bound + SCORE_EPSILON < bound.get() =>
            {
                trace!(
                    "Skipping {formula}, its bound {upper_bound:0.3} is below {:0.3}",
                    bound.get()
                );
                stats.pruned += 1;
                return stats;
            }
            Ok((graph, _)) => {
                let deadline = match (config.tree_timeout(), instance_deadline) {
                    (Some(limit), Some(d)) => Some((now + limit).min(d)),
                    (Some(limit), None) => Some(now + limit),
                    (None, d) => d,
                };
                let options = SolveOptions::new().with_deadline(deadline);
                selection.solve(&graph, &options).map_err(|e| {
                    debug!("Exact solve failed for {formula}: {e}");
                    e.to_string()
                })
            }
            Err(e) => {
                warn!("Failed to reduce the graph of {formula}: {e}");
                Err(e.to_string())
            }
        }
    };

    let mut map = lock_results(results);
    let Some(result) = map.get_mut(&formula) else {
        warn!("No heuristic result recorded for {formula}");
        return stats;
    };
    match outcome {
        Ok(tree) => {
            stats.exact_solved += 1;
            result.accept_exact(tree);
            if config.prune_by_bound {
                bound.raise(kth_best_score(&map, config.number_of_results));
            }
        }
        Err(reason) => {
            stats.fallbacks += 1;
            result.status = CandidateStatus::FailedWithFallback { reason };
        }
    }
    stats
}

/// Solve every entry with `selection` on a set of scoped workers
#[tracing::instrument(skip_all, level = "debug", fields(graphs = entries.len()))]
fn exact_stage(
    entries: Vec<TriageEntry>,
    selection: &SolverSelection,
    config: &ComputeConfig,
    instance_deadline: Option<Instant>,
    results: &ResultMap,
) -> ComputeStats {
    if entries.is_empty() {
        return ComputeStats::default();
    }
    let bound = LowerBound::new();
    if config.prune_by_bound {
        bound.raise(kth_best_score(&lock_results(results), config.number_of_results));
    }
    let bound = &bound;
    let n_workers = config.exact_workers().min(entries.len());
    let (sender, receiver) = bounded::<TriageEntry>(config.exact_queue_size);

    thread::scope(|scope| {
        let workers: Vec<_> = (0..n_workers)
            .map(|_| {
                let receiver = receiver.clone();
                scope.spawn(move || {
                    receiver
                        .iter()
                        .map(|entry| {
                            solve_exact(entry, selection, config, instance_deadline, bound, results)
                        })
                        .sum::<ComputeStats>()
                })
            })
            .collect();
        drop(receiver);

        for entry in entries {
            if let Err(e) = sender.send(entry) {
                warn!("Failed to queue graph for {}: {e}", e.0.candidate.formula);
                break;
            }
        }
        drop(sender);

        workers
            .into_iter()
            .map(|w| {
                w.join().unwrap_or_else(|_| {
                    warn!("An exact solver worker panicked");
                    ComputeStats::default()
                })
            })
            .sum()
    })
}

/// Rank `candidates` for `spectrum` using the default [`RdbeValidator`].
pub fn compute_best(
    spectrum: &ProcessedSpectrum,
    candidates: &[CandidateFormula],
    scorer: &dyn FragmentScorer,
    selection: &SolverSelection,
    config: &ComputeConfig,
) -> Result<ComputeResult, ComputeError> {
    compute_best_with_validator(
        spectrum,
        candidates,
        scorer,
        &RdbeValidator::default(),
        selection,
        config,
    )
}

/// Rank `candidates` for `spectrum` by the score of their best fragmentation tree.
///
/// Candidates repeating an earlier formula are ignored. Infeasible candidates are
/// returned in [`ComputeResult::excluded`].
#[tracing::instrument(skip_all, level = "debug", fields(precursor_mz = spectrum.precursor_mz))]
pub fn compute_best_with_validator(
    spectrum: &ProcessedSpectrum,
    candidates: &[CandidateFormula],
    scorer: &dyn FragmentScorer,
    validator: &dyn FormulaValidator,
    selection: &SolverSelection,
    config: &ComputeConfig,
) -> Result<ComputeResult, ComputeError> {
    config.validate()?;
    let started = Instant::now();
    let instance_deadline = config.instance_timeout().map(|t| started + t);
    let mode = config.exact_mode(spectrum.precursor_mz);
    let keep = match mode {
        ExactMode::All => usize::MAX,
        ExactMode::Triage => config.triage_size(),
        ExactMode::HeuristicOnly => 0,
    };
    debug!("Solving {} candidates in {mode:?} mode", candidates.len());

    let candidates: Vec<CandidateFormula> = candidates
        .iter()
        .copied()
        .unique_by(|c| c.formula)
        .collect();
    let pool = config.create_threadpool()?;
    let results: ResultMap = Mutex::new(BTreeMap::new());
    let heuristic = selection.heuristic();

    let mut builder = config.builder;
    let mut increase = 0.0;
    let mut rounds = 0;
    let (entries, mut stats) = loop {
        lock_results(&results).clear();
        rounds += 1;
        let (entries, stats) = graph_stage(
            &pool,
            spectrum,
            &candidates,
            scorer,
            validator,
            &builder,
            heuristic,
            config.graph_queue_size,
            keep,
            &results,
        );
        if !config.adapt_tree_size
            || increase + config.tree_size_step > config.max_tree_size_increase + SCORE_EPSILON
            || is_well_explained(&results, config)
        {
            break (entries, stats);
        }
        increase += config.tree_size_step;
        builder.tree_size_bonus += config.tree_size_step;
        debug!(
            "Best heuristic trees explain too little, raising the tree size bonus to {}",
            builder.tree_size_bonus
        );
    };
    stats.tree_size_rounds = rounds;

    stats += exact_stage(entries, selection, config, instance_deadline, &results);

    let (mut ranked, excluded): (Vec<_>, Vec<_>) = results
        .into_inner()
        .unwrap_or_else(|e| e.into_inner())
        .into_values()
        .partition(|r| !r.is_excluded());
    ranked.sort_by(rank_order);

    info!(
        "Ranked {} of {} candidates ({} exact, {} skipped, {} fallbacks, {} excluded) in {:0.3?}",
        ranked.len(),
        stats.candidates,
        stats.exact_solved,
        stats.pruned,
        stats.fallbacks,
        stats.excluded,
        started.elapsed()
    );
    Ok(ComputeResult {
        ranked,
        excluded,
        stats,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scorer::DefaultScorer;
    use crate::solver::{SolverConfig, SolverRegistry};
    use crate::spectrum::{Deviation, Ionization};

    fn f(s: &str) -> MolecularFormula {
        s.parse().unwrap()
    }

    fn hexose_spectrum() -> ProcessedSpectrum {
        let ion = Ionization::protonated();
        let peaks = ["C6H12O6", "C6H10O5", "C6H8O4", "C5H8O3"]
            .iter()
            .zip([20.0f32, 100.0, 60.0, 40.0])
            .map(|(s, i)| (ion.fragment_mz(f(s).mass()), i));
        ProcessedSpectrum::new(
            ion.ion_mz(f("C6H12O6").mass()),
            ion,
            Deviation::new(10.0, 0.002),
            peaks,
        )
        .unwrap()
    }

    fn candidates() -> Vec<CandidateFormula> {
        ["C6H12O6", "C7H16O5", "C6H12O6"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect()
    }

    fn selection() -> SolverSelection {
        SolverRegistry::default()
            .get_solver(&SolverConfig::default())
            .unwrap()
    }

    fn config() -> ComputeConfig {
        ComputeConfig {
            threads: 2,
            exact_threads: 2,
            ..Default::default()
        }
    }

    #[test_log::test]
    fn test_compute_exact() {
        let spectrum = hexose_spectrum();
        let result = compute_best(
            &spectrum,
            &candidates(),
            &DefaultScorer::default(),
            &selection(),
            &config(),
        )
        .unwrap();
        assert_eq!(result.ranked.len(), 1);
        assert_eq!(result.excluded.len(), 1);
        assert_eq!(result.stats.candidates, 2);
        assert_eq!(result.stats.exact_solved, 1);

        let best = result.best().unwrap();
        assert_eq!(best.formula, f("C6H12O6"));
        assert_eq!(
            best.status,
            CandidateStatus::Exact {
                solver: "dp".into()
            }
        );
        assert!(best.heuristic_score.unwrap() <= best.score + 1e-9);
        let tree = best.tree.as_ref().unwrap();
        assert!(tree.number_of_fragments() > 1);

        let excluded = &result.excluded[0];
        assert_eq!(excluded.formula, f("C7H16O5"));
        assert!(excluded.tree.is_none());
        assert!(matches!(excluded.status, CandidateStatus::Excluded { .. }));
    }

    #[test_log::test]
    fn test_heuristic_only() {
        let spectrum = hexose_spectrum();
        let config = ComputeConfig {
            heuristic_only_above_mz: 100.0,
            heuristic_triage_above_mz: 50.0,
            ..config()
        };
        assert_eq!(config.exact_mode(spectrum.precursor_mz), ExactMode::HeuristicOnly);
        let result = compute_best(
            &spectrum,
            &candidates(),
            &DefaultScorer::default(),
            &selection(),
            &config,
        )
        .unwrap();
        let best = result.best().unwrap();
        assert_eq!(best.status, CandidateStatus::Heuristic);
        assert_eq!(result.stats.exact_solved, 0);
    }

    #[test_log::test]
    fn test_instance_timeout_keeps_heuristic() {
        let spectrum = hexose_spectrum();
        let config = ComputeConfig {
            instance_timeout: Some(0.0),
            ..config()
        };
        let result = compute_best(
            &spectrum,
            &candidates(),
            &DefaultScorer::default(),
            &selection(),
            &config,
        )
        .unwrap();
        let best = result.best().unwrap();
        assert_eq!(
            best.status,
            CandidateStatus::FailedWithFallback {
                reason: "instance timeout".into()
            }
        );
        assert!(best.tree.is_some());
        assert_eq!(Some(best.score), best.heuristic_score);
        assert_eq!(result.stats.fallbacks, 1);
    }

    #[test]
    fn test_invalid_config() {
        let config = ComputeConfig {
            heuristic_only_above_mz: 100.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidParameter {
                name: "heuristic_only_above_mz",
                ..
            })
        ));
        let config = ComputeConfig {
            exact_queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rank_order() {
        let make = |formula: &str, score: f64, unexplained: usize| CandidateResult {
            formula: f(formula),
            status: CandidateStatus::Heuristic,
            tree: None,
            score,
            heuristic_score: Some(score),
            unexplained_peaks: unexplained,
            prior_score: 0.0,
        };
        let mut results = vec![
            make("C6H12O6", 1.0, 2),
            make("C5H8N4O2", 1.0, 1),
            make("C7H16O5", 2.0, 5),
            make("C4H10N2O4", 1.0, 1),
        ];
        results.sort_by(rank_order);
        let order: Vec<String> = results.iter().map(|r| r.formula.to_string()).collect();
        assert_eq!(order, vec!["C7H16O5", "C4H10N2O4", "C5H8N4O2", "C6H12O6"]);
    }

    #[test]
    fn test_stats_sum() {
        let a = ComputeStats {
            candidates: 2,
            exact_solved: 1,
            ..Default::default()
        };
        let b = ComputeStats {
            candidates: 3,
            fallbacks: 2,
            ..Default::default()
        };
        let total: ComputeStats = [a, b].into_iter().sum();
        assert_eq!(total.candidates, 5);
        assert_eq!(total.exact_solved, 1);
        assert_eq!(total.fallbacks, 2);
    }

    #[test]
    fn test_exact_mode_bands() {
        let config = ComputeConfig::default();
        assert_eq!(config.exact_mode(299.9), ExactMode::All);
        assert_eq!(config.exact_mode(300.0), ExactMode::Triage);
        assert_eq!(config.exact_mode(649.9), ExactMode::Triage);
        assert_eq!(config.exact_mode(650.0), ExactMode::HeuristicOnly);
        assert_eq!(config.triage_size(), 20);
    }

    #[test]
    fn test_lower_bound() {
        let mut map = BTreeMap::new();
        for (formula, score) in [("C6H12O6", 3.0), ("C7H16O5", 5.0), ("C5H8N4O2", 1.0)] {
            let candidate: CandidateFormula = formula.parse().unwrap();
            let mut result = CandidateResult::excluded(&candidate, String::new());
            result.status = CandidateStatus::Heuristic;
            result.score = score;
            map.insert(candidate.formula, result);
        }
        let candidate: CandidateFormula = "C4H10N2O4".parse().unwrap();
        map.insert(candidate.formula, CandidateResult::excluded(&candidate, String::new()));

        assert_eq!(kth_best_score(&map, 0), ScoreType::NEG_INFINITY);
        assert_eq!(kth_best_score(&map, 1), 5.0);
        assert_eq!(kth_best_score(&map, 2), 3.0);
        assert_eq!(kth_best_score(&map, 3), 1.0);
        assert_eq!(kth_best_score(&map, 4), ScoreType::NEG_INFINITY);

        let bound = LowerBound::new();
        assert_eq!(bound.get(), ScoreType::NEG_INFINITY);
        bound.raise(3.0);
        bound.raise(1.0);
        assert_eq!(bound.get(), 3.0);
        bound.raise(-0.5);
        assert_eq!(bound.get(), 3.0);
    }

    #[test_log::test]
    fn test_exact_solve_skipped_below_bound() {
        let graph = crate::graph::test::make_chain_graph();
        let candidate: CandidateFormula = "C6H12O6".parse().unwrap();
        let results: ResultMap = Mutex::new(BTreeMap::new());
        lock_results(&results).insert(
            candidate.formula,
            CandidateResult::from_heuristic(&candidate, FTree::trivial(&graph, "heuristic")),
        );
        let entry = |graph: &FGraph| TriageEntry {
            score: 0.0,
            candidate,
            graph: graph.clone(),
        };

        // The chain cannot score above 4
        let bound = LowerBound::new();
        bound.raise(4.5);
        let stats = solve_exact(entry(&graph), &selection(), &config(), None, &bound, &results);
        assert_eq!(stats.pruned, 1);
        assert_eq!(stats.exact_solved, 0);
        assert_eq!(lock_results(&results)[&candidate.formula].status, CandidateStatus::Heuristic);

        let bound = LowerBound::new();
        bound.raise(4.0);
        let config = ComputeConfig {
            number_of_results: 1,
            ..config()
        };
        let stats = solve_exact(entry(&graph), &selection(), &config, None, &bound, &results);
        assert_eq!(stats.pruned, 0);
        assert_eq!(stats.exact_solved, 1);
        let map = lock_results(&results);
        assert!((map[&candidate.formula].score - 4.0).abs() < 1e-9);
        assert!(map[&candidate.formula].is_exact());
    }
}
