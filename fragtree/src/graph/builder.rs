//! Construct the candidate graph for a spectrum and a candidate formula.
use std::cmp::Ordering;
use std::fmt::{Debug, Display};

use mzpeaks::prelude::*;
use thiserror::Error;
use tracing::trace;

use crate::formula::{element_masses, CandidateFormula, ElementCount, MolecularFormula};
use crate::scorer::{FragmentContext, FragmentScorer, LossContext, RootContext, ScoreType};
use crate::spectrum::ProcessedSpectrum;

use super::{Color, FGraph, GraphError, PeakRef, ROOT};

/// Decide which formulas may appear as fragments and losses
pub trait FormulaValidator: Send + Sync + Debug {
    fn is_valid_fragment(&self, formula: &MolecularFormula) -> bool;

    fn is_valid_loss(&self, loss: &MolecularFormula) -> bool {
        !loss.is_empty() && loss.is_non_negative()
    }
}

/// Accept fragments whose ring-double-bond-equivalent is at least `min_rdbe`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RdbeValidator {
    pub min_rdbe: f64,
}

impl Default for RdbeValidator {
    fn default() -> Self {
        Self { min_rdbe: -0.5 }
    }
}

impl FormulaValidator for RdbeValidator {
    fn is_valid_fragment(&self, formula: &MolecularFormula) -> bool {
        !formula.is_empty() && formula.is_non_negative() && formula.rdbe() >= self.min_rdbe
    }
}

/// Why a candidate formula produced no graph
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NoCandidatesReason {
    /// The candidate's mass does not match the precursor
    PrecursorMismatch { expected: f64, observed: f64 },
    /// No peak could be explained by a sub-formula of the candidate
    NoFragmentAssignments,
}

impl Display for NoCandidatesReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoCandidatesReason::PrecursorMismatch { expected, observed } => write!(
                f,
                "precursor mass {observed:0.5} does not match candidate mass {expected:0.5}"
            ),
            NoCandidatesReason::NoFragmentAssignments => {
                f.write_str("no peak can be assigned a sub-formula of the candidate")
            }
        }
    }
}

/// The result of graph construction. An infeasible candidate is an expected
/// outcome, not an error.
#[derive(Debug, Clone)]
pub enum GraphBuildOutcome {
    Graph(FGraph),
    NoCandidates(NoCandidatesReason),
}

impl GraphBuildOutcome {
    pub fn graph(self) -> Option<FGraph> {
        match self {
            GraphBuildOutcome::Graph(g) => Some(g),
            GraphBuildOutcome::NoCandidates(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphBuildError {
    #[error("The candidate formula {0} is empty or has negative element counts")]
    InvalidCandidate(MolecularFormula),
    #[error("Failed to assemble the graph: {0}")]
    GraphError(
        #[from]
        #[source]
        GraphError,
    ),
}

/// Parameters controlling graph construction
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GraphBuilderParams {
    /// A constant added to the weight of every loss, rewarding larger trees
    pub tree_size_bonus: ScoreType,
    /// Keep only this many of the best scoring fragments per peak
    pub max_fragments_per_peak: Option<usize>,
}

impl Default for GraphBuilderParams {
    fn default() -> Self {
        Self {
            tree_size_bonus: 0.0,
            max_fragments_per_peak: None,
        }
    }
}

impl GraphBuilderParams {
    pub fn with_tree_size_bonus(mut self, tree_size_bonus: ScoreType) -> Self {
        self.tree_size_bonus = tree_size_bonus;
        self
    }
}

/// Enumerate all sub-formulas of a parent formula within a mass window, visiting
/// elements heaviest first so the search can be cut as soon as it overshoots.
#[derive(Debug)]
struct SubformulaEnumerator {
    elements: Vec<(usize, f64, ElementCount)>,
    suffix_mass: Vec<f64>,
}

impl SubformulaEnumerator {
    fn new(parent: &MolecularFormula) -> Self {
        let masses = element_masses();
        let mut elements: Vec<(usize, f64, ElementCount)> = parent
            .counts()
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0)
            .map(|(i, c)| (i, masses[i], *c))
            .collect();
        elements.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut suffix_mass = vec![0.0; elements.len() + 1];
        for i in (0..elements.len()).rev() {
            suffix_mass[i] = suffix_mass[i + 1] + elements[i].1 * elements[i].2 as f64;
        }
        Self {
            elements,
            suffix_mass,
        }
    }

    fn enumerate(&self, low: f64, high: f64) -> Vec<MolecularFormula> {
        let mut acc = Vec::new();
        let mut current = MolecularFormula::empty();
        self.visit(0, &mut current, 0.0, low, high, &mut acc);
        acc
    }

    fn visit(
        &self,
        depth: usize,
        current: &mut MolecularFormula,
        mass: f64,
        low: f64,
        high: f64,
        acc: &mut Vec<MolecularFormula>,
    ) {
        if depth == self.elements.len() {
            if mass >= low && mass <= high && !current.is_empty() {
                acc.push(*current);
            }
            return;
        }
        let (index, element_mass, max_count) = self.elements[depth];
        let rest = self.suffix_mass[depth + 1];
        for count in 0..=max_count {
            let next = mass + count as f64 * element_mass;
            if next > high {
                break;
            }
            if next + rest < low {
                continue;
            }
            current.set(index, count);
            self.visit(depth + 1, current, next, low, high, acc);
        }
        current.set(index, 0);
    }
}

#[derive(Debug, Clone)]
struct FragmentCandidate {
    formula: MolecularFormula,
    mass: f64,
    color: Color,
    peak: PeakRef,
    score: ScoreType,
}

impl FragmentCandidate {
    fn order(&self, other: &Self) -> Ordering {
        other
            .mass
            .total_cmp(&self.mass)
            .then_with(|| self.color.cmp(&other.color))
            .then_with(|| self.formula.cmp(&other.formula))
    }
}

/// Build the candidate graph for `candidate` from `spectrum`.
///
/// Every peak below the precursor becomes a color, every valid sub-formula of the
/// candidate matching a peak becomes a fragment of that color, and every pair of
/// fragments related by a valid loss is connected, heavier fragment first. Fragments
/// that cannot be reached from the root are removed. Peaks matching the precursor are
/// attributed to the root.
///
/// A candidate whose mass does not match the precursor, or which explains no peak,
/// yields [`GraphBuildOutcome::NoCandidates`].
#[tracing::instrument(level = "trace", skip_all, fields(formula = %candidate.formula))]
pub fn build_graph(
    spectrum: &ProcessedSpectrum,
    candidate: &CandidateFormula,
    scorer: &dyn FragmentScorer,
    validator: &dyn FormulaValidator,
    params: &GraphBuilderParams,
) -> Result<GraphBuildOutcome, GraphBuildError> {
    let formula = candidate.formula;
    if formula.is_empty() || !formula.is_non_negative() {
        return Err(GraphBuildError::InvalidCandidate(formula));
    }

    let ionization = spectrum.ionization;
    let deviation = spectrum.deviation;
    let expected = formula.mass();
    let observed = spectrum.precursor_mass();
    if (expected - observed).abs() > deviation.absolute_at(spectrum.precursor_mz) {
        return Ok(GraphBuildOutcome::NoCandidates(
            NoCandidatesReason::PrecursorMismatch { expected, observed },
        ));
    }

    let root_context = RootContext {
        formula: &formula,
        theoretical_mz: ionization.ion_mz(expected),
        observed_mz: spectrum.precursor_mz,
        prior_score: candidate.prior_score,
        deviation: &deviation,
    };
    let mut graph = FGraph::new(formula, scorer.root_score(&root_context));
    graph.precursor_mz = spectrum.precursor_mz;
    graph.total_intensity = spectrum.total_intensity();

    let make_peak_ref = |index: usize, mz: f64, intensity: f32| PeakRef {
        index,
        mz,
        intensity,
        relative_intensity: spectrum.relative_intensity(intensity),
    };

    let upper_mz = spectrum.precursor_mz - deviation.absolute_at(spectrum.precursor_mz);
    let enumerator = SubformulaEnumerator::new(&formula);
    let mut root_peak: Option<PeakRef> = None;
    let mut fragment_candidates: Vec<FragmentCandidate> = Vec::new();
    let mut color: Color = 0;

    // Walk peaks from the heaviest down so colors ascend with decreasing m/z
    for (index, peak) in spectrum.peaks.iter().enumerate().rev() {
        let mz = peak.mz();
        if spectrum.is_precursor_peak(mz) {
            if root_peak.map_or(true, |p| p.intensity < peak.intensity()) {
                root_peak = Some(make_peak_ref(index, mz, peak.intensity()));
            }
            continue;
        }
        if mz > upper_mz {
            continue;
        }
        color += 1;
        graph.peaks_considered += 1;
        let peak_ref = make_peak_ref(index, mz, peak.intensity());
        let neutral = ionization.fragment_neutral_mass(mz);
        let width = deviation.absolute_at(mz);

        let mut for_peak: Vec<FragmentCandidate> = enumerator
            .enumerate(neutral - width, neutral + width)
            .into_iter()
            .filter(|f| *f != formula && validator.is_valid_fragment(f))
            .map(|f| {
                let mass = f.mass();
                let context = FragmentContext {
                    formula: &f,
                    candidate: &formula,
                    theoretical_mz: ionization.fragment_mz(mass),
                    observed_mz: mz,
                    relative_intensity: peak_ref.relative_intensity,
                    deviation: &deviation,
                };
                FragmentCandidate {
                    score: scorer.fragment_score(&context),
                    formula: f,
                    mass,
                    color,
                    peak: peak_ref,
                }
            })
            .collect();

        if let Some(limit) = params.max_fragments_per_peak {
            if for_peak.len() > limit {
                for_peak.sort_by(|a, b| {
                    b.score
                        .total_cmp(&a.score)
                        .then_with(|| a.formula.cmp(&b.formula))
                });
                for_peak.truncate(limit);
            }
        }
        trace!("Peak {mz:0.4} has {} fragment candidates", for_peak.len());
        fragment_candidates.extend(for_peak);
    }
    graph.set_root_peak(root_peak);

    if fragment_candidates.is_empty() {
        return Ok(GraphBuildOutcome::NoCandidates(
            NoCandidatesReason::NoFragmentAssignments,
        ));
    }

    fragment_candidates.sort_by(|a, b| a.order(b));
    for frag in fragment_candidates.iter() {
        graph.add_fragment(frag.formula, frag.color, Some(frag.peak), frag.score)?;
    }

    // Fragment `i` of `fragment_candidates` is vertex `i + 1`
    let masses: Vec<f64> = std::iter::once(expected)
        .chain(fragment_candidates.iter().map(|f| f.mass))
        .collect();
    let n = graph.number_of_fragments();
    for u in 0..n {
        let parent = graph.fragment(u).formula;
        let parent_color = graph.fragment(u).color;
        for v in (u + 1)..n {
            if masses[u] <= masses[v] {
                continue;
            }
            let child = graph.fragment(v);
            if child.color == parent_color || !child.formula.is_subset_of(&parent) {
                continue;
            }
            let child_formula = child.formula;
            let child_score = child.score;
            let loss = parent - child_formula;
            if !validator.is_valid_loss(&loss) {
                continue;
            }
            let context = LossContext {
                loss: &loss,
                parent: &parent,
                child: &child_formula,
                parent_is_root: u == ROOT,
            };
            let weight = scorer.loss_score(&context) + child_score + params.tree_size_bonus;
            graph.add_loss(u, v, weight)?;
        }
    }

    let before = graph.number_of_fragments();
    let graph = graph.prune_unreachable()?;
    trace!(
        "Built graph with {} fragments ({} unreachable removed), {} losses and {} colors",
        graph.number_of_fragments(),
        before - graph.number_of_fragments(),
        graph.number_of_losses(),
        graph.number_of_colors()
    );
    if graph.number_of_fragments() < 2 {
        return Ok(GraphBuildOutcome::NoCandidates(
            NoCandidatesReason::NoFragmentAssignments,
        ));
    }
    Ok(GraphBuildOutcome::Graph(graph))
}
