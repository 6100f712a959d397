/*! The candidate graph for one (spectrum, formula) pair.

An [`FGraph`] is an arena: [`Fragment`]s and [`Loss`]es are stored in dense vectors and
refer to each other by index. The root fragment always has id `0` and the reserved
color `0`. Every loss goes from a lower fragment id to a higher one, which makes the
graph acyclic by construction.
*/
use std::collections::VecDeque;

use thiserror::Error;

use crate::formula::MolecularFormula;
use crate::scorer::ScoreType;

pub mod builder;
pub mod reduce;

pub use builder::{
    build_graph, FormulaValidator, GraphBuildError, GraphBuildOutcome, GraphBuilderParams,
    NoCandidatesReason, RdbeValidator,
};
pub use reduce::{reduce_graph, tree_upper_bound, vertex_upper_bounds, ReductionStats};

pub type FragmentId = usize;
pub type LossId = usize;
pub type Color = usize;

/// The color reserved for the root fragment
pub const ROOT_COLOR: Color = 0;

/// The id of the root fragment
pub const ROOT: FragmentId = 0;

/// The experimental peak a fragment was assigned to
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeakRef {
    /// The index of the peak in the source spectrum
    pub index: usize,
    pub mz: f64,
    pub intensity: f32,
    pub relative_intensity: f64,
}

/// A vertex of the graph, a formula explaining a peak
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fragment {
    pub id: FragmentId,
    pub formula: MolecularFormula,
    pub color: Color,
    pub peak: Option<PeakRef>,
    /// The vertex score, already included in the weight of every incoming loss
    pub score: ScoreType,
}

impl Fragment {
    pub fn is_root(&self) -> bool {
        self.id == ROOT
    }
}

/// A directed edge from a parent fragment to a child fragment
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Loss {
    pub id: LossId,
    pub source: FragmentId,
    pub target: FragmentId,
    /// The formula of the parent minus the formula of the child
    pub formula: MolecularFormula,
    pub weight: ScoreType,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("Fragment {0} does not exist")]
    UnknownFragment(FragmentId),
    #[error("Loss {parent} -> {child} does not go from a lower to a higher fragment id")]
    InvalidEdgeOrder {
        parent: FragmentId,
        child: FragmentId,
    },
    #[error("Loss {parent} -> {child} connects two fragments of color {color}")]
    SameColor {
        parent: FragmentId,
        child: FragmentId,
        color: Color,
    },
    #[error("Fragment {0} uses the root color")]
    RootColor(FragmentId),
    #[error("Color {0} has no fragments")]
    EmptyColor(Color),
    #[error("Fragment {0} is not reachable from the root")]
    Unreachable(FragmentId),
    #[error("Loss weight {weight} of {parent} -> {child} is not finite")]
    NonFiniteWeight {
        parent: FragmentId,
        child: FragmentId,
        weight: ScoreType,
    },
}

/// A directed acyclic multigraph of fragments and losses with a distinguished root.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FGraph {
    fragments: Vec<Fragment>,
    losses: Vec<Loss>,
    incoming: Vec<Vec<LossId>>,
    outgoing: Vec<Vec<LossId>>,
    colors: Vec<Vec<FragmentId>>,
    /// The observed precursor m/z
    pub precursor_mz: f64,
    /// The summed intensity of every peak of the spectrum the graph was built from
    pub total_intensity: f64,
    /// The number of peaks below the precursor, whether or not they received a fragment
    pub peaks_considered: usize,
}

impl FGraph {
    /// Create a graph holding only the root fragment
    pub fn new(candidate: MolecularFormula, root_score: ScoreType) -> Self {
        let root = Fragment {
            id: ROOT,
            formula: candidate,
            color: ROOT_COLOR,
            peak: None,
            score: root_score,
        };
        Self {
            fragments: vec![root],
            losses: Vec::new(),
            incoming: vec![Vec::new()],
            outgoing: vec![Vec::new()],
            colors: vec![vec![ROOT]],
            precursor_mz: 0.0,
            total_intensity: 0.0,
            peaks_considered: 0,
        }
    }

    /// Add a fragment of `color`, which must not be [`ROOT_COLOR`]
    pub fn add_fragment(
        &mut self,
        formula: MolecularFormula,
        color: Color,
        peak: Option<PeakRef>,
        score: ScoreType,
    ) -> Result<FragmentId, GraphError> {
        let id = self.fragments.len();
        if color == ROOT_COLOR {
            return Err(GraphError::RootColor(id));
        }
        if self.colors.len() <= color {
            self.colors.resize_with(color + 1, Vec::new);
        }
        self.colors[color].push(id);
        self.fragments.push(Fragment {
            id,
            formula,
            color,
            peak,
            score,
        });
        self.incoming.push(Vec::new());
        self.outgoing.push(Vec::new());
        Ok(id)
    }

    /// Add a loss `source -> target` with an explicit weight. The loss formula is the
    /// difference of the two fragment formulas.
    pub fn add_loss(
        &mut self,
        source: FragmentId,
        target: FragmentId,
        weight: ScoreType,
    ) -> Result<LossId, GraphError> {
        let n = self.fragments.len();
        if source >= n {
            return Err(GraphError::UnknownFragment(source));
        }
        if target >= n {
            return Err(GraphError::UnknownFragment(target));
        }
        if source >= target {
            return Err(GraphError::InvalidEdgeOrder {
                parent: source,
                child: target,
            });
        }
        let color = self.fragments[source].color;
        if color == self.fragments[target].color {
            return Err(GraphError::SameColor {
                parent: source,
                child: target,
                color,
            });
        }
        if !weight.is_finite() {
            return Err(GraphError::NonFiniteWeight {
                parent: source,
                child: target,
                weight,
            });
        }
        let id = self.losses.len();
        let formula = self.fragments[source].formula - self.fragments[target].formula;
        self.losses.push(Loss {
            id,
            source,
            target,
            formula,
            weight,
        });
        self.outgoing[source].push(id);
        self.incoming[target].push(id);
        Ok(id)
    }

    /// Attach the most intense precursor peak to the root
    pub fn set_root_peak(&mut self, peak: Option<PeakRef>) {
        self.fragments[ROOT].peak = peak;
    }

    pub fn root(&self) -> &Fragment {
        &self.fragments[ROOT]
    }

    /// The candidate formula this graph was built for
    pub fn candidate(&self) -> &MolecularFormula {
        &self.fragments[ROOT].formula
    }

    pub fn root_score(&self) -> ScoreType {
        self.fragments[ROOT].score
    }

    pub fn fragment(&self, id: FragmentId) -> &Fragment {
        &self.fragments[id]
    }

    pub fn loss(&self, id: LossId) -> &Loss {
        &self.losses[id]
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn losses(&self) -> &[Loss] {
        &self.losses
    }

    pub fn number_of_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn number_of_losses(&self) -> usize {
        self.losses.len()
    }

    /// The number of colors, counting the root color
    pub fn number_of_colors(&self) -> usize {
        self.colors.len()
    }

    pub fn color_class(&self, color: Color) -> &[FragmentId] {
        &self.colors[color]
    }

    pub fn incoming(&self, id: FragmentId) -> &[LossId] {
        &self.incoming[id]
    }

    pub fn outgoing(&self, id: FragmentId) -> &[LossId] {
        &self.outgoing[id]
    }

    /// Find the loss connecting `source` to `target`, if one exists
    pub fn find_loss(&self, source: FragmentId, target: FragmentId) -> Option<&Loss> {
        self.outgoing
            .get(source)?
            .iter()
            .map(|i| &self.losses[*i])
            .find(|l| l.target == target)
    }

    /// Mark which fragments can be reached from the root
    pub fn reachable(&self) -> Vec<bool> {
        self.reachable_through(&vec![true; self.losses.len()])
    }

    /// Mark which fragments can be reached from the root using only the losses
    /// flagged in `usable`
    fn reachable_through(&self, usable: &[bool]) -> Vec<bool> {
        let mut seen = vec![false; self.fragments.len()];
        let mut queue = VecDeque::new();
        seen[ROOT] = true;
        queue.push_back(ROOT);
        while let Some(u) = queue.pop_front() {
            for e in self.outgoing[u].iter() {
                if !usable[*e] {
                    continue;
                }
                let v = self.losses[*e].target;
                if !seen[v] {
                    seen[v] = true;
                    queue.push_back(v);
                }
            }
        }
        seen
    }

    /// Check the structural invariants of the graph
    pub fn validate(&self) -> Result<(), GraphError> {
        for loss in self.losses.iter() {
            if loss.source >= loss.target {
                return Err(GraphError::InvalidEdgeOrder {
                    parent: loss.source,
                    child: loss.target,
                });
            }
            let color = self.fragments[loss.source].color;
            if color == self.fragments[loss.target].color {
                return Err(GraphError::SameColor {
                    parent: loss.source,
                    child: loss.target,
                    color,
                });
            }
        }
        for (color, members) in self.colors.iter().enumerate() {
            if members.is_empty() {
                return Err(GraphError::EmptyColor(color));
            }
        }
        for frag in self.fragments.iter().skip(1) {
            if frag.color == ROOT_COLOR {
                return Err(GraphError::RootColor(frag.id));
            }
        }
        if let Some(id) = self.reachable().iter().position(|r| !r) {
            return Err(GraphError::Unreachable(id));
        }
        Ok(())
    }

    /// Drop every fragment not reachable from the root, re-indexing fragments, losses
    /// and colors densely while keeping their relative order.
    pub fn prune_unreachable(self) -> Result<Self, GraphError> {
        let keep = vec![true; self.losses.len()];
        self.retain_losses(&keep)
    }

    /// Keep only the losses flagged in `keep`, then drop every fragment this leaves
    /// unreachable from the root. Fragments, losses and colors are re-indexed densely
    /// in their original order.
    pub fn retain_losses(self, keep: &[bool]) -> Result<Self, GraphError> {
        let reachable = self.reachable_through(keep);
        if keep.iter().all(|k| *k)
            && reachable.iter().all(|r| *r)
            && self.colors.iter().all(|c| !c.is_empty())
        {
            return Ok(self);
        }

        let mut fragment_map: Vec<Option<FragmentId>> = vec![None; self.fragments.len()];
        let mut color_map: Vec<Option<Color>> = vec![None; self.colors.len()];
        color_map[ROOT_COLOR] = Some(ROOT_COLOR);
        let mut next_color = 1;
        for (color, members) in self.colors.iter().enumerate().skip(1) {
            if members.iter().any(|m| reachable[*m]) {
                color_map[color] = Some(next_color);
                next_color += 1;
            }
        }

        let mut pruned = FGraph::new(*self.candidate(), self.root_score());
        pruned.precursor_mz = self.precursor_mz;
        pruned.total_intensity = self.total_intensity;
        pruned.peaks_considered = self.peaks_considered;
        pruned.set_root_peak(self.fragments[ROOT].peak);
        fragment_map[ROOT] = Some(ROOT);

        for frag in self.fragments.into_iter().skip(1) {
            if !reachable[frag.id] {
                continue;
            }
            let color = color_map[frag.color].ok_or(GraphError::EmptyColor(frag.color))?;
            fragment_map[frag.id] =
                Some(pruned.add_fragment(frag.formula, color, frag.peak, frag.score)?);
        }
        for loss in self.losses.into_iter() {
            if !keep[loss.id] {
                continue;
            }
            if let (Some(s), Some(t)) = (fragment_map[loss.source], fragment_map[loss.target]) {
                pruned.add_loss(s, t, loss.weight)?;
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    fn f(s: &str) -> MolecularFormula {
        s.parse().unwrap()
    }

    /// root -> a -> b -> c, one fragment per color, all positive weights
    pub(crate) fn make_chain_graph() -> FGraph {
        let mut g = FGraph::new(f("C6H12O6"), 0.0);
        let a = g.add_fragment(f("C6H10O5"), 1, None, 0.0).unwrap();
        let b = g.add_fragment(f("C6H8O4"), 2, None, 0.0).unwrap();
        let c = g.add_fragment(f("C5H8O3"), 3, None, 0.0).unwrap();
        g.add_loss(ROOT, a, 1.5).unwrap();
        g.add_loss(a, b, 2.0).unwrap();
        g.add_loss(b, c, 0.5).unwrap();
        g
    }

    /// Two fragments share color 1, only `good` leads onward to a positive child
    pub(crate) fn make_shared_color_graph() -> FGraph {
        let mut g = FGraph::new(f("C6H12O6"), 0.0);
        let good = g.add_fragment(f("C6H10O5"), 1, None, 0.0).unwrap();
        let bad = g.add_fragment(f("C5H12O5"), 1, None, 0.0).unwrap();
        let child = g.add_fragment(f("C5H8O4"), 2, None, 0.0).unwrap();
        g.add_loss(ROOT, good, 0.5).unwrap();
        g.add_loss(ROOT, bad, 1.0).unwrap();
        g.add_loss(good, child, 3.0).unwrap();
        g.add_loss(bad, child, -4.0).unwrap();
        g
    }

    #[test]
    fn test_construction() {
        let g = make_chain_graph();
        assert_eq!(g.number_of_fragments(), 4);
        assert_eq!(g.number_of_losses(), 3);
        assert_eq!(g.number_of_colors(), 4);
        assert_eq!(g.loss(0).formula, f("H2O"));
        assert_eq!(g.incoming(2), &[1]);
        assert_eq!(g.outgoing(0), &[0]);
        assert!(g.find_loss(1, 2).is_some());
        assert!(g.find_loss(0, 2).is_none());
        g.validate().unwrap();
    }

    #[test]
    fn test_invariants_rejected() {
        let mut g = make_chain_graph();
        assert_eq!(
            g.add_loss(2, 1, 1.0),
            Err(GraphError::InvalidEdgeOrder {
                parent: 2,
                child: 1
            })
        );
        let d = g.add_fragment(f("C5H6O3"), 3, None, 0.0).unwrap();
        assert!(matches!(
            g.add_loss(3, d, 1.0),
            Err(GraphError::SameColor { color: 3, .. })
        ));
        assert_eq!(g.add_fragment(f("H2O"), ROOT_COLOR, None, 0.0), Err(GraphError::RootColor(5)));
        assert!(matches!(
            g.add_loss(0, 9, 1.0),
            Err(GraphError::UnknownFragment(9))
        ));
        assert!(matches!(
            g.add_loss(0, d, f64::NAN),
            Err(GraphError::NonFiniteWeight { .. })
        ));
        assert_eq!(g.validate(), Err(GraphError::Unreachable(4)));
    }

    #[test]
    fn test_prune_unreachable() {
        let mut g = FGraph::new(f("C6H12O6"), 1.0);
        let a = g.add_fragment(f("C6H10O5"), 1, None, 0.0).unwrap();
        let orphan = g.add_fragment(f("C6H8O4"), 2, None, 0.0).unwrap();
        let b = g.add_fragment(f("C5H8O3"), 3, None, 0.0).unwrap();
        g.add_loss(ROOT, a, 1.0).unwrap();
        g.add_loss(a, b, 1.0).unwrap();
        g.add_loss(orphan, b, 1.0).unwrap();
        assert!(g.validate().is_err());

        let g = g.prune_unreachable().unwrap();
        g.validate().unwrap();
        assert_eq!(g.number_of_fragments(), 3);
        assert_eq!(g.number_of_colors(), 3);
        assert_eq!(g.number_of_losses(), 2);
        assert_eq!(g.fragment(2).formula, f("C5H8O3"));
        assert_eq!(g.fragment(2).color, 2);
        assert_eq!(g.root_score(), 1.0);
    }

    #[test]
    fn test_retain_losses() {
        let g = make_chain_graph();
        let g = g.retain_losses(&[true, true, false]).unwrap();
        g.validate().unwrap();
        assert_eq!(g.number_of_fragments(), 3);
        assert_eq!(g.number_of_losses(), 2);
        assert_eq!(g.number_of_colors(), 3);

        let g = make_chain_graph().retain_losses(&[true, false, true]).unwrap();
        g.validate().unwrap();
        assert_eq!(g.number_of_fragments(), 2);
        assert_eq!(g.number_of_losses(), 1);
        assert_eq!(g.fragment(1).formula, f("C6H10O5"));
    }
}
