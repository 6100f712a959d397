/*! Fragmentation trees, the solutions of the colorful subtree problem.

An [`FTree`] is an out-tree over a subset of the fragments and losses of one
[`FGraph`], rooted at the graph's root and using every color at most once. Tree
elements keep the id of the graph element they came from.
*/
use std::collections::HashSet;

use identity_hash::BuildIdentityHasher;
use thiserror::Error;

use crate::formula::MolecularFormula;
use crate::graph::{Color, FGraph, FragmentId, LossId, PeakRef, ROOT};
use crate::scorer::ScoreType;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeError {
    #[error("Loss {0} does not exist in the graph")]
    UnknownLoss(LossId),
    #[error("Color {0} is used by more than one fragment")]
    DuplicateColor(Color),
    #[error("Fragment {0} has more than one parent")]
    MultipleParents(FragmentId),
    #[error("Fragment {0} is not connected to the root")]
    Disconnected(FragmentId),
}

/// A fragment selected into a tree
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeFragment {
    /// The id of this fragment in the source graph
    pub graph_id: FragmentId,
    pub formula: MolecularFormula,
    pub color: Color,
    pub peak: Option<PeakRef>,
    pub score: ScoreType,
}

/// A loss selected into a tree. `source` and `target` index into [`FTree::fragments`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeLoss {
    /// The id of this loss in the source graph
    pub graph_id: LossId,
    pub source: usize,
    pub target: usize,
    pub formula: MolecularFormula,
    pub weight: ScoreType,
}

/// A fragmentation tree
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FTree {
    pub formula: MolecularFormula,
    pub fragments: Vec<TreeFragment>,
    pub losses: Vec<TreeLoss>,
    pub root_score: ScoreType,
    pub score: ScoreType,
    /// The name of the solver which produced this tree
    pub solver: String,
    total_intensity: f64,
    peaks_considered: usize,
}

impl FTree {
    /// The tree holding only the root of `graph`
    pub fn trivial(graph: &FGraph, solver: impl Into<String>) -> Self {
        let root = graph.root();
        Self {
            formula: root.formula,
            fragments: vec![TreeFragment {
                graph_id: ROOT,
                formula: root.formula,
                color: root.color,
                peak: root.peak,
                score: root.score,
            }],
            losses: Vec::new(),
            root_score: root.score,
            score: root.score,
            solver: solver.into(),
            total_intensity: graph.total_intensity,
            peaks_considered: graph.peaks_considered,
        }
    }

    /// Assemble a tree from a set of loss ids of `graph`, checking that they form a
    /// colorful out-tree rooted at the graph's root.
    pub fn from_losses(
        graph: &FGraph,
        loss_ids: &[LossId],
        solver: impl Into<String>,
    ) -> Result<Self, TreeError> {
        let mut tree = Self::trivial(graph, solver);
        let n = graph.number_of_fragments();

        let mut parent_of: Vec<Option<LossId>> = vec![None; n];
        for id in loss_ids.iter().copied() {
            if id >= graph.number_of_losses() {
                return Err(TreeError::UnknownLoss(id));
            }
            let loss = graph.loss(id);
            if parent_of[loss.target].is_some() {
                return Err(TreeError::MultipleParents(loss.target));
            }
            parent_of[loss.target] = Some(id);
        }

        // Every edge ascends in fragment id, so a single forward pass finds each
        // parent's membership before its children are visited.
        let mut index_of: Vec<Option<usize>> = vec![None; n];
        index_of[ROOT] = Some(0);
        let mut used_colors: HashSet<Color, BuildIdentityHasher<Color>> = HashSet::default();
        used_colors.insert(graph.root().color);
        for (v, parent) in parent_of.iter().enumerate() {
            let Some(loss_id) = parent else {
                continue;
            };
            let loss = graph.loss(*loss_id);
            let Some(source_index) = index_of[loss.source] else {
                return Err(TreeError::Disconnected(v));
            };
            let frag = graph.fragment(v);
            if !used_colors.insert(frag.color) {
                return Err(TreeError::DuplicateColor(frag.color));
            }
            let target_index = tree.fragments.len();
            index_of[v] = Some(target_index);
            tree.fragments.push(TreeFragment {
                graph_id: v,
                formula: frag.formula,
                color: frag.color,
                peak: frag.peak,
                score: frag.score,
            });
            tree.losses.push(TreeLoss {
                graph_id: *loss_id,
                source: source_index,
                target: target_index,
                formula: loss.formula,
                weight: loss.weight,
            });
            tree.score += loss.weight;
        }
        Ok(tree)
    }

    pub fn score(&self) -> ScoreType {
        self.score
    }

    pub fn root(&self) -> &TreeFragment {
        &self.fragments[0]
    }

    pub fn number_of_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn number_of_losses(&self) -> usize {
        self.losses.len()
    }

    pub fn loss_ids(&self) -> Vec<LossId> {
        self.losses.iter().map(|l| l.graph_id).collect()
    }

    pub fn colors(&self) -> impl Iterator<Item = Color> + '_ {
        self.fragments.iter().map(|f| f.color)
    }

    pub fn is_trivial(&self) -> bool {
        self.losses.is_empty()
    }

    /// The number of peaks below the precursor in the spectrum the tree was built from
    pub fn peaks_considered(&self) -> usize {
        self.peaks_considered
    }

    /// The number of peaks below the precursor which no fragment of this tree explains
    pub fn unexplained_peaks(&self) -> usize {
        self.peaks_considered
            .saturating_sub(self.fragments.len().saturating_sub(1))
    }

    /// The fraction of the spectrum's intensity explained by this tree, counting the
    /// precursor peak
    pub fn explained_intensity(&self) -> f64 {
        if self.total_intensity <= 0.0 {
            return 0.0;
        }
        let explained: f64 = self
            .fragments
            .iter()
            .filter_map(|f| f.peak.map(|p| p.intensity as f64))
            .sum();
        explained / self.total_intensity
    }

    /// Re-derive this tree from `graph` and check every structural property, returning
    /// the recomputed score
    pub fn validate_against(&self, graph: &FGraph) -> Result<ScoreType, TreeError> {
        for tree_loss in self.losses.iter() {
            let id = tree_loss.graph_id;
            let loss = graph.losses().get(id).ok_or(TreeError::UnknownLoss(id))?;
            let source = self.fragments[tree_loss.source].graph_id;
            let target = self.fragments[tree_loss.target].graph_id;
            if loss.source != source || loss.target != target {
                return Err(TreeError::UnknownLoss(id));
            }
        }
        let rebuilt = Self::from_losses(graph, &self.loss_ids(), self.solver.clone())?;
        Ok(rebuilt.score)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::{make_chain_graph, make_shared_color_graph};

    #[test]
    fn test_trivial() {
        let g = make_chain_graph();
        let t = FTree::trivial(&g, "test");
        assert!(t.is_trivial());
        assert_eq!(t.score(), g.root_score());
        assert_eq!(t.number_of_fragments(), 1);
    }

    #[test]
    fn test_from_losses() {
        let g = make_chain_graph();
        let t = FTree::from_losses(&g, &[2, 0, 1], "test").unwrap();
        assert_eq!(t.number_of_losses(), 3);
        assert!((t.score() - 4.0).abs() < 1e-12);
        assert_eq!(t.validate_against(&g).unwrap(), t.score());
        assert_eq!(t.losses[2].source, 2);
        assert_eq!(t.losses[2].target, 3);
        assert_eq!(t.unexplained_peaks(), 0);
    }

    #[test]
    fn test_rejects_invalid() {
        let g = make_chain_graph();
        assert_eq!(
            FTree::from_losses(&g, &[1], "test"),
            Err(TreeError::Disconnected(2))
        );
        assert_eq!(
            FTree::from_losses(&g, &[7], "test"),
            Err(TreeError::UnknownLoss(7))
        );

        let g = make_shared_color_graph();
        assert_eq!(
            FTree::from_losses(&g, &[0, 1], "test"),
            Err(TreeError::DuplicateColor(1))
        );
        assert_eq!(
            FTree::from_losses(&g, &[0, 1, 2, 3], "test"),
            Err(TreeError::MultipleParents(3))
        );
    }
}
