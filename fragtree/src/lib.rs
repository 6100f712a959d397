//! Fragmentation tree computation for tandem mass spectra.
//!
//! Each candidate molecular formula for a precursor is turned into a fragmentation
//! graph of its sub-formulas explaining the observed peaks. The best scoring colorful
//! subtree of that graph is the candidate's fragmentation tree, and candidates are
//! ranked by their tree scores.
pub mod formula;
pub mod spectrum;
pub mod scorer;
pub mod graph;
pub mod tree;
pub mod solver;

pub mod compute;

pub use crate::compute::{
    compute_best, compute_best_with_validator, CandidateResult, CandidateStatus, ComputeConfig,
    ComputeError, ComputeResult, ComputeStats, ExactMode,
};
pub use crate::formula::{CandidateFormula, FormulaParseError, MolecularFormula};
pub use crate::graph::{
    build_graph, reduce_graph, FGraph, FormulaValidator, GraphBuildError, GraphBuildOutcome,
    GraphBuilderParams, NoCandidatesReason, RdbeValidator, ReductionStats,
};
pub use crate::scorer::{DefaultScorer, FragmentScorer, ScoringParams};
pub use crate::solver::{
    ConfigurationError, SolveOptions, SolverConfig, SolverRegistry, SolverSelection, TreeSolver,
    TreeSolverError,
};
pub use crate::spectrum::{Deviation, Ionization, ProcessedSpectrum};
pub use crate::tree::FTree;
