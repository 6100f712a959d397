//! Resolve configured backend names into solvers.
use std::collections::HashMap;
use std::any::Any;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::graph::FGraph;
use crate::tree::FTree;

use super::dp::DynamicProgrammingSolver;
use super::heuristic::CriticalPathSolver;
use super::ilp::{IntegerProgrammingSolver, LinearSolverKind};
use super::{SolveOptions, TreeSolver, TreeSolverError};

/// Tuning shared by every backend factory
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BackendParams {
    /// The most non-root colors the dynamic programming backend accepts
    pub dp_max_colors: usize,
}

impl Default for BackendParams {
    fn default() -> Self {
        Self { dp_max_colors: 12 }
    }
}

/// Which backends to try, in order of preference
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SolverConfig {
    pub backends: Vec<String>,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub params: BackendParams,
}

impl Default for SolverConfig {
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut backends: Vec<String> = Vec::new();
        #[cfg(feature = "coin_cbc")]
        backends.push("cbc".into());
        #[cfg(feature = "highs")]
        backends.push("highs".into());
        backends.push(DynamicProgrammingSolver::NAME.into());
        backends.push("microlp".into());
        Self {
            backends,
            params: BackendParams::default(),
        }
    }
}

impl SolverConfig {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(backends: I) -> Self {
        Self {
            backends: backends.into_iter().map(Into::into).collect(),
            params: BackendParams::default(),
        }
    }

    pub fn with_params(mut self, params: BackendParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("None of the configured solver backends {0:?} could be created")]
    NoBackendAvailable(Vec<String>),
    #[error("No solver backends were configured")]
    Empty,
    #[error("Invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

pub type SolverFactory =
    Box<dyn Fn(&BackendParams) -> Result<Box<dyn TreeSolver>, TreeSolverError> + Send + Sync>;

/// A table of named solver factories
pub struct SolverRegistry {
    factories: HashMap<String, SolverFactory>,
}

impl Debug for SolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("SolverRegistry")
            .field("factories", &names)
            .finish()
    }
}

impl Default for SolverRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CriticalPathSolver::NAME, |_| {
            Ok(Box::new(CriticalPathSolver::new()))
        });
        registry.register(DynamicProgrammingSolver::NAME, |params| {
            Ok(Box::new(DynamicProgrammingSolver::new(params.dp_max_colors)))
        });
        for alias in ["microlp", "bundled", "ilp"] {
            registry.register(alias, |_| {
                Ok(Box::new(IntegerProgrammingSolver::new(LinearSolverKind::MicroLp)))
            });
        }
        #[cfg(feature = "highs")]
        registry.register("highs", |_| {
            Ok(Box::new(IntegerProgrammingSolver::new(LinearSolverKind::Highs)))
        });
        #[cfg(feature = "coin_cbc")]
        registry.register("cbc", |_| {
            Ok(Box::new(IntegerProgrammingSolver::new(LinearSolverKind::Cbc)))
        });
        registry
    }
}

impl SolverRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under `id`, replacing any earlier one. Ids are matched
    /// case-insensitively.
    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&BackendParams) -> Result<Box<dyn TreeSolver>, TreeSolverError> + Send + Sync + 'static,
    {
        self.factories
            .insert(id.to_ascii_lowercase(), Box::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(&id.to_ascii_lowercase())
    }

    /// Instantiate every configured backend that is registered and constructible, in
    /// order. Unknown or failing backends are skipped with a warning.
    pub fn get_solver(&self, config: &SolverConfig) -> Result<SolverSelection, ConfigurationError> {
        if config.backends.is_empty() {
            return Err(ConfigurationError::Empty);
        }
        let mut backends: Vec<Box<dyn TreeSolver>> = Vec::new();
        for id in config.backends.iter() {
            let Some(factory) = self.factories.get(&id.to_ascii_lowercase()) else {
                warn!("Solver backend {id} is not available in this build, skipping");
                continue;
            };
            match factory(&config.params) {
                Ok(solver) => {
                    debug!("Configured solver backend {}", solver.name());
                    backends.push(solver)
                }
                Err(e) => {
                    warn!("Failed to create solver backend {id}: {e}");
                }
            }
        }
        if backends.is_empty() {
            return Err(ConfigurationError::NoBackendAvailable(config.backends.clone()));
        }
        Ok(SolverSelection::new(backends))
    }
}

/// An ordered set of exact backends with a heuristic for triage. Solving delegates to
/// the first backend which supports the graph.
#[derive(Debug)]
pub struct SolverSelection {
    backends: Vec<Box<dyn TreeSolver>>,
    heuristic: CriticalPathSolver,
    name: String,
    serial: Mutex<()>,
}

impl SolverSelection {
    pub fn new(backends: Vec<Box<dyn TreeSolver>>) -> Self {
        let name = backends
            .iter()
            .map(|b| b.name())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            backends,
            heuristic: CriticalPathSolver::new(),
            name,
            serial: Mutex::new(()),
        }
    }

    pub fn backends(&self) -> impl Iterator<Item = &dyn TreeSolver> {
        self.backends.iter().map(|b| b.as_ref())
    }

    pub fn heuristic(&self) -> &CriticalPathSolver {
        &self.heuristic
    }

    /// The backend that would handle `graph`
    pub fn backend_for(&self, graph: &FGraph) -> Option<&dyn TreeSolver> {
        self.backends().find(|b| b.supports(graph))
    }
}

impl TreeSolver for SolverSelection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_exact(&self) -> bool {
        self.backends.iter().all(|b| b.is_exact())
    }

    fn requires_serialization(&self) -> bool {
        false
    }

    fn supports(&self, graph: &FGraph) -> bool {
        self.backend_for(graph).is_some()
    }

    fn solve(&self, graph: &FGraph, options: &SolveOptions) -> Result<FTree, TreeSolverError> {
        let Some(backend) = self.backend_for(graph) else {
            return Err(TreeSolverError::Unsupported {
                solver: self.name.clone(),
                reason: format!(
                    "no backend accepts a graph with {} fragments and {} colors",
                    graph.number_of_fragments(),
                    graph.number_of_colors()
                ),
            });
        };
        // A panicking backend fails this graph only
        let solved = panic::catch_unwind(AssertUnwindSafe(|| {
            if backend.requires_serialization() {
                let _guard = self.serial.lock().unwrap_or_else(|e| e.into_inner());
                backend.solve(graph, options)
            } else {
                backend.solve(graph, options)
            }
        }));
        solved.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(
                "{} panicked solving {}: {message}",
                backend.name(),
                graph.candidate()
            );
            Err(TreeSolverError::Backend {
                solver: backend.name().to_string(),
                message: format!("panicked: {message}"),
            })
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown cause".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::make_chain_graph;
    use crate::solver::test::make_random_graph;

    #[test_log::test]
    fn test_default_selection() {
        let registry = SolverRegistry::default();
        let selection = registry.get_solver(&SolverConfig::default()).unwrap();
        assert!(selection.is_exact());
        let names: Vec<_> = selection.backends().map(|b| b.name().to_string()).collect();
        assert!(names.contains(&"dp".to_string()));
        assert_eq!(names.last().unwrap(), "microlp");
        let g = make_chain_graph();
        assert_eq!(selection.backend_for(&g).unwrap().name(), "dp");
        let tree = selection.solve(&g, &SolveOptions::default()).unwrap();
        assert!((tree.score() - 4.0).abs() < 1e-9);
    }

    #[test_log::test]
    fn test_registry_miss_is_skipped() {
        let registry = SolverRegistry::default();
        let config = SolverConfig::new(["gurobi", "Bundled"]);
        let selection = registry.get_solver(&config).unwrap();
        assert_eq!(selection.name(), "microlp");
    }

    #[test_log::test]
    fn test_nothing_available() {
        let registry = SolverRegistry::default();
        let config = SolverConfig::new(["gurobi", "cplex"]);
        assert_eq!(
            registry.get_solver(&config).unwrap_err(),
            ConfigurationError::NoBackendAvailable(vec!["gurobi".into(), "cplex".into()])
        );
        assert_eq!(
            registry.get_solver(&SolverConfig::new(Vec::<String>::new())).unwrap_err(),
            ConfigurationError::Empty
        );
    }

    #[test_log::test]
    fn test_failing_factory_is_skipped() {
        let mut registry = SolverRegistry::default();
        registry.register("broken", |_| {
            Err(TreeSolverError::Backend {
                solver: "broken".into(),
                message: "license not found".into(),
            })
        });
        let selection = registry
            .get_solver(&SolverConfig::new(["broken", "heuristic"]))
            .unwrap();
        assert!(!selection.is_exact());
        assert_eq!(selection.name(), "heuristic");
    }

    #[test_log::test]
    fn test_falls_through_on_size() {
        let registry = SolverRegistry::default();
        let config = SolverConfig::new(["dp", "microlp"]).with_params(BackendParams { dp_max_colors: 3 });
        let selection = registry.get_solver(&config).unwrap();
        let g = make_random_graph(7, 5, 2);
        assert_eq!(selection.backend_for(&g).unwrap().name(), "microlp");
        let tree = selection.solve(&g, &SolveOptions::default()).unwrap();
        assert_eq!(tree.solver, "microlp");
    }

    #[derive(Debug)]
    struct PanickingSolver {
        serialized: bool,
    }

    impl TreeSolver for PanickingSolver {
        fn name(&self) -> &str {
            "panicking"
        }

        fn is_exact(&self) -> bool {
            true
        }

        fn requires_serialization(&self) -> bool {
            self.serialized
        }

        fn solve(&self, _graph: &FGraph, _options: &SolveOptions) -> Result<FTree, TreeSolverError> {
            panic!("backend state corrupted")
        }
    }

    #[test_log::test]
    fn test_backend_panic_becomes_error() {
        let g = make_chain_graph();
        for serialized in [false, true] {
            let selection = SolverSelection::new(vec![Box::new(PanickingSolver { serialized })]);
            // A poisoned serialization lock must not block the next call
            for _ in 0..2 {
                let err = selection.solve(&g, &SolveOptions::default()).unwrap_err();
                assert_eq!(
                    err,
                    TreeSolverError::Backend {
                        solver: "panicking".into(),
                        message: "panicked: backend state corrupted".into(),
                    }
                );
            }
        }
    }
}
