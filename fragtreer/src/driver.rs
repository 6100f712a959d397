use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{parser::ValueSource, ArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Value},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use fragtree::compute::{compute_best, ComputeConfig, ComputeError, ComputeStats};
use fragtree::formula::FormulaParseError;
use fragtree::graph::GraphBuilderParams;
use fragtree::scorer::{DefaultScorer, ScorerError, ScoringParams};
use fragtree::solver::{BackendParams, ConfigurationError, SolverConfig, SolverRegistry};
use fragtree::spectrum::Deviation;

use crate::args::{
    default_backends, ionization_name, non_negative_float, DEFAULT_ABSOLUTE_DEVIATION,
    DEFAULT_DP_MAX_COLORS, DEFAULT_HEURISTIC_ONLY_ABOVE_MZ, DEFAULT_HEURISTIC_TRIAGE_ABOVE_MZ,
    DEFAULT_IONIZATION, DEFAULT_NUMBER_OF_RESULTS, DEFAULT_PPM,
};
use crate::input::InputDocument;
use crate::write::{write_output, InstanceOutput};

pub const CONFIG_FILE_NAME: &str = "fragtreer.toml";
pub const ENV_PREFIX: &str = "FRAGTREER_";

#[derive(Debug, Error)]
pub enum FragTreerError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to open input file {path}: {source}")]
    InputOpen {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read or write JSON: {0}")]
    JSONError(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("Invalid configuration: {0}")]
    ConfigError(
        #[source]
        #[from]
        Box<figment::Error>,
    ),
    #[error(transparent)]
    SolverConfigError(#[from] ConfigurationError),
    #[error("Failed to create the scorer: {0}")]
    ScorerError(#[from] ScorerError),
    #[error(transparent)]
    ComputeError(#[from] ComputeError),
    #[error("Instance {name} is invalid: {reason}")]
    InvalidInstance { name: String, reason: String },
    #[error("Instance {name} has an invalid candidate formula: {source}")]
    FormulaError {
        name: String,
        #[source]
        source: FormulaParseError,
    },
}

impl From<figment::Error> for FragTreerError {
    fn from(value: figment::Error) -> Self {
        Self::ConfigError(Box::new(value))
    }
}

/// Compute fragmentation trees and rank candidate molecular formulas for MS/MS spectra.
///
/// Read a JSON document of spectra with candidate formulas, and write the ranked
/// candidates with their fragmentation trees as JSON.
#[derive(Parser, Debug, Clone, Deserialize, Serialize)]
#[command(author, version)]
#[serde(default)]
pub struct FragTreer {
    /// The path to read the input JSON from, or if '-' is passed, read from STDIN.
    /// gzip compressed input is detected automatically.
    #[arg()]
    pub input_file: String,

    /// The path to write the output JSON to, or if '-' is passed, write to STDOUT.
    ///
    /// Paths ending in `.gz` are gzip compressed.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    pub output_file: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `fragtreer.toml` in the working directory.
    /// Environment variables prefixed with `FRAGTREER_` will be read too.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(short = 't', long = "threads", default_value_t = -1)]
    pub threads: i32,

    /// The number of threads solving trees exactly, passing a value < 1 to use the
    /// same number as `--threads`
    #[arg(short = 'T', long = "exact-threads", default_value_t = -1)]
    pub exact_threads: i32,

    /// The number of ranked candidates to report per spectrum
    #[arg(short = 'n', long = "number-of-results", default_value_t = DEFAULT_NUMBER_OF_RESULTS)]
    pub number_of_results: usize,

    /// The solver backends to try in order, separated by commas
    #[arg(
        short = 's',
        long = "solvers",
        value_delimiter = ',',
        default_values_t = default_backends(),
    )]
    pub solvers: Vec<String>,

    /// The largest number of peaks the dynamic programming solver will accept
    #[arg(long = "dp-max-colors", default_value_t = DEFAULT_DP_MAX_COLORS)]
    pub dp_max_colors: usize,

    /// The time limit in seconds for solving a single tree
    #[arg(long = "tree-timeout", value_parser = non_negative_float)]
    pub tree_timeout: Option<f64>,

    /// The time limit in seconds for all the candidates of a single spectrum
    #[arg(long = "instance-timeout", value_parser = non_negative_float)]
    pub instance_timeout: Option<f64>,

    /// The relative mass error tolerance in parts-per-million
    #[arg(short = 'p', long = "ppm", default_value_t = DEFAULT_PPM, value_parser = non_negative_float)]
    pub ppm: f64,

    /// The absolute mass error tolerance in Daltons, used when larger than `--ppm`
    #[arg(
        short = 'a',
        long = "absolute-deviation",
        default_value_t = DEFAULT_ABSOLUTE_DEVIATION,
        value_parser = non_negative_float
    )]
    pub absolute_deviation: f64,

    /// The ionization of spectra which do not specify one
    #[arg(
        short = 'i',
        long = "ionization",
        default_value = DEFAULT_IONIZATION,
        value_parser = ionization_name
    )]
    pub ionization: String,

    /// A score added to every loss, favoring larger trees
    #[arg(long = "tree-size-bonus", default_value_t = 0.0)]
    pub tree_size_bonus: f64,

    /// Do not raise the tree size bonus when the best trees explain too little
    #[arg(long = "no-tree-size-adaptation")]
    pub no_tree_size_adaptation: bool,

    /// Solve every kept graph exactly, even when it cannot reach the wanted results
    #[arg(long = "no-bound-pruning")]
    pub no_bound_pruning: bool,

    /// Precursors at or above this m/z are only solved heuristically
    #[arg(long = "heuristic-only-above", default_value_t = DEFAULT_HEURISTIC_ONLY_ABOVE_MZ)]
    pub heuristic_only_above_mz: f64,

    /// Precursors at or above this m/z only solve the best heuristic candidates exactly
    #[arg(long = "heuristic-triage-above", default_value_t = DEFAULT_HEURISTIC_TRIAGE_ABOVE_MZ)]
    pub heuristic_triage_above_mz: f64,

    /// Leave fragmentation trees out of the output
    #[arg(long = "summary-only")]
    pub summary_only: bool,

    /// The parameters of the fragment and loss scoring model, only read from configuration
    #[arg(skip)]
    pub scoring: ScoringParams,
}

impl Default for FragTreer {
    fn default() -> Self {
        Self {
            input_file: "-".to_string(),
            output_file: PathBuf::from("-"),
            log_file: None,
            config_file: None,
            threads: -1,
            exact_threads: -1,
            number_of_results: DEFAULT_NUMBER_OF_RESULTS,
            solvers: default_backends(),
            dp_max_colors: DEFAULT_DP_MAX_COLORS,
            tree_timeout: None,
            instance_timeout: None,
            ppm: DEFAULT_PPM,
            absolute_deviation: DEFAULT_ABSOLUTE_DEVIATION,
            ionization: DEFAULT_IONIZATION.to_string(),
            tree_size_bonus: 0.0,
            no_tree_size_adaptation: false,
            no_bound_pruning: false,
            heuristic_only_above_mz: DEFAULT_HEURISTIC_ONLY_ABOVE_MZ,
            heuristic_triage_above_mz: DEFAULT_HEURISTIC_TRIAGE_ABOVE_MZ,
            summary_only: false,
            scoring: ScoringParams::default(),
        }
    }
}

impl FragTreer {
    /// Merge the parsed command line with configuration files and the environment.
    ///
    /// Values are layered from lowest to highest precedence: built-in defaults,
    /// `fragtreer.toml`, `--config-file`, `FRAGTREER_` environment variables, then the
    /// arguments given explicitly on the command line.
    pub fn configure(self, matches: &ArgMatches) -> Result<Self, FragTreerError> {
        let mut config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE_NAME));
        if let Some(path) = self.config_file.as_ref() {
            config = config.merge(Toml::file_exact(path));
        }
        config = config.merge(Env::prefixed(ENV_PREFIX));

        let Value::Dict(_, given) = Value::serialize(&self)? else {
            return Ok(config.extract()?);
        };
        // Fields skipped by clap have no argument id and must not be queried.
        let from_command_line: HashSet<&str> = matches
            .ids()
            .map(|id| id.as_str())
            .filter(|id| matches.value_source(id) == Some(ValueSource::CommandLine))
            .collect();
        let explicit: Dict = given
            .into_iter()
            .filter(|(key, _)| from_command_line.contains(key.as_str()))
            .collect();
        debug!("Command line overrides: {:?}", explicit.keys().collect::<Vec<_>>());
        Ok(config.merge(Serialized::defaults(explicit)).extract()?)
    }

    pub fn deviation(&self) -> Deviation {
        Deviation::new(self.ppm, self.absolute_deviation)
    }

    pub fn compute_config(&self) -> ComputeConfig {
        let as_count = |n: i32| if n > 0 { n as usize } else { 0 };
        ComputeConfig {
            number_of_results: self.number_of_results,
            threads: as_count(self.threads),
            exact_threads: as_count(self.exact_threads),
            tree_timeout: self.tree_timeout,
            instance_timeout: self.instance_timeout,
            heuristic_only_above_mz: self.heuristic_only_above_mz,
            heuristic_triage_above_mz: self.heuristic_triage_above_mz,
            builder: GraphBuilderParams::default().with_tree_size_bonus(self.tree_size_bonus),
            adapt_tree_size: !self.no_tree_size_adaptation,
            prune_by_bound: !self.no_bound_pruning,
            ..Default::default()
        }
    }

    pub fn solver_config(&self) -> SolverConfig {
        SolverConfig::new(self.solvers.iter().cloned()).with_params(BackendParams {
            dp_max_colors: self.dp_max_colors,
        })
    }

    pub fn main(&self) -> Result<(), FragTreerError> {
        info!(
            "fragtreer v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());
        let started = Instant::now();

        let selection = SolverRegistry::default().get_solver(&self.solver_config())?;
        info!("Solver backends: {}", fragtree::TreeSolver::name(&selection));
        let scorer = DefaultScorer::new(self.scoring)?;
        let compute_config = self.compute_config();
        compute_config.validate()?;
        let document = InputDocument::read(&self.input_file)?;
        info!("Read {} instances", document.instances.len());

        let deviation = self.deviation();
        let mut outputs = Vec::with_capacity(document.instances.len());
        let mut totals = ComputeStats::default();
        for instance in document.instances.iter() {
            let spectrum = match instance.spectrum(&self.ionization, deviation) {
                Ok(spectrum) => spectrum,
                Err(e) => {
                    warn!("Skipping instance: {e}");
                    continue;
                }
            };
            let candidates = instance.candidates()?;
            let result =
                compute_best(&spectrum, &candidates, &scorer, &selection, &compute_config)?;
            if let Some(best) = result.best() {
                info!(
                    "{}: best candidate {} scoring {:0.3} ({} ranked, {} excluded)",
                    instance.name,
                    best.formula,
                    best.score,
                    result.ranked.len(),
                    result.excluded.len()
                );
            } else {
                warn!("{}: no candidate could be explained", instance.name);
            }
            totals += result.stats;
            outputs.push(InstanceOutput::new(
                instance.name.clone(),
                instance.precursor_mz,
                result,
                self.number_of_results,
                !self.summary_only,
            ));
        }

        write_output(&self.output_file, &outputs)?;
        info!(
            "Candidates: {} ({} excluded, {} solved exactly, {} fallbacks)",
            totals.candidates, totals.excluded, totals.exact_solved, totals.fallbacks
        );
        info!("Elapsed Time: {:0.3?}", started.elapsed());
        Ok(())
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_command_line() {
        FragTreer::command().debug_assert();
        let args = FragTreer::parse_from(["fragtreer", "input.json", "-s", "dp,microlp", "-n", "3"]);
        assert_eq!(args.solvers, vec!["dp", "microlp"]);
        assert_eq!(args.number_of_results, 3);
        assert_eq!(args.compute_config().number_of_results, 3);
        assert_eq!(args.compute_config().threads, 0);
        assert_eq!(args.solver_config().params.dp_max_colors, 12);
        assert!(args.compute_config().prune_by_bound);

        let args = FragTreer::parse_from(["fragtreer", "input.json", "--no-bound-pruning"]);
        assert!(!args.compute_config().prune_by_bound);
    }

    #[test]
    fn test_command_line_wins_over_defaults() {
        let matches = FragTreer::command().get_matches_from(["fragtreer", "input.json", "--ppm", "5"]);
        let args = <FragTreer as clap::FromArgMatches>::from_arg_matches(&matches).unwrap();
        let configured = args.configure(&matches).unwrap();
        assert_eq!(configured.ppm, 5.0);
        assert_eq!(configured.input_file, "input.json");
        assert_eq!(configured.absolute_deviation, DEFAULT_ABSOLUTE_DEVIATION);
    }

    #[test]
    fn test_configure_without_overrides() {
        let matches = FragTreer::command().get_matches_from(["fragtreer", "input.json"]);
        let args = <FragTreer as clap::FromArgMatches>::from_arg_matches(&matches).unwrap();
        let configured = args.configure(&matches).unwrap();
        assert_eq!(configured.input_file, "input.json");
        assert_eq!(configured.ppm, DEFAULT_PPM);
        assert_eq!(configured.solvers, default_backends());
        assert_eq!(
            configured.scoring.intensity_weight,
            ScoringParams::default().intensity_weight
        );
    }
}
