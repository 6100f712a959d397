//! Fragment, loss and root scoring for candidate graphs.
//!
//! All scores live in log space and are combined additively. Vertex scores are
//! folded into the weight of each incoming edge by the graph builder, so a
//! [`FragmentScorer`] never needs to know about the tree it ends up in.
use std::collections::HashMap;
use std::fmt::Debug;

use statrs::distribution::{Continuous, LogNormal};
use statrs::function::erf::erfc;
use thiserror::Error;

use crate::formula::MolecularFormula;
use crate::spectrum::Deviation;

pub type ScoreType = f64;

/// What a [`FragmentScorer`] sees about the root of a candidate graph
#[derive(Debug, Clone, Copy)]
pub struct RootContext<'a> {
    pub formula: &'a MolecularFormula,
    /// The m/z the precursor ion of `formula` would have
    pub theoretical_mz: f64,
    /// The observed precursor m/z
    pub observed_mz: f64,
    /// A score supplied by formula decomposition, if any
    pub prior_score: ScoreType,
    pub deviation: &'a Deviation,
}

/// What a [`FragmentScorer`] sees about a fragment assigned to a peak
#[derive(Debug, Clone, Copy)]
pub struct FragmentContext<'a> {
    pub formula: &'a MolecularFormula,
    pub candidate: &'a MolecularFormula,
    pub theoretical_mz: f64,
    pub observed_mz: f64,
    /// Peak intensity relative to the base peak, in `(0, 1]`
    pub relative_intensity: f64,
    pub deviation: &'a Deviation,
}

/// What a [`FragmentScorer`] sees about a loss between two fragments
#[derive(Debug, Clone, Copy)]
pub struct LossContext<'a> {
    pub loss: &'a MolecularFormula,
    pub parent: &'a MolecularFormula,
    pub child: &'a MolecularFormula,
    pub parent_is_root: bool,
}

/// A pluggable weight function for candidate graphs.
pub trait FragmentScorer: Send + Sync + Debug {
    fn root_score(&self, context: &RootContext) -> ScoreType {
        context.prior_score
    }

    fn fragment_score(&self, context: &FragmentContext) -> ScoreType;

    fn loss_score(&self, context: &LossContext) -> ScoreType;
}

/// Score the deviation of an observed m/z from its theoretical value with the
/// two-sided tail of a normal distribution.
///
/// ```math
/// s(e, t) = \log \operatorname{erfc}\left(\frac{|e - t|}{\sigma\sqrt{2}}\right)
/// ```
///
/// where $`\sigma`$ is the allowed deviation at $`t`$ divided by `divisor`.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MassDeviationScorer {
    pub divisor: f64,
    /// The lowest score this scorer will produce
    pub floor: ScoreType,
}

impl Default for MassDeviationScorer {
    fn default() -> Self {
        Self {
            divisor: 3.0,
            floor: -10.0,
        }
    }
}

impl MassDeviationScorer {
    pub fn new(divisor: f64, floor: ScoreType) -> Self {
        Self { divisor, floor }
    }

    #[inline]
    pub fn score(&self, observed: f64, theoretical: f64, deviation: &Deviation) -> ScoreType {
        let sd = deviation.absolute_at(theoretical) / self.divisor;
        if sd <= 0.0 {
            return 0.0;
        }
        let z = (observed - theoretical).abs() / (sd * std::f64::consts::SQRT_2);
        erfc(z).ln().max(self.floor)
    }
}

/// Score the intensity of a peak against a noise level.
///
/// ```math
/// s(i) = w \log\frac{\max(i, \epsilon)}{n}
/// ```
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntensityScorer {
    pub noise_level: f64,
    pub weight: f64,
}

impl Default for IntensityScorer {
    fn default() -> Self {
        Self {
            noise_level: 0.02,
            weight: 1.0,
        }
    }
}

impl IntensityScorer {
    #[inline]
    pub fn score(&self, relative_intensity: f64) -> ScoreType {
        if self.weight == 0.0 {
            return 0.0;
        }
        self.weight * (relative_intensity.max(1e-6) / self.noise_level).ln()
    }
}

/// Losses that are frequently observed in small molecule fragmentation
pub const COMMON_LOSSES: &[&str] = &[
    "H2", "H2O", "CH4", "C2H4", "C2H2", "C4H8", "C5H8", "C6H6", "CH2O", "CO", "CH2O2", "CO2",
    "C2H4O2", "C2H2O", "C3H6O2", "C3H4O4", "C3H2O3", "C5H8O4", "C6H10O5", "C6H8O6", "NH3",
    "CH5N", "CH3N", "C3H9N", "CHNO", "CH4N2O", "H3PO3", "H3PO4", "HPO3", "C2H5O4P", "H2S", "S",
    "SO2", "SO3", "H2SO4",
];

/// Losses that are chemically implausible on their own
pub const IMPLAUSIBLE_LOSSES: &[&str] = &["C2O", "C4O", "C3H2", "C5H2", "C7H2", "N", "C"];

/// Reward losses from a list of common losses and penalize implausible ones
#[derive(Debug, Clone)]
pub struct CommonLossScorer {
    scores: HashMap<MolecularFormula, ScoreType>,
}

impl CommonLossScorer {
    pub fn new(common_bonus: ScoreType, implausible_penalty: ScoreType) -> Self {
        let mut scores = HashMap::new();
        for f in COMMON_LOSSES.iter().filter_map(|s| s.parse().ok()) {
            scores.insert(f, common_bonus);
        }
        for f in IMPLAUSIBLE_LOSSES.iter().filter_map(|s| s.parse().ok()) {
            scores.insert(f, implausible_penalty);
        }
        Self { scores }
    }

    pub fn add_loss(&mut self, loss: MolecularFormula, score: ScoreType) {
        self.scores.insert(loss, score);
    }

    #[inline]
    pub fn score(&self, loss: &MolecularFormula) -> ScoreType {
        self.scores.get(loss).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScorerError {
    #[error("Invalid loss size distribution: {0}")]
    InvalidLossSizeDistribution(String),
}

/// Score the mass of a loss with a log-normal distribution normalized so that the
/// most likely loss mass scores zero.
///
/// ```math
/// s(m) = w\left(\log p(m) - \log p(e^{\mu - \sigma^2})\right)
/// ```
#[derive(Debug, Clone)]
pub struct LossSizeScorer {
    distribution: LogNormal,
    mode_log_density: f64,
    pub weight: f64,
}

impl LossSizeScorer {
    pub fn new(location: f64, scale: f64, weight: f64) -> Result<Self, ScorerError> {
        let distribution = LogNormal::new(location, scale)
            .map_err(|e| ScorerError::InvalidLossSizeDistribution(e.to_string()))?;
        let mode = (location - scale.powi(2)).exp();
        let mode_log_density = distribution.ln_pdf(mode);
        Ok(Self {
            distribution,
            mode_log_density,
            weight,
        })
    }

    #[inline]
    pub fn score(&self, loss_mass: f64) -> ScoreType {
        if loss_mass <= 0.0 {
            return 0.0;
        }
        self.weight * (self.distribution.ln_pdf(loss_mass) - self.mode_log_density)
    }
}

/// The tunable parameters of [`DefaultScorer`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScoringParams {
    pub mass_deviation_divisor: f64,
    pub mass_deviation_floor: f64,
    pub noise_level: f64,
    pub intensity_weight: f64,
    pub common_loss_bonus: f64,
    pub implausible_loss_penalty: f64,
    pub loss_size_location: f64,
    pub loss_size_scale: f64,
    pub loss_size_weight: f64,
    pub prior_weight: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            mass_deviation_divisor: 3.0,
            mass_deviation_floor: -10.0,
            noise_level: 0.02,
            intensity_weight: 1.0,
            common_loss_bonus: 1.0,
            implausible_loss_penalty: -2.5,
            loss_size_location: 4.0,
            loss_size_scale: 0.7,
            loss_size_weight: 1.0,
            prior_weight: 1.0,
        }
    }
}

/// The standard additive log-space scorer.
///
/// Fragments are scored by mass deviation and peak intensity, losses by their
/// plausibility and size, and the root by the precursor mass deviation plus the
/// weighted prior score of the candidate formula.
#[derive(Debug, Clone)]
pub struct DefaultScorer {
    pub params: ScoringParams,
    mass_deviation: MassDeviationScorer,
    intensity: IntensityScorer,
    losses: CommonLossScorer,
    loss_size: Option<LossSizeScorer>,
}

impl DefaultScorer {
    pub fn new(params: ScoringParams) -> Result<Self, ScorerError> {
        let loss_size = if params.loss_size_weight != 0.0 {
            Some(LossSizeScorer::new(
                params.loss_size_location,
                params.loss_size_scale,
                params.loss_size_weight,
            )?)
        } else {
            None
        };
        Ok(Self {
            params,
            mass_deviation: MassDeviationScorer::new(
                params.mass_deviation_divisor,
                params.mass_deviation_floor,
            ),
            intensity: IntensityScorer {
                noise_level: params.noise_level,
                weight: params.intensity_weight,
            },
            losses: CommonLossScorer::new(
                params.common_loss_bonus,
                params.implausible_loss_penalty,
            ),
            loss_size,
        })
    }

    pub fn add_common_loss(&mut self, loss: MolecularFormula, score: ScoreType) {
        self.losses.add_loss(loss, score);
    }
}

impl Default for DefaultScorer {
    fn default() -> Self {
        Self::new(ScoringParams::default()).unwrap()
    }
}

impl FragmentScorer for DefaultScorer {
    fn root_score(&self, context: &RootContext) -> ScoreType {
        self.mass_deviation.score(
            context.observed_mz,
            context.theoretical_mz,
            context.deviation,
        ) + self.params.prior_weight * context.prior_score
    }

    fn fragment_score(&self, context: &FragmentContext) -> ScoreType {
        self.mass_deviation.score(
            context.observed_mz,
            context.theoretical_mz,
            context.deviation,
        ) + self.intensity.score(context.relative_intensity)
    }

    fn loss_score(&self, context: &LossContext) -> ScoreType {
        let size = self
            .loss_size
            .as_ref()
            .map(|s| s.score(context.loss.mass()))
            .unwrap_or_default();
        self.losses.score(context.loss) + size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mass_deviation() {
        let scorer = MassDeviationScorer::default();
        let dev = Deviation::new(10.0, 0.002);
        let exact = scorer.score(100.0, 100.0, &dev);
        assert!(exact.abs() < 1e-12);
        let off = scorer.score(100.001, 100.0, &dev);
        let further = scorer.score(100.002, 100.0, &dev);
        assert!(off < exact);
        assert!(further < off);
        assert!(scorer.score(150.0, 100.0, &dev) >= scorer.floor);

        // The allowed deviation spans three standard deviations
        let edge = 100.0 + dev.absolute_at(100.0);
        let expected = erfc(3.0 / std::f64::consts::SQRT_2).ln();
        assert!((scorer.score(edge, 100.0, &dev) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_intensity() {
        let scorer = IntensityScorer::default();
        assert!(scorer.score(1.0) > 0.0);
        assert!(scorer.score(0.02).abs() < 1e-12);
        assert!(scorer.score(0.001) < 0.0);
    }

    #[test]
    fn test_loss_scoring() {
        let scorer = DefaultScorer::default();
        let water: MolecularFormula = "H2O".parse().unwrap();
        let carbon: MolecularFormula = "C".parse().unwrap();
        let odd: MolecularFormula = "C3H5NO".parse().unwrap();
        let parent: MolecularFormula = "C6H12O6".parse().unwrap();
        let ctx = |loss| LossContext {
            loss,
            parent: &parent,
            child: &parent,
            parent_is_root: true,
        };
        let w = scorer.loss_score(&ctx(&water));
        let c = scorer.loss_score(&ctx(&carbon));
        let o = scorer.loss_score(&ctx(&odd));
        assert!(w > o, "{w} {o}");
        assert!(c < o, "{c} {o}");
    }

    #[test]
    fn test_loss_size_mode() {
        let scorer = LossSizeScorer::new(4.0, 0.7, 1.0).unwrap();
        let mode = (4.0f64 - 0.49).exp();
        assert!(scorer.score(mode).abs() < 1e-9);
        assert!(scorer.score(mode * 3.0) < 0.0);
        assert!(LossSizeScorer::new(4.0, -1.0, 1.0).is_err());
    }
}
