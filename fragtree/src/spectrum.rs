//! The processed spectrum consumed by graph construction.
//!
//! Peak merging, normalization and noise removal happen before this point. A
//! [`ProcessedSpectrum`] is a read-only, m/z sorted peak list with a precursor,
//! an ionization and the mass deviation allowed when assigning formulas to peaks.
use std::fmt::Display;
use std::str::FromStr;

use chemical_elements::{neutral_mass, PROTON};
use mzpeaks::{prelude::*, CentroidPeak, MZPeakSetType};
use thiserror::Error;

/// The mass of an electron in Daltons
pub const ELECTRON: f64 = 0.000548579909;

/// An allowed mass deviation, the larger of a relative and an absolute error
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Deviation {
    /// Relative error in parts-per-million
    pub ppm: f64,
    /// Absolute error in Daltons
    pub absolute: f64,
}

impl Default for Deviation {
    fn default() -> Self {
        Self {
            ppm: 10.0,
            absolute: 0.002,
        }
    }
}

impl Deviation {
    pub fn new(ppm: f64, absolute: f64) -> Self {
        Self { ppm, absolute }
    }

    /// The allowed absolute error around `mass`
    pub fn absolute_at(&self, mass: f64) -> f64 {
        (mass * self.ppm * 1e-6).max(self.absolute)
    }

    /// Test whether `query` is within the allowed error of `reference`
    pub fn contains(&self, reference: f64, query: f64) -> bool {
        (reference - query).abs() <= self.absolute_at(reference)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IonizationParseError {
    #[error("Could not parse an ionization from {0:?}, expected something like \"[M+H]+\"")]
    Malformed(String),
    #[error("Unsupported adduct {0:?}")]
    UnsupportedAdduct(String),
}

/// A simple adduct ionization: a charge and the mass of the charge carrier.
///
/// The neutral mass of an ion is computed with [`chemical_elements::neutral_mass`],
/// so a deprotonation is a negative charge carried by a proton.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ionization {
    pub charge: i32,
    pub carrier: f64,
}

impl Default for Ionization {
    fn default() -> Self {
        Self::protonated()
    }
}

impl Ionization {
    pub fn new(charge: i32, carrier: f64) -> Self {
        Self { charge, carrier }
    }

    /// `[M+H]+`
    pub fn protonated() -> Self {
        Self::new(1, PROTON)
    }

    /// `[M-H]-`
    pub fn deprotonated() -> Self {
        Self::new(-1, PROTON)
    }

    /// The neutral mass of an ion observed at `mz`
    pub fn neutral_mass(&self, mz: f64) -> f64 {
        neutral_mass(mz, self.charge, self.carrier)
    }

    /// The m/z of an ion of neutral mass `mass` carrying the full charge
    pub fn ion_mz(&self, mass: f64) -> f64 {
        (mass + self.charge as f64 * self.carrier) / self.charge.unsigned_abs() as f64
    }

    /// The m/z of a singly charged fragment ion with neutral mass `mass`, keeping the
    /// polarity of the precursor
    pub fn fragment_mz(&self, mass: f64) -> f64 {
        mass + self.charge.signum() as f64 * self.carrier
    }

    /// The neutral mass of a singly charged fragment ion observed at `mz`
    pub fn fragment_neutral_mass(&self, mz: f64) -> f64 {
        mz - self.charge.signum() as f64 * self.carrier
    }
}

impl Display for Ionization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.charge < 0 { '-' } else { '+' };
        let z = self.charge.unsigned_abs();
        let charge = if z == 1 {
            sign.to_string()
        } else {
            format!("{z}{sign}")
        };
        if (self.carrier - PROTON).abs() < 1e-6 {
            write!(f, "[M{sign}H]{charge}")
        } else if self.carrier.abs() < 1e-3 {
            write!(f, "[M]{charge}")
        } else {
            write!(f, "[M{sign}{:0.4}]{charge}", self.carrier)
        }
    }
}

impl FromStr for Ionization {
    type Err = IonizationParseError;

    /// Parse ionizations written as `[M+H]+`, `[M-H]-`, `[M+Na]+`, `[M+K]+`,
    /// `[M]+` or `[M]-`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let malformed = || IonizationParseError::Malformed(s.to_string());
        let inner_end = s.rfind(']').ok_or_else(malformed)?;
        if !s.starts_with("[M") {
            return Err(malformed());
        }
        let inner = &s[2..inner_end];
        let polarity = &s[inner_end + 1..];
        let charge = match polarity {
            "+" => 1,
            "-" => -1,
            _ => return Err(malformed()),
        };
        let carrier = match inner {
            "" => -ELECTRON,
            "+H" if charge > 0 => PROTON,
            "-H" if charge < 0 => PROTON,
            "+Na" if charge > 0 => sodium_mass() - ELECTRON,
            "+K" if charge > 0 => potassium_mass() - ELECTRON,
            _ => return Err(IonizationParseError::UnsupportedAdduct(inner.to_string())),
        };
        Ok(Self::new(charge, carrier))
    }
}

fn sodium_mass() -> f64 {
    crate::formula::element_masses()[13]
}

fn potassium_mass() -> f64 {
    crate::formula::element_masses()[14]
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpectrumError {
    #[error("Precursor m/z {0} is not a positive finite number")]
    InvalidPrecursor(f64),
    #[error("Peak {0} has a non-finite or non-positive m/z or intensity")]
    InvalidPeak(usize),
    #[error("Charge state zero is not a valid ionization")]
    ZeroCharge,
}

/// A peak-merged, m/z sorted spectrum together with its precursor and the mass
/// deviation to use when assigning formulas.
#[derive(Debug, Clone)]
pub struct ProcessedSpectrum {
    pub precursor_mz: f64,
    pub ionization: Ionization,
    pub deviation: Deviation,
    pub peaks: MZPeakSetType<CentroidPeak>,
    base_peak_intensity: f32,
}

impl ProcessedSpectrum {
    /// Build a spectrum from `(m/z, intensity)` pairs. Peaks do not need to be sorted.
    pub fn new(
        precursor_mz: f64,
        ionization: Ionization,
        deviation: Deviation,
        peaks: impl IntoIterator<Item = (f64, f32)>,
    ) -> Result<Self, SpectrumError> {
        if !precursor_mz.is_finite() || precursor_mz <= 0.0 {
            return Err(SpectrumError::InvalidPrecursor(precursor_mz));
        }
        if ionization.charge == 0 {
            return Err(SpectrumError::ZeroCharge);
        }
        let mut buffer = Vec::new();
        for (i, (mz, intensity)) in peaks.into_iter().enumerate() {
            if !mz.is_finite() || mz <= 0.0 || !intensity.is_finite() || intensity <= 0.0 {
                return Err(SpectrumError::InvalidPeak(i));
            }
            buffer.push(CentroidPeak::new(mz, intensity, i as u32));
        }
        let peaks = MZPeakSetType::new(buffer);
        let base_peak_intensity = peaks
            .iter()
            .map(|p| p.intensity())
            .fold(0.0f32, |a, b| a.max(b));
        Ok(Self {
            precursor_mz,
            ionization,
            deviation,
            peaks,
            base_peak_intensity,
        })
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.len() == 0
    }

    /// The neutral mass of the precursor
    pub fn precursor_mass(&self) -> f64 {
        self.ionization.neutral_mass(self.precursor_mz)
    }

    pub fn relative_intensity(&self, intensity: f32) -> f64 {
        if self.base_peak_intensity > 0.0 {
            (intensity / self.base_peak_intensity) as f64
        } else {
            0.0
        }
    }

    /// The summed intensity of all peaks
    pub fn total_intensity(&self) -> f64 {
        self.peaks.iter().map(|p| p.intensity() as f64).sum()
    }

    /// Whether the peak at `mz` falls within the deviation of the precursor
    pub fn is_precursor_peak(&self, mz: f64) -> bool {
        self.deviation.contains(self.precursor_mz, mz)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deviation() {
        let dev = Deviation::new(10.0, 0.002);
        assert!((dev.absolute_at(100.0) - 0.002).abs() < 1e-12);
        assert!((dev.absolute_at(1000.0) - 0.01).abs() < 1e-12);
        assert!(dev.contains(1000.0, 1000.009));
        assert!(!dev.contains(1000.0, 1000.011));
        assert!(dev.contains(500.0, 499.995));
    }

    #[test]
    fn test_ionization() {
        let ion: Ionization = "[M+H]+".parse().unwrap();
        assert_eq!(ion, Ionization::protonated());
        assert!((ion.neutral_mass(181.070665) - 180.063388).abs() < 1e-4);
        assert!((ion.fragment_mz(180.063388) - 181.070665).abs() < 1e-4);
        assert!((ion.ion_mz(180.063388) - 181.070665).abs() < 1e-4);
        assert!((Ionization::new(2, PROTON).ion_mz(180.063388) - 91.038970).abs() < 1e-4);

        let ion: Ionization = "[M-H]-".parse().unwrap();
        assert!((ion.neutral_mass(179.056111) - 180.063388).abs() < 1e-4);
        assert_eq!(ion.to_string(), "[M-H]-");

        let ion: Ionization = "[M+Na]+".parse().unwrap();
        assert!((ion.fragment_mz(180.063388) - 203.052583).abs() < 1e-3);

        assert!("M+H".parse::<Ionization>().is_err());
        assert!("[M+Li]+".parse::<Ionization>().is_err());
    }

    #[test]
    fn test_spectrum() {
        let spectrum = ProcessedSpectrum::new(
            181.0707,
            Ionization::protonated(),
            Deviation::default(),
            [(163.06, 50.0), (85.03, 100.0), (181.07, 10.0)],
        )
        .unwrap();
        assert_eq!(spectrum.len(), 3);
        assert!(spectrum.peaks[0].mz() < spectrum.peaks[1].mz());
        assert_eq!(spectrum.relative_intensity(50.0), 0.5);
        assert!(spectrum.is_precursor_peak(181.0709));

        let err = ProcessedSpectrum::new(
            181.0707,
            Ionization::protonated(),
            Deviation::default(),
            [(163.06, -50.0)],
        );
        assert_eq!(err.unwrap_err(), SpectrumError::InvalidPeak(0));
    }
}
