use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::str::FromStr;

use flate2::bufread::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fragtree::formula::CandidateFormula;
use fragtree::spectrum::{Deviation, Ionization, ProcessedSpectrum};

use crate::driver::FragTreerError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A candidate written either as a bare formula or with a prior score
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CandidateRecord {
    Formula(String),
    Scored {
        formula: String,
        #[serde(default)]
        prior_score: f64,
    },
}

impl CandidateRecord {
    pub fn formula(&self) -> &str {
        match self {
            Self::Formula(formula) => formula,
            Self::Scored { formula, .. } => formula,
        }
    }

    pub fn prior_score(&self) -> f64 {
        match self {
            Self::Formula(_) => 0.0,
            Self::Scored { prior_score, .. } => *prior_score,
        }
    }
}

/// One MS/MS spectrum and the formulas to rank for it
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstanceRecord {
    pub name: String,
    pub precursor_mz: f64,
    /// Falls back to the configured default ionization when missing
    #[serde(default)]
    pub ionization: Option<String>,
    pub peaks: Vec<(f64, f32)>,
    pub candidates: Vec<CandidateRecord>,
}

impl InstanceRecord {
    pub fn spectrum(
        &self,
        default_ionization: &str,
        deviation: Deviation,
    ) -> Result<ProcessedSpectrum, FragTreerError> {
        let ion_name = self.ionization.as_deref().unwrap_or(default_ionization);
        let ionization =
            Ionization::from_str(ion_name).map_err(|e| FragTreerError::InvalidInstance {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        ProcessedSpectrum::new(
            self.precursor_mz,
            ionization,
            deviation,
            self.peaks.iter().copied(),
        )
        .map_err(|e| FragTreerError::InvalidInstance {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    pub fn candidates(&self) -> Result<Vec<CandidateFormula>, FragTreerError> {
        self.candidates
            .iter()
            .map(|c| {
                let formula =
                    c.formula()
                        .parse()
                        .map_err(|e| FragTreerError::FormulaError {
                            name: self.name.clone(),
                            source: e,
                        })?;
                Ok(CandidateFormula::new(formula, c.prior_score()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct InputDocument {
    pub instances: Vec<InstanceRecord>,
}

impl InputDocument {
    /// Read a document from a buffered stream, decompressing it first if it starts with
    /// the gzip magic number
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self, FragTreerError> {
        let compressed = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
        debug!("Reading input (compressed? {compressed})");
        let document = if compressed {
            serde_json::from_reader(io::BufReader::new(MultiGzDecoder::new(reader)))?
        } else {
            serde_json::from_reader(reader)?
        };
        Ok(document)
    }

    /// Read a document from `path`, or from STDIN if `path` is `-`
    pub fn read(path: &str) -> Result<Self, FragTreerError> {
        if path == "-" {
            Self::from_reader(io::stdin().lock())
        } else {
            let handle = fs::File::open(Path::new(path)).map_err(|e| FragTreerError::InputOpen {
                path: path.to_string(),
                source: e,
            })?;
            Self::from_reader(io::BufReader::new(handle))
        }
    }
}
