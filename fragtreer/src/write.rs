use std::fs;
use std::io::{self, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use fragtree::compute::{CandidateResult, ComputeResult, ComputeStats};

use crate::driver::FragTreerError;

/// The ranked results for one input instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceOutput {
    pub name: String,
    pub precursor_mz: f64,
    pub results: Vec<CandidateResult>,
    pub excluded: Vec<ExclusionRecord>,
    pub stats: ComputeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExclusionRecord {
    pub formula: String,
    pub reason: String,
}

impl InstanceOutput {
    /// Keep the best `number_of_results` candidates, dropping their trees when
    /// `include_trees` is false
    pub fn new(
        name: String,
        precursor_mz: f64,
        result: ComputeResult,
        number_of_results: usize,
        include_trees: bool,
    ) -> Self {
        let results = result
            .ranked
            .into_iter()
            .take(number_of_results)
            .map(|mut r| {
                if !include_trees {
                    r.tree = None;
                }
                r
            })
            .collect();
        let excluded = result
            .excluded
            .into_iter()
            .map(|r| ExclusionRecord {
                formula: r.formula.to_string(),
                reason: match r.status {
                    fragtree::CandidateStatus::Excluded { reason } => reason,
                    other => format!("{other:?}"),
                },
            })
            .collect();
        Self {
            name,
            precursor_mz,
            results,
            excluded,
            stats: result.stats,
        }
    }
}

fn write_json<W: Write>(writer: W, outputs: &[InstanceOutput]) -> Result<(), FragTreerError> {
    let mut writer = io::BufWriter::new(writer);
    serde_json::to_writer_pretty(&mut writer, outputs)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Write `outputs` as a JSON array to `path`, or to STDOUT if `path` is `-`. Paths
/// ending in `.gz` are gzip compressed.
pub fn write_output(path: &Path, outputs: &[InstanceOutput]) -> Result<(), FragTreerError> {
    if path.as_os_str() == "-" {
        return write_json(io::stdout().lock(), outputs);
    }
    let handle = fs::File::create(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        let mut encoder = GzEncoder::new(handle, Compression::best());
        write_json(&mut encoder, outputs)?;
        encoder.finish()?;
        Ok(())
    } else {
        write_json(handle, outputs)
    }
}
