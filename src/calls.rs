//! Interpretation of fitted states and region calls
//!
//! A fitted model says nothing about which state is the enriched one;
//! this module ranks states by their expected signal-to-control
//! enrichment and extracts contiguous runs of the most enriched state
//! from the Viterbi path as called regions.

use std::io;

use ndarray::Array2;
use serde::Serialize;

use crate::data::CountMatrix;
use crate::error::{HmmError, Result};
use crate::models::ZinmEmission;

/// Summary of one hidden state.
#[derive(Debug, Clone, Serialize)]
pub struct StateProfile {
    /// State index.
    pub state: usize,
    /// Expected total signal-track count per bin,
    /// `a * sum_j p[state, j] / p[state, 0]` over the signal tracks.
    pub expected_signal: f64,
    /// Expected control-track count per bin.
    pub expected_control: f64,
}

impl StateProfile {
    /// Signal counts per control count; the ranking statistic.
    pub fn enrichment(&self) -> f64 {
        if self.expected_control > 0.0 {
            self.expected_signal / self.expected_control
        } else {
            0.0
        }
    }
}

/// Per-state expected counts under the negative multinomial: track `j`
/// has mean `a * p[i, j+1] / p[i, 0]`.
pub fn state_profiles(emission: &ZinmEmission) -> Vec<StateProfile> {
    let m = emission.n_states();
    let r = emission.p.ncols() - 1;
    (0..m)
        .map(|i| {
            let p0 = emission.p[[i, 0]];
            let control = emission.a * emission.p[[i, 1]] / p0;
            let signal: f64 = (2..=r)
                .map(|j| emission.a * emission.p[[i, j]] / p0)
                .sum();
            StateProfile {
                state: i,
                expected_signal: signal,
                expected_control: control,
            }
        })
        .collect()
}

/// The state with the highest expected signal enrichment. Ties keep the
/// lowest index.
pub fn most_enriched_state(emission: &ZinmEmission) -> usize {
    state_profiles(emission)
        .iter()
        .max_by(|a, b| {
            a.enrichment()
                .partial_cmp(&b.enrichment())
                .expect("enrichment is finite")
        })
        .map(|p| p.state)
        .unwrap_or(0)
}

/// A maximal run of one state within a single block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    /// Label of the enclosing block.
    pub block: String,
    /// First bin of the run, 0-based within the block.
    pub start: usize,
    /// One past the last bin of the run, within the block.
    pub end: usize,
    /// Mean posterior of the called state over the run.
    pub mean_posterior: f64,
}

impl Region {
    /// Number of bins in the region.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Extract the maximal runs of `state` from a decoded path, respecting
/// block boundaries. `posteriors` supplies the per-bin posterior of the
/// called state.
pub fn call_regions(
    counts: &CountMatrix,
    path: &[usize],
    posteriors: &Array2<f64>,
    state: usize,
) -> Result<Vec<Region>> {
    let n = counts.n_rows();
    if path.len() != n || posteriors.nrows() != n {
        return Err(HmmError::DimensionMismatch {
            expected: n,
            actual: path.len().min(posteriors.nrows()),
        });
    }
    if state >= posteriors.ncols() {
        return Err(HmmError::InvalidParameter(format!(
            "state {state} out of range"
        )));
    }

    let mut regions = Vec::new();
    let mut offset = 0;
    for (b, &size) in counts.block_sizes().iter().enumerate() {
        let label = &counts.block_labels()[b];
        let mut run_start: Option<usize> = None;
        for local in 0..=size {
            let in_state = local < size && path[offset + local] == state;
            match (run_start, in_state) {
                (None, true) => run_start = Some(local),
                (Some(start), false) => {
                    let sum: f64 = (start..local)
                        .map(|l| posteriors[[offset + l, state]])
                        .sum();
                    regions.push(Region {
                        block: label.clone(),
                        start,
                        end: local,
                        mean_posterior: sum / (local - start) as f64,
                    });
                    run_start = None;
                }
                _ => {}
            }
        }
        offset += size;
    }

    Ok(regions)
}

/// Write called regions as TSV.
pub fn write_regions<W: io::Write>(output: W, regions: &[Region]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(output);
    writer.write_record(["block", "start", "end", "mean_posterior"])?;
    for region in regions {
        writer.write_record(&[
            region.block.clone(),
            region.start.to_string(),
            region.end.to_string(),
            format!("{:.6}", region.mean_posterior),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
