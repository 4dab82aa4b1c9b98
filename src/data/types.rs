//! Data types for block-segmented count profiles

use crate::error::{HmmError, Result};

/// Block-segmented matrix of read counts.
///
/// Rows are genomic bins, columns are experimental tracks. Column 0 is the
/// control track. Any negative entry marks the observation as missing and
/// contaminates the whole row. Blocks are contiguous runs of rows that are
/// modeled as independent Markov chains with shared parameters.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    /// Number of tracks (columns).
    r: usize,
    /// Row-major `n x r` counts.
    counts: Vec<i32>,
    /// Lengths of the independent blocks; sums to `n`.
    block_sizes: Vec<usize>,
    /// One label per block (chromosome or contig name).
    block_labels: Vec<String>,
}

impl CountMatrix {
    /// Create a matrix from row-major counts and block sizes.
    ///
    /// Blocks get synthetic labels; use [`CountMatrix::with_labels`] when
    /// the source carries real ones.
    pub fn new(counts: Vec<i32>, r: usize, block_sizes: Vec<usize>) -> Result<Self> {
        let labels = (0..block_sizes.len())
            .map(|i| format!("block_{i}"))
            .collect();
        Self::with_labels(counts, r, block_sizes, labels)
    }

    /// Create a matrix with explicit block labels.
    pub fn with_labels(
        counts: Vec<i32>,
        r: usize,
        block_sizes: Vec<usize>,
        block_labels: Vec<String>,
    ) -> Result<Self> {
        if r == 0 {
            return Err(HmmError::InvalidParameter(
                "need at least one track".to_string(),
            ));
        }
        if block_sizes.is_empty() {
            return Err(HmmError::InvalidParameter(
                "need at least one block".to_string(),
            ));
        }
        if block_sizes.iter().any(|&s| s == 0) {
            return Err(HmmError::InvalidParameter(
                "block sizes must be positive".to_string(),
            ));
        }
        if block_labels.len() != block_sizes.len() {
            return Err(HmmError::DimensionMismatch {
                expected: block_sizes.len(),
                actual: block_labels.len(),
            });
        }
        let n: usize = block_sizes.iter().sum();
        if counts.len() != n * r {
            return Err(HmmError::DimensionMismatch {
                expected: n * r,
                actual: counts.len(),
            });
        }
        Ok(Self {
            r,
            counts,
            block_sizes,
            block_labels,
        })
    }

    /// Number of rows (observations).
    pub fn n_rows(&self) -> usize {
        self.counts.len() / self.r
    }

    /// Number of tracks (columns).
    pub fn n_tracks(&self) -> usize {
        self.r
    }

    /// Number of blocks.
    pub fn n_blocks(&self) -> usize {
        self.block_sizes.len()
    }

    /// Block lengths, in order.
    pub fn block_sizes(&self) -> &[usize] {
        &self.block_sizes
    }

    /// Block labels, in order.
    pub fn block_labels(&self) -> &[String] {
        &self.block_labels
    }

    /// One row of counts.
    pub fn row(&self, k: usize) -> &[i32] {
        &self.counts[k * self.r..(k + 1) * self.r]
    }

    /// Whether the row holds a missing observation (any negative entry).
    pub fn row_is_missing(&self, k: usize) -> bool {
        self.row(k).iter().any(|&v| v < 0)
    }

    /// Whether the row is all zeros.
    pub fn row_is_zero(&self, k: usize) -> bool {
        self.row(k).iter().all(|&v| v == 0)
    }

    /// The control track (column 0).
    pub fn control(&self) -> Vec<i32> {
        (0..self.n_rows()).map(|k| self.row(k)[0]).collect()
    }

    /// Mean of track `j` over rows with no missing entries.
    pub fn track_mean(&self, j: usize) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for k in 0..self.n_rows() {
            if self.row_is_missing(k) {
                continue;
            }
            sum += self.row(k)[j] as f64;
            count += 1;
        }
        if count > 0 {
            sum / count as f64
        } else {
            0.0
        }
    }

    /// Block label of the block containing row `k`.
    pub fn label_of_row(&self, k: usize) -> &str {
        let mut offset = 0;
        for (b, &size) in self.block_sizes.iter().enumerate() {
            offset += size;
            if k < offset {
                return &self.block_labels[b];
            }
        }
        // `k` is in range by construction; the loop always returns.
        unreachable!("row index out of range")
    }
}
