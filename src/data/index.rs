//! Row deduplication index
//!
//! Count rows repeat heavily in binned read-count data, so emission
//! probabilities are computed once per distinct row and copied everywhere
//! else. The index maps every row to its first occurrence.

use std::collections::HashMap;

use super::types::CountMatrix;

/// First-occurrence index over the rows of a [`CountMatrix`].
#[derive(Debug, Clone)]
pub struct RowIndex {
    /// `idx[k]` is the smallest `k' <= k` with an identical row.
    idx: Vec<usize>,
    /// Position of the first all-zero row, if any.
    zero_row: Option<usize>,
}

impl RowIndex {
    /// Build the index. Rows compare by exact equality over all tracks;
    /// rows holding the missing sentinel are keys like any other.
    pub fn build(counts: &CountMatrix) -> Self {
        let n = counts.n_rows();
        let mut idx = vec![0usize; n];
        let mut seen: HashMap<&[i32], usize> = HashMap::with_capacity(n);
        let mut zero_row = None;

        for k in 0..n {
            let row = counts.row(k);
            let first = *seen.entry(row).or_insert(k);
            idx[k] = first;
            if zero_row.is_none() && row.iter().all(|&v| v == 0) {
                zero_row = Some(k);
            }
        }

        Self { idx, zero_row }
    }

    /// The canonical (first-occurrence) position of row `k`.
    pub fn canonical(&self, k: usize) -> usize {
        self.idx[k]
    }

    /// Whether row `k` is the first occurrence of its value.
    pub fn is_canonical(&self, k: usize) -> bool {
        self.idx[k] == k
    }

    /// Position of the first all-zero row, if the matrix has one.
    pub fn zero_row(&self) -> Option<usize> {
        self.zero_row
    }

    /// Whether row `k` is an all-zero row.
    pub fn is_zero_row(&self, k: usize) -> bool {
        self.zero_row == Some(self.idx[k])
    }

    /// Number of indexed rows.
    pub fn len(&self) -> usize {
        self.idx.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.idx.is_empty()
    }
}
