//! Observation storage and ingestion
//!
//! Provides the block-segmented count matrix, the row deduplication
//! index and the tab-separated input/output routines.

mod index;
mod reader;
mod types;

pub use index::RowIndex;
pub use reader::{read_counts, read_counts_path, write_results};
pub use types::CountMatrix;
