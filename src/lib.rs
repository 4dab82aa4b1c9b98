//! # chip-hmm
//!
//! Hidden Markov Model segmentation of multi-track ChIP-seq read-count
//! profiles.
//!
//! This library provides:
//! - A block-segmented count matrix with first-class missing data and a
//!   row deduplication index
//! - Zero-inflated negative multinomial emissions (plus the standalone
//!   two-component mixture variant)
//! - Forward-backward smoothing with a reverse-kernel backward pass and
//!   log-space Viterbi decoding, both NA-robust
//! - A Baum-Welch trainer with a bracketed Newton emission update
//! - A ZINB maximum-likelihood fit of the control track to pin the
//!   shared dispersion and zero-inflation weight
//! - Enriched-region calling from the decoded state path
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use chip_hmm::data::read_counts_path;
//! use chip_hmm::models::{fit_zinb, HmmParams, ZinmHmm};
//!
//! fn main() -> anyhow::Result<()> {
//!     // Load a tab-separated profile (block label + count tracks).
//!     let counts = read_counts_path("profile.tsv")?;
//!
//!     // Pin dispersion and zero inflation on the control track.
//!     let zinb = fit_zinb(&counts.control())?;
//!
//!     // Train and decode.
//!     let mut hmm = ZinmHmm::new(HmmParams::seeded(2, &counts, &zinb))?;
//!     let fit = hmm.fit(&counts)?;
//!     let _path = hmm.predict(&counts)?;
//!
//!     println!("log-likelihood: {:.4}", fit.log_likelihood);
//!     Ok(())
//! }
//! ```

pub mod calls;
pub mod data;
pub mod error;
pub mod models;

// Re-exports for convenience
pub use calls::{call_regions, most_enriched_state, state_profiles, Region};
pub use data::{read_counts, read_counts_path, write_results, CountMatrix, RowIndex};
pub use error::{HmmError, Result};
pub use models::{
    fit_zinb, EmissionModel, FitConfig, FitResult, HmmParams, ZinbParams, ZinmHmm,
};
