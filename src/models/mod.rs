//! Emission models and inference algorithms
//!
//! Provides the ZINM/mixture emission evaluator, the forward-backward
//! and Viterbi algorithms, the Baum-Welch trainer and the control-track
//! ZINB fit.

mod algorithms;
mod emissions;
mod hmm;
mod zinb;

pub use algorithms::{
    backward, block_forward_backward, block_viterbi, forward, forward_backward,
};
pub use emissions::{
    emission_probs, EmissionModel, EmissionOptions, EmissionReport, MixtureEmission,
    OutputMode, ZinmEmission,
};
pub use hmm::{FitConfig, FitResult, HmmParams, ZinmHmm};
pub use zinb::{fit_zinb, fit_zinb_with_config, ZinbConfig, ZinbParams};
