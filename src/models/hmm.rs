//! Zero-inflated negative multinomial Hidden Markov Model
//!
//! The trainer alternates forward-backward inference with closed-form
//! transition updates and a bracketed Newton solve for the per-state
//! control probability `p0`. The shared dispersion `a` and the
//! zero-inflation weight `pi` come from the control-track ZINB fit and
//! are held fixed, as is the initial distribution; the ratio
//! `p[i,1] / p[i,0]` is pinned to its starting value `R` across the
//! whole fit.

use ndarray::{Array1, Array2};
use rand::Rng;

use super::algorithms::{block_forward_backward, block_viterbi};
use super::emissions::{
    emission_probs, EmissionModel, EmissionOptions, OutputMode, ZinmEmission,
};
use super::zinb::ZinbParams;
use crate::data::{CountMatrix, RowIndex};
use crate::error::{HmmError, Result};

/// Tolerance on the per-state ratio `p[i,1] / p[i,0]` before the fit
/// warns about an inconsistent starting point.
const RATIO_TOLERANCE: f64 = 1e-3;

/// Tuning constants of the Baum-Welch trainer.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Maximum outer EM iterations.
    pub max_iter: usize,
    /// Maximum Newton refinements of the per-state emission update.
    pub newton_max_iter: usize,
    /// Convergence tolerance, for the outer loop (`max |P_new - P|`) and
    /// for the Newton bracket width.
    pub tolerance: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iter: 500,
            newton_max_iter: 25,
            tolerance: 1e-6,
        }
    }
}

/// HMM parameters.
#[derive(Debug, Clone)]
pub struct HmmParams {
    /// Number of hidden states.
    pub n_states: usize,
    /// Number of observation tracks.
    pub n_tracks: usize,
    /// Initial state distribution. Blocks restart from it, and the
    /// trainer never re-estimates it.
    pub initial: Array1<f64>,
    /// Row-stochastic transition matrix; `transition[[i, j]]` is the
    /// probability of moving from state `i` to state `j`.
    pub transition: Array2<f64>,
    /// Emission model.
    pub emission: EmissionModel,
}

impl HmmParams {
    /// Seed starting parameters from the control-track ZINB fit: a
    /// jittered diagonally dominant transition matrix, a uniform initial
    /// distribution, and outcome probabilities whose signal tracks are
    /// spread across states with the control ratio pinned.
    pub fn seeded(n_states: usize, counts: &CountMatrix, zinb: &ZinbParams) -> Self {
        let mut rng = rand::thread_rng();
        let m = n_states;
        let r = counts.n_tracks();

        let initial = Array1::from_elem(m, 1.0 / m as f64);

        let mut transition = Array2::zeros((m, m));
        for i in 0..m {
            for j in 0..m {
                transition[[i, j]] = if i == j {
                    0.8 + rng.gen::<f64>() * 0.15
                } else {
                    rng.gen::<f64>() * 0.1
                };
            }
            let row_sum: f64 = transition.row(i).sum();
            for j in 0..m {
                transition[[i, j]] /= row_sum;
            }
        }

        // Control ratio implied by the fitted NB mean a(1-p)/p.
        let control_mean = counts.track_mean(0).max(1e-3);
        let ratio = (control_mean / zinb.a).max(1e-6);
        let p0 = zinb.p;

        let mut p = Array2::zeros((m, r + 1));
        for i in 0..m {
            p[[i, 0]] = p0;
            p[[i, 1]] = p0 * ratio;
            for j in 1..r {
                // Spread signal-track enrichment across states so they
                // start distinguishable.
                let track_mean = counts.track_mean(j).max(1e-3);
                let fold = 1.0 + 2.0 * i as f64;
                p[[i, j + 1]] = fold * track_mean * p0 / zinb.a;
            }
            let row_sum: f64 = p.row(i).sum();
            for j in 0..=r {
                p[[i, j]] /= row_sum;
            }
        }

        Self {
            n_states: m,
            n_tracks: r,
            initial,
            transition,
            emission: EmissionModel::ZeroInflated(ZinmEmission {
                a: zinb.a,
                pi: zinb.pi,
                p,
            }),
        }
    }

    /// Check the parameter block for the fatal conditions: NaN or
    /// negative entries, out-of-range scalars, empty probability rows.
    pub fn validate(&self) -> Result<()> {
        let m = self.n_states;
        if m == 0 {
            return Err(HmmError::InvalidParameter(
                "need at least one state".to_string(),
            ));
        }
        if self.initial.len() != m {
            return Err(HmmError::DimensionMismatch {
                expected: m,
                actual: self.initial.len(),
            });
        }
        if self.transition.nrows() != m || self.transition.ncols() != m {
            return Err(HmmError::DimensionMismatch {
                expected: m * m,
                actual: self.transition.nrows() * self.transition.ncols(),
            });
        }
        if self.initial.iter().any(|v| v.is_nan() || *v < 0.0) {
            return Err(HmmError::InvalidParameter(
                "initial distribution contains NaN or negative entries".to_string(),
            ));
        }
        if self.transition.iter().any(|v| v.is_nan() || *v < 0.0) {
            return Err(HmmError::InvalidParameter(
                "transition matrix contains NaN or negative entries".to_string(),
            ));
        }
        match &self.emission {
            EmissionModel::ZeroInflated(z) => {
                if !(z.a > 0.0) {
                    return Err(HmmError::InvalidParameter(format!(
                        "dispersion must be positive, got {}",
                        z.a
                    )));
                }
                if !(0.0..=1.0).contains(&z.pi) {
                    return Err(HmmError::InvalidParameter(format!(
                        "zero-inflation weight must be in [0, 1], got {}",
                        z.pi
                    )));
                }
                validate_outcome_rows(&z.p, m, self.n_tracks)?;
            }
            EmissionModel::Mixture(mix) => {
                if !(mix.a > 0.0) {
                    return Err(HmmError::InvalidParameter(format!(
                        "dispersion must be positive, got {}",
                        mix.a
                    )));
                }
                if !(0.0..=1.0).contains(&mix.theta) {
                    return Err(HmmError::InvalidParameter(format!(
                        "mixture weight must be in [0, 1], got {}",
                        mix.theta
                    )));
                }
                validate_outcome_rows(&mix.p, m, self.n_tracks)?;
                validate_outcome_rows(&mix.q, m, self.n_tracks)?;
            }
        }
        Ok(())
    }
}

fn validate_outcome_rows(p: &Array2<f64>, m: usize, r: usize) -> Result<()> {
    if p.nrows() != m || p.ncols() != r + 1 {
        return Err(HmmError::DimensionMismatch {
            expected: m * (r + 1),
            actual: p.nrows() * p.ncols(),
        });
    }
    for (i, row) in p.rows().into_iter().enumerate() {
        if row.iter().any(|v| v.is_nan() || *v < 0.0) {
            return Err(HmmError::InvalidParameter(format!(
                "outcome probabilities of state {i} contain NaN or negative entries"
            )));
        }
        if row.sum() <= 0.0 {
            return Err(HmmError::InvalidParameter(format!(
                "outcome probabilities of state {i} sum to zero"
            )));
        }
    }
    Ok(())
}

/// Outcome of a completed fit.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Log-likelihood of the last completed iteration.
    pub log_likelihood: f64,
    /// Number of iterations run.
    pub iterations: usize,
    /// Whether the outer loop converged before the iteration cap.
    pub converged: bool,
    /// State posteriors from the final E-step.
    pub posteriors: Array2<f64>,
    /// Log-space emission values under the final parameters.
    pub log_emissions: Array2<f64>,
    /// Summed expected transition counts from the final E-step.
    pub expected_transitions: Array2<f64>,
}

/// Zero-inflated negative multinomial HMM.
#[derive(Debug, Clone)]
pub struct ZinmHmm {
    /// Model parameters.
    pub params: HmmParams,
    /// Trainer tuning constants.
    pub config: FitConfig,
    /// Whether the model has been fitted.
    pub is_fitted: bool,
    /// Per-iteration log-likelihoods of the last fit.
    pub log_likelihood_history: Vec<f64>,
}

impl ZinmHmm {
    /// Create a model from starting parameters. Callers must supply
    /// valid starting values; they are checked here.
    pub fn new(params: HmmParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            config: FitConfig::default(),
            is_fitted: false,
            log_likelihood_history: vec![],
        })
    }

    /// Replace the trainer configuration.
    pub fn with_config(mut self, config: FitConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of hidden states.
    pub fn n_states(&self) -> usize {
        self.params.n_states
    }

    /// Fit the model with Baum-Welch.
    ///
    /// The trainer works on copies of the transition matrix and the
    /// outcome probabilities and commits them only on success, so a
    /// failed fit leaves the model unchanged.
    pub fn fit(&mut self, counts: &CountMatrix) -> Result<FitResult> {
        self.params.validate()?;
        if counts.n_tracks() != self.params.n_tracks {
            return Err(HmmError::DimensionMismatch {
                expected: self.params.n_tracks,
                actual: counts.n_tracks(),
            });
        }
        if self.config.max_iter == 0 {
            return Err(HmmError::InvalidParameter(
                "max_iter must be at least 1".to_string(),
            ));
        }
        let zinm = match &self.params.emission {
            EmissionModel::ZeroInflated(z) => z.clone(),
            EmissionModel::Mixture(_) => {
                return Err(HmmError::InvalidParameter(
                    "training requires the zero-inflated emission model".to_string(),
                ))
            }
        };

        let n = counts.n_rows();
        let r = counts.n_tracks();
        let m = self.params.n_states;
        let a = zinm.a;
        let pi = zinm.pi;
        let ratio = zinm.ratio();

        // The fitting procedure keeps p[i,1] = R * p[i,0] for every
        // state; a starting point that violates this is suspicious but
        // not fatal.
        for i in 1..m {
            let state_ratio = zinm.p[[i, 1]] / zinm.p[[i, 0]];
            if (state_ratio - ratio).abs() > RATIO_TOLERANCE {
                tracing::warn!(
                    state = i,
                    state_ratio,
                    shared_ratio = ratio,
                    "outcome probabilities are inconsistent with the shared control ratio"
                );
                break;
            }
        }

        let index = RowIndex::build(counts);
        let sizes = counts.block_sizes();

        // Working copies; committed on success only.
        let mut q = self.params.transition.clone();
        let mut p = zinm.p.clone();

        let mut pem = Array2::zeros((n, m));
        let mut phi = Array2::zeros((n, m));
        let mut trans_sum = Array2::zeros((m, m));
        let mut ystar = vec![0.0; r];

        self.log_likelihood_history.clear();
        let mut converged = false;
        let mut iterations = 0;

        for iter in 0..self.config.max_iter {
            iterations = iter + 1;

            // E-step: rebuild the emissions and smooth every block.
            let model = EmissionModel::ZeroInflated(ZinmEmission {
                a,
                pi,
                p: p.clone(),
            });
            let report = emission_probs(
                &model,
                counts,
                &index,
                EmissionOptions::default(),
                &mut pem,
            )?;
            if report.renormalized && iter == 0 {
                tracing::warn!("renormalizing outcome probabilities");
            }

            let (trans, loglik) =
                block_forward_backward(&q, &self.params.initial, sizes, &mut pem, &mut phi)?;
            trans_sum = trans;
            self.log_likelihood_history.push(loglik);

            // M-step: transitions, then the outcome probabilities.
            update_transitions(&mut q, &trans_sum);

            let mut new_p = Array2::zeros((m, r + 1));
            for i in 0..m {
                let mut sum_a = 0.0;
                let mut sum_b = 0.0;
                let mut sum_d = 0.0;
                ystar.iter_mut().for_each(|v| *v = 0.0);
                for k in 0..n {
                    // Missing rows carry no emission information.
                    if counts.row_is_missing(k) {
                        continue;
                    }
                    if index.is_zero_row(k) {
                        sum_b += phi[[k, i]];
                    } else {
                        let y = counts.row(k);
                        sum_a += phi[[k, i]];
                        sum_d += phi[[k, i]] * y[0] as f64;
                        for j in 1..r {
                            ystar[j] += phi[[k, i]] * y[j] as f64;
                        }
                    }
                }
                let sum_e: f64 = ystar[1..].iter().sum();
                let c_const = 1.0 + ratio;

                let p0 = self.solve_p0(
                    a, pi, sum_a, sum_b, c_const, sum_d, sum_e, i,
                )?;

                new_p[[i, 0]] = p0;
                new_p[[i, 1]] = p0 * ratio;
                let term1 = (sum_d + a * sum_a) / p0;
                let term2 = sum_b * pi * a * p0.powf(a - 1.0)
                    / (pi * p0.powf(a) + 1.0 - pi);
                let normconst = (term1 + term2) / c_const;
                for j in 1..r {
                    new_p[[i, j + 1]] = ystar[j] / normconst;
                }
            }

            let max_delta = new_p
                .iter()
                .zip(p.iter())
                .map(|(new, old)| (new - old).abs())
                .fold(0.0f64, f64::max);

            if (iter + 1) % 10 == 0 {
                tracing::debug!(
                    iteration = iter + 1,
                    log_likelihood = loglik,
                    max_delta,
                    "Baum-Welch progress"
                );
            }

            if max_delta < self.config.tolerance {
                converged = true;
                break;
            }
            p = new_p;
        }

        if converged {
            tracing::info!("converged after {} iterations", iterations);
        } else {
            tracing::info!(
                "stopped at the iteration cap ({})",
                self.config.max_iter
            );
        }

        // Final emissions in log space under the committed parameters.
        let model = EmissionModel::ZeroInflated(ZinmEmission {
            a,
            pi,
            p: p.clone(),
        });
        emission_probs(
            &model,
            counts,
            &index,
            EmissionOptions {
                mode: OutputMode::Log,
                with_constants: false,
            },
            &mut pem,
        )?;

        self.params.transition = q;
        self.params.emission = EmissionModel::ZeroInflated(ZinmEmission { a, pi, p });
        self.is_fitted = true;

        Ok(FitResult {
            log_likelihood: *self
                .log_likelihood_history
                .last()
                .expect("at least one iteration"),
            iterations,
            converged,
            posteriors: phi,
            log_emissions: pem,
            expected_transitions: trans_sum,
        })
    }

    /// Bracket and refine the root of the emission-update score for one
    /// state: double outward from 0.5 until the score changes sign, then
    /// bisect with Newton proposals that fall back to the midpoint when
    /// they leave the bracket.
    #[allow(clippy::too_many_arguments)]
    fn solve_p0(
        &self,
        a: f64,
        pi: f64,
        sum_a: f64,
        sum_b: f64,
        c_const: f64,
        sum_d: f64,
        sum_e: f64,
        state: usize,
    ) -> Result<f64> {
        let fail = || HmmError::BracketingFailed {
            state,
            log_likelihood: self
                .log_likelihood_history
                .last()
                .copied()
                .unwrap_or(f64::NEG_INFINITY),
        };

        let score = |p0: f64| emission_score(a, pi, p0, sum_a, sum_b, c_const, sum_d, sum_e);

        let mut p0 = 0.5;
        let (mut lo, mut hi);
        if score(p0) < 0.0 {
            p0 *= 2.0;
            while score(p0) < 0.0 {
                p0 *= 2.0;
                if !p0.is_finite() {
                    return Err(fail());
                }
            }
            lo = p0 / 2.0;
            hi = p0;
        } else {
            p0 /= 2.0;
            while score(p0) > 0.0 {
                p0 /= 2.0;
                if p0 < f64::MIN_POSITIVE {
                    return Err(fail());
                }
            }
            lo = p0;
            hi = p0 * 2.0;
        }

        if lo > 1.0 || hi < 0.0 {
            return Err(fail());
        }

        let mut next = 0.5 * (lo + hi);
        for _ in 0..self.config.newton_max_iter {
            p0 = if next < lo || next > hi {
                0.5 * (lo + hi)
            } else {
                next
            };
            let f = score(p0);
            if f > 0.0 {
                hi = p0;
            } else {
                lo = p0;
            }
            if hi - lo < self.config.tolerance {
                break;
            }
            let df = emission_score_derivative(a, pi, p0, sum_a, sum_b, sum_d, sum_e);
            next = p0 - f / df;
        }

        Ok(p0)
    }

    /// Most likely state sequence (Viterbi), decoded per block.
    pub fn predict(&self, counts: &CountMatrix) -> Result<Vec<usize>> {
        if !self.is_fitted {
            return Err(HmmError::InvalidParameter(
                "model is not fitted yet".to_string(),
            ));
        }
        let index = RowIndex::build(counts);
        let mut pem = Array2::zeros((counts.n_rows(), self.n_states()));
        emission_probs(
            &self.params.emission,
            counts,
            &index,
            EmissionOptions {
                mode: OutputMode::Log,
                with_constants: false,
            },
            &mut pem,
        )?;
        block_viterbi(
            &self.params.transition.mapv(f64::ln),
            &self.params.initial.mapv(f64::ln),
            counts.block_sizes(),
            &pem,
            true,
        )
    }

    /// Posterior state probabilities and the profile log-likelihood.
    pub fn posteriors(&self, counts: &CountMatrix) -> Result<(Array2<f64>, f64)> {
        if !self.is_fitted {
            return Err(HmmError::InvalidParameter(
                "model is not fitted yet".to_string(),
            ));
        }
        let index = RowIndex::build(counts);
        let n = counts.n_rows();
        let m = self.n_states();
        let mut pem = Array2::zeros((n, m));
        let mut phi = Array2::zeros((n, m));
        emission_probs(
            &self.params.emission,
            counts,
            &index,
            EmissionOptions::default(),
            &mut pem,
        )?;
        let (_, loglik) = block_forward_backward(
            &self.params.transition,
            &self.params.initial,
            counts.block_sizes(),
            &mut pem,
            &mut phi,
        )?;
        Ok((phi, loglik))
    }

    /// Log-likelihood of the observations under the current parameters.
    pub fn score(&self, counts: &CountMatrix) -> Result<f64> {
        self.posteriors(counts).map(|(_, loglik)| loglik)
    }

    /// The transition matrix.
    pub fn transition_matrix(&self) -> &Array2<f64> {
        &self.params.transition
    }
}

/// Row-normalize the expected transition counts into the transition
/// matrix. Rows with no expected mass keep their previous values.
fn update_transitions(q: &mut Array2<f64>, trans: &Array2<f64>) {
    let m = q.nrows();
    for i in 0..m {
        let row_sum: f64 = trans.row(i).sum();
        if row_sum > 0.0 {
            for j in 0..m {
                q[[i, j]] = trans[[i, j]] / row_sum;
            }
        }
    }
}

/// The score whose root in `(0, 1)` is the updated control probability.
#[allow(clippy::too_many_arguments)]
fn emission_score(
    a: f64,
    pi: f64,
    p0: f64,
    sum_a: f64,
    sum_b: f64,
    c_const: f64,
    sum_d: f64,
    sum_e: f64,
) -> f64 {
    let term1 = (sum_d + a * sum_a) / p0;
    let term2 = sum_b * pi * a * p0.powf(a - 1.0) / (pi * p0.powf(a) + 1.0 - pi);
    p0 + sum_e / (term1 + term2) - 1.0 / c_const
}

/// Derivative of [`emission_score`] with respect to `p0`.
fn emission_score_derivative(
    a: f64,
    pi: f64,
    p0: f64,
    sum_a: f64,
    sum_b: f64,
    sum_d: f64,
    sum_e: f64,
) -> f64 {
    let term1 = (sum_d + a * sum_a) / p0;
    let term2 = sum_b * pi * a * p0.powf(a - 1.0) / (pi * p0.powf(a) + 1.0 - pi);
    let subterm3a = (1.0 - pi) * pi * a * (a - 1.0) * p0.powf(a - 2.0);
    let subterm3b = pi * pi * a * p0.powf(2.0 * a - 2.0);
    let term3 =
        sum_b * (subterm3a - subterm3b) / (pi * p0.powf(a) + 1.0 - pi).powi(2);
    let term4 = (sum_d + a * sum_a) / (p0 * p0);
    1.0 - sum_e / (term1 + term2).powi(2) * (term3 - term4)
}
