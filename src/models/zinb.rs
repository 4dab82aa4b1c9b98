//! Zero-inflated negative binomial fit of the control track
//!
//! The control track pins the shared dispersion `a` and the
//! zero-inflation weight `pi` of the HMM emission model. Both come from
//! a univariate ZINB maximum-likelihood fit: with probability `pi` the
//! observation is negative binomial with size `a` and success
//! probability `p`, and with probability `1 - pi` it is a structural
//! zero, so `P(0) = pi * p^a + (1 - pi)`.
//!
//! The fit runs EM over the structural-zero responsibilities with a
//! closed-form `p` update and a bracketed bisection on the profile score
//! for `a`.

use statrs::function::gamma::{digamma, ln_gamma};

use crate::error::{HmmError, Result};

/// Fitted ZINB parameters.
#[derive(Debug, Clone)]
pub struct ZinbParams {
    /// Negative binomial size (the HMM's shared dispersion).
    pub a: f64,
    /// Weight of the negative binomial component.
    pub pi: f64,
    /// Success probability of the negative binomial.
    pub p: f64,
    /// Log-likelihood at convergence.
    pub log_likelihood: f64,
    /// Number of EM iterations run.
    pub iterations: usize,
    /// Whether the EM loop converged before the iteration cap.
    pub converged: bool,
}

/// Configuration for the ZINB fit.
#[derive(Debug, Clone)]
pub struct ZinbConfig {
    /// Maximum EM iterations.
    pub max_iter: usize,
    /// Convergence tolerance on the log-likelihood.
    pub tol: f64,
}

impl Default for ZinbConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-6,
        }
    }
}

/// Fit a ZINB distribution to a count vector by maximum likelihood.
///
/// Negative entries are missing observations and are skipped.
pub fn fit_zinb(counts: &[i32]) -> Result<ZinbParams> {
    fit_zinb_with_config(counts, &ZinbConfig::default())
}

/// Fit with a custom configuration.
pub fn fit_zinb_with_config(counts: &[i32], config: &ZinbConfig) -> Result<ZinbParams> {
    let y: Vec<f64> = counts
        .iter()
        .filter(|&&v| v >= 0)
        .map(|&v| v as f64)
        .collect();
    let n = y.len();
    if n == 0 {
        return Err(HmmError::InvalidParameter(
            "control track has no observed values".to_string(),
        ));
    }
    if y.iter().all(|&v| v == 0.0) {
        return Err(HmmError::InvalidParameter(
            "control track has no signal (all zeros)".to_string(),
        ));
    }

    // Moment-based starting point.
    let mean = y.iter().sum::<f64>() / n as f64;
    let var = y.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let mut a = if var > mean {
        (mean * mean / (var - mean)).clamp(0.1, 1e4)
    } else {
        10.0
    };
    let mut p = (a / (a + mean)).clamp(1e-6, 1.0 - 1e-6);

    // Excess zeros over the implied NB zero mass seed the mixture weight.
    let zero_frac = y.iter().filter(|&&v| v == 0.0).count() as f64 / n as f64;
    let nb_zero = p.powf(a);
    let structural = if nb_zero < 1.0 {
        ((zero_frac - nb_zero) / (1.0 - nb_zero)).clamp(0.0, 0.99)
    } else {
        0.0
    };
    let mut pi = (1.0 - structural).clamp(0.01, 1.0);

    let mut prev_ll = f64::NEG_INFINITY;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iter {
        iterations = iter + 1;

        // E-step: weight of the NB component for each observation. A
        // positive count can only come from the NB component.
        let nb_zero = p.powf(a);
        let u_zero = {
            let denom = pi * nb_zero + (1.0 - pi);
            if denom > 0.0 {
                (pi * nb_zero / denom).clamp(1e-10, 1.0)
            } else {
                0.5
            }
        };
        let u: Vec<f64> = y
            .iter()
            .map(|&v| if v == 0.0 { u_zero } else { 1.0 })
            .collect();

        // M-step: mixture weight, then the weighted NB parameters.
        let u_sum: f64 = u.iter().sum();
        pi = (u_sum / n as f64).clamp(1e-6, 1.0);

        let s: f64 = u.iter().zip(y.iter()).map(|(ui, yi)| ui * yi).sum();
        a = solve_dispersion(&y, &u, u_sum, s, a);
        p = (a * u_sum / (a * u_sum + s)).clamp(1e-9, 1.0 - 1e-9);

        let ll = log_likelihood(&y, a, pi, p);
        if (ll - prev_ll).abs() < config.tol {
            converged = true;
            prev_ll = ll;
            break;
        }
        prev_ll = ll;
    }

    tracing::debug!(
        a,
        pi,
        p,
        iterations,
        converged,
        "control-track ZINB fit finished"
    );

    Ok(ZinbParams {
        a,
        pi,
        p,
        log_likelihood: prev_ll,
        iterations,
        converged,
    })
}

/// Profile score for the dispersion, with `p` substituted by its
/// closed-form maximizer `a U / (a U + S)`.
fn dispersion_score(y: &[f64], u: &[f64], u_sum: f64, s: f64, a: f64) -> f64 {
    let mut score = 0.0;
    for (&yi, &ui) in y.iter().zip(u.iter()) {
        score += ui * (digamma(a + yi) - digamma(a));
    }
    score + u_sum * (a * u_sum / (a * u_sum + s)).ln()
}

/// Solve the profile score for `a` by doubling out a bracket from the
/// current value and bisecting. The score decreases in `a`, so a sign
/// change pins the root.
fn solve_dispersion(y: &[f64], u: &[f64], u_sum: f64, s: f64, a_start: f64) -> f64 {
    let mut lo = a_start.clamp(1e-6, 1e6);
    let mut hi = lo;

    if dispersion_score(y, u, u_sum, s, lo) > 0.0 {
        // Root is above; double until the score turns negative.
        for _ in 0..64 {
            hi *= 2.0;
            if hi > 1e6 {
                return 1e6;
            }
            if dispersion_score(y, u, u_sum, s, hi) <= 0.0 {
                break;
            }
            lo = hi;
        }
    } else {
        for _ in 0..64 {
            lo /= 2.0;
            if lo < 1e-6 {
                return 1e-6;
            }
            if dispersion_score(y, u, u_sum, s, lo) >= 0.0 {
                break;
            }
            hi = lo;
        }
    }

    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if dispersion_score(y, u, u_sum, s, mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-8 * hi.max(1.0) {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// ZINB log-likelihood of the observed counts.
fn log_likelihood(y: &[f64], a: f64, pi: f64, p: f64) -> f64 {
    let log_pi = pi.ln();
    let nb_zero = p.powf(a);
    y.iter()
        .map(|&yi| {
            if yi == 0.0 {
                (pi * nb_zero + (1.0 - pi)).max(1e-300).ln()
            } else {
                log_pi + ln_gamma(a + yi) - ln_gamma(a) - ln_gamma(yi + 1.0)
                    + a * p.ln()
                    + yi * (1.0 - p).ln()
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Overdispersed counts with no excess zeros.
    fn nb_counts() -> Vec<i32> {
        vec![
            2, 5, 1, 0, 3, 7, 2, 1, 4, 0, 6, 2, 3, 1, 5, 2, 0, 8, 3, 2, 1, 4, 2, 6, 3,
            1, 2, 0, 5, 3,
        ]
    }

    /// Same counts padded with structural zeros.
    fn inflated_counts() -> Vec<i32> {
        let mut counts = nb_counts();
        counts.extend(std::iter::repeat(0).take(30));
        counts
    }

    #[test]
    fn test_fit_is_well_formed() {
        let fit = fit_zinb(&nb_counts()).unwrap();
        assert!(fit.a > 0.0);
        assert!(fit.p > 0.0 && fit.p < 1.0);
        assert!((0.0..=1.0).contains(&fit.pi));
        assert!(fit.log_likelihood.is_finite());
        assert!(fit.converged);
    }

    #[test]
    fn test_excess_zeros_lower_component_weight() {
        let plain = fit_zinb(&nb_counts()).unwrap();
        let inflated = fit_zinb(&inflated_counts()).unwrap();
        assert!(inflated.pi < plain.pi);
    }

    #[test]
    fn test_mean_is_recovered() {
        let fit = fit_zinb(&nb_counts()).unwrap();
        let y: Vec<f64> = nb_counts().iter().map(|&v| v as f64).collect();
        let mean = y.iter().sum::<f64>() / y.len() as f64;
        // NB mean a(1-p)/p, scaled by the component weight.
        let model_mean = fit.pi * fit.a * (1.0 - fit.p) / fit.p;
        assert!((model_mean - mean).abs() / mean < 0.2);
    }

    #[test]
    fn test_missing_values_are_skipped() {
        let mut with_missing = nb_counts();
        with_missing.push(-1);
        with_missing.push(-1);
        let a = fit_zinb(&nb_counts()).unwrap();
        let b = fit_zinb(&with_missing).unwrap();
        assert!((a.a - b.a).abs() < 1e-9);
        assert!((a.pi - b.pi).abs() < 1e-9);
    }

    #[test]
    fn test_all_zero_control_rejected() {
        assert!(fit_zinb(&[0, 0, 0, 0]).is_err());
        assert!(fit_zinb(&[-1, -1]).is_err());
        assert!(fit_zinb(&[]).is_err());
    }
}
