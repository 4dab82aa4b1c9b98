//! Emission models for multi-track count observations
//!
//! Two families share the evaluator: the zero-inflated negative
//! multinomial used by the trainer, and a standalone two-component
//! negative multinomial mixture. Emission probabilities are computed up
//! to a state-independent constant, once per distinct observation row
//! (duplicates are copied through the row index).

use ndarray::Array2;
use statrs::function::gamma::ln_gamma;

use crate::data::{CountMatrix, RowIndex};
use crate::error::{HmmError, Result};

/// Output representation requested from the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Linear space, falling back to log space for rows where every state
    /// underflows to zero. This mixed per-row convention is what the
    /// forward pass consumes: a negative first slot marks a log-space row.
    LinPreferred,
    /// Always log space.
    Log,
    /// Always linear space, even when a whole row underflows.
    Lin,
    /// `1 / (1 + exp(q_term - p_term))`, the posterior weight of the
    /// first mixture component. Only defined for the mixture family.
    Ratio,
}

/// Evaluator options.
#[derive(Debug, Clone, Copy)]
pub struct EmissionOptions {
    pub mode: OutputMode,
    /// Include the combinatorial normalization constant, which depends on
    /// the observation but not on the state.
    pub with_constants: bool,
}

impl Default for EmissionOptions {
    fn default() -> Self {
        Self {
            mode: OutputMode::LinPreferred,
            with_constants: false,
        }
    }
}

/// Per-call diagnostics. Callers decide whether to surface them.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmissionReport {
    /// At least one probability row needed renormalization.
    pub renormalized: bool,
}

/// Zero-inflated negative multinomial emissions.
///
/// State `i` emits a count row `y` with probability proportional to
/// `p[i,0]^a * prod_j p[i,j+1]^y_j`, and an all-zero row with probability
/// `pi * p[i,0]^a + (1 - pi)`.
#[derive(Debug, Clone)]
pub struct ZinmEmission {
    /// Shared dispersion, the exponent of the control outcome.
    pub a: f64,
    /// Weight of the negative multinomial component at zero.
    pub pi: f64,
    /// `(m, r+1)` outcome probabilities, one row per state.
    pub p: Array2<f64>,
}

impl ZinmEmission {
    pub fn n_states(&self) -> usize {
        self.p.nrows()
    }

    /// The structural ratio `p[i,1] / p[i,0]`, read off state 0. The
    /// fitting procedure keeps it equal across states.
    pub fn ratio(&self) -> f64 {
        self.p[[0, 1]] / self.p[[0, 0]]
    }
}

/// Two-component negative multinomial mixture with weight `theta` on the
/// `p` component and `1 - theta` on the `q` component.
#[derive(Debug, Clone)]
pub struct MixtureEmission {
    pub a: f64,
    pub theta: f64,
    pub p: Array2<f64>,
    pub q: Array2<f64>,
}

impl MixtureEmission {
    pub fn n_states(&self) -> usize {
        self.p.nrows()
    }
}

/// The emission families understood by the evaluator.
#[derive(Debug, Clone)]
pub enum EmissionModel {
    ZeroInflated(ZinmEmission),
    Mixture(MixtureEmission),
}

impl EmissionModel {
    pub fn n_states(&self) -> usize {
        match self {
            EmissionModel::ZeroInflated(z) => z.n_states(),
            EmissionModel::Mixture(m) => m.n_states(),
        }
    }
}

/// Compute per-row per-state emission values into `pem` (`n x m`).
///
/// Rows with a missing observation come out as NaN in every state slot.
/// Rows that repeat an earlier observation are copied verbatim from their
/// canonical row.
pub fn emission_probs(
    model: &EmissionModel,
    counts: &CountMatrix,
    index: &RowIndex,
    opts: EmissionOptions,
    pem: &mut Array2<f64>,
) -> Result<EmissionReport> {
    let n = counts.n_rows();
    let m = model.n_states();
    if pem.nrows() != n || pem.ncols() != m {
        return Err(HmmError::DimensionMismatch {
            expected: n * m,
            actual: pem.nrows() * pem.ncols(),
        });
    }
    if index.len() != n {
        return Err(HmmError::DimensionMismatch {
            expected: n,
            actual: index.len(),
        });
    }

    match model {
        EmissionModel::ZeroInflated(z) => zinm_probs(z, counts, index, opts, pem),
        EmissionModel::Mixture(mix) => mixture_probs(mix, counts, index, opts, pem),
    }
}

/// Renormalize the rows of an outcome-probability matrix and return its
/// log. Negative entries and zero-sum rows are fatal.
fn log_table(p: &Array2<f64>, renormalized: &mut bool) -> Result<Array2<f64>> {
    let mut logp = Array2::zeros(p.dim());
    for (i, row) in p.rows().into_iter().enumerate() {
        let mut sum = 0.0;
        for &v in row.iter() {
            if v < 0.0 || v.is_nan() {
                return Err(HmmError::InvalidParameter(format!(
                    "outcome probabilities of state {i} contain a negative or NaN entry"
                )));
            }
            sum += v;
        }
        if sum <= 0.0 {
            return Err(HmmError::InvalidParameter(format!(
                "outcome probabilities of state {i} sum to zero"
            )));
        }
        if (sum - 1.0).abs() > f64::EPSILON {
            *renormalized = true;
        }
        for (j, &v) in row.iter().enumerate() {
            logp[[i, j]] = (v / sum).ln();
        }
    }
    Ok(logp)
}

/// State-independent combinatorial constant of a count row.
fn constant_term(a: f64, row: &[i32]) -> f64 {
    let mut c_term = -ln_gamma(a);
    let mut sum = a;
    for &y in row {
        sum += y as f64;
        c_term -= ln_gamma(y as f64 + 1.0);
    }
    c_term + ln_gamma(sum)
}

fn copy_canonical_row(pem: &mut Array2<f64>, from: usize, to: usize) {
    let src: Vec<f64> = pem.row(from).to_vec();
    for (j, v) in src.into_iter().enumerate() {
        pem[[to, j]] = v;
    }
}

fn fill_nan_row(pem: &mut Array2<f64>, k: usize) {
    for v in pem.row_mut(k).iter_mut() {
        *v = f64::NAN;
    }
}

/// Convert one log-space row to linear space unless every state
/// underflows (`Lin` converts regardless).
fn convert_row(pem: &mut Array2<f64>, k: usize, mode: OutputMode) {
    if mode == OutputMode::Log {
        return;
    }
    let m = pem.ncols();
    let mut lin = vec![0.0; m];
    let mut sum = 0.0;
    for i in 0..m {
        lin[i] = pem[[k, i]].exp();
        sum += lin[i];
    }
    if sum > 0.0 || mode == OutputMode::Lin {
        for i in 0..m {
            pem[[k, i]] = lin[i];
        }
    }
}

fn zinm_probs(
    model: &ZinmEmission,
    counts: &CountMatrix,
    index: &RowIndex,
    opts: EmissionOptions,
    pem: &mut Array2<f64>,
) -> Result<EmissionReport> {
    if opts.mode == OutputMode::Ratio {
        return Err(HmmError::InvalidParameter(
            "ratio output is only defined for the mixture model".to_string(),
        ));
    }
    if !(model.a > 0.0) {
        return Err(HmmError::InvalidParameter(format!(
            "dispersion must be positive, got {}",
            model.a
        )));
    }
    if !(0.0..=1.0).contains(&model.pi) {
        return Err(HmmError::InvalidParameter(format!(
            "zero-inflation weight must be in [0, 1], got {}",
            model.pi
        )));
    }

    let n = counts.n_rows();
    let r = counts.n_tracks();
    let m = model.n_states();
    if model.p.ncols() != r + 1 {
        return Err(HmmError::DimensionMismatch {
            expected: r + 1,
            actual: model.p.ncols(),
        });
    }

    let mut report = EmissionReport::default();
    let logp = log_table(&model.p, &mut report.renormalized)?;
    let a = model.a;
    let pi = model.pi;

    for k in 0..n {
        // Duplicate observations reuse the canonical row.
        if index.canonical(k) < k {
            copy_canonical_row(pem, index.canonical(k), k);
            continue;
        }

        let y = counts.row(k);
        if counts.row_is_missing(k) {
            fill_nan_row(pem, k);
            continue;
        }

        if counts.row_is_zero(k) {
            // Zero-inflated branch.
            for i in 0..m {
                pem[[k, i]] = (pi * (a * logp[[i, 0]]).exp() + (1.0 - pi)).ln();
            }
        } else {
            for i in 0..m {
                let mut value = a * logp[[i, 0]];
                for (j, &count) in y.iter().enumerate() {
                    value += count as f64 * logp[[i, j + 1]];
                }
                pem[[k, i]] = value;
            }
        }

        if opts.with_constants {
            let c_term = constant_term(a, y);
            for i in 0..m {
                pem[[k, i]] += c_term;
            }
        }

        convert_row(pem, k, opts.mode);
    }

    Ok(report)
}

fn mixture_probs(
    model: &MixtureEmission,
    counts: &CountMatrix,
    index: &RowIndex,
    opts: EmissionOptions,
    pem: &mut Array2<f64>,
) -> Result<EmissionReport> {
    if !(model.a > 0.0) {
        return Err(HmmError::InvalidParameter(format!(
            "dispersion must be positive, got {}",
            model.a
        )));
    }
    if !(0.0..=1.0).contains(&model.theta) {
        return Err(HmmError::InvalidParameter(format!(
            "mixture weight must be in [0, 1], got {}",
            model.theta
        )));
    }

    let n = counts.n_rows();
    let r = counts.n_tracks();
    let m = model.n_states();
    if model.p.ncols() != r + 1 || model.q.ncols() != r + 1 {
        return Err(HmmError::DimensionMismatch {
            expected: r + 1,
            actual: model.p.ncols().min(model.q.ncols()),
        });
    }

    let mut report = EmissionReport::default();
    let logp = log_table(&model.p, &mut report.renormalized)?;
    let logq = log_table(&model.q, &mut report.renormalized)?;
    let a = model.a;
    let log_theta = model.theta.ln();
    let log_one_minus_theta = (1.0 - model.theta).ln();

    for k in 0..n {
        if index.canonical(k) < k {
            copy_canonical_row(pem, index.canonical(k), k);
            continue;
        }

        let y = counts.row(k);
        if counts.row_is_missing(k) {
            fill_nan_row(pem, k);
            continue;
        }

        for i in 0..m {
            let mut p_term = log_theta + a * logp[[i, 0]];
            let mut q_term = log_one_minus_theta + a * logq[[i, 0]];
            for (j, &count) in y.iter().enumerate() {
                p_term += count as f64 * logp[[i, j + 1]];
                q_term += count as f64 * logq[[i, j + 1]];
            }

            pem[[k, i]] = match opts.mode {
                OutputMode::Lin => p_term.exp() + q_term.exp(),
                OutputMode::Ratio => 1.0 / (1.0 + (q_term - p_term).exp()),
                OutputMode::Log | OutputMode::LinPreferred => {
                    // log-sum-exp of the two components.
                    let big = p_term.max(q_term);
                    let small = p_term.min(q_term);
                    big + (1.0 + (small - big).exp()).ln()
                }
            };
        }

        if opts.with_constants {
            let c_term = constant_term(a, y);
            for i in 0..m {
                pem[[k, i]] += c_term;
            }
        }

        if opts.mode == OutputMode::LinPreferred {
            convert_row(pem, k, opts.mode);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn two_state_model() -> ZinmEmission {
        ZinmEmission {
            a: 2.0,
            pi: 0.5,
            p: arr2(&[[0.5, 0.3, 0.2], [0.2, 0.5, 0.3]]),
        }
    }

    fn counts_a() -> CountMatrix {
        CountMatrix::new(vec![10, 0, 10, 0, 0, 0, 0, 5], 2, vec![4]).unwrap()
    }

    fn eval(
        model: &ZinmEmission,
        counts: &CountMatrix,
        opts: EmissionOptions,
    ) -> (Array2<f64>, EmissionReport) {
        let index = RowIndex::build(counts);
        let mut pem = Array2::zeros((counts.n_rows(), model.n_states()));
        let report = emission_probs(
            &EmissionModel::ZeroInflated(model.clone()),
            counts,
            &index,
            opts,
            &mut pem,
        )
        .unwrap();
        (pem, report)
    }

    #[test]
    fn test_duplicate_rows_copied_bitwise() {
        let model = two_state_model();
        let (pem, _) = eval(&model, &counts_a(), EmissionOptions::default());
        assert_eq!(pem[[1, 0]].to_bits(), pem[[0, 0]].to_bits());
        assert_eq!(pem[[1, 1]].to_bits(), pem[[0, 1]].to_bits());
    }

    #[test]
    fn test_zero_row_uses_zero_inflation() {
        let model = two_state_model();
        let opts = EmissionOptions {
            mode: OutputMode::Log,
            with_constants: false,
        };
        let (pem, _) = eval(&model, &counts_a(), opts);
        for i in 0..2 {
            let p0 = model.p[[i, 0]];
            let expected = (0.5 * p0.powf(2.0) + 0.5).ln();
            assert!((pem[[2, i]] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_nonzero_row_log_value() {
        let model = two_state_model();
        let opts = EmissionOptions {
            mode: OutputMode::Log,
            with_constants: false,
        };
        let (pem, _) = eval(&model, &counts_a(), opts);
        // Row 0 is [10, 0]: a*ln(p0) + 10*ln(p1).
        let expected = 2.0 * 0.5f64.ln() + 10.0 * 0.3f64.ln();
        assert!((pem[[0, 0]] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_missing_row_is_nan() {
        let model = two_state_model();
        let counts =
            CountMatrix::new(vec![10, 0, -1, 0, 0, 0, 0, 5], 2, vec![4]).unwrap();
        let (pem, _) = eval(&model, &counts, EmissionOptions::default());
        assert!(pem[[1, 0]].is_nan());
        assert!(pem[[1, 1]].is_nan());
    }

    #[test]
    fn test_lin_matches_exp_of_log() {
        let model = two_state_model();
        let log_opts = EmissionOptions {
            mode: OutputMode::Log,
            with_constants: false,
        };
        let lin_opts = EmissionOptions {
            mode: OutputMode::LinPreferred,
            with_constants: false,
        };
        let (log_pem, _) = eval(&model, &counts_a(), log_opts);
        let (lin_pem, _) = eval(&model, &counts_a(), lin_opts);
        for k in 0..4 {
            for i in 0..2 {
                assert!((lin_pem[[k, i]] - log_pem[[k, i]].exp()).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_underflow_falls_back_to_log() {
        let model = two_state_model();
        // Large counts underflow every state in linear space.
        let counts = CountMatrix::new(vec![5000, 5000], 2, vec![1]).unwrap();
        let (pem, _) = eval(&model, &counts, EmissionOptions::default());
        assert!(pem[[0, 0]] < 0.0);
        assert!(pem[[0, 0]].is_finite());
    }

    #[test]
    fn test_renormalization_reported_and_equivalent() {
        let normalized = two_state_model();
        let scaled = ZinmEmission {
            a: 2.0,
            pi: 0.5,
            p: arr2(&[[0.75, 0.45, 0.3], [0.3, 0.75, 0.45]]),
        };
        let opts = EmissionOptions {
            mode: OutputMode::Log,
            with_constants: false,
        };
        let (pem_n, report_n) = eval(&normalized, &counts_a(), opts);
        let (pem_s, report_s) = eval(&scaled, &counts_a(), opts);
        assert!(!report_n.renormalized);
        assert!(report_s.renormalized);
        for k in 0..4 {
            for i in 0..2 {
                assert!((pem_n[[k, i]] - pem_s[[k, i]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_constant_term_value() {
        let model = two_state_model();
        let opts_plain = EmissionOptions {
            mode: OutputMode::Log,
            with_constants: false,
        };
        let opts_const = EmissionOptions {
            mode: OutputMode::Log,
            with_constants: true,
        };
        let (plain, _) = eval(&model, &counts_a(), opts_plain);
        let (with_const, _) = eval(&model, &counts_a(), opts_const);
        // Row 3 is [0, 5]: -lgamma(2) + lgamma(7) - lgamma(1) - lgamma(6).
        let expected = -ln_gamma(2.0) + ln_gamma(7.0) - ln_gamma(1.0) - ln_gamma(6.0);
        assert!((with_const[[3, 0]] - plain[[3, 0]] - expected).abs() < 1e-10);
        // Same shift for every state.
        assert!(
            ((with_const[[3, 1]] - plain[[3, 1]]) - (with_const[[3, 0]] - plain[[3, 0]]))
                .abs()
                < 1e-12
        );
    }

    #[test]
    fn test_negative_probability_rejected() {
        let model = ZinmEmission {
            a: 2.0,
            pi: 0.5,
            p: arr2(&[[0.5, -0.3, 0.8], [0.2, 0.5, 0.3]]),
        };
        let counts = counts_a();
        let index = RowIndex::build(&counts);
        let mut pem = Array2::zeros((4, 2));
        let err = emission_probs(
            &EmissionModel::ZeroInflated(model),
            &counts,
            &index,
            EmissionOptions::default(),
            &mut pem,
        );
        assert!(matches!(err, Err(HmmError::InvalidParameter(_))));
    }

    #[test]
    fn test_ratio_rejected_for_zinm() {
        let model = two_state_model();
        let counts = counts_a();
        let index = RowIndex::build(&counts);
        let mut pem = Array2::zeros((4, 2));
        let err = emission_probs(
            &EmissionModel::ZeroInflated(model),
            &counts,
            &index,
            EmissionOptions {
                mode: OutputMode::Ratio,
                with_constants: false,
            },
            &mut pem,
        );
        assert!(matches!(err, Err(HmmError::InvalidParameter(_))));
    }

    #[test]
    fn test_mixture_ratio_in_unit_interval() {
        let model = MixtureEmission {
            a: 2.0,
            theta: 0.3,
            p: arr2(&[[0.5, 0.3, 0.2], [0.2, 0.5, 0.3]]),
            q: arr2(&[[0.4, 0.4, 0.2], [0.3, 0.3, 0.4]]),
        };
        let counts = counts_a();
        let index = RowIndex::build(&counts);
        let mut pem = Array2::zeros((4, 2));
        emission_probs(
            &EmissionModel::Mixture(model),
            &counts,
            &index,
            EmissionOptions {
                mode: OutputMode::Ratio,
                with_constants: false,
            },
            &mut pem,
        )
        .unwrap();
        for k in 0..4 {
            for i in 0..2 {
                assert!(pem[[k, i]] >= 0.0 && pem[[k, i]] <= 1.0);
            }
        }
    }

    #[test]
    fn test_mixture_log_is_logsumexp() {
        let model = MixtureEmission {
            a: 2.0,
            theta: 0.3,
            p: arr2(&[[0.5, 0.3, 0.2]]),
            q: arr2(&[[0.4, 0.4, 0.2]]),
        };
        let counts = CountMatrix::new(vec![3, 1], 2, vec![1]).unwrap();
        let index = RowIndex::build(&counts);
        let mut pem = Array2::zeros((1, 1));
        emission_probs(
            &EmissionModel::Mixture(model),
            &counts,
            &index,
            EmissionOptions {
                mode: OutputMode::Log,
                with_constants: false,
            },
            &mut pem,
        )
        .unwrap();
        let p_term = 0.3f64.ln() + 2.0 * 0.5f64.ln() + 3.0 * 0.3f64.ln() + 0.2f64.ln();
        let q_term = 0.7f64.ln() + 2.0 * 0.4f64.ln() + 3.0 * 0.4f64.ln() + 0.2f64.ln();
        let expected = (p_term.exp() + q_term.exp()).ln();
        assert!((pem[[0, 0]] - expected).abs() < 1e-12);
    }
}
