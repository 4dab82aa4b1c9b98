//! HMM inference: forward, reverse-kernel backward, Viterbi
//!
//! The forward pass accepts emission rows in linear or log space,
//! discriminated by the sign of the first slot; the evaluator guarantees
//! all slots of a row share a representation. Missing emissions (NaN
//! rows) contribute only their transitions. The backward pass smooths
//! with the reverse kernel `P(X_k | X_{k+1}, Y)`, which yields the state
//! posteriors and the expected transition counts in one scan without a
//! beta recursion.

use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewMut2};

use crate::error::{HmmError, Result};

/// Forward algorithm over one block.
///
/// `prob` is the `n_b x m` emission matrix; it is overwritten with the
/// normalized alphas (or with the transition-only prediction at missing
/// or mass-collapsed steps). Returns the block log-likelihood.
pub fn forward(q: &Array2<f64>, init: &Array1<f64>, mut prob: ArrayViewMut2<f64>) -> f64 {
    let n = prob.nrows();
    let m = prob.ncols();
    let mut alpha = vec![0.0; m];
    let mut tmp = vec![0.0; m];
    let mut loglik = 0.0;

    for k in 0..n {
        if k == 0 {
            for j in 0..m {
                tmp[j] = init[j];
            }
        } else {
            for j in 0..m {
                tmp[j] = 0.0;
                for i in 0..m {
                    tmp[j] += alpha[i] * q[[i, j]];
                }
            }
        }

        // Missing emissions: keep the prediction, contribute nothing.
        if (0..m).any(|j| prob[[k, j]].is_nan()) {
            alpha.copy_from_slice(&tmp);
            for j in 0..m {
                prob[[k, j]] = tmp[j];
            }
            continue;
        }

        let mut c = 0.0;
        if prob[[k, 0]] < 0.0 {
            // Log-space row: factor out the maximum to avoid underflow.
            let mut w = 0;
            for j in 1..m {
                if prob[[k, j]] > prob[[k, w]] {
                    w = j;
                }
            }
            for j in 0..m {
                alpha[j] = tmp[j] * (prob[[k, j]] - prob[[k, w]]).exp();
                c += alpha[j];
            }
            loglik += prob[[k, w]];
        } else {
            for j in 0..m {
                alpha[j] = tmp[j] * prob[[k, j]];
                c += alpha[j];
            }
        }

        if !(c > 0.0) {
            // Total mass collapse (e.g. the only reachable states have
            // zero emission). Treat the step as missing.
            alpha.copy_from_slice(&tmp);
            for j in 0..m {
                prob[[k, j]] = tmp[j];
            }
        } else {
            for j in 0..m {
                alpha[j] /= c;
                prob[[k, j]] = alpha[j];
            }
            loglik += c.ln();
        }
    }

    loglik
}

/// Backward smoothing over one block with the reverse kernel.
///
/// `alpha` holds the normalized forward probabilities. Fills `phi` with
/// the state posteriors and `trans` with the summed conditional
/// transition probabilities of the block.
pub fn backward(
    q: &Array2<f64>,
    alpha: ArrayView2<f64>,
    mut phi: ArrayViewMut2<f64>,
    trans: &mut Array2<f64>,
) {
    let n = alpha.nrows();
    let m = alpha.ncols();

    trans.fill(0.0);
    phi.fill(0.0);
    for j in 0..m {
        phi[[n - 1, j]] = alpha[[n - 1, j]];
    }

    // rker[[j, i]] = P(X_k = i | X_{k+1} = j, Y) = alpha_k(i) Q(i,j),
    // normalized over i.
    let mut rker = Array2::zeros((m, m));
    for k in (0..n.saturating_sub(1)).rev() {
        for j in 0..m {
            let mut x = 0.0;
            for i in 0..m {
                rker[[j, i]] = alpha[[k, i]] * q[[i, j]];
                x += rker[[j, i]];
            }
            if x > 0.0 {
                for i in 0..m {
                    rker[[j, i]] /= x;
                }
            } else {
                // No predecessor reaches state j; the kernel row is zero
                // and the corresponding posterior mass is dropped.
                for i in 0..m {
                    rker[[j, i]] = 0.0;
                }
            }
        }
        for j in 0..m {
            for i in 0..m {
                let x = phi[[k + 1, i]] * rker[[i, j]];
                phi[[k, j]] += x;
                trans[[j, i]] += x;
            }
        }
    }
}

/// Forward-backward over one block. Replaces `prob` with the alphas and
/// fills `phi` and `trans`; returns the block log-likelihood.
pub fn forward_backward(
    q: &Array2<f64>,
    init: &Array1<f64>,
    mut prob: ArrayViewMut2<f64>,
    phi: ArrayViewMut2<f64>,
    trans: &mut Array2<f64>,
) -> f64 {
    let loglik = forward(q, init, prob.view_mut());
    backward(q, prob.view(), phi, trans);
    loglik
}

/// Forward-backward over a fragmented profile.
///
/// Each block is an independent chain restarted from `init`, so splitting
/// a profile into blocks changes the result unless `init` matches the
/// stationary distribution of the chain. Returns the
/// summed expected transition counts and the total log-likelihood; `pem`
/// is replaced block by block with the normalized alphas and `phi` is
/// filled with the posteriors.
pub fn block_forward_backward(
    q: &Array2<f64>,
    init: &Array1<f64>,
    sizes: &[usize],
    pem: &mut Array2<f64>,
    phi: &mut Array2<f64>,
) -> Result<(Array2<f64>, f64)> {
    let n: usize = sizes.iter().sum();
    let m = q.nrows();
    if pem.nrows() != n || phi.nrows() != n {
        return Err(HmmError::DimensionMismatch {
            expected: n,
            actual: pem.nrows().min(phi.nrows()),
        });
    }

    let mut sum_trans = Array2::zeros((m, m));
    let mut trans = Array2::zeros((m, m));
    let mut loglik = 0.0;
    let mut offset = 0;

    for &size in sizes {
        let end = offset + size;
        loglik += forward_backward(
            q,
            init,
            pem.slice_mut(s![offset..end, ..]),
            phi.slice_mut(s![offset..end, ..]),
            &mut trans,
        );
        sum_trans += &trans;
        offset = end;
    }

    Ok((sum_trans, loglik))
}

/// Whether a row of log emissions carries no information: any NaN, or
/// every state at negative infinity.
fn is_undefined(row: &[f64]) -> bool {
    let mut n_inf = 0;
    for &v in row {
        if v.is_nan() {
            return true;
        }
        if v == f64::NEG_INFINITY {
            n_inf += 1;
        }
    }
    n_inf == row.len()
}

/// Log-space Viterbi over one block. `path` receives the decoded states.
fn viterbi_block(
    log_q: &Array2<f64>,
    log_init: &Array1<f64>,
    log_p: ArrayView2<f64>,
    path: &mut [usize],
) {
    let n = log_p.nrows();
    let m = log_p.ncols();
    if n == 0 {
        return;
    }

    let mut oldmax = vec![0.0f64; m];
    let mut newmax = vec![0.0f64; m];
    let mut argmax = Array2::<usize>::zeros((n, m));

    for j in 0..m {
        newmax[j] = log_init[j] + log_p[[0, j]];
    }
    for k in 1..n {
        std::mem::swap(&mut oldmax, &mut newmax);
        for j in 0..m {
            let mut thismax = oldmax[0] + log_q[[0, j]];
            argmax[[k, j]] = 0;
            for i in 1..m {
                let tmp = oldmax[i] + log_q[[i, j]];
                if tmp > thismax {
                    thismax = tmp;
                    argmax[[k, j]] = i;
                }
            }
            newmax[j] = thismax + log_p[[k, j]];
        }
    }

    // Final state: first maximum wins ties.
    let mut final_state = 0;
    for j in 1..m {
        if newmax[j] > newmax[final_state] {
            final_state = j;
        }
    }
    path[n - 1] = final_state;
    for k in (0..n - 1).rev() {
        path[k] = argmax[[k + 1, path[k + 1]]];
    }
}

/// Viterbi decoding of a fragmented profile.
///
/// Parameters and emissions may be passed in linear or log space
/// (`inputs_are_log`). Undefined emission rows are replaced by zeros so
/// the step contributes only its transitions; NaN in the transition
/// matrix or the initial distribution is a hard error.
pub fn block_viterbi(
    q: &Array2<f64>,
    init: &Array1<f64>,
    sizes: &[usize],
    prob: &Array2<f64>,
    inputs_are_log: bool,
) -> Result<Vec<usize>> {
    let n: usize = sizes.iter().sum();
    let m = q.nrows();
    if prob.nrows() != n || prob.ncols() != m || init.len() != m || q.ncols() != m {
        return Err(HmmError::DimensionMismatch {
            expected: n * m,
            actual: prob.nrows() * prob.ncols(),
        });
    }

    let (log_q, log_init, mut log_p) = if inputs_are_log {
        (q.clone(), init.clone(), prob.clone())
    } else {
        (
            q.mapv(f64::ln),
            init.mapv(f64::ln),
            prob.mapv(f64::ln),
        )
    };

    if log_q.iter().any(|v| v.is_nan()) {
        return Err(HmmError::InvalidParameter(
            "transition matrix contains NaN".to_string(),
        ));
    }
    if log_init.iter().any(|v| v.is_nan()) {
        return Err(HmmError::InvalidParameter(
            "initial distribution contains NaN".to_string(),
        ));
    }

    for k in 0..n {
        let undefined = {
            let row = log_p.row(k);
            is_undefined(row.as_slice().expect("standard layout row"))
        };
        if undefined {
            for j in 0..m {
                log_p[[k, j]] = 0.0;
            }
        }
    }

    let mut path = vec![0usize; n];
    let mut offset = 0;
    for &size in sizes {
        let end = offset + size;
        viterbi_block(
            &log_q,
            &log_init,
            log_p.slice(s![offset..end, ..]),
            &mut path[offset..end],
        );
        offset = end;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn test_chain() -> (Array2<f64>, Array1<f64>) {
        let q = arr2(&[[0.9, 0.1], [0.1, 0.9]]);
        let init = Array1::from_vec(vec![0.5, 0.5]);
        (q, init)
    }

    /// Linear emissions favoring state 0 early and state 1 late.
    fn test_emissions() -> Array2<f64> {
        arr2(&[
            [0.8, 0.1],
            [0.7, 0.2],
            [0.1, 0.9],
            [0.2, 0.8],
        ])
    }

    #[test]
    fn test_forward_loglik_finite_and_alphas_normalized() {
        let (q, init) = test_chain();
        let mut prob = test_emissions();
        let loglik = forward(&q, &init, prob.view_mut());
        assert!(loglik.is_finite());
        for k in 0..4 {
            let sum: f64 = prob.row(k).sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_forward_log_rows_match_linear_rows() {
        let (q, init) = test_chain();
        let mut lin = test_emissions();
        let mut log = test_emissions().mapv(f64::ln);
        let ll_lin = forward(&q, &init, lin.view_mut());
        let ll_log = forward(&q, &init, log.view_mut());
        assert!((ll_lin - ll_log).abs() < 1e-9);
        for k in 0..4 {
            for j in 0..2 {
                assert!((lin[[k, j]] - log[[k, j]]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_forward_skips_missing_step() {
        // Single state: alphas are trivial, so the log-likelihood is the
        // sum of the log emissions of the defined steps only.
        let q = arr2(&[[1.0]]);
        let init = Array1::from_vec(vec![1.0]);
        let mut prob = arr2(&[[0.5], [f64::NAN], [0.25]]);
        let loglik = forward(&q, &init, prob.view_mut());
        assert!((loglik - (0.5f64.ln() + 0.25f64.ln())).abs() < 1e-12);
        // The missing step was overwritten with the prediction.
        assert!((prob[[1, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_forward_mass_collapse_is_silent() {
        // Zero initial mass collapses every step; the pass must neither
        // produce NaN nor contribute to the log-likelihood.
        let (q, _) = test_chain();
        let init = Array1::from_vec(vec![0.0, 0.0]);
        let mut prob = test_emissions();
        let loglik = forward(&q, &init, prob.view_mut());
        assert_eq!(loglik, 0.0);
        assert!(prob.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_posteriors_sum_to_one() {
        let (q, init) = test_chain();
        let mut pem = test_emissions();
        let mut phi = Array2::zeros((4, 2));
        let (_, loglik) =
            block_forward_backward(&q, &init, &[4], &mut pem, &mut phi).unwrap();
        assert!(loglik.is_finite());
        for k in 0..4 {
            let sum: f64 = phi.row(k).sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_posterior_mode_tracks_dominant_emissions() {
        let (q, init) = test_chain();
        let mut pem = test_emissions();
        let mut phi = Array2::zeros((4, 2));
        block_forward_backward(&q, &init, &[4], &mut pem, &mut phi).unwrap();
        assert!(phi[[0, 0]] > phi[[0, 1]]);
        assert!(phi[[3, 1]] > phi[[3, 0]]);
    }

    #[test]
    fn test_block_split_preserves_loglik() {
        let (q, init) = test_chain();
        let six = arr2(&[
            [0.8, 0.1],
            [0.7, 0.2],
            [0.1, 0.9],
            [0.8, 0.1],
            [0.7, 0.2],
            [0.1, 0.9],
        ]);

        let mut pem_joint = six.clone();
        let mut phi_joint = Array2::zeros((6, 2));
        let (_, ll_joint) =
            block_forward_backward(&q, &init, &[3, 3], &mut pem_joint, &mut phi_joint)
                .unwrap();

        let mut ll_split = 0.0;
        for half in 0..2 {
            let mut pem = six.slice(s![half * 3..(half + 1) * 3, ..]).to_owned();
            let mut phi = Array2::zeros((3, 2));
            let (_, ll) =
                block_forward_backward(&q, &init, &[3], &mut pem, &mut phi).unwrap();
            ll_split += ll;
        }
        assert!((ll_joint - ll_split).abs() < 1e-9);
    }

    #[test]
    fn test_transition_counts_accumulate() {
        let (q, init) = test_chain();
        let mut pem = test_emissions();
        let mut phi = Array2::zeros((4, 2));
        let (trans, _) =
            block_forward_backward(&q, &init, &[4], &mut pem, &mut phi).unwrap();
        // One expected transition per adjacent pair.
        let total: f64 = trans.iter().sum();
        assert!((total - 3.0).abs() < 1e-9);
        assert!(trans.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_unreachable_state_drops_mass_without_nan() {
        // State 1 is unreachable from anywhere.
        let q = arr2(&[[1.0, 0.0], [1.0, 0.0]]);
        let init = Array1::from_vec(vec![1.0, 0.0]);
        let mut pem = test_emissions();
        let mut phi = Array2::zeros((4, 2));
        let (trans, _) =
            block_forward_backward(&q, &init, &[4], &mut pem, &mut phi).unwrap();
        assert!(phi.iter().all(|v| !v.is_nan()));
        assert!(trans.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_viterbi_decodes_dominant_states() {
        let (q, init) = test_chain();
        let prob = test_emissions();
        let path = block_viterbi(&q, &init, &[4], &prob, false).unwrap();
        assert_eq!(path, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_viterbi_log_and_linear_agree() {
        let (q, init) = test_chain();
        let prob = test_emissions();
        let lin_path = block_viterbi(&q, &init, &[4], &prob, false).unwrap();
        let log_path = block_viterbi(
            &q.mapv(f64::ln),
            &init.mapv(f64::ln),
            &[4],
            &prob.mapv(f64::ln),
            true,
        )
        .unwrap();
        assert_eq!(lin_path, log_path);
    }

    #[test]
    fn test_viterbi_no_improving_single_swap() {
        let (q, init) = test_chain();
        let prob = test_emissions();
        let path = block_viterbi(&q, &init, &[4], &prob, false).unwrap();

        let log_q = q.mapv(f64::ln);
        let log_init = init.mapv(f64::ln);
        let log_p = prob.mapv(f64::ln);
        let score = |p: &[usize]| -> f64 {
            let mut s = log_init[p[0]] + log_p[[0, p[0]]];
            for k in 1..p.len() {
                s += log_q[[p[k - 1], p[k]]] + log_p[[k, p[k]]];
            }
            s
        };
        let best = score(&path);
        for k in 0..4 {
            let mut other = path.clone();
            other[k] = 1 - other[k];
            assert!(score(&other) <= best + 1e-12);
        }
    }

    #[test]
    fn test_viterbi_undefined_rows_use_transitions_only() {
        let (q, init) = test_chain();
        let mut prob = test_emissions();
        prob[[2, 0]] = f64::NAN;
        prob[[2, 1]] = f64::NAN;
        let path = block_viterbi(&q, &init, &[4], &prob, false).unwrap();
        assert_eq!(path.len(), 4);
        // With the sticky chain, the undefined step follows its context.
        assert!(path[2] == path[1] || path[2] == path[3]);
    }

    #[test]
    fn test_viterbi_all_neg_inf_row_is_undefined() {
        let (q, init) = test_chain();
        let mut log_p = test_emissions().mapv(f64::ln);
        log_p[[1, 0]] = f64::NEG_INFINITY;
        log_p[[1, 1]] = f64::NEG_INFINITY;
        let path = block_viterbi(
            &q.mapv(f64::ln),
            &init.mapv(f64::ln),
            &[4],
            &log_p,
            true,
        )
        .unwrap();
        assert_eq!(path, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_viterbi_rejects_nan_parameters() {
        let (q, init) = test_chain();
        let mut bad_q = q.clone();
        bad_q[[0, 0]] = f64::NAN;
        let prob = test_emissions();
        assert!(block_viterbi(&bad_q, &init, &[4], &prob, false).is_err());

        let mut bad_init = init;
        bad_init[0] = f64::NAN;
        assert!(block_viterbi(&q, &bad_init, &[4], &prob, false).is_err());
    }

    #[test]
    fn test_viterbi_respects_block_boundaries() {
        // Emissions pin the end of block 1 to state 1; a fresh block
        // restarts from init, so the strong state-0 emission wins
        // immediately instead of paying the sticky transition.
        let (q, init) = test_chain();
        let prob = arr2(&[
            [0.1, 0.9],
            [0.1, 0.9],
            [0.9, 0.1],
            [0.9, 0.1],
        ]);
        let joint = block_viterbi(&q, &init, &[4], &prob, false).unwrap();
        let split = block_viterbi(&q, &init, &[2, 2], &prob, false).unwrap();
        assert_eq!(split, vec![1, 1, 0, 0]);
        assert_eq!(joint.len(), split.len());
    }
}
