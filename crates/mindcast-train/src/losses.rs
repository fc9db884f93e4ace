//! Contrastive and reconstruction losses.
//!
//! The contrastive term is bidirectional in both phases: during mixup a soft
//! NCE whose label matrix spreads probability between each row's own target
//! and its permutation partner (weighted by the interpolation coefficient),
//! afterwards a soft CLIP loss whose labels come from the target-target
//! similarity structure. Inputs are expected row-normalized.

use anyhow::{ensure, Result};
use burn::prelude::*;
use burn::tensor::activation::{log_softmax, softmax};
use mindcast_data::MixupState;

/// Log-softmax over rows with the row maximum subtracted first; the
/// temperatures here push logits far past `exp`'s f32 range.
fn stable_log_softmax<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 2> {
    let row_max = logits.clone().max_dim(1).detach();
    log_softmax(logits - row_max, 1)
}

fn stable_softmax<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 2> {
    let row_max = logits.clone().max_dim(1).detach();
    softmax(logits - row_max, 1)
}

/// Bidirectional NCE with optional mixup-aware soft labels.
///
/// `preds` and `targs` are `[n, d]`, L2-normalized rows. With a
/// [`MixupState`] each row `i` credits its own column with `betas[i]` and its
/// permutation partner's column with `1 - betas[i]`; without one the labels
/// are the diagonal.
pub fn mixco_nce<B: Backend>(
    preds: Tensor<B, 2>,
    targs: Tensor<B, 2>,
    temp: f32,
    state: Option<&MixupState>,
) -> Tensor<B, 1> {
    let [n, _] = preds.dims();
    let device = preds.device();
    let logits = preds.matmul(targs.transpose()) / temp;

    let mut probs = vec![0.0f32; n * n];
    match state {
        Some(state) => {
            debug_assert_eq!(state.len(), n);
            for i in 0..n {
                probs[i * n + i] = state.betas[i];
                probs[i * n + state.perm[i]] = 1.0 - state.betas[i];
            }
        }
        None => {
            for i in 0..n {
                probs[i * n + i] = 1.0;
            }
        }
    }
    let probs = Tensor::<B, 1>::from_data(probs.as_slice(), &device).reshape([n, n]);

    let fwd = (stable_log_softmax(logits.clone()) * probs.clone())
        .sum_dim(1)
        .mean()
        .neg();
    let bwd = (stable_log_softmax(logits.transpose()) * probs.transpose())
        .sum_dim(1)
        .mean()
        .neg();
    (fwd + bwd) / 2.0
}

/// Soft CLIP loss: cross entropy of prediction-target similarities against
/// the softened target-target similarity structure, both directions.
pub fn soft_clip_loss<B: Backend>(
    preds: Tensor<B, 2>,
    targs: Tensor<B, 2>,
    temp: f32,
) -> Tensor<B, 1> {
    let clip_clip = targs.clone().matmul(targs.clone().transpose()) / temp;
    let brain_clip = preds.matmul(targs.transpose()) / temp;
    let soft_labels = stable_softmax(clip_clip);

    let fwd = (stable_log_softmax(brain_clip.clone()) * soft_labels.clone())
        .sum_dim(1)
        .mean()
        .neg();
    // clip_clip is symmetric, so the same soft labels serve both directions
    let bwd = (stable_log_softmax(brain_clip.transpose()) * soft_labels)
        .sum_dim(1)
        .mean()
        .neg();
    (fwd + bwd) / 2.0
}

/// Mean absolute error.
pub fn l1_loss<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    (pred - target).abs().mean()
}

/// Interpolate latent targets with the batch's mixup state:
/// `target * beta + target[perm] * (1 - beta)` per row.
pub fn mixup_targets<B: Backend>(target: Tensor<B, 2>, state: &MixupState) -> Tensor<B, 2> {
    let device = target.device();
    let shuffled = target.clone().select(0, state.perm_tensor(&device));
    let betas = state.betas_column(&device);
    target * betas.clone() + shuffled * (betas.neg() + 1.0)
}

/// Extract the scalar loss, failing hard on a non-finite value.
///
/// A NaN or infinite total loss would corrupt the optimizer state, so it
/// aborts the run instead of being retried.
pub fn check_finite<B: Backend>(loss: &Tensor<B, 1>, context: &str) -> Result<f32> {
    let value: f32 = loss
        .clone()
        .into_data()
        .to_vec()
        .expect("loss to scalar")[0];
    ensure!(
        value.is_finite(),
        "non-finite {} loss ({}); aborting before the optimizer state is corrupted",
        context,
        value
    );
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindcast_core::metrics::l2_normalize_rows;
    use mindcast_core::NdBackend;

    fn device() -> <NdBackend as Backend>::Device {
        Default::default()
    }

    fn normalized(rows: &[f32], n: usize, d: usize) -> Tensor<NdBackend, 2> {
        let t = Tensor::<NdBackend, 1>::from_data(rows, &device()).reshape([n, d]);
        l2_normalize_rows(t)
    }

    #[test]
    fn test_nce_prefers_aligned_predictions() {
        let targs = normalized(&[1.0, 0.0, 0.0, 1.0], 2, 2);
        let aligned = mixco_nce(targs.clone(), targs.clone(), 0.1, None);
        let crossed = normalized(&[0.0, 1.0, 1.0, 0.0], 2, 2);
        let misaligned = mixco_nce(crossed, targs, 0.1, None);

        let a: f32 = aligned.into_data().to_vec::<f32>().unwrap()[0];
        let m: f32 = misaligned.into_data().to_vec::<f32>().unwrap()[0];
        assert!(a < m, "aligned loss {a} should beat misaligned {m}");
    }

    #[test]
    fn test_nce_mixup_labels_shift_optimum() {
        let targs = normalized(&[1.0, 0.0, 0.0, 1.0], 2, 2);
        // full swap: each row entirely credits its partner
        let state = MixupState {
            perm: vec![1, 0],
            betas: vec![0.0, 0.0],
            select: vec![true, true],
        };
        let crossed = normalized(&[0.0, 1.0, 1.0, 0.0], 2, 2);
        let crossed_loss = mixco_nce(crossed, targs.clone(), 0.1, Some(&state));
        let aligned_loss = mixco_nce(targs.clone(), targs, 0.1, Some(&state));

        let c: f32 = crossed_loss.into_data().to_vec::<f32>().unwrap()[0];
        let a: f32 = aligned_loss.into_data().to_vec::<f32>().unwrap()[0];
        assert!(c < a, "swapped labels should reward swapped predictions");
    }

    #[test]
    fn test_soft_clip_loss_finite_and_ordered() {
        let targs = normalized(&[1.0, 0.0, 0.0, 1.0, 0.7, 0.7], 3, 2);
        let aligned = soft_clip_loss(targs.clone(), targs.clone(), 0.125);
        let preds = normalized(&[0.0, 1.0, 1.0, 0.0, 0.7, -0.7], 3, 2);
        let misaligned = soft_clip_loss(preds, targs, 0.125);

        let a: f32 = aligned.into_data().to_vec::<f32>().unwrap()[0];
        let m: f32 = misaligned.into_data().to_vec::<f32>().unwrap()[0];
        assert!(a.is_finite() && m.is_finite());
        assert!(a < m);
    }

    #[test]
    fn test_l1_loss() {
        let d = device();
        let a = Tensor::<NdBackend, 2>::ones([2, 3], &d);
        let b = Tensor::<NdBackend, 2>::zeros([2, 3], &d);
        let loss: f32 = l1_loss(a, b).into_data().to_vec::<f32>().unwrap()[0];
        assert!((loss - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mixup_targets_interpolates() {
        let d = device();
        let target = Tensor::<NdBackend, 1>::from_data([0.0f32, 0.0, 1.0, 1.0].as_slice(), &d)
            .reshape([2usize, 2usize]);
        let state = MixupState {
            perm: vec![1, 0],
            betas: vec![0.25, 1.0],
            select: vec![true, false],
        };
        let mixed = mixup_targets(target, &state);
        let vals: Vec<f32> = mixed.into_data().to_vec().unwrap();
        // row 0: 0.25 * [0,0] + 0.75 * [1,1]; row 1 untouched (beta = 1)
        assert!((vals[0] - 0.75).abs() < 1e-6);
        assert!((vals[1] - 0.75).abs() < 1e-6);
        assert!((vals[2] - 1.0).abs() < 1e-6);
        assert!((vals[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_check_finite_accepts_and_rejects() {
        let d = device();
        let ok = Tensor::<NdBackend, 1>::from_data([0.5f32].as_slice(), &d);
        assert_eq!(check_finite(&ok, "train").unwrap(), 0.5);

        let bad = Tensor::<NdBackend, 1>::from_data([f32::NAN].as_slice(), &d);
        assert!(check_finite(&bad, "train").is_err());
    }
}
