//! Retrieval and reconstruction metric primitives.
//!
//! These are the side metrics tracked during training: batchwise retrieval
//! accuracy between predicted and target embeddings, row-wise cosine
//! similarity, and pixel correlation for blurry reconstructions. None of them
//! participate in the optimized loss.

use burn::prelude::*;

/// L2-normalize each row of a 2D tensor.
pub fn l2_normalize_rows<B: Backend>(t: Tensor<B, 2>) -> Tensor<B, 2> {
    let norms = t.clone().powf_scalar(2.0).sum_dim(1).sqrt() + 1e-8;
    t / norms
}

/// Pairwise cosine similarity between two batches of embeddings.
///
/// Rows are normalized internally; the result is `[n, n]` with entry `(i, j)`
/// the similarity between `preds[i]` and `targs[j]`.
pub fn batchwise_cosine_similarity<B: Backend>(
    preds: Tensor<B, 2>,
    targs: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let preds = l2_normalize_rows(preds);
    let targs = l2_normalize_rows(targs);
    preds.matmul(targs.transpose())
}

/// Top-k retrieval accuracy with diagonal labels.
///
/// Row `i` of `similarities` scores sample `i` against every candidate; the
/// correct candidate is index `i`. Returns the fraction of rows whose top-k
/// entries include the correct one.
pub fn topk_accuracy<B: Backend>(similarities: Tensor<B, 2>, k: usize) -> f32 {
    let [n, m] = similarities.dims();
    if n == 0 {
        return 0.0;
    }
    let k = k.min(m);
    let data: Vec<f32> = similarities
        .into_data()
        .to_vec()
        .expect("similarities to vec");

    let mut correct = 0usize;
    for i in 0..n {
        let row = &data[i * m..(i + 1) * m];
        let own = row[i];
        // rank = number of candidates scoring strictly higher than the label
        let rank = row.iter().filter(|&&s| s > own).count();
        if rank < k {
            correct += 1;
        }
    }
    correct as f32 / n as f32
}

/// Mean row-wise cosine similarity between two batches of embeddings.
pub fn mean_cosine_similarity<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> f32 {
    let a = l2_normalize_rows(a);
    let b = l2_normalize_rows(b);
    let sims = (a * b).sum_dim(1);
    let sims: Vec<f32> = sims.into_data().to_vec().expect("cosine sims to vec");
    if sims.is_empty() {
        return 0.0;
    }
    sims.iter().sum::<f32>() / sims.len() as f32
}

/// Mean per-sample Pearson correlation between two image batches `[n, c, h, w]`.
///
/// Each sample is flattened before the correlation is taken; samples with
/// zero variance on either side contribute 0.
pub fn pixcorr<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>) -> f32 {
    let [n, c, h, w] = a.dims();
    assert_eq!(
        [n, c, h, w],
        b.dims(),
        "pixcorr expects identically shaped image batches"
    );
    if n == 0 {
        return 0.0;
    }
    let len = c * h * w;
    let a: Vec<f32> = a.into_data().to_vec().expect("images to vec");
    let b: Vec<f32> = b.into_data().to_vec().expect("images to vec");

    let mut total = 0.0f64;
    for i in 0..n {
        let xs = &a[i * len..(i + 1) * len];
        let ys = &b[i * len..(i + 1) * len];
        total += pearson(xs, ys);
    }
    (total / n as f64) as f32
}

fn pearson(xs: &[f32], ys: &[f32]) -> f64 {
    let n = xs.len() as f64;
    let mean_x = xs.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_y = ys.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        let dx = x as f64 - mean_x;
        let dy = y as f64 - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}
