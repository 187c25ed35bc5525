use ndarray::{Array2, ArrayView2, Axis};

/// Row-wise softmax, shifted by each row's max for stability.
pub(crate) fn softmax_rows(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 1e-10 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}

/// Scales every row to sum to one. Rows that sum to (almost) zero are left untouched.
pub(crate) fn normalize_rows(matrix: &mut Array2<f32>) {
    for mut row in matrix.axis_iter_mut(Axis(0)) {
        let sum = row.sum();
        if sum > 1e-10 {
            row.mapv_inplace(|v| v / sum);
        }
    }
}
