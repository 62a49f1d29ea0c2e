//! Small numeric helpers shared by recalibration and the orchestrator.

/// Indices that sort `values` ascending.
pub fn argsort(values: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(std::cmp::Ordering::Equal));
    idx
}

/// Trimmed mean over the central half of the values. Robust against a few
/// outlier samples dominating the aggregated error statistics. Falls back to
/// the plain mean for fewer than four values.
pub fn robust_average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() < 4 {
        return values.iter().sum::<f64>() / values.len() as f64;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let lo = sorted.len() / 4;
    let hi = sorted.len() - lo;
    let central = &sorted[lo..hi];
    central.iter().sum::<f64>() / central.len() as f64
}

/// Sort `(x, y)` pairs by x and collapse duplicate x values by averaging
/// their y values. Local-regression fitting requires strictly increasing x.
pub fn dedupe_monotonic(xs: &[f64], ys: &[f64]) -> (Vec<f64>, Vec<f64>) {
    debug_assert_eq!(xs.len(), ys.len());
    let order = argsort(xs);
    let mut out_x: Vec<f64> = Vec::with_capacity(xs.len());
    let mut out_y: Vec<f64> = Vec::with_capacity(ys.len());
    let mut i = 0;
    while i < order.len() {
        let x = xs[order[i]];
        let mut y = ys[order[i]];
        let mut count = 1usize;
        while i + 1 < order.len() && xs[order[i + 1]] == x {
            i += 1;
            y += ys[order[i]];
            count += 1;
        }
        out_x.push(x);
        out_y.push(y / count as f64);
        i += 1;
    }
    (out_x, out_y)
}

/// Median of a mutable slice. Empty input yields 0.
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argsort_orders_indices() {
        let v = vec![3.0, 1.0, 2.0];
        assert_eq!(argsort(&v), vec![1, 2, 0]);
    }

    #[test]
    fn robust_average_trims_outliers() {
        let v = vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 100.0, -100.0];
        let avg = robust_average(&v);
        assert!((avg - 1.0).abs() < 1e-9, "got {avg}");
    }

    #[test]
    fn dedupe_averages_equal_x() {
        let xs = vec![2.0, 1.0, 2.0];
        let ys = vec![4.0, 1.0, 6.0];
        let (x, y) = dedupe_monotonic(&xs, &ys);
        assert_eq!(x, vec![1.0, 2.0]);
        assert_eq!(y, vec![1.0, 5.0]);
    }

    #[test]
    fn median_of_even_and_odd() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&mut []), 0.0);
    }
}
