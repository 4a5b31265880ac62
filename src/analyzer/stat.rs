//! Weighted quantiles and weighted Pearson correlation.
//!
//! Weights here are the fraction of the sampling interval each
//! observation stood for; both primitives accept `None` to mean equal
//! weighting.

/// How a quantile treats the space between measured values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantileKind {
    /// Only measured values are returned.
    Empirical,
    /// Linear interpolation between the straddling neighbors.
    LinInterp,
}

/// Quantile of a sorted series at probability `p` in `[0, 1]`.
///
/// Scans cumulative weight against `p * Σw`. For `LinInterp`, the result
/// interpolates between the straddling values with
/// `t = (cum − p·Σw) / w[i]`. Returns NaN for an empty series.
pub fn quantile(p: f64, kind: QuantileKind, xs: &[f64], ws: Option<&[f64]>) -> f64 {
    debug_assert!((0.0..=1.0).contains(&p));
    debug_assert!(xs.windows(2).all(|w| w[0] <= w[1]), "series must be sorted");
    debug_assert!(ws.map_or(true, |w| w.len() == xs.len()));

    if xs.is_empty() {
        return f64::NAN;
    }

    let sum_w = match ws {
        Some(w) => w.iter().sum::<f64>(),
        None => xs.len() as f64,
    };
    let target = p * sum_w;

    let mut cum = 0.0;
    for (i, &x) in xs.iter().enumerate() {
        let w = ws.map_or(1.0, |w| w[i]);
        cum += w;
        if cum >= target {
            return match kind {
                QuantileKind::Empirical => x,
                QuantileKind::LinInterp => {
                    if i == 0 {
                        x
                    } else {
                        let mut t = cum - target;
                        if w != 0.0 {
                            t /= w;
                        }
                        t = t.clamp(0.0, 1.0);
                        t * xs[i - 1] + (1.0 - t) * x
                    }
                }
            };
        }
    }

    // Reachable only through floating-point shortfall in the cumulative
    // sum; the largest value is the right answer there.
    xs[xs.len() - 1]
}

/// Weighted Pearson correlation of `xs` against `ys`.
///
/// Returns NaN when either series has zero weighted variance; the caller
/// maps that to its sentinel.
pub fn correlation(xs: &[f64], ys: &[f64], ws: Option<&[f64]>) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    debug_assert!(ws.map_or(true, |w| w.len() == xs.len()));

    if xs.is_empty() {
        return f64::NAN;
    }

    let weight = |i: usize| ws.map_or(1.0, |w| w[i]);

    let mut sum_w = 0.0;
    let mut mean_x = 0.0;
    let mut mean_y = 0.0;
    for i in 0..xs.len() {
        let w = weight(i);
        sum_w += w;
        mean_x += w * xs[i];
        mean_y += w * ys[i];
    }
    mean_x /= sum_w;
    mean_y /= sum_w;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..xs.len() {
        let w = weight(i);
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += w * dx * dy;
        var_x += w * dx * dx;
        var_y += w * dy * dy;
    }

    cov / (var_x.sqrt() * var_y.sqrt())
}

/// Sorts values ascending, carrying their weights along so pairs stay
/// matched for weighted quantiles.
pub fn sort_with_weights(values: &mut [f64], weights: &mut [f64]) {
    debug_assert_eq!(values.len(), weights.len());

    let mut pairs: Vec<(f64, f64)> = values
        .iter()
        .copied()
        .zip(weights.iter().copied())
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    for (i, (v, w)) in pairs.into_iter().enumerate() {
        values[i] = v;
        weights[i] = w;
    }
}
