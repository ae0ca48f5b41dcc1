//! Agreement between observed and predicted heights.

/// Linear fit `obs = intercept + slope * pred` plus error statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accuracy {
    pub intercept: f64,
    pub slope: f64,
    /// Root mean square error.
    pub rmse: f64,
    /// Mean of `pred − obs`.
    pub bias: f64,
    /// Standard deviation of `pred − obs`.
    pub sd: f64,
    /// Coefficient of determination of the predictions.
    pub r2: f64,
    pub n: usize,
}

/// Compare predictions with observations. Pairs with a NaN on either side
/// are ignored; `None` when no pair remains.
pub fn accuracy(obs: &[f64], pred: &[f64]) -> Option<Accuracy> {
    let pairs: Vec<(f64, f64)> = obs
        .iter()
        .zip(pred)
        .filter(|(o, p)| o.is_finite() && p.is_finite())
        .map(|(&o, &p)| (o, p))
        .collect();
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;

    let mean_x = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.0).sum::<f64>() / n;

    let mut ss_xy = 0.0;
    let mut ss_xx = 0.0;
    let mut ss_tot = 0.0;
    for &(y, x) in &pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        ss_xy += dx * dy;
        ss_xx += dx * dx;
        ss_tot += dy * dy;
    }

    let slope = if ss_xx.abs() > 1e-15 { ss_xy / ss_xx } else { 0.0 };
    let intercept = mean_y - slope * mean_x;

    let diffs: Vec<f64> = pairs.iter().map(|(o, p)| p - o).collect();
    let ss_res: f64 = diffs.iter().map(|d| d * d).sum();
    let rmse = (ss_res / n).sqrt();
    let bias = diffs.iter().sum::<f64>() / n;
    let sd = if n > 1.0 {
        (diffs.iter().map(|d| (d - bias).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { f64::NAN };

    Some(Accuracy {
        intercept,
        slope,
        rmse,
        bias,
        sd,
        r2,
        n: pairs.len(),
    })
}
