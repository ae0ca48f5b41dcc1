//! Summary statistics over extracted pixel and point values.

use std::cmp::Ordering;

/// The seven aggregates kept per (polygon, raster source) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSummary {
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
}

impl StatsSummary {
    /// Column suffixes, in [`StatsSummary::values`] order.
    pub const SUFFIXES: [&'static str; 7] = [
        "mean",
        "std",
        "min",
        "max",
        "25th_percentile",
        "median",
        "75th_percentile",
    ];

    pub fn values(&self) -> [f64; 7] {
        [self.mean, self.std, self.min, self.max, self.p25, self.median, self.p75]
    }
}

/// Summary of point elevations for one LiDAR return class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointStats {
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation (n − 1).
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p10: f64,
    pub p90: f64,
}

impl PointStats {
    pub const SUFFIXES: [&'static str; 7] = ["mean", "median", "std", "min", "max", "p10", "p90"];

    pub fn values(&self) -> [f64; 7] {
        [self.mean, self.median, self.std, self.min, self.max, self.p10, self.p90]
    }
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    v
}

/// Percentile `p` (0–100) of sorted data, linear interpolation between
/// closest ranks. NaN for empty input.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = (sorted.len() - 1) as f64 * (p / 100.0).clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with `ddof` delta degrees of freedom.
pub fn std_dev(values: &[f64], ddof: usize) -> f64 {
    if values.len() <= ddof {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - ddof) as f64).sqrt()
}

/// Seven-value summary; `None` for an empty slice.
pub fn compute_stats(values: &[f64]) -> Option<StatsSummary> {
    if values.is_empty() {
        return None;
    }
    let s = sorted(values);
    Some(StatsSummary {
        mean: mean(values),
        std: std_dev(values, 0),
        min: s[0],
        max: s[s.len() - 1],
        p25: percentile_sorted(&s, 25.0),
        median: percentile_sorted(&s, 50.0),
        p75: percentile_sorted(&s, 75.0),
    })
}

/// Elevation summary for a class of LiDAR returns; `None` when no points.
pub fn point_stats(z: &[f64]) -> Option<PointStats> {
    if z.is_empty() {
        return None;
    }
    let s = sorted(z);
    Some(PointStats {
        mean: mean(z),
        median: percentile_sorted(&s, 50.0),
        std: std_dev(z, 1),
        min: s[0],
        max: s[s.len() - 1],
        p10: percentile_sorted(&s, 10.0),
        p90: percentile_sorted(&s, 90.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_compute_stats_matches_numpy() {
        // numpy: mean 2.5, std 1.1180, percentiles 1.75 / 2.5 / 3.25
        let s = compute_stats(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_relative_eq!(s.mean, 2.5);
        assert_relative_eq!(s.std, 1.25_f64.sqrt());
        assert_eq!((s.min, s.max), (1.0, 4.0));
        assert_relative_eq!(s.p25, 1.75);
        assert_relative_eq!(s.median, 2.5);
        assert_relative_eq!(s.p75, 3.25);
    }

    #[test]
    fn test_compute_stats_empty() {
        assert!(compute_stats(&[]).is_none());
    }

    #[test]
    fn test_single_value() {
        let s = compute_stats(&[7.0]).unwrap();
        assert_eq!(s.values(), [7.0, 0.0, 7.0, 7.0, 7.0, 7.0, 7.0]);
    }

    #[test]
    fn test_point_stats_sample_std() {
        let p = point_stats(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_relative_eq!(p.std, 2.5_f64.sqrt());
        assert_relative_eq!(p.p10, 1.4);
        assert_relative_eq!(p.p90, 4.6);
        assert_relative_eq!(p.median, 3.0);
        assert!(point_stats(&[2.0]).unwrap().std.is_nan());
    }
}
