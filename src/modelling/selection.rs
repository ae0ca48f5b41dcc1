//! Feature selection by hierarchical clustering of correlated features.
//!
//! Features are clustered with average linkage on `1 − |ρ|` (Spearman) and
//! the tree is cut at a distance threshold. Each cluster is represented by
//! the member most correlated with the target.

use crate::stats::mean;

/// Default cut height of the feature dendrogram.
pub const CLUSTER_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSelection {
    /// Cluster label per feature, numbered from 0 in order of first member.
    pub clusters: Vec<usize>,
    /// Selected feature indices, ascending.
    pub selected: Vec<usize>,
}

/// Ranks with ties averaged, 1-based.
pub fn rank(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let r = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            ranks[k] = r;
        }
        i = j + 1;
    }
    ranks
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let (ma, mb) = (mean(a), mean(b));
    let mut num = 0.0;
    let (mut da, mut db) = (0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        num += (x - ma) * (y - mb);
        da += (x - ma).powi(2);
        db += (y - mb).powi(2);
    }
    if da == 0.0 || db == 0.0 {
        return 0.0;
    }
    num / (da * db).sqrt()
}

/// Spearman rank correlation. Zero when either side is constant.
pub fn spearman(a: &[f64], b: &[f64]) -> f64 {
    pearson(&rank(a), &rank(b))
}

/// Average-linkage agglomerative clustering of `n` items on a distance
/// matrix, merging while the closest pair of clusters is within `threshold`.
pub fn average_linkage(distance: &[Vec<f64>], threshold: f64) -> Vec<usize> {
    let n = distance.len();
    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    loop {
        let mut best: Option<(f64, usize, usize)> = None;
        for a in 0..clusters.len() {
            for b in a + 1..clusters.len() {
                let mut sum = 0.0;
                for &i in &clusters[a] {
                    for &j in &clusters[b] {
                        sum += distance[i][j];
                    }
                }
                let d = sum / (clusters[a].len() * clusters[b].len()) as f64;
                if best.map_or(true, |(bd, _, _)| d < bd) {
                    best = Some((d, a, b));
                }
            }
        }
        match best {
            Some((d, a, b)) if d <= threshold => {
                let merged = clusters.remove(b);
                clusters[a].extend(merged);
            }
            _ => break,
        }
    }

    let mut labels = vec![0; n];
    let mut members: Vec<Vec<usize>> = clusters;
    for m in &mut members {
        m.sort_unstable();
    }
    members.sort_by_key(|m| m[0]);
    for (label, m) in members.iter().enumerate() {
        for &i in m {
            labels[i] = label;
        }
    }
    labels
}

/// Cluster the feature columns and keep one feature per cluster.
pub fn fs_hcluster(columns: &[Vec<f64>], target: &[f64], threshold: f64) -> FeatureSelection {
    let p = columns.len();
    let mut distance = vec![vec![0.0; p]; p];
    for i in 0..p {
        for j in i + 1..p {
            let d = 1.0 - spearman(&columns[i], &columns[j]).abs();
            distance[i][j] = d;
            distance[j][i] = d;
        }
    }
    let clusters = average_linkage(&distance, threshold);
    let with_target: Vec<f64> = columns.iter().map(|c| spearman(c, target).abs()).collect();

    let n_clusters = clusters.iter().max().map_or(0, |m| m + 1);
    let mut selected: Vec<usize> = (0..n_clusters)
        .filter_map(|c| {
            (0..p)
                .filter(|&f| clusters[f] == c)
                .max_by(|&a, &b| with_target[a].total_cmp(&with_target[b]).then(b.cmp(&a)))
        })
        .collect();
    selected.sort_unstable();
    FeatureSelection { clusters, selected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rank_ties() {
        assert_eq!(rank(&[10.0, 20.0, 10.0, 5.0]), vec![2.5, 4.0, 2.5, 1.0]);
    }

    #[test]
    fn test_spearman_monotone() {
        let a = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(spearman(&a, &[1.0, 4.0, 9.0, 16.0]), 1.0);
        assert_relative_eq!(spearman(&a, &[4.0, 3.0, 2.0, 1.0]), -1.0);
        assert_eq!(spearman(&a, &[1.0, 1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_correlated_features_share_cluster() {
        let target: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let a: Vec<f64> = target.iter().map(|v| v * 2.0).collect();
        let b: Vec<f64> = target.iter().map(|v| v.powi(3)).collect();
        let noise = vec![3.0, 1.0, 4.0, 1.5, 5.0, 9.0, 2.0, 6.0, 5.5, 3.5];
        let sel = fs_hcluster(&[a, b, noise], &target, CLUSTER_THRESHOLD);
        assert_eq!(sel.clusters[0], sel.clusters[1]);
        assert_ne!(sel.clusters[0], sel.clusters[2]);
        // tie on |ρ| = 1 keeps the first feature
        assert_eq!(sel.selected, vec![0, 2]);
    }

    #[test]
    fn test_threshold_zero_keeps_singletons() {
        let d = vec![vec![0.0, 0.5], vec![0.5, 0.0]];
        assert_eq!(average_linkage(&d, 0.0), vec![0, 1]);
        assert_eq!(average_linkage(&d, 0.5), vec![0, 0]);
    }
}
