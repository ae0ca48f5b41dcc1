//! Regression models compared on the merged table.
//!
//! MLR and SVM are fitted with `linfa`. `linfa-trees` only grows
//! classification trees, so the tree ensembles are CART regressors grown
//! directly on `ndarray` views.

use crate::error::{Error, Result};
use linfa::traits::{Fit, Predict};
use linfa::Dataset;
use linfa_linear::FittedLinearRegression;
use linfa_svm::Svm;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;

/// Model families run for every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// Ordinary least squares.
    Mlr,
    /// Epsilon support vector regression with an RBF kernel.
    Svm,
    /// Random forest of regression trees.
    Rf,
    /// Gradient-boosted regression trees.
    Gbm,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [ModelKind::Mlr, ModelKind::Svm, ModelKind::Gbm, ModelKind::Rf];
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelKind::Mlr => "MLR",
            ModelKind::Svm => "SVM",
            ModelKind::Rf => "RF",
            ModelKind::Gbm => "GBM",
        };
        f.write_str(s)
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MLR" => Ok(ModelKind::Mlr),
            "SVM" => Ok(ModelKind::Svm),
            "RF" => Ok(ModelKind::Rf),
            "GBM" => Ok(ModelKind::Gbm),
            _ => Err(Error::InvalidParameter {
                name: "model",
                value: s.to_string(),
                reason: "expected MLR, SVM, RF or GBM".into(),
            }),
        }
    }
}

/// Hyper-parameters shared by the model families.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParams {
    /// SVR regularisation.
    pub svm_c: f64,
    /// Width of the SVR insensitive tube.
    pub svm_epsilon: f64,
    /// Trees in the random forest.
    pub rf_trees: usize,
    pub rf_max_depth: usize,
    /// Boosting rounds.
    pub gbm_rounds: usize,
    pub gbm_max_depth: usize,
    pub gbm_learning_rate: f64,
    /// Smallest number of samples in a tree leaf.
    pub min_leaf: usize,
    /// Folds of the k-fold evaluation.
    pub folds: usize,
    pub seed: u64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            svm_c: 1.0,
            svm_epsilon: 0.1,
            rf_trees: 100,
            rf_max_depth: 8,
            gbm_rounds: 100,
            gbm_max_depth: 3,
            gbm_learning_rate: 0.1,
            min_leaf: 2,
            folds: 5,
            seed: 42,
        }
    }
}

/// A model that can be fitted on a feature matrix and queried.
pub trait Regressor {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<()>;

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>>;

    /// Model-specific importances, when the model has a natural measure.
    fn importances(&self) -> Option<Vec<f64>> {
        None
    }
}

pub fn build(kind: ModelKind, params: &ModelParams) -> Box<dyn Regressor> {
    match kind {
        ModelKind::Mlr => Box::new(LinearRegression::default()),
        ModelKind::Svm => Box::new(SupportVectorRegression::new(params.svm_c, params.svm_epsilon)),
        ModelKind::Rf => Box::new(RandomForest::new(params)),
        ModelKind::Gbm => Box::new(GradientBoosting::new(params)),
    }
}

fn check_shape(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<usize> {
    if x.nrows() == 0 || x.nrows() != y.len() {
        return Err(Error::InsufficientData(format!(
            "{} feature rows for {} targets",
            x.nrows(),
            y.len()
        )));
    }
    Ok(x.ncols())
}

fn check_width(x: ArrayView2<f64>, p: usize) -> Result<()> {
    if x.ncols() != p {
        return Err(Error::InsufficientData(format!("{} features, model was fitted on {}", x.ncols(), p)));
    }
    Ok(())
}

fn model_error(e: impl fmt::Display) -> Error {
    Error::Model(e.to_string())
}

/// Population mean and standard deviation of every column.
fn column_mean_sd(x: ArrayView2<f64>) -> (Array1<f64>, Array1<f64>) {
    let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
    let sd = x.std_axis(Axis(0), 0.0);
    (mean, sd)
}

// ---------------------------------------------------------------------------
// MLR
// ---------------------------------------------------------------------------

/// Least squares with intercept. Constant columns are left out of the fit
/// and get a zero coefficient.
#[derive(Default)]
pub struct LinearRegression {
    n_features: usize,
    /// Columns with non-zero variance.
    used: Vec<usize>,
    sd: Vec<f64>,
    /// Target mean, the prediction when every column is constant.
    y_mean: f64,
    fitted: Option<FittedLinearRegression<f64>>,
}

impl Regressor for LinearRegression {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<()> {
        let p = check_shape(x, y)?;
        let (_, sd) = column_mean_sd(x);
        self.n_features = p;
        self.used = (0..p).filter(|&j| sd[j] > 0.0).collect();
        self.sd = sd.to_vec();
        self.y_mean = y.mean().unwrap_or(0.0);
        self.fitted = if self.used.is_empty() {
            None
        } else {
            let dataset = Dataset::new(x.select(Axis(1), &self.used), y.to_owned());
            Some(
                linfa_linear::LinearRegression::new()
                    .fit(&dataset)
                    .map_err(model_error)?,
            )
        };
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        check_width(x, self.n_features)?;
        Ok(match &self.fitted {
            Some(m) => m.predict(&x.select(Axis(1), &self.used)),
            None => Array1::from_elem(x.nrows(), self.y_mean),
        })
    }

    /// Absolute coefficients of the standardised features.
    fn importances(&self) -> Option<Vec<f64>> {
        let mut imps = vec![0.0; self.n_features];
        if let Some(m) = &self.fitted {
            for (&j, c) in self.used.iter().zip(m.params()) {
                imps[j] = (c * self.sd[j]).abs();
            }
        }
        Some(imps)
    }
}

// ---------------------------------------------------------------------------
// SVM
// ---------------------------------------------------------------------------

/// C-SVR on standardised features. The Gaussian kernel width is the
/// number of features, i.e. `gamma = 1 / (p * var)` with unit variance.
pub struct SupportVectorRegression {
    c: f64,
    epsilon: f64,
    mean: Array1<f64>,
    sd: Array1<f64>,
    fitted: Option<Svm<f64, f64>>,
}

impl SupportVectorRegression {
    pub fn new(c: f64, epsilon: f64) -> Self {
        Self {
            c,
            epsilon,
            mean: Array1::zeros(0),
            sd: Array1::zeros(0),
            fitted: None,
        }
    }

    fn scale(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut z = x.to_owned();
        for (mut col, (m, s)) in z.columns_mut().into_iter().zip(self.mean.iter().zip(&self.sd)) {
            if *s > 0.0 {
                col.mapv_inplace(|v| (v - m) / s);
            } else {
                col.fill(0.0);
            }
        }
        z
    }
}

impl Regressor for SupportVectorRegression {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<()> {
        let p = check_shape(x, y)?;
        let (mean, sd) = column_mean_sd(x);
        self.mean = mean;
        self.sd = sd;
        let dataset = Dataset::new(self.scale(x), y.to_owned());
        let svm = Svm::<f64, f64>::params()
            .c_svr(self.c, Some(self.epsilon))
            .gaussian_kernel(p.max(1) as f64)
            .fit(&dataset)
            .map_err(model_error)?;
        self.fitted = Some(svm);
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        check_width(x, self.mean.len())?;
        let svm = self
            .fitted
            .as_ref()
            .ok_or_else(|| Error::Model("SVM used before fitting".into()))?;
        Ok(svm.predict(&self.scale(x)))
    }
}

// ---------------------------------------------------------------------------
// Regression trees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        match self {
            Node::Leaf(v) => *v,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] <= *threshold {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }
}

/// CART regression tree grown on variance reduction.
#[derive(Debug, Clone)]
pub struct RegressionTree {
    max_depth: usize,
    min_leaf: usize,
    /// Features tried per split; all when `None`.
    max_features: Option<usize>,
    root: Option<Node>,
    /// Total squared-error reduction per feature.
    gain: Vec<f64>,
}

impl RegressionTree {
    pub fn new(max_depth: usize, min_leaf: usize, max_features: Option<usize>) -> Self {
        Self {
            max_depth,
            min_leaf: min_leaf.max(1),
            max_features,
            root: None,
            gain: Vec::new(),
        }
    }

    pub fn fit_with_rng(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>, rng: &mut StdRng) -> Result<()> {
        let p = check_shape(x, y)?;
        self.gain = vec![0.0; p];
        let idx: Vec<usize> = (0..x.nrows()).collect();
        self.root = Some(self.grow(x, y, idx, 0, rng));
        Ok(())
    }

    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        self.root.as_ref().map_or(f64::NAN, |n| n.predict(row))
    }

    fn grow(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>, idx: Vec<usize>, depth: usize, rng: &mut StdRng) -> Node {
        let n = idx.len() as f64;
        let mean = idx.iter().map(|&i| y[i]).sum::<f64>() / n;
        if depth >= self.max_depth || idx.len() < 2 * self.min_leaf {
            return Node::Leaf(mean);
        }

        let p = self.gain.len();
        let mut features: Vec<usize> = (0..p).collect();
        if let Some(m) = self.max_features.filter(|&m| m < p) {
            // partial Fisher-Yates
            for i in 0..m {
                let j = rng.gen_range(i..p);
                features.swap(i, j);
            }
            features.truncate(m);
        }

        let total: f64 = idx.iter().map(|&i| y[i]).sum();
        let total_sq: f64 = idx.iter().map(|&i| y[i] * y[i]).sum();
        let parent_sse = total_sq - total * total / n;

        let mut best: Option<(f64, usize, f64)> = None;
        for &f in &features {
            let mut order = idx.clone();
            order.sort_by(|&a, &b| x[[a, f]].total_cmp(&x[[b, f]]));
            let (mut s, mut sq) = (0.0, 0.0);
            for k in 0..order.len() - 1 {
                let yi = y[order[k]];
                s += yi;
                sq += yi * yi;
                if k + 1 < self.min_leaf || order.len() - (k + 1) < self.min_leaf {
                    continue;
                }
                let (xa, xb) = (x[[order[k], f]], x[[order[k + 1], f]]);
                if xa == xb {
                    continue;
                }
                let nl = (k + 1) as f64;
                let nr = n - nl;
                let sse = (sq - s * s / nl) + ((total_sq - sq) - (total - s) * (total - s) / nr);
                if best.map_or(true, |(b, _, _)| sse < b) {
                    best = Some((sse, f, (xa + xb) / 2.0));
                }
            }
        }

        match best {
            Some((sse, feature, threshold)) if sse < parent_sse - 1e-12 => {
                self.gain[feature] += parent_sse - sse;
                let (l, r): (Vec<usize>, Vec<usize>) = idx.into_iter().partition(|&i| x[[i, feature]] <= threshold);
                let left = self.grow(x, y, l, depth + 1, rng);
                let right = self.grow(x, y, r, depth + 1, rng);
                Node::Split {
                    feature,
                    threshold,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            _ => Node::Leaf(mean),
        }
    }
}

impl Regressor for RegressionTree {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        self.fit_with_rng(x, y, &mut rng)
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        check_width(x, self.gain.len())?;
        Ok(x.rows().into_iter().map(|row| self.predict_row(row)).collect())
    }

    fn importances(&self) -> Option<Vec<f64>> {
        Some(self.gain.clone())
    }
}

/// Bootstrap-aggregated trees with a third of the features per split.
#[derive(Debug, Clone)]
pub struct RandomForest {
    n_trees: usize,
    max_depth: usize,
    min_leaf: usize,
    seed: u64,
    n_features: usize,
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            n_trees: params.rf_trees.max(1),
            max_depth: params.rf_max_depth,
            min_leaf: params.min_leaf,
            seed: params.seed,
            n_features: 0,
            trees: Vec::new(),
        }
    }
}

impl Regressor for RandomForest {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<()> {
        let p = check_shape(x, y)?;
        let m = p.div_ceil(3).max(1);
        let n = x.nrows();
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.n_features = p;
        self.trees.clear();
        for _ in 0..self.n_trees {
            let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let xs = x.select(Axis(0), &sample);
            let ys = y.select(Axis(0), &sample);
            let mut tree = RegressionTree::new(self.max_depth, self.min_leaf, Some(m));
            tree.fit_with_rng(xs.view(), ys.view(), &mut rng)?;
            self.trees.push(tree);
        }
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        check_width(x, self.n_features)?;
        if self.trees.is_empty() {
            return Err(Error::Model("random forest used before fitting".into()));
        }
        let n = self.trees.len() as f64;
        Ok(x.rows()
            .into_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n)
            .collect())
    }
}

/// Squared-loss gradient boosting over shallow trees.
#[derive(Debug, Clone)]
pub struct GradientBoosting {
    rounds: usize,
    max_depth: usize,
    min_leaf: usize,
    learning_rate: f64,
    seed: u64,
    n_features: usize,
    base: f64,
    trees: Vec<RegressionTree>,
}

impl GradientBoosting {
    pub fn new(params: &ModelParams) -> Self {
        Self {
            rounds: params.gbm_rounds,
            max_depth: params.gbm_max_depth,
            min_leaf: params.min_leaf,
            learning_rate: params.gbm_learning_rate,
            seed: params.seed,
            n_features: 0,
            base: 0.0,
            trees: Vec::new(),
        }
    }

    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        self.base + self.learning_rate * self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }
}

impl Regressor for GradientBoosting {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<()> {
        self.n_features = check_shape(x, y)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.base = y.mean().unwrap_or(0.0);
        let mut pred = Array1::from_elem(y.len(), self.base);
        self.trees.clear();
        for _ in 0..self.rounds {
            let residual = &y - &pred;
            let mut tree = RegressionTree::new(self.max_depth, self.min_leaf, None);
            tree.fit_with_rng(x, residual.view(), &mut rng)?;
            for (p, row) in pred.iter_mut().zip(x.rows()) {
                *p += self.learning_rate * tree.predict_row(row);
            }
            self.trees.push(tree);
        }
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        check_width(x, self.n_features)?;
        Ok(x.rows().into_iter().map(|row| self.predict_row(row)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn linear_data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((20, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 3) as f64 });
        let y = x.rows().into_iter().map(|r| 2.0 + 3.0 * r[0] - 1.5 * r[1]).collect();
        (x, y)
    }

    #[test]
    fn test_model_kind_parse() {
        assert_eq!("gbm".parse::<ModelKind>().unwrap(), ModelKind::Gbm);
        assert_eq!("SVM".parse::<ModelKind>().unwrap(), ModelKind::Svm);
        assert_eq!(ModelKind::Svm.to_string(), "SVM");
        assert!("KNN".parse::<ModelKind>().is_err());
    }

    #[test]
    fn test_linear_regression_exact() {
        let (x, y) = linear_data();
        let mut m = LinearRegression::default();
        m.fit(x.view(), y.view()).unwrap();
        let p = m.predict(array![[10.0, 1.0]].view()).unwrap();
        assert_relative_eq!(p[0], 30.5, epsilon = 1e-6);
        let imps = m.importances().unwrap();
        assert!(imps[0] > imps[1]);
    }

    #[test]
    fn test_linear_regression_constant_feature() {
        let x = Array2::from_shape_fn((5, 2), |(i, j)| if j == 0 { i as f64 } else { 1.0 });
        let y = Array1::from_iter((0..5).map(|i| i as f64));
        let mut m = LinearRegression::default();
        m.fit(x.view(), y.view()).unwrap();
        let p = m.predict(array![[7.0, 1.0]].view()).unwrap();
        assert_relative_eq!(p[0], 7.0, epsilon = 1e-6);
        assert_eq!(m.importances().unwrap()[1], 0.0);
    }

    #[test]
    fn test_linear_regression_all_constant_predicts_mean() {
        let x = Array2::from_elem((4, 1), 3.0);
        let y = array![1.0, 2.0, 3.0, 6.0];
        let mut m = LinearRegression::default();
        m.fit(x.view(), y.view()).unwrap();
        assert_relative_eq!(m.predict(x.view()).unwrap()[0], 3.0);
    }

    #[test]
    fn test_svm_follows_trend() {
        let x = Array2::from_shape_fn((30, 1), |(i, _)| i as f64 / 10.0);
        let y = x.column(0).mapv(|v| 2.0 * v);
        let mut m = build(ModelKind::Svm, &ModelParams::default());
        m.fit(x.view(), y.view()).unwrap();
        let p = m.predict(array![[0.5], [2.5]].view()).unwrap();
        assert!(p[0] < p[1]);
        assert!((p[0] - 1.0).abs() < 0.6, "{}", p[0]);
        assert!((p[1] - 5.0).abs() < 0.6, "{}", p[1]);
        assert!(m.importances().is_none());
    }

    #[test]
    fn test_tree_splits_step() {
        let x = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let y = Array1::from_iter((0..10).map(|i| if i < 5 { 1.0 } else { 5.0 }));
        let mut t = RegressionTree::new(3, 1, None);
        t.fit(x.view(), y.view()).unwrap();
        let p = t.predict(array![[2.0], [8.0]].view()).unwrap();
        assert_relative_eq!(p[0], 1.0);
        assert_relative_eq!(p[1], 5.0);
    }

    #[test]
    fn test_ensembles_fit_step() {
        let x = Array2::from_shape_fn((40, 2), |(i, j)| if j == 0 { i as f64 } else { ((i * 7) % 5) as f64 });
        let y = x.column(0).mapv(|v| if v < 20.0 { 0.0 } else { 10.0 });
        for kind in [ModelKind::Rf, ModelKind::Gbm] {
            let mut m = build(kind, &ModelParams::default());
            m.fit(x.view(), y.view()).unwrap();
            let p = m.predict(array![[5.0, 1.0], [35.0, 1.0]].view()).unwrap();
            assert!(p[0] < 3.0, "{kind}");
            assert!(p[1] > 7.0, "{kind}");
        }
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let mut m = LinearRegression::default();
        assert!(m.fit(array![[1.0]].view(), array![1.0, 2.0].view()).is_err());
        let (x, y) = linear_data();
        m.fit(x.view(), y.view()).unwrap();
        assert!(m.predict(array![[1.0]].view()).is_err());
    }
}
