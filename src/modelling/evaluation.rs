//! Out-of-sample predictions for model comparison.
//!
//! With complete ground truth the rows are shuffled and split into k folds.
//! When some targets are missing, every row is predicted by a model trained
//! on all other rows that have a target.

use super::models::{build, ModelKind, ModelParams, Regressor};
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMethod {
    KFold,
    Dataset,
}

impl fmt::Display for EvalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EvalMethod::KFold => "k-fold",
            EvalMethod::Dataset => "dataset",
        })
    }
}

/// k-fold when every target is known, dataset otherwise.
pub fn choose_method(target: &[Option<f64>]) -> EvalMethod {
    if target.iter().any(Option::is_none) {
        EvalMethod::Dataset
    } else {
        EvalMethod::KFold
    }
}

/// Out-of-sample predictions and one importance row per fitted model.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub predictions: Vec<f64>,
    pub importances: Vec<Vec<f64>>,
}

impl RunResult {
    /// Column means of the importance rows.
    pub fn mean_importances(&self) -> Vec<f64> {
        let Some(first) = self.importances.first() else {
            return Vec::new();
        };
        let n = self.importances.len() as f64;
        (0..first.len())
            .map(|j| self.importances.iter().map(|r| r[j]).sum::<f64>() / n)
            .collect()
    }
}

/// Row-major feature rows as a matrix.
pub fn to_matrix(rows: &[Vec<f64>]) -> Result<Array2<f64>> {
    let p = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != p) {
        return Err(Error::InsufficientData("ragged feature matrix".into()));
    }
    Array2::from_shape_vec((rows.len(), p), rows.concat()).map_err(|e| Error::Model(e.to_string()))
}

/// Shuffled fold membership: `k` disjoint index sets covering `0..n`.
pub fn kfold_indices(n: usize, k: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut folds = vec![Vec::new(); k.max(1)];
    let len = folds.len();
    for (i, idx) in order.into_iter().enumerate() {
        folds[i % len].push(idx);
    }
    folds
}

fn mse(model: &dyn Regressor, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64> {
    let pred = model.predict(x)?;
    Ok((&pred - &y).mapv(|d| d * d).mean().unwrap_or(0.0))
}

/// Increase in squared error when each feature column is shuffled.
pub fn permutation_importance(
    model: &dyn Regressor,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    seed: u64,
) -> Result<Vec<f64>> {
    if x.nrows() == 0 {
        return Ok(Vec::new());
    }
    let baseline = mse(model, x, y)?;
    let mut rng = StdRng::seed_from_u64(seed);
    (0..x.ncols())
        .map(|j| {
            let mut column = x.column(j).to_vec();
            column.shuffle(&mut rng);
            let mut permuted = x.to_owned();
            permuted.column_mut(j).assign(&Array1::from(column));
            Ok(mse(model, permuted.view(), y)? - baseline)
        })
        .collect()
}

fn importances_of(model: &dyn Regressor, x: ArrayView2<f64>, y: ArrayView1<f64>, seed: u64) -> Result<Vec<f64>> {
    match model.importances() {
        Some(imps) => Ok(imps),
        None => permutation_importance(model, x, y, seed),
    }
}

/// Predict every row out of sample with model `kind`.
pub fn model_run(
    x: ArrayView2<f64>,
    y: &[Option<f64>],
    kind: ModelKind,
    method: EvalMethod,
    params: &ModelParams,
) -> Result<RunResult> {
    if x.nrows() != y.len() {
        return Err(Error::InsufficientData(format!("{} rows for {} targets", x.nrows(), y.len())));
    }
    match method {
        EvalMethod::KFold => kfold_run(x, y, kind, params),
        EvalMethod::Dataset => dataset_run(x, y, kind, params),
    }
}

fn kfold_run(x: ArrayView2<f64>, y: &[Option<f64>], kind: ModelKind, params: &ModelParams) -> Result<RunResult> {
    let y: Array1<f64> = y
        .iter()
        .map(|v| v.ok_or_else(|| Error::InsufficientData("k-fold needs every target".into())))
        .collect::<Result<_>>()?;
    let n = x.nrows();
    let k = params.folds.min(n);
    if k < 2 {
        return Err(Error::InsufficientData(format!("{} rows for k-fold", n)));
    }
    let mut predictions = vec![f64::NAN; n];
    let mut importances = Vec::with_capacity(k);
    for (f, test) in kfold_indices(n, k, params.seed).iter().enumerate() {
        let train: Vec<usize> = (0..n).filter(|i| !test.contains(i)).collect();
        let mut model = build(kind, params);
        model.fit(x.select(Axis(0), &train).view(), y.select(Axis(0), &train).view())?;
        let (tx, ty) = (x.select(Axis(0), test), y.select(Axis(0), test));
        let pred = model.predict(tx.view())?;
        for (&i, &p) in test.iter().zip(pred.iter()) {
            predictions[i] = p;
        }
        importances.push(importances_of(model.as_ref(), tx.view(), ty.view(), params.seed + f as u64)?);
        debug!("{} fold {}: trained on {}, tested on {}", kind, f + 1, train.len(), test.len());
    }
    Ok(RunResult {
        predictions,
        importances,
    })
}

fn dataset_run(x: ArrayView2<f64>, y: &[Option<f64>], kind: ModelKind, params: &ModelParams) -> Result<RunResult> {
    let known: Vec<usize> = (0..y.len()).filter(|&i| y[i].is_some()).collect();
    if known.len() < 2 {
        return Err(Error::InsufficientData(format!("{} rows with a target", known.len())));
    }
    let y_known = |idx: &[usize]| -> Array1<f64> { idx.iter().filter_map(|&i| y[i]).collect() };

    let mut predictions = Vec::with_capacity(x.nrows());
    for i in 0..x.nrows() {
        let train: Vec<usize> = known.iter().copied().filter(|&j| j != i).collect();
        let mut model = build(kind, params);
        model.fit(x.select(Axis(0), &train).view(), y_known(&train).view())?;
        predictions.push(model.predict(x.select(Axis(0), &[i]).view())?[0]);
    }

    let mut model = build(kind, params);
    let (kx, ky) = (x.select(Axis(0), &known), y_known(&known));
    model.fit(kx.view(), ky.view())?;
    let importances = vec![importances_of(model.as_ref(), kx.view(), ky.view(), params.seed)?];
    debug!("{}: {} rows predicted, {} with a target", kind, x.nrows(), known.len());
    Ok(RunResult {
        predictions,
        importances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn data(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { ((i * 5) % 7) as f64 });
        let y = x.column(0).mapv(|v| 1.0 + 2.0 * v);
        (x, y)
    }

    #[test]
    fn test_choose_method() {
        assert_eq!(choose_method(&[Some(1.0), Some(2.0)]), EvalMethod::KFold);
        assert_eq!(choose_method(&[Some(1.0), None]), EvalMethod::Dataset);
        assert_eq!(EvalMethod::KFold.to_string(), "k-fold");
    }

    #[test]
    fn test_kfold_indices_partition() {
        let folds = kfold_indices(23, 5, 7);
        assert_eq!(folds.len(), 5);
        let mut all: Vec<usize> = folds.concat();
        all.sort_unstable();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
        assert!(folds.iter().all(|f| f.len() == 4 || f.len() == 5));
        assert_eq!(folds, kfold_indices(23, 5, 7));
    }

    #[test]
    fn test_kfold_linear_model_recovers_target() {
        let (x, y) = data(25);
        let y: Vec<Option<f64>> = y.iter().map(|&v| Some(v)).collect();
        let run = model_run(x.view(), &y, ModelKind::Mlr, EvalMethod::KFold, &ModelParams::default()).unwrap();
        for (p, t) in run.predictions.iter().zip(&y) {
            assert_relative_eq!(*p, t.unwrap(), epsilon = 1e-6);
        }
        assert_eq!(run.importances.len(), 5);
        assert_eq!(run.mean_importances().len(), 2);
    }

    #[test]
    fn test_dataset_predicts_missing_rows() {
        let (x, y) = data(12);
        let mut y: Vec<Option<f64>> = y.iter().map(|&v| Some(v)).collect();
        y[3] = None;
        let run = model_run(x.view(), &y, ModelKind::Mlr, EvalMethod::Dataset, &ModelParams::default()).unwrap();
        assert_eq!(run.predictions.len(), 12);
        assert_relative_eq!(run.predictions[3], 7.0, epsilon = 1e-6);
        assert_eq!(run.importances.len(), 1);
    }

    #[test]
    fn test_kfold_rejects_missing_target() {
        let (x, _) = data(6);
        let y = vec![Some(1.0), None, Some(1.0), Some(1.0), Some(1.0), Some(1.0)];
        assert!(model_run(x.view(), &y, ModelKind::Svm, EvalMethod::KFold, &ModelParams::default()).is_err());
    }

    #[test]
    fn test_permutation_importance_finds_signal() {
        let (x, y) = data(30);
        let mut model = build(ModelKind::Svm, &ModelParams::default());
        model.fit(x.view(), y.view()).unwrap();
        let imps = permutation_importance(model.as_ref(), x.view(), y.view(), 1).unwrap();
        assert!(imps[0] > imps[1]);
    }

    #[test]
    fn test_to_matrix_rejects_ragged_rows() {
        let m = to_matrix(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m.dim(), (2, 2));
        assert_eq!(m[[1, 0]], 3.0);
        assert!(to_matrix(&[vec![1.0, 2.0], vec![3.0]]).is_err());
    }

    #[test]
    fn test_svm_runs_under_both_methods() {
        let (x, y) = data(15);
        let mut y: Vec<Option<f64>> = y.iter().map(|&v| Some(v)).collect();
        let run = model_run(x.view(), &y, ModelKind::Svm, EvalMethod::KFold, &ModelParams::default()).unwrap();
        assert!(run.predictions.iter().all(|p| p.is_finite()));
        y[0] = None;
        let run = model_run(x.view(), &y, ModelKind::Svm, EvalMethod::Dataset, &ModelParams::default()).unwrap();
        assert_eq!(run.predictions.len(), 15);
        assert_eq!(run.importances[0].len(), 2);
    }
}
