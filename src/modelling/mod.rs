//! Canopy-height model comparison over the merged statistics table.
//!
//! For each target the evaluation method is picked from the data (k-fold
//! with complete ground truth, dataset otherwise), features are optionally
//! reduced by clustering, and every model kind is run and scored.

pub mod accuracy;
pub mod evaluation;
pub mod models;
pub mod selection;
pub mod table;

pub use accuracy::{accuracy, Accuracy};
pub use evaluation::{choose_method, kfold_indices, model_run, permutation_importance, to_matrix, EvalMethod, RunResult};
pub use models::{build, ModelKind, ModelParams, Regressor};
pub use selection::{fs_hcluster, FeatureSelection, CLUSTER_THRESHOLD};
pub use table::MlTable;

use crate::error::Result;
use crate::storage::{Location, Store};
use tracing::{info, warn};

/// Outcome of one (target, model) run.
#[derive(Debug, Clone)]
pub struct ModelReport {
    pub target: String,
    pub model: ModelKind,
    pub method: EvalMethod,
    pub features: Vec<String>,
    pub accuracy: Option<Accuracy>,
    pub predictions: Location,
    pub importances: Location,
}

/// Feature columns kept for a target.
pub fn select_features(table: &MlTable, method: EvalMethod, feature_selection: bool) -> Vec<usize> {
    let all: Vec<usize> = (0..table.n_features()).collect();
    if method != EvalMethod::KFold || !feature_selection || table.n_features() < 2 {
        return all;
    }
    let target: Vec<f64> = table.target.iter().map(|t| t.unwrap_or(f64::NAN)).collect();
    let columns: Vec<Vec<f64>> = all.iter().map(|&c| table.column(c)).collect();
    let sel = fs_hcluster(&columns, &target, CLUSTER_THRESHOLD);
    info!(
        "{} features in {} clusters",
        table.n_features(),
        sel.selected.len()
    );
    sel.selected
}

pub fn results_file_name(target: &str, model: ModelKind, method: EvalMethod) -> String {
    format!("results_raw_{target}_{model}_{method}.csv")
}

pub fn importances_file_name(target: &str, model: ModelKind, method: EvalMethod) -> String {
    format!("imps_{target}_{model}_{method}.csv")
}

fn log_accuracy(target: &str, model: ModelKind, acc: Option<&Accuracy>) {
    match acc {
        Some(a) => info!(
            "{} {}: n={} rmse={:.3} bias={:.3} sd={:.3} r2={:.3} slope={:.3} intercept={:.3}",
            target, model, a.n, a.rmse, a.bias, a.sd, a.r2, a.slope, a.intercept
        ),
        None => warn!("{} {}: no scored predictions", target, model),
    }
}

fn predictions_csv(ids: &[u32], obs: &[Option<f64>], pred: &[f64]) -> Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(["id", "obs", "pred"])?;
    for ((id, o), p) in ids.iter().zip(obs).zip(pred) {
        w.write_record([
            id.to_string(),
            o.map(|v| v.to_string()).unwrap_or_default(),
            p.to_string(),
        ])?;
    }
    w.into_inner().map_err(|e| e.into_error().into())
}

/// Importance rows under the feature names, and whether the names fit. A
/// width mismatch falls back to positional column names.
fn importances_csv(names: &[String], rows: &[Vec<f64>]) -> Result<(Vec<u8>, bool)> {
    let width = rows.first().map_or(names.len(), Vec::len);
    let matched = width == names.len();
    let header: Vec<String> = if matched {
        names.to_vec()
    } else {
        (0..width).map(|i| format!("imp_{i}")).collect()
    };
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(&header)?;
    for row in rows {
        w.write_record(row.iter().map(|v| v.to_string()))?;
    }
    let bytes = w.into_inner().map_err(|e| e.into_error())?;
    Ok((bytes, matched))
}

/// Run every model on `table` for `target`, writing predictions and
/// importances under `out_dir`.
pub fn run(
    store: &Store,
    table: &MlTable,
    target: &str,
    models: &[ModelKind],
    params: &ModelParams,
    feature_selection: bool,
    out_dir: &Location,
) -> Result<Vec<ModelReport>> {
    let method = choose_method(&table.target);
    let selected = select_features(table, method, feature_selection);
    let names: Vec<String> = selected.iter().map(|&c| table.feature_names[c].clone()).collect();
    let x = to_matrix(&table.select(&selected))?;
    info!(
        "{}: {} rows, {} features, {} evaluation",
        target,
        table.n_rows(),
        names.len(),
        method
    );

    let obs: Vec<f64> = table.target.iter().map(|t| t.unwrap_or(f64::NAN)).collect();
    let mut reports = Vec::with_capacity(models.len());
    for &model in models {
        info!("running {} for {}", model, target);
        let result = model_run(x.view(), &table.target, model, method, params)?;
        let acc = accuracy(&obs, &result.predictions);

        let predictions = out_dir.join(&results_file_name(target, model, method));
        store.write_bytes(
            &predictions,
            &predictions_csv(&table.ids, &table.target, &result.predictions)?,
        )?;

        let importances = out_dir.join(&importances_file_name(target, model, method));
        let (imps_csv, matched) = importances_csv(&names, &result.importances)?;
        store.write_bytes(&importances, &imps_csv)?;
        if matched {
            let mean = result.mean_importances();
            let top = mean
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| names[i].as_str());
            info!("{} {}: most important feature {:?}", target, model, top);
        } else {
            warn!("{} {}: importances do not match the selected features", target, model);
        }
        log_accuracy(target, model, acc.as_ref());

        reports.push(ModelReport {
            target: target.to_string(),
            model,
            method,
            features: names.clone(),
            accuracy: acc,
            predictions,
            importances,
        });
    }
    Ok(reports)
}
