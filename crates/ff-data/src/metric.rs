//! Scalar discrepancy between aligned series.
//!
//! Argument order matters everywhere in this module: the first argument is the
//! simulated signal, the second is the reference whose magnitude normalizes
//! the error.

use ff_types::{invalid_argument, ComparisonPair, DataError, FitResult};
use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-12;

fn check_lengths(simulated: &[f64], reference: &[f64]) -> FitResult<()> {
    if simulated.len() != reference.len() {
        return Err(invalid_argument!(
            "metric inputs differ in length: {} vs {}",
            simulated.len(),
            reference.len()
        ));
    }
    if simulated.is_empty() {
        return Err(DataError::InsufficientData {
            message: "metric needs at least one point".to_string(),
        }
        .into());
    }
    Ok(())
}

/// RMSE normalized by the peak absolute reference value. Returns a fraction.
pub fn nrmse(simulated: &[f64], reference: &[f64]) -> FitResult<f64> {
    check_lengths(simulated, reference)?;
    let mse = simulated
        .iter()
        .zip(reference)
        .map(|(s, r)| (s - r).powi(2))
        .sum::<f64>()
        / simulated.len() as f64;
    let peak = reference.iter().fold(0.0f64, |acc, r| acc.max(r.abs()));
    Ok(mse.sqrt() / peak.max(EPSILON))
}

/// Mean absolute percentage error, already scaled to percent.
pub fn mape(simulated: &[f64], reference: &[f64]) -> FitResult<f64> {
    check_lengths(simulated, reference)?;
    let total: f64 = simulated
        .iter()
        .zip(reference)
        .map(|(s, r)| (s - r).abs() / r.abs().max(EPSILON))
        .sum();
    Ok(100.0 * total / simulated.len() as f64)
}

/// Scoring rule used by the objective
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMetric {
    #[default]
    Nrmse,
    Mape,
}

impl ErrorMetric {
    /// Error in percent. Non-finite results are reported as errors.
    pub fn score_percent(&self, pair: &ComparisonPair) -> FitResult<f64> {
        let simulated = pair.simulated.values();
        let reference = pair.reference.values();
        let score = match self {
            ErrorMetric::Nrmse => 100.0 * nrmse(&simulated, &reference)?,
            ErrorMetric::Mape => mape(&simulated, &reference)?,
        };
        if !score.is_finite() {
            return Err(DataError::NonFinite {
                message: format!("{:?} produced {}", self, score),
            }
            .into());
        }
        Ok(score)
    }
}
