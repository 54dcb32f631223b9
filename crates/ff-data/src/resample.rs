//! Reconciling simulated and reference series onto a common basis.

use std::collections::BTreeMap;

use ff_types::{invalid_argument, ComparisonPair, DataError, FitResult, StepPoint, StepSeries};
use serde::{Deserialize, Serialize};

/// Resample `series` to exactly `n` points over normalized progress.
///
/// Both the input and the output are treated as evenly spaced on [0, 1];
/// original step numbers are discarded and the result is numbered 1..=n.
pub fn resample_to_n_points(series: &StepSeries, n: usize) -> FitResult<StepSeries> {
    let m = series.len();
    if n < 2 {
        return Err(invalid_argument!("resample target must have at least 2 points, got {}", n));
    }
    if m < 2 {
        return Err(invalid_argument!("cannot resample a series of {} point(s); need at least 2", m));
    }

    let values = series.values();
    let last = m - 1;
    let resampled: Vec<f64> = (0..n)
        .map(|i| {
            let pos = i as f64 / (n - 1) as f64 * last as f64;
            let lo = pos.floor() as usize;
            if lo >= last {
                return values[last];
            }
            let frac = pos - lo as f64;
            values[lo] + frac * (values[lo + 1] - values[lo])
        })
        .collect();

    Ok(StepSeries::from_values(&resampled))
}

/// Keep only the steps present in both series, in step order.
pub fn align_by_step(simulated: &StepSeries, reference: &StepSeries) -> FitResult<ComparisonPair> {
    let reference_by_step: BTreeMap<i64, f64> = reference
        .points()
        .iter()
        .map(|p| (p.step, p.value))
        .collect();

    let (sim, refr): (Vec<StepPoint>, Vec<StepPoint>) = simulated
        .points()
        .iter()
        .filter_map(|p| {
            reference_by_step
                .get(&p.step)
                .map(|&value| (*p, StepPoint { step: p.step, value }))
        })
        .unzip();

    if sim.is_empty() {
        return Err(DataError::DataNotFound {
            message: "simulated and reference series share no step indices".to_string(),
        }
        .into());
    }

    ComparisonPair::new(StepSeries::new(sim)?, StepSeries::new(refr)?)
}

/// How the reference series is brought onto the simulated one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentPolicy {
    /// Resample the reference to the simulated length over normalized progress.
    #[default]
    Resample,
    /// Inner join on step index.
    StepJoin,
}

impl AlignmentPolicy {
    pub fn align(&self, simulated: &StepSeries, reference: &StepSeries) -> FitResult<ComparisonPair> {
        match self {
            AlignmentPolicy::Resample => {
                let reference = resample_to_n_points(reference, simulated.len())?;
                ComparisonPair::new(simulated.clone(), reference)
            }
            AlignmentPolicy::StepJoin => align_by_step(simulated, reference),
        }
    }
}
