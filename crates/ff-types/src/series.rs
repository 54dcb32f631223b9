use serde::{Deserialize, Serialize};

use crate::errors::FitResult;
use crate::invalid_argument;

/// One aggregated reading at a simulation step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepPoint {
    pub step: i64,
    pub value: f64,
}

/// Ordered (step, value) sequence with strictly increasing step indices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSeries {
    points: Vec<StepPoint>,
}

impl StepSeries {
    /// Build a series, rejecting out-of-order or duplicate steps.
    pub fn new(points: Vec<StepPoint>) -> FitResult<Self> {
        for pair in points.windows(2) {
            if pair[1].step <= pair[0].step {
                return Err(invalid_argument!(
                    "step indices must be strictly increasing: {} followed by {}",
                    pair[0].step, pair[1].step
                ));
            }
        }
        Ok(Self { points })
    }

    /// Number the values 1..=n.
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            points: values
                .iter()
                .enumerate()
                .map(|(i, &value)| StepPoint {
                    step: i as i64 + 1,
                    value,
                })
                .collect(),
        }
    }

    pub fn points(&self) -> &[StepPoint] {
        &self.points
    }

    pub fn steps(&self) -> Vec<i64> {
        self.points.iter().map(|p| p.step).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&StepPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&StepPoint> {
        self.points.last()
    }

    /// Keep only points whose step satisfies `keep`.
    pub fn retain_steps<F: Fn(i64) -> bool>(&self, keep: F) -> Self {
        Self {
            points: self.points.iter().filter(|p| keep(p.step)).copied().collect(),
        }
    }

    /// Drop the first `n` points.
    pub fn skip(&self, n: usize) -> Self {
        Self {
            points: self.points.iter().skip(n).copied().collect(),
        }
    }
}

/// Simulated and reference signals of equal length, ready for scoring
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonPair {
    pub simulated: StepSeries,
    pub reference: StepSeries,
}

impl ComparisonPair {
    pub fn new(simulated: StepSeries, reference: StepSeries) -> FitResult<Self> {
        if simulated.len() != reference.len() {
            return Err(invalid_argument!(
                "comparison series differ in length: simulated {} vs reference {}",
                simulated.len(),
                reference.len()
            ));
        }
        Ok(Self { simulated, reference })
    }

    pub fn len(&self) -> usize {
        self.simulated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.simulated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(step: i64, value: f64) -> StepPoint {
        StepPoint { step, value }
    }

    #[test]
    fn rejects_non_increasing_steps() {
        assert!(StepSeries::new(vec![point(0, 0.0), point(2, 1.0), point(1, 2.0)]).is_err());
        assert!(StepSeries::new(vec![point(1, 0.0), point(1, 1.0)]).is_err());
        assert!(StepSeries::new(vec![point(0, 0.0), point(5, 1.0)]).is_ok());
    }

    #[test]
    fn from_values_numbers_from_one() {
        let series = StepSeries::from_values(&[3.0, 4.0]);
        assert_eq!(series.steps(), vec![1, 2]);
        assert_eq!(series.values(), vec![3.0, 4.0]);
    }

    #[test]
    fn retain_and_skip() {
        let series = StepSeries::new(vec![point(0, 0.0), point(1, 10.0), point(2, 20.0)]).unwrap();
        assert_eq!(series.retain_steps(|s| s > 0).values(), vec![10.0, 20.0]);
        assert_eq!(series.skip(1).steps(), vec![1, 2]);
    }

    #[test]
    fn comparison_pair_requires_equal_lengths() {
        let a = StepSeries::from_values(&[1.0, 2.0]);
        let b = StepSeries::from_values(&[1.0, 2.0, 3.0]);
        assert!(ComparisonPair::new(a.clone(), b).is_err());
        assert_eq!(ComparisonPair::new(a.clone(), a).unwrap().len(), 2);
    }
}
