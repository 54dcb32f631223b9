//! Step-structured solver log extraction.
//!
//! Solver logs look like
//!
//! ```text
//! *Step  = 3
//! *Time  = 0.3
//! *Data  = Rx
//! 5 -0.0125
//! 35 0.0031
//! ```
//!
//! Each block contributes one aggregated value per step, computed over the
//! rows whose entity id is in the keep-set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use ff_types::{invalid_argument, DataError, FitError, FitResult, StepPoint, StepSeries};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[-+]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?").expect("static number pattern")
    })
}

fn numbers(line: &str) -> impl Iterator<Item = f64> + '_ {
    number_pattern()
        .find_iter(line)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
}

/// Reduction applied to the readings of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Sum,
    Mean,
}

impl Aggregation {
    fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        match self {
            Aggregation::Sum => Some(sum),
            Aggregation::Mean => Some(sum / values.len() as f64),
        }
    }
}

impl FromStr for Aggregation {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sum" => Ok(Aggregation::Sum),
            "mean" => Ok(Aggregation::Mean),
            other => Err(invalid_argument!("aggregation must be 'sum' or 'mean', got '{}'", other)),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Sum => write!(f, "sum"),
            Aggregation::Mean => write!(f, "mean"),
        }
    }
}

/// Parser turning a step log into a [`StepSeries`]
#[derive(Debug, Clone, Default)]
pub struct StepLogParser {
    keep: Option<BTreeSet<i64>>,
    aggregation: Aggregation,
}

impl StepLogParser {
    pub fn new(aggregation: Aggregation) -> Self {
        Self {
            keep: None,
            aggregation,
        }
    }

    /// Restrict aggregation to these entity ids.
    pub fn with_ids<I: IntoIterator<Item = i64>>(mut self, ids: I) -> Self {
        self.keep = Some(ids.into_iter().collect());
        self
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Read and parse a log file. Undecodable bytes are replaced, not fatal.
    pub fn parse_file<P: AsRef<Path>>(&self, path: P) -> FitResult<StepSeries> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let series = self.parse_bytes(&bytes).map_err(|e| match e {
            FitError::Data(DataError::DataNotFound { message }) => DataError::DataNotFound {
                message: format!("{} ({})", message, path.display()),
            }
            .into(),
            other => other,
        })?;
        debug!("Parsed {} steps from {}", series.len(), path.display());
        Ok(series)
    }

    pub fn parse_bytes(&self, bytes: &[u8]) -> FitResult<StepSeries> {
        self.parse_str(&String::from_utf8_lossy(bytes))
    }

    pub fn parse_str(&self, text: &str) -> FitResult<StepSeries> {
        let mut current_step: Option<i64> = None;
        let mut readings: BTreeMap<i64, Vec<f64>> = BTreeMap::new();

        for line in text.lines() {
            let s = line.trim();

            if s.starts_with("*Step") {
                if let Some(step) = numbers(s).last() {
                    let step = step as i64;
                    readings.entry(step).or_default();
                    current_step = Some(step);
                }
                continue;
            }

            // Nothing before the first step marker counts
            let Some(step) = current_step else {
                continue;
            };

            if s.starts_with('*') {
                continue;
            }

            let mut row = numbers(s);
            let (Some(id), Some(value)) = (row.next(), row.next()) else {
                continue;
            };
            let id = id as i64;

            if self.keep.as_ref().map_or(true, |keep| keep.contains(&id)) {
                readings.entry(step).or_default().push(value);
            }
        }

        let points: Vec<StepPoint> = readings
            .into_iter()
            .filter_map(|(step, values)| {
                self.aggregation
                    .apply(&values)
                    .filter(|v| v.is_finite())
                    .map(|value| StepPoint { step, value })
            })
            .collect();

        if points.is_empty() {
            return Err(DataError::DataNotFound {
                message: "no step produced readings for the selected ids".to_string(),
            }
            .into());
        }

        StepSeries::new(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const LOG: &str = "\
Data Record #1
===========================================================================
Step = 0
*Step  = 0
*Time  = 0
*Data  = Rx
1 0
5 0
7 0
*Step  = 1
*Time  = 0.1
*Data  = Rx
1 1.5
5 2.5
7 100
*Step  = 2
*Time  = 0.2
*Data  = Rx
1 3.0
5 -1.0e-1
7 200
";

    #[test]
    fn sums_only_kept_ids() {
        let parser = StepLogParser::new(Aggregation::Sum).with_ids([1, 5]);
        let series = parser.parse_str(LOG).unwrap();
        assert_eq!(series.steps(), vec![0, 1, 2]);
        assert_eq!(series.values(), vec![0.0, 4.0, 2.9]);
    }

    #[test]
    fn mean_over_kept_ids() {
        let parser = StepLogParser::new(Aggregation::Mean).with_ids([1, 5]);
        let series = parser.parse_str(LOG).unwrap();
        assert_eq!(series.values(), vec![0.0, 2.0, 1.45]);
    }

    #[test]
    fn no_filter_uses_every_row() {
        let parser = StepLogParser::new(Aggregation::Sum);
        let series = parser.parse_str(LOG).unwrap();
        assert_eq!(series.values()[1], 104.0);
    }

    #[test]
    fn rows_before_first_marker_are_ignored() {
        let text = "1 1000\n2 2000\n*Step = 4\n1 1.0\n";
        let series = StepLogParser::new(Aggregation::Sum).parse_str(text).unwrap();
        assert_eq!(series.steps(), vec![4]);
        assert_eq!(series.values(), vec![1.0]);
    }

    #[test]
    fn steps_without_kept_rows_are_dropped() {
        let text = "*Step = 0\n1 0\n*Step = 1\n9 10\n*Step = 2\n1 20\n";
        let series = StepLogParser::new(Aggregation::Sum)
            .with_ids([1])
            .parse_str(text)
            .unwrap();
        assert_eq!(series.steps(), vec![0, 2]);
        assert_eq!(series.values(), vec![0.0, 20.0]);
    }

    #[test]
    fn missing_ids_everywhere_is_data_not_found() {
        let text = "*Step = 0\n1 0\n*Step = 1\n2 10\n*Step = 2\n3 20\n";
        let err = StepLogParser::new(Aggregation::Sum)
            .with_ids([5])
            .parse_str(text)
            .unwrap_err();
        match err {
            FitError::Data(DataError::DataNotFound { .. }) => {}
            other => panic!("expected DataNotFound, got {other:?}"),
        }
    }

    #[test]
    fn unknown_aggregation_is_invalid_argument() {
        let err = "median".parse::<Aggregation>().unwrap_err();
        assert!(matches!(err, FitError::InvalidArgument(_)));
        assert_eq!("Mean".parse::<Aggregation>().unwrap(), Aggregation::Mean);
    }

    #[test]
    fn tolerates_invalid_utf8() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"*Step = 1\n\xff\xfe garbage\n1 2.5\n").unwrap();
        file.flush().unwrap();

        let series = StepLogParser::new(Aggregation::Sum).parse_file(file.path()).unwrap();
        assert_eq!(series.values(), vec![2.5]);
    }

    #[test]
    fn repeated_step_markers_merge() {
        let text = "*Step = 1\n1 1.0\n*Step = 1\n1 2.0\n";
        let series = StepLogParser::new(Aggregation::Sum).parse_str(text).unwrap();
        assert_eq!(series.steps(), vec![1]);
        assert_eq!(series.values(), vec![3.0]);
    }
}
