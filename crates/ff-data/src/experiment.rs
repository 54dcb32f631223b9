//! Reference (experimental) data loading.

use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use ff_types::{invalid_argument, DataError, FitResult, StepSeries};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One weighted column contributing to the comparison signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelWeight {
    pub column: String,
    pub weight: f64,
}

impl ChannelWeight {
    pub fn new(column: impl Into<String>, weight: f64) -> Self {
        Self {
            column: column.into(),
            weight,
        }
    }
}

/// Which columns of the reference file make up the comparison channel.
///
/// The derived signal is `sum(weight_i * column_i)`. The default combines the
/// upper and lower shear force channels symmetrically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub displacement_column: String,
    pub channels: Vec<ChannelWeight>,
}

impl Default for ExperimentSpec {
    fn default() -> Self {
        Self {
            displacement_column: "X Displacement (mm)".to_string(),
            channels: vec![
                ChannelWeight::new("Force_Up_X (N)", 0.5),
                ChannelWeight::new("Force_Down_X (N)", -0.5),
            ],
        }
    }
}

/// Reference curve: displacement axis plus the derived comparison signal
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentData {
    pub displacement: Vec<f64>,
    /// Derived signal numbered 1..=n in file order.
    pub signal: StepSeries,
}

impl ExperimentData {
    pub fn len(&self) -> usize {
        self.signal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signal.is_empty()
    }
}

/// Loads tabular reference files
#[derive(Debug, Clone, Default)]
pub struct ExperimentLoader {
    spec: ExperimentSpec,
}

impl ExperimentLoader {
    pub fn new(spec: ExperimentSpec) -> FitResult<Self> {
        if spec.channels.is_empty() {
            return Err(invalid_argument!("experiment spec needs at least one channel column"));
        }
        if spec.channels.iter().any(|c| !c.weight.is_finite()) {
            return Err(invalid_argument!("experiment channel weights must be finite"));
        }
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &ExperimentSpec {
        &self.spec
    }

    pub fn load<P: AsRef<Path>>(&self, path: P) -> FitResult<ExperimentData> {
        let path = path.as_ref();
        info!("Loading experiment data from: {}", path.display());

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(|e| DataError::ParseError {
                message: format!("Failed to open experiment file {}: {}", path.display(), e),
            })?;

        let headers = rdr
            .headers()
            .map_err(|e| DataError::ParseError {
                message: format!("Failed to read experiment headers: {}", e),
            })?
            .clone();
        debug!("Experiment headers: {:?}", headers);

        let source = path.display().to_string();
        let x_idx = find_column(&headers, &self.spec.displacement_column, &source)?;
        let channel_idx = self
            .spec
            .channels
            .iter()
            .map(|c| find_column(&headers, &c.column, &source).map(|idx| (idx, c.weight)))
            .collect::<FitResult<Vec<_>>>()?;

        let mut displacement = Vec::new();
        let mut values = Vec::new();

        for (line_num, result) in rdr.records().enumerate() {
            let line = line_num + 2;
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable experiment row at line {}: {}", line, e);
                    continue;
                }
            };

            match parse_row(&record, x_idx, &channel_idx) {
                Some((x, v)) => {
                    displacement.push(x);
                    values.push(v);
                }
                None => warn!("Skipping experiment row at line {} with missing or non-numeric values", line),
            }
        }

        if values.is_empty() {
            return Err(DataError::DataNotFound {
                message: format!("experiment file {} has no numeric rows", source),
            }
            .into());
        }
        // Progress-normalized alignment needs both ends of the curve.
        if values.len() < 2 {
            return Err(DataError::InsufficientData {
                message: format!("experiment file {} has {} numeric row; need at least 2", source, values.len()),
            }
            .into());
        }

        info!("Loaded {} experiment points", values.len());
        Ok(ExperimentData {
            displacement,
            signal: StepSeries::from_values(&values),
        })
    }
}

fn find_column(headers: &StringRecord, name: &str, source: &str) -> FitResult<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| {
            DataError::DataNotFound {
                message: format!("required column '{}' not found in {}", name, source),
            }
            .into()
        })
}

fn parse_row(record: &StringRecord, x_idx: usize, channels: &[(usize, f64)]) -> Option<(f64, f64)> {
    let field = |idx: usize| {
        record
            .get(idx)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    };

    let x = field(x_idx)?;
    let mut value = 0.0;
    for &(idx, weight) in channels {
        value += weight * field(idx)?;
    }
    Some((x, value))
}
