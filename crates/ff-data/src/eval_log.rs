//! Append-only CSV history of every real objective evaluation.
//!
//! Header layout: `timestamp`, then for each active coefficient pair `i` in
//! ascending order `log10_c{i}`, `c{i}`, `m{i}` (members the layout does not
//! declare are omitted), then `error_percent`. A file whose header does not
//! match the current layout is moved aside and a fresh log is started.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use ff_types::{
    CacheKey, DataError, EvaluationRecord, FitResult, KeyPrecision, ParameterLayout, PENALTY_SCORE,
};
use tracing::{debug, info, warn};

const TIMESTAMP: &str = "timestamp";
const ERROR_PERCENT: &str = "error_percent";
const LOG10_PREFIX: &str = "log10_";

/// One parsed row of the evaluation log
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub timestamp: DateTime<Utc>,
    /// Coefficient columns in header order, including the log10 helpers.
    pub values: Vec<(String, f64)>,
    pub error_percent: f64,
}

impl LogRow {
    pub fn is_penalty(&self) -> bool {
        self.error_percent >= PENALTY_SCORE
    }

    /// Coefficient values without the derived log10 columns.
    pub fn coefficients(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .filter(|(name, _)| !name.starts_with(LOG10_PREFIX))
            .map(|(name, v)| (name.clone(), *v))
            .collect()
    }
}

/// Aggregate view over a log
#[derive(Debug, Clone, PartialEq)]
pub struct LogSummary {
    pub count: usize,
    pub penalties: usize,
    /// Lowest non-penalty row.
    pub best: Option<LogRow>,
    pub mean: Option<f64>,
    /// Sample standard deviation (n - 1).
    pub std_dev: Option<f64>,
}

impl LogSummary {
    pub fn from_rows(rows: &[LogRow]) -> Self {
        let scored: Vec<&LogRow> = rows.iter().filter(|r| !r.is_penalty()).collect();
        let best = scored
            .iter()
            .min_by(|a, b| a.error_percent.total_cmp(&b.error_percent))
            .map(|r| (*r).clone());

        let n = scored.len();
        let mean = (n > 0).then(|| scored.iter().map(|r| r.error_percent).sum::<f64>() / n as f64);
        let std_dev = match mean {
            Some(mean) if n > 1 => {
                let var = scored
                    .iter()
                    .map(|r| (r.error_percent - mean).powi(2))
                    .sum::<f64>()
                    / (n - 1) as f64;
                Some(var.sqrt())
            }
            _ => None,
        };

        Self {
            count: rows.len(),
            penalties: rows.len() - n,
            best,
            mean,
            std_dev,
        }
    }
}

/// Persisted evaluation history bound to one coefficient layout
#[derive(Debug)]
pub struct EvaluationLog {
    path: PathBuf,
    layout: ParameterLayout,
    header: Vec<String>,
    rows: Vec<LogRow>,
}

impl EvaluationLog {
    /// Open (or create) the log at `path` for `layout`.
    pub fn open<P: AsRef<Path>>(path: P, layout: &ParameterLayout) -> FitResult<Self> {
        let path = path.as_ref().to_path_buf();
        let header = header_for(layout);

        let mut log = Self {
            path,
            layout: layout.clone(),
            header,
            rows: Vec::new(),
        };

        let has_content = fs::metadata(&log.path).map(|m| m.len() > 0).unwrap_or(false);
        if !has_content {
            log.write_header()?;
            info!("Started evaluation log at {}", log.path.display());
            return Ok(log);
        }

        let (file_header, rows) = read_rows(&log.path)?;
        if file_header != log.header {
            let stale = stale_path(&log.path, Utc::now());
            warn!(
                "Evaluation log {} has header {:?}, expected {:?}; moving it to {} and starting fresh",
                log.path.display(),
                file_header,
                log.header,
                stale.display()
            );
            fs::rename(&log.path, &stale)?;
            log.write_header()?;
            return Ok(log);
        }

        info!("Loaded {} prior evaluations from {}", rows.len(), log.path.display());
        log.rows = rows;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[LogRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append one record and flush it to disk before returning.
    pub fn append(&mut self, record: &EvaluationRecord) -> FitResult<()> {
        let row = self.row_for(record);

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);

        let mut fields = Vec::with_capacity(self.header.len());
        fields.push(row.timestamp.to_rfc3339());
        fields.extend(row.values.iter().map(|(_, v)| v.to_string()));
        fields.push(row.error_percent.to_string());
        wtr.write_record(&fields)?;
        wtr.flush()?;

        debug!("Appended evaluation {:.6} to {}", row.error_percent, self.path.display());
        self.rows.push(row);
        Ok(())
    }

    /// Cache keys and scores of every reusable logged evaluation.
    ///
    /// Logged values, fixed members of active pairs included, go into the
    /// key as written. Pairs with no active coefficient are not logged and
    /// take the layout's current values, so changing such a pair between
    /// sessions does not invalidate the log; start a new log when doing so.
    /// Rows whose values fall outside the current bounds are skipped.
    pub fn history(&self, precision: &KeyPrecision) -> Vec<(CacheKey, f64)> {
        self.rows
            .iter()
            .filter_map(|row| {
                let values = row.coefficients();
                let in_bounds = values.iter().all(|(name, v)| {
                    self.layout.get(name).map_or(false, |c| c.clamp(*v) == *v)
                });
                if !in_bounds {
                    debug!("Skipping logged evaluation outside current bounds: {:?}", values);
                    return None;
                }
                let mut full: BTreeMap<String, f64> = values;
                for coeff in self.layout.coefficients() {
                    full.entry(coeff.name.clone()).or_insert(coeff.initial);
                }
                match self.layout.vector(&full) {
                    Ok(params) => Some((self.layout.cache_key(&params, precision), row.error_percent)),
                    Err(e) => {
                        warn!("Ignoring logged evaluation: {}", e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn summary(&self) -> LogSummary {
        LogSummary::from_rows(&self.rows)
    }

    /// Summarize any log file, whatever layout wrote it.
    pub fn summarize_file<P: AsRef<Path>>(path: P) -> FitResult<LogSummary> {
        let (_, rows) = read_rows(path.as_ref())?;
        Ok(LogSummary::from_rows(&rows))
    }

    fn row_for(&self, record: &EvaluationRecord) -> LogRow {
        let values = self.header[1..self.header.len() - 1]
            .iter()
            .map(|column| {
                let value = match column.strip_prefix(LOG10_PREFIX) {
                    Some(name) => record.parameters.get(name).map(f64::log10),
                    None => record.parameters.get(column),
                };
                (column.clone(), value.unwrap_or(f64::NAN))
            })
            .collect();

        LogRow {
            timestamp: record.timestamp,
            values,
            error_percent: record.error_percent,
        }
    }

    fn write_header(&self) -> FitResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut wtr = WriterBuilder::new().from_path(&self.path)?;
        wtr.write_record(&self.header)?;
        wtr.flush()?;
        Ok(())
    }
}

fn header_for(layout: &ParameterLayout) -> Vec<String> {
    let mut header = vec![TIMESTAMP.to_string()];
    for pair in layout.active_pairs() {
        let magnitude = format!("c{pair}");
        let exponent = format!("m{pair}");
        if layout.get(&magnitude).is_some() {
            header.push(format!("{LOG10_PREFIX}{magnitude}"));
            header.push(magnitude);
        }
        if layout.get(&exponent).is_some() {
            header.push(exponent);
        }
    }
    header.push(ERROR_PERCENT.to_string());
    header
}

fn stale_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "evaluations".to_string());
    let stamp = now.format("%Y%m%dT%H%M%S");
    let name = match path.extension() {
        Some(ext) => format!("{}.stale-{}.{}", stem, stamp, ext.to_string_lossy()),
        None => format!("{}.stale-{}", stem, stamp),
    };
    path.with_file_name(name)
}

fn read_rows(path: &Path) -> FitResult<(Vec<String>, Vec<LogRow>)> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| DataError::ParseError {
            message: format!("Failed to open evaluation log {}: {}", path.display(), e),
        })?;
    let header: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();

    let well_formed = header.len() >= 2
        && header.first().map(String::as_str) == Some(TIMESTAMP)
        && header.last().map(String::as_str) == Some(ERROR_PERCENT);
    if !well_formed {
        return Ok((header, Vec::new()));
    }

    let mut rows = Vec::new();
    for (line_num, result) in rdr.records().enumerate() {
        let line = line_num + 2;
        match result.map_err(|e| e.to_string()).and_then(|r| parse_row(&header, &r)) {
            Ok(row) => rows.push(row),
            Err(e) => warn!("Skipping evaluation log line {}: {}", line, e),
        }
    }
    Ok((header, rows))
}

fn parse_row(header: &[String], record: &StringRecord) -> Result<LogRow, String> {
    if record.len() != header.len() {
        return Err(format!("expected {} fields, found {}", header.len(), record.len()));
    }
    let field = |idx: usize| record.get(idx).unwrap_or("");

    let timestamp = DateTime::parse_from_rfc3339(field(0))
        .map_err(|e| format!("bad timestamp '{}': {}", field(0), e))?
        .with_timezone(&Utc);

    let parse = |idx: usize| {
        field(idx)
            .parse::<f64>()
            .map_err(|_| format!("column '{}' is not numeric: '{}'", header[idx], field(idx)))
    };

    let last = header.len() - 1;
    let values = (1..last)
        .map(|idx| parse(idx).map(|v| (header[idx].clone(), v)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LogRow {
        timestamp,
        values,
        error_percent: parse(last)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ff_types::CoefficientDef;
    use tempfile::TempDir;

    fn layout() -> ParameterLayout {
        ParameterLayout::new(vec![
            CoefficientDef::magnitude(1, 1e-10, 1.0, 1e-3),
            CoefficientDef::exponent(1, -20.0, 20.0, 2.0).fixed(),
            CoefficientDef::magnitude(2, 1e-10, 1.0, 1e-4).fixed(),
            CoefficientDef::exponent(2, -20.0, 20.0, -2.0).fixed(),
        ])
        .unwrap()
    }

    fn record(layout: &ParameterLayout, c1: f64, score: f64) -> EvaluationRecord {
        let mut values = BTreeMap::new();
        values.insert("c1".to_string(), c1);
        EvaluationRecord::new(layout.vector(&values).unwrap(), score)
    }

    #[test]
    fn header_lists_active_pairs_only() {
        assert_eq!(
            header_for(&layout()),
            vec!["timestamp", "log10_c1", "c1", "m1", "error_percent"]
        );
    }

    #[test]
    fn append_then_reopen_restores_history() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run_log.csv");
        let layout = layout();
        let precision = KeyPrecision::default();

        {
            let mut log = EvaluationLog::open(&path, &layout).unwrap();
            assert!(log.is_empty());
            log.append(&record(&layout, 1e-3, 12.5)).unwrap();
            log.append(&record(&layout, 2e-3, PENALTY_SCORE)).unwrap();
        }

        let log = EvaluationLog::open(&path, &layout).unwrap();
        assert_eq!(log.len(), 2);
        let history = log.history(&precision);
        assert_eq!(history.len(), 2);

        let expected = layout.cache_key(&record(&layout, 1e-3, 0.0).parameters, &precision);
        assert!(history.iter().any(|(k, s)| *k == expected && *s == 12.5));
    }

    #[test]
    fn logged_fixed_values_are_part_of_the_history_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run_log.csv");
        let precision = KeyPrecision::default();
        {
            let layout = layout();
            let mut log = EvaluationLog::open(&path, &layout).unwrap();
            log.append(&record(&layout, 1e-3, 12.5)).unwrap();
        }

        // Same header, different fixed exponent for the active pair
        let changed = ParameterLayout::new(vec![
            CoefficientDef::magnitude(1, 1e-10, 1.0, 1e-3),
            CoefficientDef::exponent(1, -20.0, 20.0, 3.0).fixed(),
            CoefficientDef::magnitude(2, 1e-10, 1.0, 1e-4).fixed(),
            CoefficientDef::exponent(2, -20.0, 20.0, -2.0).fixed(),
        ])
        .unwrap();
        let log = EvaluationLog::open(&path, &changed).unwrap();
        assert_eq!(log.len(), 1);

        let candidate = changed.cache_key(&record(&changed, 1e-3, 0.0).parameters, &precision);
        let history = log.history(&precision);
        assert_eq!(history.len(), 1);
        assert!(history.iter().all(|(key, _)| *key != candidate));
    }

    #[test]
    fn mismatched_header_is_rotated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run_log.csv");
        fs::write(&path, "timestamp,log10_c1,c1,m1,log10_c2,c2,m2,error_percent\n").unwrap();

        let log = EvaluationLog::open(&path, &layout()).unwrap();
        assert!(log.is_empty());

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.starts_with("run_log.stale-") && n.ends_with(".csv")));

        let fresh = fs::read_to_string(&path).unwrap();
        assert_eq!(fresh.trim(), "timestamp,log10_c1,c1,m1,error_percent");
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        fs::write(
            &path,
            "timestamp,log10_c1,c1,m1,error_percent\n\
             2024-05-01T10:00:00+00:00,-3,0.001,2,7.5\n\
             not-a-date,-3,0.001,2,7.5\n\
             2024-05-01T10:05:00+00:00,-3,abc,2,7.5\n",
        )
        .unwrap();
        let log = EvaluationLog::open(&path, &layout()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.rows()[0].error_percent, 7.5);
    }

    #[test]
    fn summary_excludes_penalties_from_statistics() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let row = |score: f64| LogRow {
            timestamp: ts,
            values: vec![("c1".to_string(), 1e-3)],
            error_percent: score,
        };
        let rows = vec![row(10.0), row(PENALTY_SCORE), row(20.0), row(30.0)];

        let summary = LogSummary::from_rows(&rows);
        assert_eq!(summary.count, 4);
        assert_eq!(summary.penalties, 1);
        assert_eq!(summary.best.unwrap().error_percent, 10.0);
        assert_eq!(summary.mean, Some(20.0));
        assert_eq!(summary.std_dev, Some(10.0));
    }

    #[test]
    fn summary_of_empty_log() {
        let summary = LogSummary::from_rows(&[]);
        assert_eq!(summary.count, 0);
        assert!(summary.best.is_none());
        assert!(summary.mean.is_none());
        assert!(summary.std_dev.is_none());
    }

    #[test]
    fn stale_name_keeps_extension() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            stale_path(Path::new("/tmp/run_log.csv"), now),
            PathBuf::from("/tmp/run_log.stale-20240309T140507.csv")
        );
        assert_eq!(
            stale_path(Path::new("history"), now),
            PathBuf::from("history.stale-20240309T140507")
        );
    }
}
