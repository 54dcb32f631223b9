//! Solver-backed objective function.
//!
//! One evaluation runs inject, invoke, extract, align and score inside a
//! fresh run directory. Solver and data failures along the way are absorbed
//! into the penalty score so the search driver always sees a finite number.
//! Configuration errors abort instead.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ff_data::{Aggregation, AlignmentPolicy, ErrorMetric, StepLogParser};
use ff_optimizer::Objective;
use ff_solver::{ParameterInjector, SolveRequest, SolverInvoker};
use ff_types::{
    DataError, FitError, FitResult, ParameterVector, SolverError, StepSeries, PENALTY_SCORE,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Model description written into every run directory.
pub const MODEL_FILE: &str = "model.feb";
/// Solver's own log, written next to the model description.
pub const SOLVER_LOG_FILE: &str = "model.log";
/// Lines of the solver log surfaced on failure.
const LOG_TAIL_LINES: usize = 60;

/// When to leave a run directory on disk after the evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepRunDirs {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl KeepRunDirs {
    fn keeps(&self, failed: bool) -> bool {
        match self {
            KeepRunDirs::Never => false,
            KeepRunDirs::OnFailure => failed,
            KeepRunDirs::Always => true,
        }
    }
}

/// Which leading points of the simulated series are baseline, not data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselinePolicy {
    /// Keep only steps numbered above zero.
    #[default]
    DropStepZero,
    /// Drop the first recorded step, whatever its number.
    DropFirst,
    Keep,
}

impl BaselinePolicy {
    pub fn apply(&self, series: &StepSeries) -> StepSeries {
        match self {
            BaselinePolicy::DropStepZero => series.retain_steps(|step| step > 0),
            BaselinePolicy::DropFirst => series.skip(1),
            BaselinePolicy::Keep => series.clone(),
        }
    }
}

/// Output channel that carries the simulated signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputChannel {
    /// Element name inside the logfile section, e.g. `node_data`.
    pub tag: String,
    /// Value of its `data` attribute, e.g. `Rx`.
    pub data: String,
    /// File name the channel is redirected to inside the run directory.
    pub file: String,
}

impl Default for OutputChannel {
    fn default() -> Self {
        Self {
            tag: "node_data".to_string(),
            data: "Rx".to_string(),
            file: "node_rx force.txt".to_string(),
        }
    }
}

/// How a single evaluation is run and scored
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveSettings {
    pub output: OutputChannel,
    pub aggregation: Aggregation,
    pub baseline: BaselinePolicy,
    pub alignment: AlignmentPolicy,
    pub metric: ErrorMetric,
    pub time_budget: Duration,
    pub threads: usize,
    pub keep: KeepRunDirs,
    /// Parent directory for per-evaluation run directories.
    pub run_root: PathBuf,
    pub penalty: f64,
}

impl Default for ObjectiveSettings {
    fn default() -> Self {
        Self {
            output: OutputChannel::default(),
            aggregation: Aggregation::Sum,
            baseline: BaselinePolicy::default(),
            alignment: AlignmentPolicy::default(),
            metric: ErrorMetric::default(),
            time_budget: Duration::from_secs(120),
            threads: 6,
            keep: KeepRunDirs::Never,
            run_root: std::env::temp_dir(),
            penalty: PENALTY_SCORE,
        }
    }
}

/// Terminal state of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Scored,
    Timeout,
    NonZeroExit,
    MissingOutput,
    /// Injection, launch, extraction or scoring failed.
    Failed,
}

impl EvaluationOutcome {
    fn from_error(error: &FitError) -> Self {
        match error {
            FitError::Solver(SolverError::Timeout { .. }) => EvaluationOutcome::Timeout,
            FitError::Solver(SolverError::NonZeroExit { .. }) => EvaluationOutcome::NonZeroExit,
            FitError::Solver(SolverError::MissingOutput { .. }) => EvaluationOutcome::MissingOutput,
            _ => EvaluationOutcome::Failed,
        }
    }
}

/// Everything known about one finished evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub run_id: String,
    pub score: f64,
    pub outcome: EvaluationOutcome,
    /// Present only when the run directory was left on disk.
    pub run_dir: Option<PathBuf>,
    pub elapsed: Duration,
    pub solver_time: Option<Duration>,
    pub error: Option<String>,
}

impl EvaluationReport {
    pub fn is_penalty(&self) -> bool {
        self.outcome != EvaluationOutcome::Scored
    }
}

/// Scratch directory owned by one evaluation, removed on drop unless kept.
#[derive(Debug)]
pub struct RunDirectory {
    path: PathBuf,
    keep: bool,
}

impl RunDirectory {
    pub fn create(root: &Path, run_id: &str) -> FitResult<Self> {
        let path = root.join(format!("febfit_{run_id}"));
        fs::create_dir_all(&path)?;
        Ok(Self { path, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for RunDirectory {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("Failed to remove run directory {}: {}", self.path.display(), e);
        }
    }
}

/// [`Objective`] that scores a parameter vector by running the solver.
pub struct SolverObjective<I: ParameterInjector, S: SolverInvoker> {
    injector: I,
    invoker: S,
    template: PathBuf,
    reference: StepSeries,
    parser: StepLogParser,
    settings: ObjectiveSettings,
    evaluations: usize,
    last_report: Option<EvaluationReport>,
}

impl<I: ParameterInjector, S: SolverInvoker> SolverObjective<I, S> {
    /// `reference` is the experimental signal; `entity_ids` selects which
    /// rows of the solver's step log contribute to the simulated signal.
    pub fn new(
        injector: I,
        invoker: S,
        template: impl Into<PathBuf>,
        reference: StepSeries,
        entity_ids: Vec<i64>,
        settings: ObjectiveSettings,
    ) -> Self {
        let parser = StepLogParser::new(settings.aggregation).with_ids(entity_ids);
        Self {
            injector,
            invoker,
            template: template.into(),
            reference,
            parser,
            settings,
            evaluations: 0,
            last_report: None,
        }
    }

    pub fn settings(&self) -> &ObjectiveSettings {
        &self.settings
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn last_report(&self) -> Option<&EvaluationReport> {
        self.last_report.as_ref()
    }

    /// Run one evaluation and report how it ended. Solver and data errors
    /// come back as the penalty score with the matching outcome; only
    /// [`FitError::is_fatal`] errors are returned.
    pub fn evaluate_detailed(&mut self, params: &ParameterVector) -> FitResult<EvaluationReport> {
        self.evaluations += 1;
        let run_id = Uuid::new_v4().simple().to_string();
        let span = info_span!("febfit.evaluation", run_id = %run_id);
        let _enter = span.enter();
        let start = Instant::now();

        debug!(n = self.evaluations, "Evaluating {}", params);

        let mut run_dir = match RunDirectory::create(&self.settings.run_root, &run_id) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(stage = "setup", "Could not create run directory: {}", e);
                return Ok(self.finish(EvaluationReport {
                    run_id,
                    score: self.settings.penalty,
                    outcome: EvaluationOutcome::Failed,
                    run_dir: None,
                    elapsed: start.elapsed(),
                    solver_time: None,
                    error: Some(e.to_string()),
                }));
            }
        };

        let mut solver_time = None;
        let result = self.run_pipeline(run_dir.path(), params, &mut solver_time);

        let (score, outcome, error) = match result {
            Ok(score) => (score, EvaluationOutcome::Scored, None),
            Err(e) if e.is_fatal() => {
                error!(stage = "evaluate", "Aborting on configuration error: {}", e);
                return Err(e);
            }
            Err(e) => {
                let outcome = EvaluationOutcome::from_error(&e);
                warn!(?outcome, "Evaluation failed, scoring penalty: {}", e);
                (self.settings.penalty, outcome, Some(e.to_string()))
            }
        };

        let failed = outcome != EvaluationOutcome::Scored;
        let kept = self.settings.keep.keeps(failed);
        if kept {
            if matches!(outcome, EvaluationOutcome::NonZeroExit | EvaluationOutcome::MissingOutput) {
                log_diagnostics(run_dir.path());
            }
            info!("Keeping run directory {}", run_dir.path().display());
            run_dir.keep();
        }

        let elapsed = start.elapsed();
        info!(
            score,
            elapsed_ms = elapsed.as_millis() as u64,
            "Evaluation finished"
        );

        let report = EvaluationReport {
            run_id,
            score,
            outcome,
            run_dir: kept.then(|| run_dir.path().to_path_buf()),
            elapsed,
            solver_time,
            error,
        };
        drop(run_dir);
        Ok(self.finish(report))
    }

    fn finish(&mut self, report: EvaluationReport) -> EvaluationReport {
        self.last_report = Some(report.clone());
        report
    }

    fn run_pipeline(
        &self,
        dir: &Path,
        params: &ParameterVector,
        solver_time: &mut Option<Duration>,
    ) -> FitResult<f64> {
        let model = dir.join(MODEL_FILE);
        let output = dir.join(&self.settings.output.file);

        self.injector.write_parameters(&self.template, &model, params)?;
        self.injector
            .redirect_output(&model, &self.settings.output.tag, &self.settings.output.data, &output)?;

        let request = SolveRequest {
            input: model,
            workdir: dir.to_path_buf(),
            time_budget: self.settings.time_budget,
            threads: self.settings.threads,
        };
        let solved = self.invoker.run(&request)?;
        *solver_time = Some(solved.duration);
        info!(
            stage = "solve",
            elapsed_ms = solved.duration.as_millis() as u64,
            exit_code = solved.exit_code,
            "Solver finished"
        );

        if !solved.passed() {
            return Err(SolverError::NonZeroExit {
                code: solved.exit_code,
            }
            .into());
        }
        if !output.exists() {
            return Err(SolverError::MissingOutput {
                path: output.display().to_string(),
            }
            .into());
        }

        let simulated = self.settings.baseline.apply(&self.parser.parse_file(&output)?);
        if simulated.len() < 2 {
            return Err(DataError::InsufficientData {
                message: format!("{} simulated points after baseline removal", simulated.len()),
            }
            .into());
        }

        // Reference goes second: it normalizes the metric.
        let pair = self.settings.alignment.align(&simulated, &self.reference)?;
        self.settings.metric.score_percent(&pair)
    }
}

impl<I: ParameterInjector, S: SolverInvoker> Objective for SolverObjective<I, S> {
    fn evaluate(&mut self, params: &ParameterVector) -> FitResult<f64> {
        Ok(self.evaluate_detailed(params)?.score)
    }
}

fn log_diagnostics(dir: &Path) {
    let files: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(e) => {
            warn!("Cannot list {}: {}", dir.display(), e);
            return;
        }
    };
    warn!(files = ?files, "Run directory contents");

    match fs::read(dir.join(SOLVER_LOG_FILE)) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().collect();
            let tail = &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..];
            warn!("Last {} lines of {}:\n{}", tail.len(), SOLVER_LOG_FILE, tail.join("\n"));
        }
        Err(_) => warn!("{} not found", SOLVER_LOG_FILE),
    }
}
