//! Calibration session wiring.
//!
//! Setup errors (bad configuration, missing template, region or experiment
//! columns) abort here. Once the search starts, solver-side failures only
//! ever show up as penalty scores.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ff_data::{EvaluationLog, ExperimentLoader};
use ff_optimizer::{BestEvaluation, CachedEvaluator, SearchOutcome, SessionId, SessionStatus};
use ff_solver::{FebInjector, ParameterInjector, ProcessInvoker, SolverInvoker};
use ff_types::{
    config_error, internal_error, FitResult, ParameterLayout, ParameterVector, StopReason,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{CalibrationConfig, InitialSource, InitialValue};
use crate::objective::{EvaluationReport, SolverObjective};

/// Result of a finished calibration session
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub session_id: SessionId,
    pub strategy: String,
    pub outcome: SearchOutcome,
    pub best: Option<BestEvaluation>,
    pub stop_reason: Option<StopReason>,
    pub status: SessionStatus,
    pub log_path: PathBuf,
    pub completed_at: DateTime<Utc>,
}

impl CalibrationReport {
    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.error_percent)
    }

    pub fn best_parameters(&self) -> Option<&ParameterVector> {
        self.best.as_ref().map(|b| &b.parameters)
    }
}

/// One calibration run built from a validated configuration.
#[derive(Debug, Clone)]
pub struct Calibration {
    config: CalibrationConfig,
}

impl Calibration {
    pub fn new(config: CalibrationConfig) -> FitResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn injector(&self) -> FebInjector {
        FebInjector::new(self.config.material_id.clone())
    }

    pub fn invoker(&self) -> FitResult<ProcessInvoker> {
        ProcessInvoker::with_args(&self.config.solver.executable, self.config.solver.args.clone())
    }

    /// Coefficient layout, with `initial = "template"` values read from the
    /// template's material and clamped to their bounds.
    pub fn layout<I: ParameterInjector>(&self, injector: &I) -> FitResult<ParameterLayout> {
        let from_template: Vec<String> = self
            .config
            .coefficients
            .iter()
            .filter(|c| c.initial == InitialValue::Source(InitialSource::Template))
            .map(|c| c.name())
            .collect();
        let current = if from_template.is_empty() {
            BTreeMap::new()
        } else {
            injector.read_parameters(&self.config.template, &from_template)?
        };

        let mut defs = Vec::with_capacity(self.config.coefficients.len());
        for coefficient in &self.config.coefficients {
            let name = coefficient.name();
            let initial = match coefficient.initial {
                InitialValue::Value(v) => v,
                InitialValue::Source(InitialSource::Template) => {
                    let raw = current
                        .get(&name)
                        .copied()
                        .ok_or_else(|| internal_error!("template value for {} was not read", name))?;
                    let clamped = raw.clamp(coefficient.low, coefficient.high);
                    if clamped != raw {
                        warn!(
                            "Template value {}={} outside [{}, {}], starting from {}",
                            name, raw, coefficient.low, coefficient.high, clamped
                        );
                    }
                    clamped
                }
            };
            defs.push(coefficient.to_def(initial));
        }
        ParameterLayout::new(defs)
    }

    /// Load the experiment and the region's entity ids and build the
    /// objective around `injector` and `invoker`.
    pub fn objective<I: ParameterInjector, S: SolverInvoker>(
        &self,
        injector: I,
        invoker: S,
    ) -> FitResult<SolverObjective<I, S>> {
        let ids = injector.extract_entity_ids(&self.config.template, &self.config.region)?;
        if ids.is_empty() {
            return Err(config_error!("region '{}' references no entities", self.config.region));
        }
        info!("Region '{}' selects {} entities", self.config.region, ids.len());

        let experiment = ExperimentLoader::new(self.config.experiment.spec.clone())?.load(&self.config.experiment.file)?;
        info!(
            "Loaded {} reference points from {}",
            experiment.len(),
            self.config.experiment.file.display()
        );

        let settings = self.config.objective_settings()?;
        fs::create_dir_all(&settings.run_root)?;

        Ok(SolverObjective::new(
            injector,
            invoker,
            self.config.template.clone(),
            experiment.signal,
            ids,
            settings,
        ))
    }

    /// Run the configured search against the real solver.
    pub fn run(&self) -> FitResult<CalibrationReport> {
        let invoker = self.invoker()?;
        self.run_with(self.injector(), invoker)
    }

    pub fn run_with<I: ParameterInjector, S: SolverInvoker>(
        &self,
        injector: I,
        invoker: S,
    ) -> FitResult<CalibrationReport> {
        let layout = self.layout(&injector)?;
        let objective = self.objective(injector, invoker)?;

        if let Some(parent) = self.config.log.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let log = EvaluationLog::open(&self.config.log, &layout)?;

        let mut strategy = self.config.search.build(layout.dimension())?;
        let x0 = layout.initial_point();
        let bounds = layout.search_bounds();
        let mut evaluator = CachedEvaluator::new(objective, layout, self.config.stop)
            .with_precision(self.config.precision)
            .with_log(log);

        info!(
            strategy = strategy.name(),
            dimension = x0.len(),
            target_error = self.config.stop.target_error,
            max_evaluations = self.config.stop.max_evaluations,
            "Starting calibration"
        );

        let outcome = match strategy.minimize(&mut evaluator, &x0, &bounds) {
            Ok(outcome) => outcome,
            Err(e) => {
                let status = evaluator.abort(&e);
                error!(
                    session_id = %status.id,
                    state = ?status.state,
                    real_evaluations = status.real_evaluations,
                    "Calibration aborted: {}",
                    e
                );
                return Err(e);
            }
        };

        let stop_reason = evaluator.stop_reason();
        let log_path = evaluator
            .log()
            .map(|log| log.path().to_path_buf())
            .unwrap_or_else(|| self.config.log.clone());
        let (_, status) = evaluator.finish();

        info!(
            termination = ?outcome.termination,
            real_evaluations = status.real_evaluations,
            failed = status.failed_evaluations,
            cache_hits = status.session_hits + status.history_hits,
            best = status.best_score(),
            "Calibration finished"
        );

        Ok(CalibrationReport {
            session_id: status.id,
            strategy: strategy.name().to_string(),
            outcome,
            best: status.best.clone(),
            stop_reason,
            status,
            log_path,
            completed_at: Utc::now(),
        })
    }

    /// Score one explicit parameter set, bypassing cache and log. Names not
    /// given take their initial value.
    pub fn evaluate_once(&self, values: &BTreeMap<String, f64>) -> FitResult<(ParameterVector, EvaluationReport)> {
        let invoker = self.invoker()?;
        self.evaluate_once_with(self.injector(), invoker, values)
    }

    pub fn evaluate_once_with<I: ParameterInjector, S: SolverInvoker>(
        &self,
        injector: I,
        invoker: S,
        values: &BTreeMap<String, f64>,
    ) -> FitResult<(ParameterVector, EvaluationReport)> {
        let layout = self.layout(&injector)?;
        let mut merged = layout.initial_vector().as_map().clone();
        merged.extend(values.iter().map(|(k, v)| (k.clone(), *v)));
        let params = layout.vector(&merged)?;

        let mut objective = self.objective(injector, invoker)?;
        let report = objective.evaluate_detailed(&params)?;
        Ok((params, report))
    }
}
