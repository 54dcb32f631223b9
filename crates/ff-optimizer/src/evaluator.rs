//! Evaluation cache, dedupe and stopping layer between a search driver and the
//! objective function.
//!
//! Lookup order for every candidate: the in-session cache, then the persisted
//! history of earlier sessions, then a real objective evaluation. Real
//! evaluations are appended to the evaluation log before the score is handed
//! back.

use ff_data::{CacheStats, EvaluationLog, ScoreCache};
use ff_types::{
    CacheKey, EvaluationRecord, FitError, FitResult, KeyPrecision, ParameterLayout, ParameterVector, ScoreSource,
    StopReason, PENALTY_SCORE,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::search::{Control, ScoredFunction};
use crate::status::SessionStatus;

/// Expensive scalar objective. Failed runs are expected to come back as
/// [`PENALTY_SCORE`]; an `Err` aborts the session.
pub trait Objective {
    fn evaluate(&mut self, params: &ParameterVector) -> FitResult<f64>;
}

/// When the session should stop asking for real evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StopPolicy {
    /// Stop once a real evaluation scores at or below this percentage.
    pub target_error: Option<f64>,
    /// Stop once this many real evaluations have been spent.
    pub max_evaluations: Option<usize>,
}

impl StopPolicy {
    pub fn new(target_error: Option<f64>, max_evaluations: Option<usize>) -> Self {
        Self {
            target_error,
            max_evaluations,
        }
    }

    fn check(&self, score: f64, real_evaluations: usize) -> Option<StopReason> {
        if self.target_error.map_or(false, |target| score <= target) {
            return Some(StopReason::TargetReached);
        }
        if self.max_evaluations.map_or(false, |cap| real_evaluations >= cap) {
            return Some(StopReason::EvalCapReached);
        }
        None
    }
}

/// Answer to one candidate vector
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub parameters: ParameterVector,
    pub key: CacheKey,
    pub score: f64,
    pub source: ScoreSource,
    /// Set once the session has been halted, on this call or an earlier one.
    pub stop: Option<StopReason>,
}

/// Wraps an [`Objective`] so that a search driver can call it freely.
pub struct CachedEvaluator<O: Objective> {
    objective: O,
    layout: ParameterLayout,
    precision: KeyPrecision,
    policy: StopPolicy,
    session: ScoreCache,
    history: ScoreCache,
    log: Option<EvaluationLog>,
    status: SessionStatus,
}

impl<O: Objective> CachedEvaluator<O> {
    pub fn new(objective: O, layout: ParameterLayout, policy: StopPolicy) -> Self {
        let mut status = SessionStatus::new();
        status.mark_running();
        Self {
            objective,
            layout,
            precision: KeyPrecision::default(),
            policy,
            session: ScoreCache::new(),
            history: ScoreCache::new(),
            log: None,
            status,
        }
    }

    pub fn with_precision(mut self, precision: KeyPrecision) -> Self {
        self.precision = precision;
        self.reload_history();
        self
    }

    /// Persist real evaluations to `log` and reuse what it already holds.
    pub fn with_log(mut self, log: EvaluationLog) -> Self {
        self.log = Some(log);
        self.reload_history();
        self
    }

    fn reload_history(&mut self) {
        if let Some(log) = &self.log {
            self.history = ScoreCache::from_entries(log.history(&self.precision));
            info!("Loaded {} reusable evaluations from history", self.history.len());
        }
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.status.stop_reason
    }

    pub fn log(&self) -> Option<&EvaluationLog> {
        self.log.as_ref()
    }

    pub fn session_stats(&self) -> CacheStats {
        self.session.get_stats()
    }

    pub fn objective(&self) -> &O {
        &self.objective
    }

    pub fn objective_mut(&mut self) -> &mut O {
        &mut self.objective
    }

    /// Mark the session failed after `error` aborted the search.
    pub fn abort(&mut self, error: &FitError) -> &SessionStatus {
        self.status.mark_failed(error.to_string());
        &self.status
    }

    /// Close the session and hand back its status.
    pub fn finish(mut self) -> (O, SessionStatus) {
        self.status.mark_completed();
        (self.objective, self.status)
    }

    /// Decode a search vector and evaluate it.
    pub fn evaluate_point(&mut self, x: &[f64]) -> FitResult<Evaluation> {
        let params = self.layout.decode(x)?;
        self.evaluate_params(params)
    }

    pub fn evaluate_params(&mut self, params: ParameterVector) -> FitResult<Evaluation> {
        let key = self.layout.cache_key(&params, &self.precision);

        if let Some(score) = self.session.get(&key) {
            debug!(%key, score, "Session cache hit");
            return Ok(self.answer(params, key, score, ScoreSource::Session));
        }

        if let Some(score) = self.history.get(&key) {
            debug!(%key, score, "Reusing evaluation from history");
            self.session.insert(key.clone(), score);
            self.status.update_best(&params, score, ScoreSource::History);
            return Ok(self.answer(params, key, score, ScoreSource::History));
        }

        if let Some(reason) = self.status.stop_reason {
            debug!(%key, %reason, "Session stopped; not evaluating");
            return Ok(self.answer(params, key, PENALTY_SCORE, ScoreSource::Suppressed));
        }

        let mut score = self.objective.evaluate(&params)?;
        if !score.is_finite() {
            warn!("Objective returned {} for {}; substituting penalty", score, params);
            score = PENALTY_SCORE;
        }

        if let Some(log) = self.log.as_mut() {
            log.append(&EvaluationRecord::new(params.clone(), score))?;
        }
        self.session.insert(key.clone(), score);

        if score >= PENALTY_SCORE {
            self.status.failed_evaluations += 1;
        }
        self.status.update_best(&params, score, ScoreSource::Solver);
        let evaluation = self.answer(params, key, score, ScoreSource::Solver);

        info!(
            n = self.status.real_evaluations,
            score,
            best = self.status.best_score(),
            "Evaluated {}",
            evaluation.parameters
        );

        if let Some(reason) = self.policy.check(score, self.status.real_evaluations) {
            info!(%reason, evaluations = self.status.real_evaluations, "Stopping calibration");
            self.status.stop_reason = Some(reason);
        }

        Ok(Evaluation {
            stop: self.status.stop_reason,
            ..evaluation
        })
    }

    fn answer(&mut self, parameters: ParameterVector, key: CacheKey, score: f64, source: ScoreSource) -> Evaluation {
        self.status.record(source);
        Evaluation {
            parameters,
            key,
            score,
            source,
            stop: self.status.stop_reason,
        }
    }
}

impl<O: Objective> ScoredFunction for CachedEvaluator<O> {
    fn call(&mut self, x: &[f64]) -> FitResult<(f64, Control)> {
        let evaluation = self.evaluate_point(x)?;
        let control = match evaluation.stop {
            Some(_) => Control::Stop,
            None => Control::Continue,
        };
        Ok((evaluation.score, control))
    }
}
