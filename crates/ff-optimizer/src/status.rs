//! Session bookkeeping: lifecycle, counters and best-so-far.

use chrono::{DateTime, Utc};
use ff_types::{ParameterVector, ScoreSource, StopReason};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique calibration session identifier.
pub type SessionId = Uuid;

/// Lifecycle state for a calibration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Lowest score seen so far and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestEvaluation {
    pub parameters: ParameterVector,
    pub error_percent: f64,
    pub source: ScoreSource,
    pub found_at: DateTime<Utc>,
}

/// Aggregate status of a calibration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub state: SessionState,
    /// Fresh objective evaluations (solver runs).
    pub real_evaluations: usize,
    /// Real evaluations that came back as the penalty score.
    pub failed_evaluations: usize,
    pub session_hits: usize,
    pub history_hits: usize,
    /// Calls answered with the penalty after the session had stopped.
    pub suppressed: usize,
    pub best: Option<BestEvaluation>,
    pub stop_reason: Option<StopReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Pending,
            real_evaluations: 0,
            failed_evaluations: 0,
            session_hits: 0,
            history_hits: 0,
            suppressed: 0,
            best: None,
            stop_reason: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = SessionState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = SessionState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = SessionState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn record(&mut self, source: ScoreSource) {
        match source {
            ScoreSource::Session => self.session_hits += 1,
            ScoreSource::History => self.history_hits += 1,
            ScoreSource::Solver => self.real_evaluations += 1,
            ScoreSource::Suppressed => self.suppressed += 1,
        }
    }

    /// Replace the best evaluation if `error_percent` is strictly lower.
    /// Returns whether it improved.
    pub fn update_best(&mut self, parameters: &ParameterVector, error_percent: f64, source: ScoreSource) -> bool {
        let improved = match &self.best {
            None => true,
            Some(current) => error_percent < current.error_percent,
        };
        if improved {
            self.best = Some(BestEvaluation {
                parameters: parameters.clone(),
                error_percent,
                source,
                found_at: Utc::now(),
            });
        }
        improved
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.error_percent)
    }
}
