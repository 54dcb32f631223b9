use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::params::ParameterVector;

/// Score handed to the optimizer whenever an evaluation cannot be completed.
pub const PENALTY_SCORE: f64 = 1e9;

/// One persisted objective evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub timestamp: DateTime<Utc>,
    pub parameters: ParameterVector,
    pub error_percent: f64,
}

impl EvaluationRecord {
    pub fn new(parameters: ParameterVector, error_percent: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            parameters,
            error_percent,
        }
    }

    pub fn is_penalty(&self) -> bool {
        self.error_percent >= PENALTY_SCORE
    }
}

/// Why the calibration loop asked the search driver to halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// A real evaluation scored at or below the target error.
    TargetReached,
    /// The configured number of real evaluations has been spent.
    EvalCapReached,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TargetReached => write!(f, "target error reached"),
            StopReason::EvalCapReached => write!(f, "evaluation cap reached"),
        }
    }
}

/// Where a score handed back to the optimizer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreSource {
    /// Repeat of a vector already scored in this session.
    Session,
    /// Reused from the persisted log of an earlier session.
    History,
    /// Fresh solver run.
    Solver,
    /// Not evaluated because the session had already been stopped.
    Suppressed,
}
