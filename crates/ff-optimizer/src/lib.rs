//! # ff-optimizer
//!
//! Turns an expensive, failure-prone objective into a function a search driver
//! can call freely: dedupe by rounded cache key, reuse of earlier sessions'
//! evaluations, best-so-far tracking and cooperative stopping. Also provides
//! the derivative-free search drivers.

mod evaluator;
mod search;
mod status;

pub use evaluator::{CachedEvaluator, Evaluation, Objective, StopPolicy};
pub use search::{
    BoundedScalar, Control, NelderMead, RandomSearch, ScoredFunction, SearchOutcome, SearchStrategy,
    Termination,
};
pub use status::{BestEvaluation, SessionId, SessionState, SessionStatus};
