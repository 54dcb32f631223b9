//! # ff-engine
//!
//! The calibration loop: a solver-backed objective, configuration layering,
//! tracing setup and the session that drives a search over it.

pub mod config;
pub mod objective;
pub mod session;
pub mod telemetry;

pub use config::{
    CalibrationConfig, CliOverrides, CoefficientConfig, ExperimentConfig, InitialSource, InitialValue, SearchConfig,
    SolverConfig,
};
pub use objective::{
    BaselinePolicy, EvaluationOutcome, EvaluationReport, KeepRunDirs, ObjectiveSettings, OutputChannel, RunDirectory,
    SolverObjective,
};
pub use session::{Calibration, CalibrationReport};
pub use telemetry::init_tracing;
