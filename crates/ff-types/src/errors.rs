use std::time::Duration;
use thiserror::Error;

/// Main error type for febfit
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Model description error: {0}")]
    Model(#[from] ModelError),

    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FitError {
    /// Configuration-time errors abort the calibration; everything else is
    /// absorbed into the penalty score by the objective.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FitError::InvalidArgument(_) | FitError::Config(_))
    }
}

/// Errors raised while reading or rewriting the model description
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Element <{tag}> not found in {container}")]
    ElementNotFound { tag: String, container: String },

    #[error("Material id={material_id} not found")]
    MaterialNotFound { material_id: String },

    #[error("No <{tag} data=\"{channel}\"> found in logfile section")]
    ChannelNotFound { tag: String, channel: String },

    #[error("Region '{region}' not found")]
    RegionNotFound { region: String },

    #[error("Malformed model description: {message}")]
    Malformed { message: String },

    #[error("Value of <{tag}> is not numeric: {text}")]
    NotNumeric { tag: String, text: String },
}

/// Errors from the external solver boundary
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Solver timed out after {}s", .budget.as_secs_f64())]
    Timeout { budget: Duration },

    #[error("Solver exited with status {}", describe_exit(.code))]
    NonZeroExit { code: Option<i32> },

    #[error("Solver finished but expected output was not produced: {path}")]
    MissingOutput { path: String },

    #[error("Failed to launch solver {executable}: {message}")]
    LaunchFailed { executable: String, message: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

/// Data-related errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("No usable data: {message}")]
    DataNotFound { message: String },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Data parsing error: {message}")]
    ParseError { message: String },

    #[error("Non-finite score: {message}")]
    NonFinite { message: String },
}

/// Result type alias for febfit operations
pub type FitResult<T> = Result<T, FitError>;

/// Macro for creating invalid-argument errors
#[macro_export]
macro_rules! invalid_argument {
    ($($arg:tt)*) => {
        $crate::FitError::InvalidArgument(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::FitError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::FitError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SolverError::Timeout { budget: Duration::from_secs(120) };
        assert!(error.to_string().contains("timed out"));
        assert!(error.to_string().contains("120"));

        let error = SolverError::NonZeroExit { code: Some(3) };
        assert!(error.to_string().contains("status 3"));

        let error = SolverError::NonZeroExit { code: None };
        assert!(error.to_string().contains("signal"));
    }

    #[test]
    fn test_error_conversion() {
        let data_error = DataError::DataNotFound {
            message: "test".to_string(),
        };
        let fit_error: FitError = data_error.into();

        match fit_error {
            FitError::Data(_) => (),
            _ => panic!("Expected Data error"),
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(invalid_argument!("n must be >= 2, got {}", 1).is_fatal());
        assert!(config_error!("missing field: {}", "template").is_fatal());
        assert!(!FitError::from(SolverError::MissingOutput { path: "x".into() }).is_fatal());
        assert!(!internal_error!("boom").is_fatal());
    }
}
