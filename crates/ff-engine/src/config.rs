//! Calibration configuration.
//!
//! Values are layered with the precedence CLI > environment > file >
//! defaults. Relative paths in a file are resolved against the file's
//! directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ff_data::{Aggregation, AlignmentPolicy, ErrorMetric, ExperimentSpec};
use ff_optimizer::{BoundedScalar, NelderMead, RandomSearch, SearchStrategy, StopPolicy};
use ff_types::{
    config_error, invalid_argument, CoefficientDef, CoefficientKind, FitResult, KeyPrecision, PENALTY_SCORE,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::objective::{BaselinePolicy, KeepRunDirs, ObjectiveSettings, OutputChannel};

pub const ENV_SOLVER: &str = "FEBFIT_SOLVER";
pub const ENV_THREADS: &str = "FEBFIT_THREADS";
pub const ENV_LOG: &str = "FEBFIT_LOG";

/// Where a coefficient's starting value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialSource {
    /// Read the current value out of the template's material.
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialValue {
    Value(f64),
    Source(InitialSource),
}

impl Default for InitialValue {
    fn default() -> Self {
        InitialValue::Source(InitialSource::Template)
    }
}

/// One coefficient as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientConfig {
    pub pair: usize,
    pub kind: CoefficientKind,
    pub low: f64,
    pub high: f64,
    #[serde(default)]
    pub initial: InitialValue,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl CoefficientConfig {
    pub fn name(&self) -> String {
        match self.kind {
            CoefficientKind::Magnitude => format!("c{}", self.pair),
            CoefficientKind::Exponent => format!("m{}", self.pair),
        }
    }

    /// Definition with `initial` as the starting value.
    pub fn to_def(&self, initial: f64) -> CoefficientDef {
        let def = match self.kind {
            CoefficientKind::Magnitude => CoefficientDef::magnitude(self.pair, self.low, self.high, initial),
            CoefficientKind::Exponent => CoefficientDef::exponent(self.pair, self.low, self.high, initial),
        };
        if self.active {
            def
        } else {
            def.fixed()
        }
    }
}

/// Reference data file and how its columns combine into the signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub file: PathBuf,
    #[serde(flatten)]
    pub spec: ExperimentSpec,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("experiment.csv"),
            spec: ExperimentSpec::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub executable: PathBuf,
    /// Arguments; `{input}` is replaced by the model description path.
    pub args: Vec<String>,
    pub time_budget_secs: u64,
    pub threads: usize,
    pub keep_runs: KeepRunDirs,
    /// Parent of the per-evaluation run directories.
    pub run_root: Option<PathBuf>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("febio4"),
            args: vec!["-i".to_string(), ff_solver::INPUT_PLACEHOLDER.to_string()],
            time_budget_secs: 120,
            threads: 6,
            keep_runs: KeepRunDirs::Never,
            run_root: None,
        }
    }
}

/// Search driver selection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SearchConfig {
    /// Bounded scalar search for one active coordinate, Nelder-Mead otherwise.
    #[default]
    Auto,
    BoundedScalar(BoundedScalar),
    NelderMead(NelderMead),
    Random(RandomSearch),
}

impl SearchConfig {
    pub fn build(&self, dimension: usize) -> FitResult<Box<dyn SearchStrategy>> {
        let strategy: Box<dyn SearchStrategy> = match self {
            SearchConfig::Auto if dimension == 1 => Box::new(BoundedScalar::default()),
            SearchConfig::Auto => Box::new(NelderMead::default()),
            SearchConfig::BoundedScalar(_) if dimension != 1 => {
                return Err(invalid_argument!(
                    "bounded_scalar search needs exactly one active coefficient, got {}",
                    dimension
                ))
            }
            SearchConfig::BoundedScalar(s) => Box::new(s.clone()),
            SearchConfig::NelderMead(s) => Box::new(s.clone()),
            SearchConfig::Random(s) => Box::new(s.clone()),
        };
        Ok(strategy)
    }
}

/// Complete configuration of a calibration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub template: PathBuf,
    pub material_id: String,
    /// Surface whose nodes make up the simulated signal.
    pub region: String,
    pub experiment: ExperimentConfig,
    pub output: OutputChannel,
    pub solver: SolverConfig,
    pub coefficients: Vec<CoefficientConfig>,
    pub precision: KeyPrecision,
    pub stop: StopPolicy,
    pub search: SearchConfig,
    /// `sum` or `mean`.
    pub aggregation: String,
    pub baseline: BaselinePolicy,
    pub metric: ErrorMetric,
    pub alignment: AlignmentPolicy,
    pub log: PathBuf,
    pub penalty: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            template: PathBuf::from("model.feb"),
            material_id: "1".to_string(),
            region: "PrescribedDisplacement4".to_string(),
            experiment: ExperimentConfig::default(),
            output: OutputChannel::default(),
            solver: SolverConfig::default(),
            coefficients: Vec::new(),
            precision: KeyPrecision::default(),
            stop: StopPolicy::default(),
            search: SearchConfig::default(),
            aggregation: Aggregation::Sum.to_string(),
            baseline: BaselinePolicy::default(),
            metric: ErrorMetric::default(),
            alignment: AlignmentPolicy::default(),
            log: PathBuf::from("run_log.csv"),
            penalty: PENALTY_SCORE,
        }
    }
}

/// Values given on the command line; `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub solver: Option<PathBuf>,
    pub threads: Option<usize>,
    pub keep_runs: bool,
    pub max_evaluations: Option<usize>,
    pub target_error: Option<f64>,
    pub log: Option<PathBuf>,
}

impl CalibrationConfig {
    pub fn from_toml(text: &str) -> FitResult<Self> {
        toml::from_str(text).map_err(|e| config_error!("invalid calibration file: {}", e))
    }

    /// Read a TOML file and resolve its relative paths.
    pub fn load<P: AsRef<Path>>(path: P) -> FitResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read {}: {}", path.display(), e))?;
        let mut config = Self::from_toml(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        debug!("Loaded calibration config from {}", path.display());
        Ok(config)
    }

    /// File, then environment, then CLI, then validation.
    pub fn load_layered<P: AsRef<Path>>(
        path: P,
        env: &HashMap<String, String>,
        cli: &CliOverrides,
    ) -> FitResult<Self> {
        let mut config = Self::load(path)?;
        let used = config.apply_env(env)?;
        if !used.is_empty() {
            debug!(keys = ?used, "Applied environment overrides");
        }
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.template);
        resolve(&mut self.experiment.file);
        resolve(&mut self.log);
        if let Some(root) = self.solver.run_root.as_mut() {
            resolve(root);
        }
    }

    /// Apply `FEBFIT_*` variables. Returns the keys that were used.
    pub fn apply_env(&mut self, env: &HashMap<String, String>) -> FitResult<Vec<String>> {
        let mut used = Vec::new();

        if let Some(value) = env.get(ENV_SOLVER) {
            self.solver.executable = PathBuf::from(value);
            used.push(ENV_SOLVER.to_string());
        }
        if let Some(value) = env.get(ENV_THREADS) {
            self.solver.threads = value
                .trim()
                .parse()
                .map_err(|_| config_error!("{} must be a positive integer, got '{}'", ENV_THREADS, value))?;
            used.push(ENV_THREADS.to_string());
        }
        if let Some(value) = env.get(ENV_LOG) {
            self.log = PathBuf::from(value);
            used.push(ENV_LOG.to_string());
        }

        Ok(used)
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(solver) = &cli.solver {
            self.solver.executable = solver.clone();
        }
        if let Some(threads) = cli.threads {
            self.solver.threads = threads;
        }
        if cli.keep_runs {
            self.solver.keep_runs = KeepRunDirs::OnFailure;
        }
        if let Some(cap) = cli.max_evaluations {
            self.stop.max_evaluations = Some(cap);
        }
        if let Some(target) = cli.target_error {
            self.stop.target_error = Some(target);
        }
        if let Some(log) = &cli.log {
            self.log = log.clone();
        }
    }

    pub fn validate(&self) -> FitResult<()> {
        self.aggregation_mode()?;

        if self.solver.time_budget_secs == 0 {
            return Err(invalid_argument!("solver.time_budget_secs must be positive"));
        }
        if self.solver.threads == 0 {
            return Err(invalid_argument!("solver.threads must be positive"));
        }
        if self.solver.executable.as_os_str().is_empty() {
            return Err(config_error!("solver.executable is empty"));
        }
        if self.output.file.trim().is_empty() || self.output.tag.trim().is_empty() {
            return Err(config_error!("output.tag and output.file must be set"));
        }
        if !(self.penalty.is_finite() && self.penalty >= PENALTY_SCORE) {
            return Err(invalid_argument!(
                "penalty must be finite and at least {:e}, got {}",
                PENALTY_SCORE,
                self.penalty
            ));
        }
        if matches!(self.stop.max_evaluations, Some(0)) {
            return Err(invalid_argument!("stop.max_evaluations must be positive"));
        }
        if let Some(target) = self.stop.target_error {
            if !(target.is_finite() && target >= 0.0) {
                return Err(invalid_argument!("stop.target_error must be a non-negative percentage, got {}", target));
            }
        }

        if self.coefficients.is_empty() {
            return Err(config_error!("no coefficients configured"));
        }
        let mut names = Vec::with_capacity(self.coefficients.len());
        for coefficient in &self.coefficients {
            let name = coefficient.name();
            if coefficient.pair == 0 {
                return Err(invalid_argument!("coefficient pairs are numbered from 1"));
            }
            if names.contains(&name) {
                return Err(invalid_argument!("coefficient {} configured twice", name));
            }
            if !(coefficient.low.is_finite() && coefficient.high.is_finite()) || coefficient.low >= coefficient.high {
                return Err(invalid_argument!(
                    "coefficient {}: bounds [{}, {}] are not an interval",
                    name,
                    coefficient.low,
                    coefficient.high
                ));
            }
            if coefficient.kind == CoefficientKind::Magnitude && coefficient.low <= 0.0 {
                return Err(invalid_argument!("magnitude coefficient {} needs positive bounds", name));
            }
            names.push(name);
        }
        if !self.coefficients.iter().any(|c| c.active) {
            return Err(invalid_argument!("at least one coefficient must be active"));
        }

        let dimension = self.coefficients.iter().filter(|c| c.active).count();
        self.search.build(dimension)?;
        Ok(())
    }

    pub fn aggregation_mode(&self) -> FitResult<Aggregation> {
        Aggregation::from_str(&self.aggregation)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.solver.time_budget_secs)
    }

    /// Run directories go under `solver.run_root`, else the user cache
    /// directory, else the system temp directory.
    pub fn run_root(&self) -> PathBuf {
        self.solver.run_root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|dir| dir.join("febfit").join("runs"))
                .unwrap_or_else(std::env::temp_dir)
        })
    }

    pub fn objective_settings(&self) -> FitResult<ObjectiveSettings> {
        Ok(ObjectiveSettings {
            output: self.output.clone(),
            aggregation: self.aggregation_mode()?,
            baseline: self.baseline,
            alignment: self.alignment,
            metric: self.metric,
            time_budget: self.time_budget(),
            threads: self.solver.threads,
            keep: self.solver.keep_runs,
            run_root: self.run_root(),
            penalty: self.penalty,
        })
    }

    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_experiment(mut self, file: impl Into<PathBuf>) -> Self {
        self.experiment.file = file.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_solver(mut self, executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.solver.executable = executable.into();
        self.solver.args = args;
        self
    }

    pub fn with_coefficient(mut self, coefficient: CoefficientConfig) -> Self {
        self.coefficients.push(coefficient);
        self
    }

    pub fn with_stop(mut self, stop: StopPolicy) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    pub fn with_log(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = log.into();
        self
    }

    pub fn with_run_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.solver.run_root = Some(root.into());
        self
    }

    pub fn with_keep_runs(mut self, keep: KeepRunDirs) -> Self {
        self.solver.keep_runs = keep;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_types::FitError;

    const SAMPLE: &str = r#"
template = "shear.feb"
region = "TopFace"
aggregation = "mean"
baseline = "drop_first"
metric = "mape"
log = "logs/run_log.csv"

[experiment]
file = "shear_sample35.csv"
displacement_column = "X Displacement (mm)"
channels = [
    { column = "Force_Up_X (N)", weight = 0.5 },
    { column = "Force_Down_X (N)", weight = -0.5 },
]

[solver]
executable = "/opt/febio/bin/febio4"
time_budget_secs = 300
threads = 4
keep_runs = "on_failure"

[[coefficients]]
pair = 1
kind = "magnitude"
low = 1e-6
high = 1e-1
initial = 1e-3

[[coefficients]]
pair = 1
kind = "exponent"
low = -20.0
high = 20.0

[[coefficients]]
pair = 2
kind = "magnitude"
low = 1e-8
high = 1e-2
initial = 1e-4
active = false

[stop]
target_error = 2.5
max_evaluations = 30

[search]
strategy = "nelder_mead"
max_iter = 80
"#;

    fn sample() -> CalibrationConfig {
        CalibrationConfig::from_toml(SAMPLE).unwrap()
    }

    #[test]
    fn parses_full_file() {
        let config = sample();
        assert_eq!(config.region, "TopFace");
        assert_eq!(config.aggregation_mode().unwrap(), Aggregation::Mean);
        assert_eq!(config.baseline, BaselinePolicy::DropFirst);
        assert_eq!(config.metric, ErrorMetric::Mape);
        assert_eq!(config.alignment, AlignmentPolicy::Resample);
        assert_eq!(config.solver.keep_runs, KeepRunDirs::OnFailure);
        assert_eq!(config.solver.args, vec!["-i", "{input}"]);
        assert_eq!(config.experiment.spec.channels.len(), 2);
        assert_eq!(config.stop, StopPolicy::new(Some(2.5), Some(30)));

        assert_eq!(config.coefficients.len(), 3);
        assert_eq!(config.coefficients[0].initial, InitialValue::Value(1e-3));
        assert_eq!(config.coefficients[1].initial, InitialValue::Source(InitialSource::Template));
        assert_eq!(config.coefficients[1].name(), "m1");
        assert!(!config.coefficients[2].active);

        match &config.search {
            SearchConfig::NelderMead(nm) => {
                assert_eq!(nm.max_iter, 80);
                assert_eq!(nm.xatol, NelderMead::default().xatol);
            }
            other => panic!("unexpected search {:?}", other),
        }
        config.validate().unwrap();
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = CalibrationConfig::from_toml(
            "[[coefficients]]\npair = 1\nkind = \"magnitude\"\nlow = 1e-6\nhigh = 1.0\n",
        )
        .unwrap();
        assert_eq!(config.material_id, "1");
        assert_eq!(config.output, OutputChannel::default());
        assert_eq!(config.search, SearchConfig::Auto);
        assert_eq!(config.precision, KeyPrecision::default());
        assert_eq!(config.penalty, PENALTY_SCORE);
        config.validate().unwrap();
    }

    #[test]
    fn precedence_is_cli_then_env_then_file_then_defaults() {
        let mut config = sample();
        let mut env = HashMap::new();
        env.insert(ENV_SOLVER.to_string(), "/env/febio4".to_string());
        env.insert(ENV_THREADS.to_string(), "8".to_string());

        let used = config.apply_env(&env).unwrap();
        assert_eq!(used.len(), 2);
        assert_eq!(config.solver.executable, PathBuf::from("/env/febio4"));
        assert_eq!(config.solver.threads, 8);

        config.apply_cli(&CliOverrides {
            threads: Some(2),
            max_evaluations: Some(5),
            ..CliOverrides::default()
        });
        assert_eq!(config.solver.executable, PathBuf::from("/env/febio4"));
        assert_eq!(config.solver.threads, 2);
        assert_eq!(config.stop.max_evaluations, Some(5));
        assert_eq!(config.stop.target_error, Some(2.5));
        assert_eq!(config.solver.time_budget_secs, 300);
        assert_eq!(config.material_id, "1");
    }

    #[test]
    fn bad_env_value_is_a_config_error() {
        let mut config = sample();
        let mut env = HashMap::new();
        env.insert(ENV_THREADS.to_string(), "many".to_string());
        assert!(matches!(config.apply_env(&env), Err(FitError::Config(_))));
    }

    #[test]
    fn relative_paths_follow_the_file() {
        let mut config = sample().with_run_root("scratch");
        config.resolve_paths(Path::new("/work/calib"));
        assert_eq!(config.template, PathBuf::from("/work/calib/shear.feb"));
        assert_eq!(config.experiment.file, PathBuf::from("/work/calib/shear_sample35.csv"));
        assert_eq!(config.log, PathBuf::from("/work/calib/logs/run_log.csv"));
        assert_eq!(config.run_root(), PathBuf::from("/work/calib/scratch"));
        assert_eq!(config.solver.executable, PathBuf::from("/opt/febio/bin/febio4"));
    }

    #[test]
    fn validation_rejects_bad_setups() {
        let mut unknown_mode = sample();
        unknown_mode.aggregation = "median".to_string();
        assert!(matches!(unknown_mode.validate(), Err(FitError::InvalidArgument(_))));

        let mut inverted = sample();
        inverted.coefficients[0].low = 1.0;
        inverted.coefficients[0].high = 1e-3;
        assert!(inverted.validate().is_err());

        let mut negative = sample();
        negative.coefficients[0].low = -1.0;
        assert!(negative.validate().is_err());

        let mut duplicate = sample();
        let again = duplicate.coefficients[0].clone();
        duplicate.coefficients.push(again);
        assert!(duplicate.validate().is_err());

        let mut no_budget = sample();
        no_budget.solver.time_budget_secs = 0;
        assert!(no_budget.validate().is_err());

        let mut all_fixed = sample();
        for c in &mut all_fixed.coefficients {
            c.active = false;
        }
        assert!(all_fixed.validate().is_err());

        let scalar_on_two = sample().with_search(SearchConfig::BoundedScalar(BoundedScalar::default()));
        assert!(scalar_on_two.validate().is_err());

        for target in [f64::NAN, f64::INFINITY, -0.5] {
            let bad_target = sample().with_stop(StopPolicy::new(Some(target), Some(10)));
            assert!(
                matches!(bad_target.validate(), Err(FitError::InvalidArgument(_))),
                "target {target} accepted"
            );
        }
        let zero_target = sample().with_stop(StopPolicy::new(Some(0.0), None));
        assert!(zero_target.validate().is_ok());
    }

    #[test]
    fn auto_search_depends_on_dimension() {
        assert_eq!(SearchConfig::Auto.build(1).unwrap().name(), "bounded_scalar");
        assert_eq!(SearchConfig::Auto.build(3).unwrap().name(), "nelder_mead");
    }

    #[test]
    fn layered_load_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("calib.toml");
        fs::write(&path, SAMPLE).unwrap();

        let mut env = HashMap::new();
        env.insert(ENV_LOG.to_string(), "/var/febfit/log.csv".to_string());
        let cli = CliOverrides {
            solver: Some(PathBuf::from("/cli/febio4")),
            keep_runs: true,
            ..CliOverrides::default()
        };

        let config = CalibrationConfig::load_layered(&path, &env, &cli).unwrap();
        assert_eq!(config.template, dir.path().join("shear.feb"));
        assert_eq!(config.log, PathBuf::from("/var/febfit/log.csv"));
        assert_eq!(config.solver.executable, PathBuf::from("/cli/febio4"));
        assert_eq!(config.solver.keep_runs, KeepRunDirs::OnFailure);
        assert_eq!(config.objective_settings().unwrap().time_budget, Duration::from_secs(300));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = CalibrationConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, FitError::Config(_)));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            CalibrationConfig::from_toml("template = [1, 2"),
            Err(FitError::Config(_))
        ));
    }
}
