//! febfit - material coefficient calibration against an external FE solver.
//!
//! ## Commands
//!
//! - `run`: calibrate the configured coefficients
//! - `evaluate`: score one explicit parameter set
//! - `nodes`: list the entity ids of a model region
//! - `summary`: summarize an evaluation log

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ff_data::EvaluationLog;
use ff_engine::{init_tracing, Calibration, CalibrationConfig, CliOverrides};
use ff_solver::{FebInjector, ParameterInjector};
use serde::Serialize;
use tracing::Level;

#[derive(Parser)]
#[command(name = "febfit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Calibrate material coefficients by driving an external FE solver", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON results
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a calibration session
    Run {
        /// Calibration file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Solver executable
        #[arg(long)]
        solver: Option<PathBuf>,

        /// Thread budget handed to the solver
        #[arg(long)]
        threads: Option<usize>,

        /// Keep the run directories of failed evaluations
        #[arg(long)]
        keep_runs: bool,

        /// Stop after this many solver runs
        #[arg(long)]
        max_evals: Option<usize>,

        /// Stop once the error drops to this percentage
        #[arg(long)]
        target: Option<f64>,

        /// Evaluation log (CSV)
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Score one parameter set without touching the cache or log
    Evaluate {
        #[arg(short, long)]
        config: PathBuf,

        /// Solver executable
        #[arg(long)]
        solver: Option<PathBuf>,

        /// Keep the run directory afterwards
        #[arg(long)]
        keep_runs: bool,

        /// Coefficient assignments such as `c1=1e-3 m1=2.0`
        #[arg(value_parser = parse_assignment)]
        values: Vec<(String, f64)>,
    },

    /// Print the entity ids referenced by a region of a model file
    Nodes {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(short, long)]
        region: String,
    },

    /// Summarize an evaluation log
    Summary {
        #[arg(short, long, default_value = "run_log.csv")]
        log: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            solver,
            threads,
            keep_runs,
            max_evals,
            target,
            log,
        } => {
            let overrides = CliOverrides {
                solver,
                threads,
                keep_runs,
                max_evaluations: max_evals,
                target_error: target,
                log,
            };
            cmd_run(&config, &overrides, cli.json)
        }
        Commands::Evaluate {
            config,
            solver,
            keep_runs,
            values,
        } => {
            let overrides = CliOverrides {
                solver,
                keep_runs,
                ..CliOverrides::default()
            };
            cmd_evaluate(&config, &overrides, values, cli.json)
        }
        Commands::Nodes { model, region } => cmd_nodes(&model, &region, cli.json),
        Commands::Summary { log } => cmd_summary(&log, cli.json),
    }
}

fn load_config(path: &Path, overrides: &CliOverrides) -> Result<CalibrationConfig> {
    let env: HashMap<String, String> = std::env::vars().collect();
    CalibrationConfig::load_layered(path, &env, overrides)
        .with_context(|| format!("Failed to load calibration config {}", path.display()))
}

fn cmd_run(config: &Path, overrides: &CliOverrides, json: bool) -> Result<()> {
    let calibration = Calibration::new(load_config(config, overrides)?)?;
    let report = calibration.run().context("Calibration failed")?;

    if json {
        return print_json(&report);
    }

    println!("Strategy:     {}", report.strategy);
    println!("Termination:  {:?}", report.outcome.termination);
    if let Some(reason) = report.stop_reason {
        println!("Stopped:      {}", reason);
    }
    println!(
        "Evaluations:  {} solver runs ({} failed), {} cache hits",
        report.status.real_evaluations,
        report.status.failed_evaluations,
        report.status.session_hits + report.status.history_hits
    );
    println!("Log:          {}", report.log_path.display());

    match &report.best {
        Some(best) => {
            println!("Best error:   {:.4}%", best.error_percent);
            for (name, value) in best.parameters.iter() {
                println!("  {:<4} = {:.6e}", name, value);
            }
            Ok(())
        }
        None => bail!("No evaluation produced a score"),
    }
}

fn cmd_evaluate(config: &Path, overrides: &CliOverrides, values: Vec<(String, f64)>, json: bool) -> Result<()> {
    let calibration = Calibration::new(load_config(config, overrides)?)?;
    let values: BTreeMap<String, f64> = values.into_iter().collect();
    let (params, report) = calibration.evaluate_once(&values)?;

    if json {
        #[derive(Serialize)]
        struct Output<'a> {
            parameters: &'a ff_types::ParameterVector,
            report: &'a ff_engine::EvaluationReport,
        }
        return print_json(&Output {
            parameters: &params,
            report: &report,
        });
    }

    println!("Parameters:   {}", params);
    println!("Outcome:      {:?}", report.outcome);
    println!("Error:        {:.4}%", report.score);
    println!("Elapsed:      {:.1}s", report.elapsed.as_secs_f64());
    if let Some(dir) = &report.run_dir {
        println!("Run dir:      {}", dir.display());
    }
    if let Some(error) = &report.error {
        println!("Failure:      {}", error);
    }
    Ok(())
}

fn cmd_nodes(model: &Path, region: &str, json: bool) -> Result<()> {
    let ids = FebInjector::default()
        .extract_entity_ids(model, region)
        .with_context(|| format!("Failed to read region '{}' from {}", region, model.display()))?;

    if json {
        return print_json(&ids);
    }
    println!("{} entities in '{}':", ids.len(), region);
    let line: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    println!("{}", line.join(" "));
    Ok(())
}

fn cmd_summary(log: &Path, json: bool) -> Result<()> {
    let summary = EvaluationLog::summarize_file(log)
        .with_context(|| format!("Failed to read evaluation log {}", log.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "count": summary.count,
            "penalties": summary.penalties,
            "mean": summary.mean,
            "std_dev": summary.std_dev,
            "best": summary.best.as_ref().map(|row| serde_json::json!({
                "timestamp": row.timestamp,
                "coefficients": row.coefficients(),
                "error_percent": row.error_percent,
            })),
        }));
    }

    println!("Evaluations:  {} ({} penalties)", summary.count, summary.penalties);
    if let Some(mean) = summary.mean {
        println!("Mean error:   {:.4}%", mean);
    }
    if let Some(std_dev) = summary.std_dev {
        println!("Std dev:      {:.4}%", std_dev);
    }
    if let Some(best) = &summary.best {
        println!("Best error:   {:.4}% at {}", best.error_percent, best.timestamp.to_rfc3339());
        for (name, value) in best.coefficients() {
            println!("  {:<4} = {:.6e}", name, value);
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse `name=value`.
fn parse_assignment(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for {}: {}", name.trim(), e))?;
    Ok((name.trim().to_string(), value))
}
