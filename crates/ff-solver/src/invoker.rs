//! External solver execution.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use ff_types::{invalid_argument, FitResult, SolverError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

/// Placeholder in solver arguments replaced by the model description path.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Environment variables that carry the thread budget to the solver and the
/// numeric libraries it links.
pub const THREAD_ENV_VARS: [&str; 3] = ["OMP_NUM_THREADS", "MKL_NUM_THREADS", "OPENBLAS_NUM_THREADS"];

/// One solver run
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub input: PathBuf,
    pub workdir: PathBuf,
    pub time_budget: Duration,
    pub threads: usize,
}

/// Result of a solver run that finished inside its time budget.
#[derive(Debug, Clone)]
pub struct SolveOutput {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl SolveOutput {
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == Some(0)
    }
}

/// Runs the solver. Blocks the calling thread until the run ends.
///
/// Exceeding the time budget must terminate the process and return
/// [`SolverError::Timeout`]; a non-zero exit is reported through
/// [`SolveOutput`] instead.
pub trait SolverInvoker {
    fn run(&self, request: &SolveRequest) -> FitResult<SolveOutput>;
}

/// Launches the solver as a child process
#[derive(Debug)]
pub struct ProcessInvoker {
    executable: PathBuf,
    args: Vec<String>,
    runtime: Runtime,
}

impl ProcessInvoker {
    /// Solver invoked as `<executable> -i <input>`.
    pub fn new<P: Into<PathBuf>>(executable: P) -> FitResult<Self> {
        Self::with_args(executable, vec!["-i".to_string(), INPUT_PLACEHOLDER.to_string()])
    }

    pub fn with_args<P: Into<PathBuf>>(executable: P, args: Vec<String>) -> FitResult<Self> {
        let executable = executable.into();
        if executable.as_os_str().is_empty() {
            return Err(invalid_argument!("solver executable path is empty"));
        }
        if !args.iter().any(|a| a.contains(INPUT_PLACEHOLDER)) {
            return Err(invalid_argument!(
                "solver arguments must reference the model file via {}",
                INPUT_PLACEHOLDER
            ));
        }

        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            executable,
            args,
            runtime,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn command(&self, request: &SolveRequest) -> Command {
        let input = request.input.to_string_lossy();
        let threads = request.threads.max(1).to_string();

        let mut cmd = Command::new(&self.executable);
        cmd.args(self.args.iter().map(|a| a.replace(INPUT_PLACEHOLDER, &input)))
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in THREAD_ENV_VARS {
            cmd.env(var, &threads);
        }
        cmd
    }

    async fn execute(&self, request: &SolveRequest) -> FitResult<SolveOutput> {
        let start = Instant::now();

        let mut child = self.command(request).spawn().map_err(|e| SolverError::LaunchFailed {
            executable: self.executable.display().to_string(),
            message: e.to_string(),
        })?;
        debug!(pid = child.id(), "Solver started on {}", request.input.display());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = tokio::time::timeout(request.time_budget, async {
            tokio::join!(child.wait(), drain(stdout), drain(stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to terminate timed-out solver: {}", e);
                }
                return Err(SolverError::Timeout {
                    budget: request.time_budget,
                }
                .into());
            }
        };
        let status = status?;

        Ok(SolveOutput {
            exit_code: status.code(),
            success: status.success(),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            duration: start.elapsed(),
        })
    }
}

impl SolverInvoker for ProcessInvoker {
    fn run(&self, request: &SolveRequest) -> FitResult<SolveOutput> {
        self.runtime.block_on(self.execute(request))
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("Solver output stream closed early: {}", e);
        }
    }
    buf
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use ff_types::FitError;
    use std::fs;
    use tempfile::TempDir;

    /// Shell stub run through `/bin/sh` so the script itself is never exec'd.
    fn stub(dir: &TempDir, body: &str) -> ProcessInvoker {
        let path = dir.path().join("solver.sh");
        fs::write(&path, format!("{body}\n")).unwrap();
        ProcessInvoker::with_args(
            "/bin/sh",
            vec![path.display().to_string(), "-i".to_string(), INPUT_PLACEHOLDER.to_string()],
        )
        .unwrap()
    }

    fn request(dir: &TempDir, budget: Duration) -> SolveRequest {
        SolveRequest {
            input: dir.path().join("model.feb"),
            workdir: dir.path().to_path_buf(),
            time_budget: budget,
            threads: 3,
        }
    }

    #[test]
    fn passes_input_and_thread_budget() {
        let dir = TempDir::new().unwrap();
        let invoker = stub(&dir, r#"echo "$1 $2 $OMP_NUM_THREADS $MKL_NUM_THREADS"; echo oops >&2; pwd > cwd.txt"#);
        let output = invoker.run(&request(&dir, Duration::from_secs(30))).unwrap();

        assert!(output.passed());
        let expected = format!("-i {} 3 3", dir.path().join("model.feb").display());
        assert_eq!(output.stdout.trim(), expected);
        assert_eq!(output.stderr.trim(), "oops");
        assert!(dir.path().join("cwd.txt").exists());
    }

    #[test]
    fn non_zero_exit_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let output = stub(&dir, "exit 3")
            .run(&request(&dir, Duration::from_secs(30)))
            .unwrap();
        assert!(!output.passed());
        assert_eq!(output.exit_code, Some(3));
    }

    #[test]
    fn time_budget_expiry_is_a_timeout() {
        let dir = TempDir::new().unwrap();
        let invoker = stub(&dir, "exec sleep 30");
        let start = Instant::now();
        let err = invoker
            .run(&request(&dir, Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, FitError::Solver(SolverError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_executable_fails_to_launch() {
        let dir = TempDir::new().unwrap();
        let err = ProcessInvoker::new(dir.path().join("no-such-solver"))
            .unwrap()
            .run(&request(&dir, Duration::from_secs(5)))
            .unwrap_err();
        assert!(matches!(err, FitError::Solver(SolverError::LaunchFailed { .. })));
    }

    #[test]
    fn arguments_must_reference_input() {
        assert!(ProcessInvoker::with_args("febio4", vec!["-silent".to_string()]).is_err());
        assert!(ProcessInvoker::with_args("febio4", vec!["-i".to_string(), "{input}".to_string()]).is_ok());
    }
}
