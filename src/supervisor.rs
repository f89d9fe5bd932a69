/// Single transcode run: spawn the command, follow its diagnostic stream,
/// report progress, enforce the inactivity timeout and validate the result.
use crate::command::TranscodeCommand;
use crate::process::{platform_terminator, ProcessError, ProcessHandle, Terminate};
use crate::progress::{decode_record, parse_elapsed, progress_fraction};
use crate::reader::{LineTimeoutReader, ReaderError, DEFAULT_POLL_INTERVAL};
use crate::validate::{check_outputs, ArtifactValidator, ProbeValidator, ValidationPlan};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default inactivity window before a run is presumed hung.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Progress sink. Receives 0.0 at start, parsed samples, and 1.0 after validation.
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(f64) + Send);

/// Supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// `None` disables the watchdog.
    pub inactivity_timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Separator between progress records on the diagnostic stream.
    pub record_delimiter: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Some(DEFAULT_INACTIVITY_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            record_delimiter: "size=".to_string(),
        }
    }
}

/// Everything one run needs from its caller.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub command: TranscodeCommand,
    /// Total media duration in seconds, used to normalize progress.
    pub total_duration: f64,
    /// `None` runs in fire-and-forget mode: the exit is trusted and `run` returns `None`.
    pub validation: Option<ValidationPlan>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success {
        output: String,
    },
    /// Non-zero exit with validation disabled. Reported, never raised.
    SubprocessFailure {
        output: String,
        exit_code: Option<i32>,
    },
    TimedOut {
        output: String,
    },
    ValidationFailed {
        output: String,
        reasons: Vec<String>,
    },
}

impl RunOutcome {
    /// The accumulated diagnostic output, available regardless of outcome.
    pub fn output(&self) -> &str {
        match self {
            RunOutcome::Success { output }
            | RunOutcome::SubprocessFailure { output, .. }
            | RunOutcome::TimedOut { output }
            | RunOutcome::ValidationFailed { output, .. } => output,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }
}

/// Result of [`TranscodeSupervisor::execute`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub pid: u32,
    /// Exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

/// Value returned by [`TranscodeSupervisor::run`] when validation was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validated {
    /// The encoded file that passed validation.
    Artifact(PathBuf),
    /// A multi-artifact run whose files all exist.
    Multiple,
}

impl Validated {
    fn from_plan(plan: &ValidationPlan) -> Self {
        match plan {
            ValidationPlan::Single(path) => Validated::Artifact(path.clone()),
            ValidationPlan::Numbered(_) => Validated::Multiple,
        }
    }
}

/// Errors that cross the supervisor boundary.
#[derive(Debug)]
pub enum SupervisorError {
    /// The process could not be started.
    Spawn {
        command: String,
        source: ProcessError,
    },
    /// The diagnostic stream or the process wait failed.
    Io {
        command: String,
        output: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// No diagnostic output within the inactivity window; the process was killed.
    Hung { command: String, output: String },
    /// The run finished but its output did not validate.
    FailedEncoding {
        command: String,
        reasons: Vec<String>,
        output: String,
    },
}

impl SupervisorError {
    /// Diagnostic output collected before the failure, when there was any.
    pub fn output(&self) -> Option<&str> {
        match self {
            SupervisorError::Spawn { .. } => None,
            SupervisorError::Io { output, .. }
            | SupervisorError::Hung { output, .. }
            | SupervisorError::FailedEncoding { output, .. } => Some(output),
        }
    }
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { command, source } => {
                write!(f, "{}\ncommand: {}", source, command)
            }
            SupervisorError::Io {
                command,
                output,
                source,
            } => write!(
                f,
                "I/O error during transcode: {}\ncommand: {}\nFull output: {}",
                source, command, output
            ),
            SupervisorError::Hung { command, output } => {
                write!(f, "Process hung.\ncommand: {}\nFull output: {}", command, output)
            }
            SupervisorError::FailedEncoding {
                command,
                reasons,
                output,
            } => write!(
                f,
                "Failed encoding. Errors: {}.\ncommand: {}\nFull output: {}",
                reasons.join(", "),
                command,
                output
            ),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::Io { source, .. } => Some(source.as_ref()),
            SupervisorError::Hung { .. } | SupervisorError::FailedEncoding { .. } => None,
        }
    }
}

fn emit(progress: &mut Option<ProgressCallback<'_>>, value: f64) {
    if let Some(callback) = progress {
        callback(value);
    }
}

/// Runs transcode commands under an inactivity watchdog.
#[derive(Clone)]
pub struct TranscodeSupervisor {
    config: SupervisorConfig,
    terminator: Arc<dyn Terminate>,
    validator: Arc<dyn ArtifactValidator>,
}

impl TranscodeSupervisor {
    /// A supervisor using the platform terminator and ffprobe validation.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            terminator: platform_terminator(),
            validator: Arc::new(ProbeValidator::default()),
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn Terminate>) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ArtifactValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Run the job and map the outcome onto the two-mode contract.
    ///
    /// With validation: `Some(Validated)` on success, `FailedEncoding` otherwise.
    /// Without validation: `None` on any clean stream end, whatever the exit code.
    /// A hang is always `Hung`.
    pub async fn run(
        &self,
        job: &TranscodeJob,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<Option<Validated>, SupervisorError> {
        let report = self.execute(job, progress).await?;
        let command = job.command.to_string();

        match report.outcome {
            RunOutcome::TimedOut { output } => Err(SupervisorError::Hung { command, output }),
            RunOutcome::ValidationFailed { output, reasons } => {
                Err(SupervisorError::FailedEncoding {
                    command,
                    reasons,
                    output,
                })
            }
            RunOutcome::Success { .. } | RunOutcome::SubprocessFailure { .. } => {
                Ok(job.validation.as_ref().map(Validated::from_plan))
            }
        }
    }

    /// Run the job and report the full outcome.
    ///
    /// Only spawn and stream failures are returned as errors; hangs and
    /// validation failures are classified in the [`RunReport`].
    pub async fn execute(
        &self,
        job: &TranscodeJob,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<RunReport, SupervisorError> {
        let mut progress = progress;
        let command = job.command.to_string();
        tracing::info!(command = %command, "running transcoding");

        let start = Instant::now();
        let mut handle = ProcessHandle::spawn(&job.command, Arc::clone(&self.terminator))
            .map_err(|source| SupervisorError::Spawn {
                command: command.clone(),
                source,
            })?;
        let pid = handle.pid();

        let Some(stderr) = handle.take_stderr() else {
            Self::abandon(&mut handle).await;
            return Err(SupervisorError::Io {
                command,
                output: String::new(),
                source: "diagnostic stream was not captured".into(),
            });
        };

        emit(&mut progress, 0.0);

        let mut output = String::new();
        let total_duration = job.total_duration;
        let mut reader = LineTimeoutReader::new(stderr, self.config.record_delimiter.as_bytes())
            .with_timeout(self.config.inactivity_timeout)
            .with_poll_interval(self.config.poll_interval);

        let read_result = reader
            .for_each_record(|raw: &[u8]| {
                let record = decode_record(raw);
                output.push_str(&record);
                if let Some(elapsed) = parse_elapsed(&record) {
                    match progress_fraction(elapsed, total_duration) {
                        Some(fraction) => emit(&mut progress, fraction),
                        None => tracing::trace!(total_duration, "no usable duration, progress skipped"),
                    }
                }
            })
            .await;
        // Release the diagnostic stream before waiting on the child.
        drop(reader);

        match read_result {
            Ok(()) => {}
            Err(ReaderError::TimedOut { idle, timeout }) => {
                Self::abandon(&mut handle).await;
                tracing::error!(
                    command = %command,
                    pid,
                    idle_ms = idle.as_millis() as u64,
                    timeout_secs = timeout.as_secs_f64(),
                    output = %output,
                    "process hung"
                );
                return Ok(RunReport {
                    outcome: RunOutcome::TimedOut { output },
                    pid,
                    exit_code: None,
                    elapsed: start.elapsed(),
                });
            }
            Err(ReaderError::Io { source }) => {
                Self::abandon(&mut handle).await;
                tracing::error!(command = %command, pid, error = %source, "failed reading diagnostic stream");
                return Err(SupervisorError::Io {
                    command,
                    output,
                    source: Box::new(source),
                });
            }
        }

        let status = match handle.wait().await {
            Ok(status) => status,
            Err(source) => {
                return Err(SupervisorError::Io {
                    command,
                    output,
                    source: Box::new(source),
                })
            }
        };
        let exit_code = status.code();

        let outcome = match &job.validation {
            None if status.success() => {
                tracing::info!(pid, "transcoding finished");
                RunOutcome::Success { output }
            }
            None => {
                tracing::warn!(pid, exit_code = ?exit_code, "transcoder exited unsuccessfully, output not validated");
                RunOutcome::SubprocessFailure { output, exit_code }
            }
            Some(plan) => {
                let reasons = self.validate(plan).await;
                if reasons.is_empty() {
                    emit(&mut progress, 1.0);
                    tracing::info!(
                        command = %command,
                        outputs = ?plan.paths(),
                        "transcoding succeeded"
                    );
                    RunOutcome::Success { output }
                } else {
                    tracing::error!(
                        command = %command,
                        exit_code = ?exit_code,
                        reasons = %reasons.join(", "),
                        output = %output,
                        "failed encoding"
                    );
                    RunOutcome::ValidationFailed { output, reasons }
                }
            }
        };

        let elapsed = start.elapsed();
        tracing::debug!(pid, exit_code = ?exit_code, elapsed_ms = elapsed.as_millis() as u64, "run complete");

        Ok(RunReport {
            outcome,
            pid,
            exit_code,
            elapsed,
        })
    }

    /// Check the plan on a blocking thread, since the validator may run a probe.
    async fn validate(&self, plan: &ValidationPlan) -> Vec<String> {
        let plan = plan.clone();
        let validator = Arc::clone(&self.validator);
        match tokio::task::spawn_blocking(move || check_outputs(&plan, validator.as_ref())).await {
            Ok(reasons) => reasons,
            Err(e) => {
                tracing::error!(error = %e, "validation task failed");
                vec![format!("validation failed to run: {e}")]
            }
        }
    }

    /// Kill and reap the child after the run has been given up on.
    async fn abandon(handle: &mut ProcessHandle) {
        if let Err(e) = handle.terminate() {
            tracing::warn!(pid = handle.pid(), error = %e, "failed to terminate transcoder");
        }
        if let Err(e) = handle.wait().await {
            tracing::warn!(pid = handle.pid(), error = %e, "failed to reap transcoder");
        }
    }
}

impl std::fmt::Debug for TranscodeSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeSupervisor")
            .field("config", &self.config)
            .field("terminator", &self.terminator)
            .finish_non_exhaustive()
    }
}
