/// Spawned transcoder process and its platform-specific termination.
///
/// On unix the child is started as the leader of a new process group so a
/// forced kill reaches the shell and everything it launched.
use crate::command::TranscodeCommand;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, ChildStderr};

/// Errors raised while spawning, signalling or reaping the child.
#[derive(Debug)]
pub enum ProcessError {
    /// Failed to spawn the subprocess.
    Spawn { source: std::io::Error },
    /// Failed to deliver the termination request.
    Terminate { pid: u32, source: std::io::Error },
    /// Failed to wait for the subprocess to exit.
    Wait { pid: u32, source: std::io::Error },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { source } => {
                write!(f, "failed to spawn transcode process: {}", source)
            }
            ProcessError::Terminate { pid, source } => {
                write!(f, "failed to terminate process {}: {}", pid, source)
            }
            ProcessError::Wait { pid, source } => {
                write!(f, "failed to wait for process {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source } => Some(source),
            ProcessError::Terminate { source, .. } => Some(source),
            ProcessError::Wait { source, .. } => Some(source),
        }
    }
}

/// The forced-termination request a [`Terminate`] implementation delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// POSIX SIGKILL: immediate and uncatchable.
    Kill,
    /// Forced termination through the host process API, value 1.
    Forced,
}

impl TerminationSignal {
    /// Raw value handed to the host.
    pub fn value(self) -> i32 {
        match self {
            TerminationSignal::Kill => 9,
            TerminationSignal::Forced => 1,
        }
    }
}

/// Platform strategy for stopping a hung child.
pub trait Terminate: Send + Sync + std::fmt::Debug {
    fn signal(&self) -> TerminationSignal;

    /// Deliver the termination request to the child spawned as `pid`.
    ///
    /// Must succeed quietly when the child is already gone. `pid` stays valid
    /// after the child has been reaped, so group members can still be reached.
    fn terminate(&self, pid: u32, child: &mut Child) -> Result<(), ProcessError>;
}

/// SIGKILL to the child's process group.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupKill;

#[cfg(unix)]
impl Terminate for GroupKill {
    fn signal(&self) -> TerminationSignal {
        TerminationSignal::Kill
    }

    fn terminate(&self, pid: u32, child: &mut Child) -> Result<(), ProcessError> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // killpg(0) would target our own group.
        if pid == 0 {
            return ForcedTerminate.terminate(pid, child);
        }

        // The group outlives its leader: the shell may be gone while a
        // process it started still holds the diagnostic stream.
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => {
                tracing::debug!(pid, "sent SIGKILL to process group");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => {
                tracing::warn!(pid, error = %errno, "killpg failed, killing process only");
                child.start_kill().map_err(|source| ProcessError::Terminate { pid, source })
            }
        }
    }
}

/// Forced termination through the process API (`TerminateProcess` with exit code 1).
#[derive(Debug, Default, Clone, Copy)]
pub struct ForcedTerminate;

impl Terminate for ForcedTerminate {
    fn signal(&self) -> TerminationSignal {
        TerminationSignal::Forced
    }

    fn terminate(&self, pid: u32, child: &mut Child) -> Result<(), ProcessError> {
        match child.start_kill() {
            Ok(()) => {
                tracing::debug!(pid, "forced termination requested");
                Ok(())
            }
            // Raised when the child has already been reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(ProcessError::Terminate { pid, source }),
        }
    }
}

/// The termination strategy for the host platform.
#[cfg(unix)]
pub fn platform_terminator() -> Arc<dyn Terminate> {
    Arc::new(GroupKill)
}

/// The termination strategy for the host platform.
#[cfg(not(unix))]
pub fn platform_terminator() -> Arc<dyn Terminate> {
    Arc::new(ForcedTerminate)
}

/// One running transcoder process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    terminator: Arc<dyn Terminate>,
}

impl ProcessHandle {
    /// Spawn `command` with stderr piped; stdin and stdout are discarded.
    pub fn spawn(
        command: &TranscodeCommand,
        terminator: Arc<dyn Terminate>,
    ) -> Result<Self, ProcessError> {
        let mut process = command.to_process_command();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0); // New process group for clean kill

        let child = process
            .spawn()
            .map_err(|source| ProcessError::Spawn { source })?;
        let pid = child.id().unwrap_or(0);
        tracing::debug!(pid, signal = ?terminator.signal(), "transcode process started");

        Ok(Self {
            child,
            pid,
            terminator,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the diagnostic stream. Returns `None` on the second call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Check if process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Forcefully terminate the process and, on unix, the rest of its group.
    ///
    /// Always delegates to the terminator, even when the direct child has
    /// exited; calling it again after everything is gone is a no-op.
    pub fn terminate(&mut self) -> Result<(), ProcessError> {
        self.terminator.terminate(self.pid, &mut self.child)
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        self.child.wait().await.map_err(|source| ProcessError::Wait {
            pid: self.pid,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_terminate_uses_value_one() {
        assert_eq!(ForcedTerminate.signal(), TerminationSignal::Forced);
        assert_eq!(ForcedTerminate.signal().value(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_platform_uses_sigkill() {
        let terminator = platform_terminator();
        assert_eq!(terminator.signal(), TerminationSignal::Kill);
        assert_eq!(terminator.signal().value(), nix::sys::signal::Signal::SIGKILL as i32);
    }

    #[cfg(not(unix))]
    #[test]
    fn test_non_unix_platform_uses_forced_value() {
        assert_eq!(platform_terminator().signal().value(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_running_process() {
        use std::os::unix::process::ExitStatusExt;

        let cmd = TranscodeCommand::new("sleep 30");
        let mut handle = ProcessHandle::spawn(&cmd, platform_terminator()).unwrap();
        assert!(handle.pid() > 0);
        assert!(handle.is_running());

        handle.terminate().unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGKILL as i32));
        assert!(!handle.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let cmd = TranscodeCommand::new("sleep 30");
        let mut handle = ProcessHandle::spawn(&cmd, platform_terminator()).unwrap();
        handle.terminate().unwrap();
        handle.terminate().unwrap();
        handle.wait().await.unwrap();
        handle.terminate().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_after_exit_is_ok() {
        let cmd = TranscodeCommand::new("exit 0");
        let mut handle = ProcessHandle::spawn(&cmd, platform_terminator()).unwrap();
        let status = handle.wait().await.unwrap();
        assert!(status.success());
        handle.terminate().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forced_terminate_after_exit_is_ok() {
        let cmd = TranscodeCommand::new("exit 0");
        let mut handle = ProcessHandle::spawn(&cmd, Arc::new(ForcedTerminate)).unwrap();
        handle.wait().await.unwrap();
        handle.terminate().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_reaches_group_after_leader_exit() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        let cmd = TranscodeCommand::new(format!("(sleep 1; touch '{}') &", marker.display()));
        let mut handle = ProcessHandle::spawn(&cmd, platform_terminator()).unwrap();

        // The shell exits at once and is reaped; its background job lives on.
        assert!(handle.wait().await.unwrap().success());
        assert!(!handle.is_running());

        handle.terminate().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_is_piped() {
        use tokio::io::AsyncReadExt;

        let cmd = TranscodeCommand::new("printf 'diag' >&2");
        let mut handle = ProcessHandle::spawn(&cmd, platform_terminator()).unwrap();
        let mut stderr = handle.take_stderr().unwrap();
        assert!(handle.take_stderr().is_none());

        let mut text = String::new();
        stderr.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "diag");
        handle.wait().await.unwrap();
    }
}
