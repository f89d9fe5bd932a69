/// The shell invocation handed to the supervisor.
///
/// Construction of the transcoder's arguments happens upstream; this type only
/// carries the finished, already-escaped command line and a scheduling priority.
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeCommand {
    shell: String,
    priority: i32,
}

impl TranscodeCommand {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            priority: 0,
        }
    }

    /// Niceness applied with `nice -n` on unix. Ignored elsewhere.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The exact line passed to the platform shell.
    pub fn command_line(&self) -> String {
        if cfg!(unix) && self.priority != 0 {
            format!("nice -n {} {}", self.priority, self.shell)
        } else {
            self.shell.clone()
        }
    }

    /// Build the process invocation: `sh -c` on unix, `cmd /C` elsewhere.
    pub(crate) fn to_process_command(&self) -> tokio::process::Command {
        let (shell, flag) = if cfg!(unix) { ("sh", "-c") } else { ("cmd", "/C") };
        if !cfg!(unix) && self.priority != 0 {
            tracing::debug!(priority = self.priority, "priority not supported on this platform");
        }
        let mut cmd = tokio::process::Command::new(shell);
        cmd.arg(flag).arg(self.command_line());
        cmd
    }
}

impl fmt::Display for TranscodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}
