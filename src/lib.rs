//! Supervision of long-running transcoder processes.
//!
//! A [`TranscodeSupervisor`] spawns a ready-made command line, follows its
//! diagnostic stream record by record, turns `time=` markers into normalized
//! progress, kills the process when it stops producing output, and optionally
//! validates what it wrote.

pub mod command;
pub mod config;
pub mod process;
pub mod progress;
pub mod reader;
pub mod supervisor;
pub mod validate;

pub use command::TranscodeCommand;
pub use config::{ConfigError, WatchConfig};
pub use process::{platform_terminator, ProcessError, ProcessHandle, Terminate, TerminationSignal};
pub use reader::{ActivityClock, LineTimeoutReader, ReaderError};
pub use supervisor::{
    ProgressCallback, RunOutcome, RunReport, SupervisorConfig, SupervisorError, TranscodeJob,
    TranscodeSupervisor, Validated,
};
pub use validate::{AlwaysValid, ArtifactValidator, ProbeValidator, ValidationPlan};
