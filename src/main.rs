use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use transcode_watch::{
    ProbeValidator, TranscodeCommand, TranscodeJob, TranscodeSupervisor, Validated, ValidationPlan,
    WatchConfig,
};

/// Run a transcoding command under supervision: report progress from its
/// diagnostic output, kill it when it hangs, and validate what it produced.
#[derive(Parser, Debug)]
#[command(name = "transcode-watch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "transcode-watch.toml")]
    config: PathBuf,

    /// Total media duration in seconds, used to normalize progress
    #[arg(short, long)]
    duration: f64,

    /// Expected output file (repeat for multi-artifact runs)
    #[arg(short, long = "output", value_name = "PATH")]
    outputs: Vec<PathBuf>,

    /// Outputs are numbered artifacts: check existence only
    #[arg(long)]
    multi: bool,

    /// Inactivity timeout in seconds (overrides config)
    #[arg(long, conflicts_with = "no_timeout")]
    timeout: Option<u64>,

    /// Disable the inactivity watchdog
    #[arg(long)]
    no_timeout: bool,

    /// Niceness for the transcoder (overrides config)
    #[arg(long, allow_hyphen_values = true)]
    priority: Option<i32>,

    /// Trust the exit and skip output validation
    #[arg(long)]
    no_validate: bool,

    /// Emit progress and result as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (records, watchdog decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// The command line to supervise, as one shell-escaped string
    /// (e.g. `-- 'ffmpeg -i "a b.mov" out.mp4'`). Passed to the shell verbatim.
    #[arg(allow_hyphen_values = true, value_name = "COMMAND")]
    command: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Progress { value: f64 },
    Done { output: Option<&'a str> },
    Failed { error: String },
}

fn print_event(event: &Event<'_>) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
    }
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match WatchConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut supervisor_config = config.supervisor_config();
    if cli.no_timeout {
        supervisor_config.inactivity_timeout = None;
    } else if let Some(secs) = cli.timeout {
        supervisor_config.inactivity_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    let validate = config.validation.enabled && !cli.no_validate;
    let validation = if !validate {
        None
    } else if cli.outputs.is_empty() {
        eprintln!("Error: validation requires at least one --output (or pass --no-validate)");
        return ExitCode::FAILURE;
    } else if cli.multi {
        Some(ValidationPlan::Numbered(cli.outputs.clone()))
    } else {
        Some(ValidationPlan::Single(cli.outputs[0].clone()))
    };

    let priority = cli.priority.unwrap_or(config.supervisor.priority);
    let job = TranscodeJob {
        command: TranscodeCommand::new(cli.command.as_str()).with_priority(priority),
        total_duration: cli.duration,
        validation,
    };

    if cli.dry_run {
        println!("transcode-watch v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Command: {}", job.command);
        println!("Total duration: {}s", job.total_duration);
        match supervisor_config.inactivity_timeout {
            Some(timeout) => println!("Inactivity timeout: {}s", timeout.as_secs()),
            None => println!("Inactivity timeout: disabled"),
        }
        println!("Poll interval: {}ms", supervisor_config.poll_interval.as_millis());
        println!("Record delimiter: {:?}", supervisor_config.record_delimiter);
        println!("Validation: {:?}", job.validation);
        return ExitCode::SUCCESS;
    }

    let supervisor = TranscodeSupervisor::new(supervisor_config)
        .with_validator(Arc::new(ProbeValidator::new(&config.validation.ffprobe)));

    let json = cli.json;
    let mut last_percent: i64 = -1;
    let mut on_progress = |value: f64| {
        if json {
            print_event(&Event::Progress { value });
            return;
        }
        let percent = (value * 100.0).floor() as i64;
        if percent != last_percent {
            last_percent = percent;
            println!("{percent:>3}%");
        }
    };

    let result = supervisor.run(&job, Some(&mut on_progress)).await;
    match result {
        Ok(validated) => {
            let output = match &validated {
                Some(Validated::Artifact(path)) => path.to_str(),
                Some(Validated::Multiple) | None => None,
            };
            if json {
                print_event(&Event::Done { output });
            } else if let Some(Validated::Artifact(path)) = &validated {
                println!("Encoded: {}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if json {
                print_event(&Event::Failed {
                    error: e.to_string(),
                });
            }
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_is_one_verbatim_string() {
        let cli = Cli::try_parse_from([
            "transcode-watch",
            "-d",
            "10",
            "--no-validate",
            "--",
            r#"ffmpeg -i "a b.mov" out.mp4"#,
        ])
        .unwrap();
        assert_eq!(cli.command, r#"ffmpeg -i "a b.mov" out.mp4"#);
    }

    #[test]
    fn test_unquoted_command_words_are_rejected() {
        let result = Cli::try_parse_from([
            "transcode-watch",
            "-d",
            "10",
            "--",
            "ffmpeg",
            "-i",
            "a b.mov",
        ]);
        assert!(result.is_err());
    }
}
