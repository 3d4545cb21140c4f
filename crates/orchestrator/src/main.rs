use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use orchestrator::{Orchestrator, OrchestratorError, OrchestratorResult, config};
use sandbox_process::ProcessFactory;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the sandbox, bring up its services and run until SIGINT/SIGTERM
    Run(RunArgs),
    /// Validate a config file and print the effective configuration
    CheckConfig(CheckConfigArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to orchestrator.yaml config file
    #[arg(long, short, env = "ORCHESTRATOR_CONFIG")]
    config: PathBuf,
    /// Deploy a function before start, as NAME=PATH (repeatable)
    #[arg(long = "function", value_name = "NAME=PATH", value_parser = parse_function)]
    functions: Vec<(String, PathBuf)>,
}

#[derive(Args)]
struct CheckConfigArgs {
    /// Path to orchestrator.yaml config file
    #[arg(long, short)]
    config: PathBuf,
}

fn parse_function(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::CheckConfig(args) => check_config(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn check_config(args: CheckConfigArgs) -> OrchestratorResult<()> {
    let config = config::load(&args.config).await?;
    let yaml = serde_yaml_ng::to_string(&config)
        .map_err(|e| OrchestratorError::Config(format!("serialize config: {e}")))?;
    print!("{yaml}");
    Ok(())
}

async fn run(args: RunArgs) -> OrchestratorResult<()> {
    let config = config::load(&args.config).await?;
    let process = config.sandbox.process.clone().ok_or_else(|| {
        OrchestratorError::Config("sandbox.process is required for the process backend".into())
    })?;
    let monitor_interval = Duration::from_millis(config.monitor.interval_ms);
    let factory = ProcessFactory::new(process)?;
    let orchestrator = Orchestrator::new(config, Arc::new(factory))?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for (name, path) in &args.functions {
        let code = tokio::fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::Config(format!("read function {name} from {}: {e}", path.display()))
        })?;
        orchestrator.registry().deploy(name, &code)?;
    }

    orchestrator.start().await?;
    if !monitor_interval.is_zero() {
        orchestrator.monitor().start_monitoring(monitor_interval);
    }

    wait_for_signal().await;

    orchestrator.stop().await?;
    info!("orchestrator exited");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => {
            info!("received SIGTERM, stopping");
        }
        _ = recv_signal(&mut sigint) => {
            info!("received SIGINT, stopping");
        }
    }
}

async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_flag_parses_name_and_path() {
        assert_eq!(
            parse_function("echo=fns/echo.ts").unwrap(),
            ("echo".to_string(), PathBuf::from("fns/echo.ts"))
        );
        assert!(parse_function("echo").is_err());
        assert!(parse_function("=x.ts").is_err());
    }

    #[test]
    fn cli_accepts_repeated_functions() {
        let cli = Cli::try_parse_from([
            "orchestrator",
            "run",
            "--config",
            "o.yaml",
            "--function",
            "a=a.ts",
            "--function",
            "b=b.ts",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.functions.len(), 2);
    }
}
