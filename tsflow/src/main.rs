//! `tsflow`: parse a `-I input -P processor... -O output` plugin chain
//! from the command line and run it as a threaded pipeline.

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use tsflow::supervisor::{Supervisor, SupervisorError};
use tsflow::{control, parse_pipeline_args, CliError};

fn main() -> ExitCode {
    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let config = match parse_pipeline_args(&raw_args) {
        Ok(cfg) => cfg,
        Err(CliError::Help(text)) => {
            println!("{text}");
            return ExitCode::from(0);
        }
        Err(CliError::Version) => {
            println!("tsflow {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::from(0);
        }
        Err(e) => {
            eprintln!("tsflow: {e}");
            return ExitCode::from(1);
        }
    };

    init_logging(config.verbose, config.debug_level);

    match run(config) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("tsflow: {e}");
            ExitCode::from(2)
        }
    }
}

/// `--debug[=L]` picks an absolute filter level; `--verbose` (repeatable)
/// steps the default level up one notch per occurrence. Neither overrides
/// `RUST_LOG` if the user set it explicitly.
fn init_logging(verbose: u32, debug_level: Option<i64>) {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
        return;
    }
    let level = if let Some(l) = debug_level {
        match l {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();
}

fn run(config: pipeline_core::PipelineConfig) -> Result<i32, SupervisorError> {
    let stage_count = config.stage_count();
    let control_port = config.control_port.clone();
    let supervisor = Supervisor::build(&config)?;

    if let Some(addr) = control_port {
        let scheduler = supervisor.scheduler();
        if let Err(e) = control::ControlServer::bind(&addr, scheduler, stage_count) {
            tracing::warn!(error = %e, "failed to bind control socket");
        }
    }

    supervisor.run()
}
