use std::{env, io, process};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use webd::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    error::{ConfigError, LifecycleError},
    lifecycle::{LaunchMode, StartOutcome, StopOutcome, SystemLifecycle},
};

fn main() {
    let args = parse_args();
    init_logging(&args);

    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        process::exit(err.exit_code());
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run(args: &Cli) -> Result<(), LifecycleError> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    let cwd = env::current_dir().map_err(ConfigError::CurrentDir)?;
    config.resolve_paths(&cwd);

    let mode = match args.command {
        Commands::Start { foreground: true } | Commands::Restart { foreground: true } => {
            LaunchMode::Foreground
        }
        _ => LaunchMode::Background,
    };
    let lifecycle = SystemLifecycle::from_config(&config, mode)?;

    match args.command {
        Commands::Start { .. } => {
            println!("Starting daemon...");
            report_start(lifecycle.start()?)
        }
        Commands::Stop => {
            println!("Attempting to stop the daemon...");
            match lifecycle.stop()? {
                StopOutcome::NotRunning => Err(LifecycleError::NotRunning {
                    path: lifecycle.pidfile(),
                }),
                StopOutcome::Stale { .. } => Ok(()),
                StopOutcome::Stopped { pid, forced } => {
                    if forced {
                        warn!("Daemon (PID {pid}) had to be killed");
                    }
                    Ok(())
                }
            }
        }
        Commands::Restart { .. } => {
            println!("Attempting to restart the daemon...");
            let outcome = lifecycle.restart()?;
            if outcome.stopped == StopOutcome::NotRunning {
                warn!(
                    "PID file '{}' does not exist. Daemon not running?",
                    lifecycle.pidfile().display()
                );
            }
            report_start(outcome.started)
        }
    }
}

fn report_start(outcome: StartOutcome) -> Result<(), LifecycleError> {
    match outcome {
        StartOutcome::AlreadyRunning { pid } => Err(LifecycleError::AlreadyRunning { pid }),
        StartOutcome::Launched { .. } => Ok(()),
        StartOutcome::Completed { pid } => {
            info!("Workload in PID {pid} returned");
            Ok(())
        }
    }
}
