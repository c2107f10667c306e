use std::process::ExitCode;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agent_azure::agent::run;
use agent_azure::config::Args;
use agent_azure::context::RunContext;

/// Targets that drown `-vv` output in connection details.
const NOISY_TARGETS: [&str; 3] = ["reqwest", "hyper", "rustls"];

fn init_tracing(verbose: u8) {
    let level_filter = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };

    let mut env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();
    if verbose == 2 {
        for target in NOISY_TARGETS {
            if let Ok(directive) = format!("{target}=warn").parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    // stdout carries the agent sections
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true));
    if let Err(e) = subscriber.try_init() {
        eprintln!("Failed to set logger: {e}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    debug!("Parsed arguments: {:?}", args.masked());

    let ctx = match RunContext::from_args(args) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{}", e);
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    match run(&ctx).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("{e}");
            ExitCode::from(1)
        }
    }
}
