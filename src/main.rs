use clap::Parser;
use delegation_engine::Cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("delegation_engine=info"));
    let (json, plain) = if cli.log_json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (
            None,
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();

    delegation_engine::run_with(cli)?;
    Ok(())
}
