//! Process entrypoint: parse CLI flags, build `Config`, initialize tracing,
//! and hand off to the app's bootstrap/run loop.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "relay-bot", about = "Chat-driven agent relay")]
struct Cli {
    /// TOML overrides file merged on top of env-derived defaults.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Overrides RELAY_STATE_DIR.
    #[arg(long)]
    state_dir: Option<std::path::PathBuf>,

    /// Overrides RUST_LOG-style filtering for this process only.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let mut config = relay_bot::config::Config::from_env();
    if let Some(path) = &cli.config {
        config = config.load_overrides_file(path)?;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "fatal misconfiguration");
        std::process::exit(1);
    }

    relay_bot::run(config).await
}
