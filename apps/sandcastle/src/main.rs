use clap::Parser;
use sandcastle::cli::{self, Cli};
use sandcastle::config::AppConfig;
use sandcastle::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let cfg = AppConfig::from_env()?;
    init_tracing(&cfg.log_filter);
    cli::run(cli, cfg).await
}
