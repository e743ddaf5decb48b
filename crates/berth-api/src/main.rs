//! Berth API server binary.

use anyhow::Result;

use berth_api::config::Config;
use berth_api::server::Server;
use berth_core::observability::{LogFormat, init_logging};

fn log_format(config: &Config) -> LogFormat {
    match std::env::var("BERTH_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        Ok(value) if value.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
        _ if config.debug => LogFormat::Pretty,
        _ => LogFormat::Json,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(log_format(&config));

    tracing::info!(
        port = config.port,
        debug = config.debug,
        "berth-api starting"
    );

    Server::new(config).serve().await?;

    Ok(())
}
