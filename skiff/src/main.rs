use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Install the ring crypto provider before any TLS usage.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
    // Use JSON logs in production (SKIFF_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("SKIFF_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("skiff=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = skiff::config::Args::parse();
    let home = args.home.unwrap_or_else(skiff::config::default_home);
    tracing::info!(home = %home.display(), "Starting skiff");

    if args.reset {
        return skiff::server::reset(&home);
    }

    let server = skiff::server::Server::new(home)?;
    server.run().await
}
