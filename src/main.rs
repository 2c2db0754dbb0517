use anyhow::Result;
use clap::Parser;
use quarri_mcp::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "quarri_mcp=info".into()),
        )
        .init();

    cli::run(Cli::parse()).await
}
