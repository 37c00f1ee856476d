use anyhow::Result;
use clap::Parser;
use credstore::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credstore=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    credstore::cli::run(cli).await
}
