use clap::Parser;
use sift::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    sift::cli::execute(cli).await
}
