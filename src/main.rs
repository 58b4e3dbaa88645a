use anyhow::Result;
use clap::Parser;
use task_market_runtime::config::Config;
use task_market_runtime::serve;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "task-market-runtime", about = "Task market routing runtime")]
struct Cli {
    /// Override RUNTIME_BIND_ADDR for this run.
    #[arg(long)]
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Some(bind_addr) = cli.bind_addr {
        std::env::set_var("RUNTIME_BIND_ADDR", bind_addr);
    }

    let config = Config::from_env()?;
    serve(config).await
}
