use anyhow::Result;
use clap::Parser;

use kube_fleet_manager::config::CliArgs;
use kube_fleet_manager::runner;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = CliArgs::parse();
    let exit_code = runner::run(&args, None).await?;
    std::process::exit(exit_code);
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
