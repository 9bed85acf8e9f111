mod cli;

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use swarmpi_worker::{WorkerConfig, run};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_tracing();

    let cfg = WorkerConfig::new(SocketAddr::from((cli.ip, cli.port)));
    println!(
        "swarmpi-worker {} master={}",
        env!("CARGO_PKG_VERSION"),
        cfg.master_addr
    );

    tokio::select! {
        result = run(cfg) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            Ok(())
        }
    }
}
