use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use swarmpi_master::config::Cli;
use swarmpi_master::{App, AppHandle};

fn init_tracing(logs: bool) {
    let default_filter = if logs { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_pi(handle: &AppHandle) {
    let pi = handle.pi_stats();
    println!(
        "pi [{} decimals, {} bits]: {}",
        pi.pi_decimals, pi.precision_bits, pi.pi
    );
}

fn print_mem(handle: &AppHandle) {
    let stats = handle.server_stats();
    let mem = &stats.memory;
    println!(
        "jobs {} ({} result bytes) | merge buffer {} entries ({} bytes) | aggregate {} bits ({} bytes)",
        mem.jobs_tracked,
        mem.job_result_bytes,
        stats.merge_buffer,
        mem.merge_buffer_bytes,
        mem.aggregate_precision_bits,
        mem.aggregate_mantissa_bytes,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.logs);

    let handle = App::start(cli.into_config()).await?;
    println!(
        "swarmpi-master {} rpc={} http={}",
        env!("CARGO_PKG_VERSION"),
        handle.rpc_addr(),
        handle
            .http_addr()
            .map_or_else(|| "off".to_string(), |addr| addr.to_string()),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.request_stop();
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "" => {}
                    "pi" => print_pi(&handle),
                    "mem" => print_mem(&handle),
                    "exit" => {
                        handle.request_stop();
                        break;
                    }
                    other => println!("unknown command {other:?} (try: pi, mem, exit)"),
                },
                // No console (stdin closed): serve until interrupted.
                Ok(None) => {
                    let _ = tokio::signal::ctrl_c().await;
                    handle.request_stop();
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "console read failed");
                    let _ = tokio::signal::ctrl_c().await;
                    handle.request_stop();
                    break;
                }
            }
        }
    }

    handle.wait().await;
    Ok(())
}
