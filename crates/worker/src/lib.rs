//! Worker compute loop: connect to the master, ask for a term range, sum it,
//! send it back, repeat. Every transport failure funnels into one
//! reconnection path with a fixed delay, so at most one reconnect is ever in
//! progress.

pub mod client;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use swarmpi_bbp::{encode_float, job_precision, partial_sum};

use crate::client::MasterClient;

/// Worker configuration; the defaults match the deployed fleet.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Master RPC address.
    pub master_addr: std::net::SocketAddr,
    /// Heartbeat period.
    pub ping_interval: Duration,
    /// Dial attempts before giving up entirely.
    pub dial_attempts: u32,
    /// Delay between dial attempts.
    pub dial_retry: Duration,
    /// Delay before re-dialing after a live session drops.
    pub reconnect_delay: Duration,
    /// Delay before re-asking when the master has no work to give.
    pub idle_sleep: Duration,
}

impl WorkerConfig {
    /// Default heartbeat period.
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

    /// Default number of dial attempts.
    pub const DEFAULT_DIAL_ATTEMPTS: u32 = 20;

    /// Default delay between dial attempts.
    pub const DEFAULT_DIAL_RETRY: Duration = Duration::from_secs(5);

    /// Default delay before reconnecting a dropped session.
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

    /// Default idle delay when the master hands out no work.
    pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_secs(10);

    /// Defaults against the given master address.
    pub fn new(master_addr: std::net::SocketAddr) -> Self {
        Self {
            master_addr,
            ping_interval: Self::DEFAULT_PING_INTERVAL,
            dial_attempts: Self::DEFAULT_DIAL_ATTEMPTS,
            dial_retry: Self::DEFAULT_DIAL_RETRY,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            idle_sleep: Self::DEFAULT_IDLE_SLEEP,
        }
    }
}

/// Run the compute loop until the master is unreachable past the dial budget.
///
/// States: disconnected (dialing with backoff) → connected (registered,
/// heartbeat running) → working (range in flight), and back to disconnected
/// on any RPC failure after a fixed delay.
pub async fn run(cfg: WorkerConfig) -> anyhow::Result<()> {
    loop {
        let mut client = dial_with_backoff(&cfg).await?;

        let name = match client.connect().await {
            Ok(name) => name,
            Err(err) => {
                warn!(error = %err, "registration failed");
                tokio::time::sleep(cfg.reconnect_delay).await;
                continue;
            }
        };
        info!(%name, "registered with master");

        let link = Arc::new(Mutex::new(client));
        let (ping_failed_tx, mut ping_failed_rx) = mpsc::channel::<()>(1);
        let heartbeat = tokio::spawn(heartbeat_loop(
            link.clone(),
            name.clone(),
            cfg.ping_interval,
            ping_failed_tx,
        ));

        let failure = session(&link, &name, &cfg, &mut ping_failed_rx).await;
        heartbeat.abort();
        warn!(
            error = %failure,
            delay_secs = cfg.reconnect_delay.as_secs(),
            "session dropped, reconnecting"
        );
        tokio::time::sleep(cfg.reconnect_delay).await;
    }
}

async fn dial_with_backoff(cfg: &WorkerConfig) -> anyhow::Result<MasterClient> {
    let attempts = cfg.dial_attempts.max(1);
    for attempt in 1..=attempts {
        match MasterClient::dial(cfg.master_addr).await {
            Ok(client) => {
                info!(master = %cfg.master_addr, attempt, "connected");
                return Ok(client);
            }
            Err(err) => {
                warn!(master = %cfg.master_addr, attempt, error = %err, "dial failed");
                if attempt < attempts {
                    tokio::time::sleep(cfg.dial_retry).await;
                }
            }
        }
    }
    anyhow::bail!(
        "master at {} unreachable after {} attempts",
        cfg.master_addr,
        attempts
    )
}

/// Ask/compute/give until something breaks; the error is the reason the
/// session ended.
async fn session(
    link: &Mutex<MasterClient>,
    name: &str,
    cfg: &WorkerConfig,
    ping_failed: &mut mpsc::Receiver<()>,
) -> anyhow::Error {
    loop {
        tokio::select! {
            _ = ping_failed.recv() => return anyhow::anyhow!("heartbeat lost"),
            result = run_one_job(link, name, cfg) => {
                if let Err(err) = result {
                    return err;
                }
            }
        }
    }
}

async fn run_one_job(
    link: &Mutex<MasterClient>,
    name: &str,
    cfg: &WorkerConfig,
) -> anyhow::Result<()> {
    let assignment = { link.lock().await.ask(name).await? };
    if assignment.is_empty() {
        debug!("no work available, idling");
        tokio::time::sleep(cfg.idle_sleep).await;
        return Ok(());
    }

    let precision = job_precision(assignment.num_terms);
    info!(
        job_id = assignment.job_id,
        first_term = assignment.first_term,
        num_terms = assignment.num_terms,
        precision,
        "computing range"
    );

    let started = Instant::now();
    let sum = tokio::task::spawn_blocking(move || {
        partial_sum(assignment.first_term, assignment.num_terms, precision)
    })
    .await
    .context("compute task")?;
    let result_prec = sum.prec();
    let encoded = encode_float(&sum);
    info!(
        job_id = assignment.job_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        bytes = encoded.len(),
        "range computed"
    );

    link.lock()
        .await
        .give(assignment.job_id, encoded, result_prec)
        .await?;
    Ok(())
}

/// Pings on a fixed period, sharing the connection with the compute loop.
/// The first failed ping reports once and exits; the session loop turns that
/// into a reconnect.
async fn heartbeat_loop(
    link: Arc<Mutex<MasterClient>>,
    name: String,
    period: Duration,
    failed: mpsc::Sender<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let result = { link.lock().await.ping(&name).await };
        if let Err(err) = result {
            warn!(error = %err, "ping failed");
            let _ = failed.send(()).await;
            return;
        }
    }
}
