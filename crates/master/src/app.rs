//! The master aggregate: one registry, one ledger, the RPC verbs, and the
//! periodic liveness and merge drivers, created at start and torn down at
//! stop. No global state; everything hangs off an `Arc<App>`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use swarmpi_proto::{MASTER_RPC_PORT, Reply, Request};

use crate::ledger::Ledger;
use crate::registry::Registry;
use crate::stats::{PiStats, ServerStats};
use crate::{dashboard, persist, rpc, stats};

/// Master configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Initial per-job term count.
    pub term_size: u64,
    /// Delete the state file before starting.
    pub reset: bool,
    /// Enable the adaptive term-size shrinker.
    pub shrink_term_size: bool,
    /// RPC port (0 for ephemeral).
    pub rpc_port: u16,
    /// Dashboard HTTP port (0 for ephemeral, `None` to disable).
    pub http_port: Option<u16>,
    /// Where ledger state is persisted.
    pub state_path: PathBuf,
    /// How often the liveness scanner runs.
    pub liveness_interval: Duration,
    /// How often a merge pass is scheduled.
    pub merge_interval: Duration,
}

impl AppConfig {
    /// Default initial term-range size.
    pub const DEFAULT_TERM_SIZE: u64 = 5_000;

    /// Default liveness-scan period.
    pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

    /// Default merge period.
    pub const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_secs(10);
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            term_size: Self::DEFAULT_TERM_SIZE,
            reset: false,
            shrink_term_size: true,
            rpc_port: MASTER_RPC_PORT,
            http_port: Some(80),
            state_path: PathBuf::from(persist::STATE_FILE),
            liveness_interval: Self::DEFAULT_LIVENESS_INTERVAL,
            merge_interval: Self::DEFAULT_MERGE_INTERVAL,
        }
    }
}

/// The running master.
pub struct App {
    pub(crate) registry: Registry,
    pub(crate) ledger: Arc<Ledger>,
    stop: watch::Sender<bool>,
}

impl App {
    fn new(cfg: &AppConfig) -> Arc<Self> {
        let ledger = Arc::new(Ledger::new(
            cfg.state_path.clone(),
            cfg.term_size,
            cfg.shrink_term_size,
        ));

        let hook_ledger = ledger.clone();
        let registry = Registry::new(move |worker_name| {
            hook_ledger.mark_lost_by(worker_name);
        });

        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            registry,
            ledger,
            stop,
        })
    }

    /// Bind the listeners, restore state, and spawn the run loop.
    pub async fn start(cfg: AppConfig) -> anyhow::Result<AppHandle> {
        let app = Self::new(&cfg);

        if cfg.reset {
            app.ledger.delete_state_file();
        }
        {
            let ledger = app.ledger.clone();
            tokio::task::spawn_blocking(move || ledger.restore())
                .await
                .context("restore task")?;
        }

        let rpc_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.rpc_port))
            .await
            .with_context(|| format!("bind RPC port {}", cfg.rpc_port))?;
        let rpc_addr = rpc_listener.local_addr().context("RPC listener address")?;
        info!(%rpc_addr, "RPC listener started");

        let http = match cfg.http_port {
            Some(port) => {
                let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
                    .await
                    .with_context(|| format!("bind dashboard port {port}"))?;
                let addr = listener.local_addr().context("dashboard listener address")?;
                info!(%addr, "dashboard started");
                Some((listener, addr))
            }
            None => None,
        };
        let http_addr = http.as_ref().map(|(_, addr)| *addr);

        let join = tokio::spawn(run(
            app.clone(),
            cfg,
            rpc_listener,
            http.map(|(listener, _)| listener),
        ));

        Ok(AppHandle {
            app,
            rpc_addr,
            http_addr,
            join,
        })
    }

    /// Serve one RPC request.
    pub(crate) async fn dispatch(&self, request: Request, peer: SocketAddr) -> Reply {
        match request {
            Request::Connect { worker_ip } => {
                // A worker that cannot name its own address is registered
                // under the address it dialed from.
                let ip = worker_ip.parse().unwrap_or_else(|_| peer.ip());
                let worker_name = self.registry.connect(ip);
                self.persist_soon();
                Reply::Connect { worker_name }
            }
            Request::Ask { worker_name } => {
                let assignment = self.ledger.ask(&worker_name);
                self.persist_soon();
                Reply::Ask(assignment)
            }
            Request::Give {
                job_id,
                result,
                precision,
            } => {
                if self.ledger.give(job_id, result, precision) {
                    self.kick_merge();
                }
                Reply::Give
            }
            Request::Ping { worker_name } => {
                self.registry.notify_ping(&worker_name);
                Reply::Ping
            }
        }
    }

    /// Ask the run loop to shut down.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub(crate) fn stop_subscribe(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Current server-side view.
    pub fn server_stats(&self) -> ServerStats {
        stats::server_stats(&self.registry, &self.ledger)
    }

    /// Current π view.
    pub fn pi_stats(&self) -> PiStats {
        stats::pi_stats(&self.ledger)
    }

    fn scan_liveness(&self) {
        let evicted = self.registry.scan(Utc::now());
        let mut orphaned = 0;
        for name in &evicted {
            orphaned += self.ledger.mark_lost_by(name);
        }
        if orphaned > 0 {
            self.persist_soon();
        }
    }

    /// Schedule a merge pass off the async runtime. The merge gate inside the
    /// ledger keeps concurrent kicks from overlapping.
    pub(crate) fn kick_merge(&self) {
        let ledger = self.ledger.clone();
        let stop = self.stop.clone();
        tokio::task::spawn_blocking(move || match ledger.merge() {
            Ok(Some(_)) => ledger.save(),
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "merge cannot continue; shutting down (reset required)");
                stop.send_replace(true);
            }
        });
    }

    fn persist_soon(&self) {
        let ledger = self.ledger.clone();
        tokio::task::spawn_blocking(move || ledger.save());
    }
}

/// Handle to a running master.
pub struct AppHandle {
    app: Arc<App>,
    rpc_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    join: JoinHandle<()>,
}

impl AppHandle {
    /// Address the RPC listener is bound to.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Address the dashboard is bound to, when enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Current server-side view.
    pub fn server_stats(&self) -> ServerStats {
        self.app.server_stats()
    }

    /// Current π view.
    pub fn pi_stats(&self) -> PiStats {
        self.app.pi_stats()
    }

    /// Ask the master to shut down (idempotent).
    pub fn request_stop(&self) {
        self.app.request_stop();
    }

    /// Wait until the master has fully stopped and persisted.
    pub async fn wait(self) {
        if let Err(err) = self.join.await {
            error!(error = %err, "master run loop panicked");
        }
    }
}

async fn run(
    app: Arc<App>,
    cfg: AppConfig,
    rpc_listener: TcpListener,
    http_listener: Option<TcpListener>,
) {
    let rpc_task = tokio::spawn(rpc::serve(rpc_listener, app.clone()));
    let dashboard_task =
        http_listener.map(|listener| tokio::spawn(dashboard::serve(listener, app.clone())));

    let mut liveness = tokio::time::interval(cfg.liveness_interval);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut merge = tokio::time::interval(cfg.merge_interval);
    merge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut stop_rx = app.stop_subscribe();
    loop {
        tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
            _ = liveness.tick() => app.scan_liveness(),
            _ = merge.tick() => app.kick_merge(),
        }
    }

    rpc_task.abort();
    if let Some(task) = dashboard_task {
        task.abort();
    }

    // Waits out any in-flight merge, then persists one final time.
    let ledger = app.ledger.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || ledger.stop()).await {
        error!(error = %err, "final persist task failed");
    }
    info!("master stopped");
}
