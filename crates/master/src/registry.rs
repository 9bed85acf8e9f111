//! Worker registry: naming, heartbeat tracking, liveness eviction.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{info, warn};

use crate::sync::lock;

/// A worker silent for longer than this many seconds is marked unavailable.
pub const PING_TIMEOUT_SECS: i64 = 10;

/// Successive missed probes after which a worker is evicted.
pub const MAX_MISSED_PINGS: u32 = 5;

const NAME_LEN: usize = 8;

/// One registered worker.
#[derive(Debug, Clone)]
pub struct Worker {
    /// Master-assigned name, unique for the life of the process.
    pub name: String,
    /// Remote address the worker reported on `Connect`.
    pub ip: IpAddr,
    /// Cleared when the worker goes silent, restored on the next ping.
    pub available: bool,
    /// Last heartbeat received.
    pub last_ping: DateTime<Utc>,
    /// Successive liveness probes this worker has missed.
    pub missed_pings: u32,
}

/// Registry of connected workers.
///
/// The orphan hook is invoked (with no registry lock held) whenever a worker
/// (re)connects or is evicted, so the job ledger can mark that worker's
/// in-flight jobs as lost without the registry knowing the ledger type.
pub struct Registry {
    workers: Mutex<HashMap<String, Worker>>,
    orphan_jobs: Box<dyn Fn(&str) + Send + Sync>,
}

impl Registry {
    /// Create an empty registry with the given orphan hook.
    pub fn new(orphan_jobs: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            orphan_jobs: Box::new(orphan_jobs),
        }
    }

    /// Register a worker by IP, returning its name.
    ///
    /// Idempotent by address: a known IP gets its previous name back with its
    /// liveness state refreshed. Both paths fire the orphan hook — a
    /// reconnecting worker may have crashed with jobs in flight, and a fresh
    /// one has nothing to orphan anyway.
    pub fn connect(&self, ip: IpAddr) -> String {
        let now = Utc::now();
        let name = {
            let mut workers = lock(&self.workers);

            if let Some(existing) = workers.values_mut().find(|w| w.ip == ip) {
                existing.available = true;
                existing.missed_pings = 0;
                existing.last_ping = now;
                info!(name = %existing.name, %ip, "worker reconnected");
                existing.name.clone()
            } else {
                let mut name = random_name();
                while workers.contains_key(&name) {
                    name = random_name();
                }
                workers.insert(
                    name.clone(),
                    Worker {
                        name: name.clone(),
                        ip,
                        available: true,
                        last_ping: now,
                        missed_pings: 0,
                    },
                );
                info!(%name, %ip, "worker registered");
                name
            }
        };

        (self.orphan_jobs)(&name);
        name
    }

    /// Record a heartbeat. Returns false for unknown names, which callers
    /// ignore; the worker will re-register on its next reconnect.
    pub fn notify_ping(&self, worker_name: &str) -> bool {
        let mut workers = lock(&self.workers);
        match workers.get_mut(worker_name) {
            Some(worker) => {
                worker.last_ping = Utc::now();
                worker.available = true;
                worker.missed_pings = 0;
                true
            }
            None => false,
        }
    }

    /// One liveness sweep at time `now`.
    ///
    /// Every worker silent for more than [`PING_TIMEOUT_SECS`] gets a missed-probe
    /// strike and loses availability; workers past [`MAX_MISSED_PINGS`]
    /// strikes are evicted and their names returned so the ledger can
    /// reassign their jobs.
    pub fn scan(&self, now: DateTime<Utc>) -> Vec<String> {
        let evicted: Vec<String> = {
            let mut workers = lock(&self.workers);

            for worker in workers.values_mut() {
                if now - worker.last_ping > Duration::seconds(PING_TIMEOUT_SECS) {
                    worker.missed_pings += 1;
                    worker.available = false;
                    warn!(
                        name = %worker.name,
                        missed = worker.missed_pings,
                        "worker silent, deactivating"
                    );
                }
            }

            let names: Vec<String> = workers
                .values()
                .filter(|w| w.missed_pings > MAX_MISSED_PINGS)
                .map(|w| w.name.clone())
                .collect();
            for name in &names {
                workers.remove(name);
                warn!(%name, "worker evicted after repeated missed pings");
            }
            names
        };

        for name in &evicted {
            (self.orphan_jobs)(name);
        }
        evicted
    }

    /// Snapshot of all registered workers for read-only consumers.
    pub fn list(&self) -> Vec<Worker> {
        let workers = lock(&self.workers);
        let mut list: Vec<Worker> = workers.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

fn random_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_registry() -> (Registry, Arc<AtomicUsize>) {
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = hook_calls.clone();
        let registry = Registry::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        (registry, hook_calls)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn connect_is_idempotent_by_ip() {
        let (registry, hook_calls) = counting_registry();

        let first = registry.connect(ip(1));
        let second = registry.connect(ip(1));
        assert_eq!(first, second);
        assert_eq!(registry.list().len(), 1);
        // The hook fires on the reconnect too.
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);

        let other = registry.connect(ip(2));
        assert_ne!(first, other);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn names_are_alphanumeric_and_fixed_length() {
        let (registry, _) = counting_registry();
        let name = registry.connect(ip(1));
        assert_eq!(name.len(), NAME_LEN);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ping_refreshes_and_unknown_names_are_reported() {
        let (registry, _) = counting_registry();
        let name = registry.connect(ip(1));

        assert!(registry.notify_ping(&name));
        assert!(!registry.notify_ping("nobody"));
    }

    #[test]
    fn silence_deactivates_then_evicts() {
        let (registry, hook_calls) = counting_registry();
        let name = registry.connect(ip(1));
        let connected_hooks = hook_calls.load(Ordering::SeqCst);

        let base = Utc::now();
        for round in 1..=MAX_MISSED_PINGS {
            let evicted = registry.scan(base + Duration::seconds(11 * i64::from(round)));
            assert!(evicted.is_empty(), "evicted too early at round {round}");
            let worker = &registry.list()[0];
            assert!(!worker.available);
            assert_eq!(worker.missed_pings, round);
        }

        // One strike past the limit evicts and fires the hook.
        let evicted = registry.scan(base + Duration::seconds(11 * 6));
        assert_eq!(evicted, vec![name]);
        assert!(registry.list().is_empty());
        assert_eq!(hook_calls.load(Ordering::SeqCst), connected_hooks + 1);
    }

    #[test]
    fn a_ping_resets_the_missed_counter() {
        let (registry, _) = counting_registry();
        let name = registry.connect(ip(1));

        registry.scan(Utc::now() + Duration::seconds(11));
        assert_eq!(registry.list()[0].missed_pings, 1);

        assert!(registry.notify_ping(&name));
        let worker = &registry.list()[0];
        assert_eq!(worker.missed_pings, 0);
        assert!(worker.available);
    }
}
