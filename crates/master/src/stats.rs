//! Read-only snapshots of the registry and ledger for external observers
//! (dashboard, WebSocket push, console commands).

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::Ledger;
use crate::registry::{Registry, Worker};

/// Master-side view pushed to the dashboard once per second.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    /// Current per-job term count.
    pub term_size: u64,
    /// Registered workers.
    pub workers: Vec<WorkerStats>,
    /// Every job the ledger tracks.
    pub jobs: Vec<JobStats>,
    /// Results currently staged for merge.
    pub merge_buffer: usize,
    /// Rough memory footprint of the coordination state.
    pub memory: MemoryStats,
}

/// One registered worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    /// Master-assigned name.
    pub id: String,
    /// Remote address.
    pub ip: String,
    /// Answering pings.
    pub active: bool,
    /// Last heartbeat.
    pub last_ping: DateTime<Utc>,
    /// Successive missed liveness probes.
    pub missed_pings: u32,
}

/// One tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    /// Stable job id.
    pub id: u64,
    /// Owning worker.
    pub worker_id: String,
    /// First term of the range.
    pub first_term: u64,
    /// Range length.
    pub num_terms: u64,
    /// Merged into the aggregate.
    pub completed: bool,
    /// Awaiting re-dispatch.
    pub lost: bool,
    /// Dispatch time.
    pub sent_at: DateTime<Utc>,
    /// Merge time, when completed.
    pub received_at: Option<DateTime<Utc>>,
}

/// The aggregate, pushed every ten seconds and served on `/pi`.
#[derive(Debug, Clone, Serialize)]
pub struct PiStats {
    /// Decimal rendering of the aggregate.
    pub pi: String,
    /// Digits after the decimal point.
    pub pi_decimals: usize,
    /// Mantissa bits backing the rendering.
    pub precision_bits: u32,
}

/// Measured sizes of the big coordination structures. The master has no
/// runtime allocator report to lean on, so this counts what it owns.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Jobs tracked by the ledger.
    pub jobs_tracked: usize,
    /// Bytes held by completed jobs' encoded results.
    pub job_result_bytes: usize,
    /// Bytes staged in the merge buffer.
    pub merge_buffer_bytes: usize,
    /// Mantissa bits of the aggregate.
    pub aggregate_precision_bits: u32,
    /// Bytes backing the aggregate mantissa.
    pub aggregate_mantissa_bytes: usize,
}

/// One WebSocket frame: a server view, a π view, or both.
#[derive(Debug, Clone, Serialize)]
pub struct StatsFrame {
    /// Server view, when this frame carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerStats>,
    /// π view, when this frame carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pi: Option<PiStats>,
}

/// Build the server-side view.
pub fn server_stats(registry: &Registry, ledger: &Ledger) -> ServerStats {
    let workers = registry.list().into_iter().map(worker_stats).collect();

    let (jobs, result_bytes) = ledger.visit_jobs(|jobs| {
        let list: Vec<JobStats> = jobs
            .values()
            .map(|job| JobStats {
                id: job.id,
                worker_id: job.worker_name.clone(),
                first_term: job.first_term,
                num_terms: job.num_terms,
                completed: job.completed,
                lost: job.lost,
                sent_at: job.send_at,
                received_at: job.returned_at,
            })
            .collect();
        let bytes: usize = jobs.values().map(|job| job.result.len()).sum();
        (list, bytes)
    });

    let (_, pi_prec) = ledger.pi_decimal();
    ServerStats {
        term_size: ledger.term_size(),
        workers,
        jobs,
        merge_buffer: ledger.buffered(),
        memory: MemoryStats {
            jobs_tracked: ledger.visit_jobs(|jobs| jobs.len()),
            job_result_bytes: result_bytes,
            merge_buffer_bytes: ledger.buffer_bytes(),
            aggregate_precision_bits: pi_prec,
            aggregate_mantissa_bytes: (pi_prec as usize).div_ceil(8),
        },
    }
}

/// Build the π view.
pub fn pi_stats(ledger: &Ledger) -> PiStats {
    let (pi, prec) = ledger.pi_decimal();
    let pi_decimals = pi.split_once('.').map_or(0, |(_, frac)| frac.len());
    PiStats {
        pi,
        pi_decimals,
        precision_bits: prec,
    }
}

fn worker_stats(worker: Worker) -> WorkerStats {
    WorkerStats {
        id: worker.name,
        ip: worker.ip.to_string(),
        active: worker.available,
        last_ping: worker.last_ping,
        missed_pings: worker.missed_pings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_reflect_the_ledger_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("calc.state"), 10, true);
        let registry = Registry::new(|_| {});

        let name = registry.connect([10, 0, 0, 1].into());
        let assignment = ledger.ask(&name);

        let stats = server_stats(&registry, &ledger);
        assert_eq!(stats.term_size, 10);
        assert_eq!(stats.workers.len(), 1);
        assert_eq!(stats.workers[0].id, name);
        assert_eq!(stats.jobs.len(), 1);
        assert_eq!(stats.jobs[0].id, assignment.job_id);
        assert!(!stats.jobs[0].completed);
        assert_eq!(stats.merge_buffer, 0);

        let json = serde_json::to_string(&StatsFrame {
            server: Some(stats),
            pi: None,
        })
        .unwrap();
        assert!(json.contains("\"server\""));
        assert!(!json.contains("\"pi\""));
    }

    #[test]
    fn pi_stats_count_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("calc.state"), 10, true);

        // Fresh aggregate renders as "0": no decimals yet.
        let stats = pi_stats(&ledger);
        assert_eq!(stats.pi, "0");
        assert_eq!(stats.pi_decimals, 0);
    }
}
