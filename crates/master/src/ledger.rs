//! Job ledger: term-range allocation, reassignment of lost jobs, the staged
//! merge buffer, and the aggregate π value.
//!
//! The ledger is append-only: jobs are created by `ask` and mutated in place,
//! never deleted, so the full history can be replayed from the state file.
//! Lock order (see also [`crate::merge`]): merge buffer before job table
//! before save gate; the aggregate lock nests inside none of them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rug::Float;
use tracing::{debug, info, warn};

use swarmpi_proto::JobAssignment;

use crate::persist;
use crate::sync::{lock, read, write};

/// Mantissa bits of a fresh aggregate; merges widen it as needed.
pub const INITIAL_PI_PRECISION: u32 = 50_000;

/// The adaptive sizer never shrinks the term range below this.
pub const MIN_TERM_SIZE: u64 = 10;

/// Buffered results beyond this count kick an immediate merge.
pub const MERGE_KICK_THRESHOLD: usize = 5;

/// One dispatched term range.
#[derive(Debug, Clone)]
pub struct Job {
    /// Stable id, dense and monotonic across the ledger's life.
    pub id: u64,
    /// When the range was (last) dispatched.
    pub send_at: DateTime<Utc>,
    /// When the result was folded into the aggregate.
    pub returned_at: Option<DateTime<Utc>>,
    /// The result has been merged; never unset afterwards.
    pub completed: bool,
    /// The owning worker vanished; the range will be re-dispatched as-is.
    pub lost: bool,
    /// Name of the worker the range was (last) dispatched to.
    pub worker_name: String,
    /// First term index of the half-open range.
    pub first_term: u64,
    /// Number of terms in the range.
    pub num_terms: u64,
    /// Encoded partial sum, set once completed.
    pub result: Vec<u8>,
    /// Mantissa bits needed to decode `result`.
    pub result_prec: u32,
}

impl Job {
    fn assignment(&self) -> JobAssignment {
        JobAssignment {
            job_id: self.id,
            first_term: self.first_term,
            num_terms: self.num_terms,
        }
    }
}

/// A partial sum staged for aggregation, keyed by job id in the buffer.
#[derive(Debug, Clone)]
pub struct MergeEntry {
    /// Encoded partial sum as received from the worker.
    pub result: Vec<u8>,
    /// Mantissa bits needed to decode `result`.
    pub precision: u32,
}

pub(crate) struct JobTable {
    pub(crate) jobs: BTreeMap<u64, Job>,
    pub(crate) last_term: u64,
    pub(crate) last_job_id: u64,
    pub(crate) term_size: u64,
}

/// The ledger proper. All methods take `&self`; interior locks serialise
/// access so RPC handlers, the liveness scanner, and the merge engine can
/// share one instance behind an `Arc`.
pub struct Ledger {
    pub(crate) table: Mutex<JobTable>,
    pub(crate) buffer: RwLock<BTreeMap<u64, MergeEntry>>,
    pub(crate) pi: Mutex<Float>,
    pub(crate) merge_gate: Mutex<()>,
    save_gate: Mutex<()>,
    stopped: AtomicBool,
    state_path: PathBuf,
    pub(crate) shrink_enabled: bool,
}

impl Ledger {
    /// Create an empty ledger persisting to `state_path`.
    pub fn new(state_path: impl Into<PathBuf>, term_size: u64, shrink_enabled: bool) -> Self {
        Self {
            table: Mutex::new(JobTable {
                jobs: BTreeMap::new(),
                last_term: 0,
                last_job_id: 0,
                term_size: term_size.max(1),
            }),
            buffer: RwLock::new(BTreeMap::new()),
            pi: Mutex::new(Float::new(INITIAL_PI_PRECISION)),
            merge_gate: Mutex::new(()),
            save_gate: Mutex::new(()),
            stopped: AtomicBool::new(false),
            state_path: state_path.into(),
            shrink_enabled,
        }
    }

    /// Hand out the next term range for `worker_name`.
    ///
    /// A previously lost job takes priority and is re-dispatched unchanged
    /// (same id, same range); otherwise a fresh contiguous range is cut off
    /// the end of the series. Returns an empty assignment once stopped.
    pub fn ask(&self, worker_name: &str) -> JobAssignment {
        if self.is_stopped() {
            return JobAssignment::default();
        }

        let now = Utc::now();
        let mut table = lock(&self.table);

        let reassign = table.jobs.values().find(|j| j.lost).map(|j| j.id);
        if let Some(id) = reassign
            && let Some(job) = table.jobs.get_mut(&id)
        {
            job.lost = false;
            job.worker_name = worker_name.to_string();
            job.send_at = now;
            info!(job_id = id, worker = worker_name, "re-dispatched lost job");
            return job.assignment();
        }

        let id = table.last_job_id;
        let job = Job {
            id,
            send_at: now,
            returned_at: None,
            completed: false,
            lost: false,
            worker_name: worker_name.to_string(),
            first_term: table.last_term,
            num_terms: table.term_size,
            result: Vec::new(),
            result_prec: 0,
        };
        let assignment = job.assignment();
        table.last_job_id += 1;
        table.last_term = job.first_term + job.num_terms;
        table.jobs.insert(id, job);
        info!(
            job_id = id,
            worker = worker_name,
            first_term = assignment.first_term,
            num_terms = assignment.num_terms,
            "dispatched new job"
        );
        assignment
    }

    /// Stage a returned partial sum for the next merge.
    ///
    /// Returns true when the buffer has grown past [`MERGE_KICK_THRESHOLD`]
    /// and the caller should kick the merge engine. Job ids are not verified
    /// here; the merge drops entries with no matching job.
    pub fn give(&self, job_id: u64, result: Vec<u8>, precision: u32) -> bool {
        if self.is_stopped() {
            return false;
        }

        let mut buffer = write(&self.buffer);
        buffer.insert(job_id, MergeEntry { result, precision });
        let staged = buffer.len();
        debug!(job_id, staged, "result staged for merge");
        staged > MERGE_KICK_THRESHOLD
    }

    /// Mark every pending job owned by `worker_name` as lost, making the
    /// ranges eligible for re-dispatch. Returns how many were marked.
    pub fn mark_lost_by(&self, worker_name: &str) -> usize {
        let mut table = lock(&self.table);
        let mut marked = 0;
        for job in table.jobs.values_mut() {
            if job.worker_name == worker_name && !job.completed && !job.lost {
                job.lost = true;
                marked += 1;
            }
        }
        if marked > 0 {
            info!(worker = worker_name, jobs = marked, "marked in-flight jobs lost");
        }
        marked
    }

    /// Latch the stopped flag, wait out any in-flight merge, and persist.
    /// Asks and gives arriving afterwards are answered without mutating state.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Acquiring the merge gate means any running merge has finished.
        drop(lock(&self.merge_gate));
        self.save();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Current per-job term count.
    pub fn term_size(&self) -> u64 {
        lock(&self.table).term_size
    }

    /// Number of results staged for merge.
    pub fn buffered(&self) -> usize {
        read(&self.buffer).len()
    }

    /// Run `f` over the job table without cloning result payloads.
    pub fn visit_jobs<R>(&self, f: impl FnOnce(&BTreeMap<u64, Job>) -> R) -> R {
        f(&lock(&self.table).jobs)
    }

    /// The aggregate rendered as a decimal string, with its mantissa bits.
    pub fn pi_decimal(&self) -> (String, u32) {
        let pi = lock(&self.pi);
        (swarmpi_bbp::to_decimal_string(&pi), pi.prec())
    }

    /// Bytes staged in the merge buffer (for the memory report).
    pub fn buffer_bytes(&self) -> usize {
        read(&self.buffer).values().map(|e| e.result.len()).sum()
    }

    /// Persist the current state, serialised by the save gate. Failures are
    /// logged; the in-memory state keeps going and the next merge retries.
    pub fn save(&self) {
        let _gate = lock(&self.save_gate);
        let state = self.snapshot_state();
        if let Err(err) = persist::write_state(&self.state_path, &state) {
            warn!(path = %self.state_path.display(), error = %err, "state save failed");
        }
    }

    pub(crate) fn snapshot_state(&self) -> persist::StateFile {
        let (last_term, last_job_id, term_size, jobs) = {
            let table = lock(&self.table);
            (
                table.last_term,
                table.last_job_id,
                table.term_size,
                table.jobs.values().map(persist::JobRecord::from).collect(),
            )
        };
        let (pi, pi_prec) = self.pi_decimal();
        persist::StateFile {
            version: persist::STATE_VERSION,
            last_term,
            last_job_id,
            term_size,
            pi_prec,
            pi,
            jobs,
        }
    }

    /// Load state from disk, if present. Every restored non-completed job is
    /// marked lost so it is immediately eligible for re-dispatch; a corrupt
    /// file is logged and the ledger starts empty.
    pub fn restore(&self) {
        let state = match persist::read_state(&self.state_path) {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(err) => {
                warn!(
                    path = %self.state_path.display(),
                    error = %err,
                    "state file unreadable, starting empty (pass --reset to clear it)"
                );
                return;
            }
        };

        let pi = match swarmpi_bbp::from_decimal_string(&state.pi, state.pi_prec.max(2)) {
            Ok(pi) => pi,
            Err(err) => {
                warn!(error = %err, "persisted aggregate unreadable, starting empty");
                return;
            }
        };

        {
            let mut table = lock(&self.table);
            table.last_term = state.last_term;
            table.last_job_id = state.last_job_id;
            table.term_size = state.term_size.max(1);
            table.jobs.clear();
            for record in state.jobs {
                let mut job = match record.into_job() {
                    Ok(job) => job,
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable job record");
                        continue;
                    }
                };
                if !job.completed {
                    job.lost = true;
                }
                table.jobs.insert(job.id, job);
            }
            info!(
                jobs = table.jobs.len(),
                last_term = table.last_term,
                last_job_id = table.last_job_id,
                term_size = table.term_size,
                "ledger restored"
            );
        }
        *lock(&self.pi) = pi;

        self.save();
    }

    /// Delete the state file (`--reset`).
    pub fn delete_state_file(&self) {
        match std::fs::remove_file(&self.state_path) {
            Ok(()) => info!(path = %self.state_path.display(), "state file deleted"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "unable to delete state file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_ledger(term_size: u64) -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("calc.state"), term_size, true);
        (dir, ledger)
    }

    #[test]
    fn asks_hand_out_dense_contiguous_ranges() {
        let (_dir, ledger) = scratch_ledger(10);

        for expect in 0u64..4 {
            let a = ledger.ask("w1");
            assert_eq!(a.job_id, expect);
            assert_eq!(a.first_term, expect * 10);
            assert_eq!(a.num_terms, 10);
        }

        ledger.visit_jobs(|jobs| {
            assert_eq!(jobs.len(), 4);
            for (id, job) in jobs {
                assert!(!job.completed);
                assert!(!job.lost);
                assert_eq!(job.first_term, id * 10);
            }
        });
        assert_eq!(lock(&ledger.table).last_term, 40);
    }

    #[test]
    fn lost_jobs_are_reassigned_before_new_ones() {
        let (_dir, ledger) = scratch_ledger(10);

        let original = ledger.ask("vanishing");
        assert_eq!(ledger.mark_lost_by("vanishing"), 1);

        let reassigned = ledger.ask("survivor");
        assert_eq!(reassigned.job_id, original.job_id);
        assert_eq!(reassigned.first_term, original.first_term);
        assert_eq!(reassigned.num_terms, original.num_terms);

        ledger.visit_jobs(|jobs| {
            let job = &jobs[&original.job_id];
            assert!(!job.lost);
            assert_eq!(job.worker_name, "survivor");
        });

        // No extra id was allocated for the reassignment.
        let fresh = ledger.ask("survivor");
        assert_eq!(fresh.job_id, original.job_id + 1);
    }

    #[test]
    fn mark_lost_skips_completed_jobs() {
        let (_dir, ledger) = scratch_ledger(10);
        let a = ledger.ask("w1");
        let b = ledger.ask("w1");

        {
            let mut table = lock(&ledger.table);
            table.jobs.get_mut(&a.job_id).unwrap().completed = true;
        }

        assert_eq!(ledger.mark_lost_by("w1"), 1);
        ledger.visit_jobs(|jobs| {
            assert!(!jobs[&a.job_id].lost);
            assert!(jobs[&b.job_id].lost);
        });
    }

    #[test]
    fn give_reports_when_the_buffer_needs_merging() {
        let (_dir, ledger) = scratch_ledger(10);

        for id in 0..5u64 {
            assert!(!ledger.give(id, vec![0; 8], 64));
        }
        assert!(ledger.give(5, vec![0; 8], 64));

        // Re-giving the same id overwrites instead of growing the buffer.
        assert_eq!(ledger.buffered(), 6);
        ledger.give(5, vec![1; 8], 64);
        assert_eq!(ledger.buffered(), 6);
    }

    #[test]
    fn stopped_ledger_answers_without_mutating() {
        let (_dir, ledger) = scratch_ledger(10);
        ledger.ask("w1");
        ledger.stop();

        let empty = ledger.ask("w1");
        assert!(empty.is_empty());
        assert!(!ledger.give(0, vec![0; 8], 64));
        assert_eq!(ledger.buffered(), 0);
        ledger.visit_jobs(|jobs| assert_eq!(jobs.len(), 1));
    }
}
