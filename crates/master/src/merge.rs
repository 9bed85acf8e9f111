//! Merge engine: folds buffered partial sums into the aggregate π, widening
//! its precision until the addition is reported exact.
//!
//! At most one merge runs at a time (non-blocking gate). Decoding and the
//! big-float arithmetic happen on scratch values with no ledger lock held;
//! only the final bookkeeping step takes the buffer and table locks, in that
//! order.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{Duration, Utc};
use rug::Float;
use rug::float::Round;
use rug::ops::AddAssignRound;
use thiserror::Error;
use tracing::{debug, info, warn};

use swarmpi_bbp::decode_float;

use crate::ledger::{Ledger, MIN_TERM_SIZE};
use crate::sync::{lock, read, write};

/// A batch whose last job took longer than this many seconds from dispatch to
/// merge shrinks the term size for subsequent jobs.
pub const SLOW_JOB_SECS: i64 = 10;

/// Fatal merge failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    /// Exactness would require more precision than the float backend allows.
    /// There is no way to continue without losing digits; the operator must
    /// reset the state.
    #[error("aggregate needs more than {max} mantissa bits (currently {current})")]
    PrecisionCeiling {
        /// Precision the aggregate had reached.
        current: u32,
        /// Backend maximum.
        max: u32,
    },
}

/// What a merge pass did, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Jobs folded into the aggregate and marked completed.
    pub merged: usize,
    /// Buffer entries dropped: undecodable results (job marked lost again)
    /// or ids with no matching job.
    pub dropped: usize,
    /// Precision doublings performed to reach an exact addition.
    pub escalations: u32,
    /// Aggregate precision after the pass.
    pub pi_prec: u32,
    /// New term size, when the adaptive rule shrank it.
    pub shrunk_term_size: Option<u64>,
}

impl Ledger {
    /// One merge pass. Returns `Ok(None)` when another merge is running or
    /// there is nothing to do.
    pub fn merge(&self) -> Result<Option<MergeOutcome>, MergeError> {
        if self.is_stopped() {
            return Ok(None);
        }
        let Ok(_gate) = self.merge_gate.try_lock() else {
            debug!("merge already in progress, skipping");
            return Ok(None);
        };

        // Snapshot the buffer; BTreeMap iteration gives ascending job ids,
        // which makes "the last job of the batch" well defined below.
        let snapshot: Vec<(u64, Vec<u8>, u32)> = {
            let buffer = read(&self.buffer);
            buffer
                .iter()
                .map(|(id, entry)| (*id, entry.result.clone(), entry.precision))
                .collect()
        };
        if snapshot.is_empty() {
            return Ok(None);
        }

        // Only results for jobs the ledger actually issued may reach the
        // aggregate; anything else is dropped during bookkeeping.
        let known: HashSet<u64> = {
            let table = lock(&self.table);
            snapshot
                .iter()
                .map(|(id, _, _)| *id)
                .filter(|id| table.jobs.contains_key(id))
                .collect()
        };

        let mut temp_pi = lock(&self.pi).clone();

        let mut decoded: Vec<Float> = Vec::with_capacity(snapshot.len());
        let mut undecodable: Vec<u64> = Vec::new();
        for (job_id, result, precision) in &snapshot {
            if !known.contains(job_id) {
                continue;
            }
            match decode_float(result, *precision) {
                Ok(value) => decoded.push(value),
                Err(err) => {
                    warn!(job_id, error = %err, "undecodable result, job will be reassigned");
                    undecodable.push(*job_id);
                }
            }
        }

        let mut escalations = 0u32;
        if !decoded.is_empty() {
            let mut batch_sum = Float::new(temp_pi.prec());
            for value in &decoded {
                batch_sum += value;
            }

            loop {
                let mut candidate = temp_pi.clone();
                if candidate.add_assign_round(&batch_sum, Round::Nearest) == Ordering::Equal {
                    temp_pi = candidate;
                    break;
                }

                let current = temp_pi.prec();
                let max = rug::float::prec_max();
                let widened = current
                    .checked_mul(2)
                    .filter(|p| *p <= max)
                    .ok_or(MergeError::PrecisionCeiling { current, max })?;

                // Widening preserves the values exactly; only the retried
                // addition sees the extra bits.
                temp_pi.set_prec(widened);
                batch_sum.set_prec(widened);
                escalations += 1;
                debug!(bits = widened, "widened aggregate precision");
            }
        }

        let pi_prec = temp_pi.prec();
        *lock(&self.pi) = temp_pi;

        // Bookkeeping: buffer lock before table lock.
        let now = Utc::now();
        let mut merged = 0usize;
        let mut dropped = 0usize;
        let mut shrunk_term_size = None;
        {
            let mut buffer = write(&self.buffer);
            let mut table = lock(&self.table);

            for (job_id, _, _) in &snapshot {
                if undecodable.contains(job_id) {
                    buffer.remove(job_id);
                    dropped += 1;
                    if let Some(job) = table.jobs.get_mut(job_id)
                        && !job.completed
                    {
                        job.lost = true;
                    }
                    continue;
                }

                let Some(entry) = buffer.remove(job_id) else {
                    continue;
                };
                match table.jobs.get_mut(job_id) {
                    Some(job) => {
                        job.completed = true;
                        job.lost = false;
                        job.returned_at = Some(now);
                        job.result = entry.result;
                        job.result_prec = entry.precision;
                        merged += 1;
                    }
                    None => {
                        debug!(job_id, "result for unknown job dropped");
                        dropped += 1;
                    }
                }
            }

            // Open-loop back-pressure: if the last job of this batch took too
            // long, the next ranges get smaller. Never grows.
            let slow_batch = snapshot
                .last()
                .and_then(|(last_id, _, _)| table.jobs.get(last_id))
                .is_some_and(|job| now - job.send_at > Duration::seconds(SLOW_JOB_SECS));
            if self.shrink_enabled && slow_batch && table.term_size > MIN_TERM_SIZE {
                table.term_size = (table.term_size - table.term_size / 10).max(MIN_TERM_SIZE);
                shrunk_term_size = Some(table.term_size);
                info!(term_size = table.term_size, "shrank term size after slow batch");
            }
        }

        info!(merged, dropped, escalations, pi_prec, "merge pass finished");
        Ok(Some(MergeOutcome {
            merged,
            dropped,
            escalations,
            pi_prec,
            shrunk_term_size,
        }))
    }
}
