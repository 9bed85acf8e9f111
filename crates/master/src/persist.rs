//! Crash-safe persistence of the ledger state.
//!
//! A single JSON file, written whole to a temp file and renamed into place.
//! Result payloads are base64; the aggregate is a decimal string carrying
//! enough digits to re-parse bit-exactly at its recorded precision.

use std::path::Path;

use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::Job;

/// Bumped when the layout changes incompatibly.
pub const STATE_VERSION: u32 = 1;

/// Default state file name, next to the master's working directory.
pub const STATE_FILE: &str = "calc.state";

/// The persisted ledger tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// Layout version.
    #[serde(default)]
    pub version: u32,
    /// Next term index to dispatch.
    pub last_term: u64,
    /// Next job id to allocate.
    pub last_job_id: u64,
    /// Current per-job term count.
    pub term_size: u64,
    /// Mantissa bits of the persisted aggregate.
    pub pi_prec: u32,
    /// Aggregate as a decimal string.
    pub pi: String,
    /// Every job ever dispatched.
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

/// One persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stable job id.
    pub id: u64,
    /// Dispatch time.
    pub send_at: DateTime<Utc>,
    /// Merge time, when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
    /// Result merged into the aggregate.
    pub completed: bool,
    /// Worker vanished before returning.
    pub lost: bool,
    /// Owning worker name.
    pub worker_name: String,
    /// First term index.
    pub first_term: u64,
    /// Term count.
    pub num_terms: u64,
    /// Base64 of the encoded partial sum, when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_b64: Option<String>,
    /// Mantissa bits needed to decode the result.
    #[serde(default)]
    pub result_prec: u32,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            send_at: job.send_at,
            returned_at: job.returned_at,
            completed: job.completed,
            lost: job.lost,
            worker_name: job.worker_name.clone(),
            first_term: job.first_term,
            num_terms: job.num_terms,
            result_b64: (!job.result.is_empty()).then(|| B64.encode(&job.result)),
            result_prec: job.result_prec,
        }
    }
}

impl JobRecord {
    /// Rehydrate the in-memory job.
    pub fn into_job(self) -> anyhow::Result<Job> {
        let result = match self.result_b64 {
            Some(b64) => B64
                .decode(b64.as_bytes())
                .with_context(|| format!("job {}: bad result payload", self.id))?,
            None => Vec::new(),
        };
        Ok(Job {
            id: self.id,
            send_at: self.send_at,
            returned_at: self.returned_at,
            completed: self.completed,
            lost: self.lost,
            worker_name: self.worker_name,
            first_term: self.first_term,
            num_terms: self.num_terms,
            result,
            result_prec: self.result_prec,
        })
    }
}

/// Write the state atomically (temp file + rename).
pub fn write_state(path: &Path, state: &StateFile) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(state).context("encode state")?;

    let tmp = path.with_extension("state.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

/// Read the state file. `Ok(None)` when it does not exist.
pub fn read_state(path: &Path) -> anyhow::Result<Option<StateFile>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let state: StateFile = serde_json::from_str(&raw).context("decode state")?;
    Ok(Some(state))
}
