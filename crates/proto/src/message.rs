use serde::{Deserialize, Serialize};

/// Default TCP port the master listens on for worker RPC.
pub const MASTER_RPC_PORT: u16 = 9999;

/// A request from a worker to the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Request {
    /// Register (or re-register) this worker. Idempotent by IP: reconnecting
    /// from a known address yields the previously assigned name.
    Connect {
        /// The worker's own IPv4 address, as it sees it.
        worker_ip: String,
    },
    /// Ask for the next term range to compute.
    Ask {
        /// Name assigned by a previous `Connect`.
        worker_name: String,
    },
    /// Return a computed partial sum.
    Give {
        /// Job this result belongs to.
        job_id: u64,
        /// Encoded partial sum (see `swarmpi_bbp::encode_float`).
        result: Vec<u8>,
        /// Mantissa bits needed to decode `result` losslessly.
        precision: u32,
    },
    /// Heartbeat. Absence of pings is how the master detects worker loss;
    /// there is no disconnect verb.
    Ping {
        /// Name assigned by a previous `Connect`.
        worker_name: String,
    },
}

/// The master's reply to a [`Request`], variant-for-variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reply {
    /// Reply to `Connect`.
    Connect {
        /// Assigned worker name.
        worker_name: String,
    },
    /// Reply to `Ask`. A stopped master answers with an empty assignment
    /// (`num_terms == 0`).
    Ask(JobAssignment),
    /// Reply to `Give`. Unknown job ids are dropped silently.
    Give,
    /// Reply to `Ping`. Unknown names are ignored.
    Ping,
}

/// A term range handed to a worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobAssignment {
    /// Stable job id; retained across reassignment of lost jobs.
    pub job_id: u64,
    /// First term index of the half-open range.
    pub first_term: u64,
    /// Number of terms in the range.
    pub num_terms: u64,
}

impl JobAssignment {
    /// Whether this assignment carries no work (stopped master).
    pub fn is_empty(&self) -> bool {
        self.num_terms == 0
    }
}
