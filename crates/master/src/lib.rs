//! Coordination engine for the distributed BBP π computation.
//!
//! The master owns two pieces of state: a [`registry::Registry`] of connected
//! workers (who is alive, judged by heartbeats) and a [`ledger::Ledger`] of
//! term-range jobs (who is computing what, and the merged aggregate π). The
//! [`app::App`] aggregate wires them together, serves the four RPC verbs,
//! runs the liveness and merge timers, and exposes read-only stats to the
//! dashboard and console.

pub mod app;
pub mod config;
pub mod dashboard;
pub mod ledger;
pub mod merge;
pub mod persist;
pub mod registry;
pub mod rpc;
pub mod stats;

mod sync;

pub use app::{App, AppConfig, AppHandle};
