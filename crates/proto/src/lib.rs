//! Wire protocol between the π master and its workers.
//!
//! Four request/reply verbs over one TCP connection, one in-flight exchange
//! at a time. Frames are `[u32 LE length][bincode payload]`.

mod framing;
mod message;

pub use framing::{MAX_FRAME, WireError, read_message, write_message};
pub use message::{JobAssignment, MASTER_RPC_PORT, Reply, Request};
