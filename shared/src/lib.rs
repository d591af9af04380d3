//! Shared types for the broker gateway and its account workers
//!
//! Contains only what both sides of the process boundary need: identifiers,
//! the frame codec and the message schema carried over it, and logging setup.

pub mod errors;
pub mod framing;
pub mod logging;
pub mod messages;
pub mod types;

pub use errors::*;
pub use types::*;

pub use framing::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use messages::{
    HeartbeatReport, SessionCredentials, TaskRequest, TaskResponse, WorkerCommand, WorkerEvent,
    SESSION_ENV_VAR,
};
