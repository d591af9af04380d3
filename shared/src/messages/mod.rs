//! Messages exchanged between the gateway and its worker processes
//!
//! - `task`: remote method calls and their results
//! - `control`: the command/event envelopes carried by each frame
//! - `session`: credentials handed to a worker at launch

pub mod control;
pub mod session;
pub mod task;

pub use control::{HeartbeatReport, WorkerCommand, WorkerEvent};
pub use session::{SessionCredentials, SESSION_ENV_VAR};
pub use task::{json_text, TaskRequest, TaskResponse};
