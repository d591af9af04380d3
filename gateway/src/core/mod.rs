//! Core business logic modules
//!
//! Pure state and selection logic with no I/O. The services in
//! `crate::services` own the locks and the processes around these types.

pub mod balancer;
pub mod metrics;
pub mod process_table;
pub mod refresh;

pub use balancer::{Balancer, RoutingStrategy};
pub use metrics::{ProcessMetrics, SystemMetrics, TaskHistory, TaskHistoryEntry};
pub use process_table::{ProcessRecord, ProcessStatus, ProcessTable};
pub use refresh::{token_fingerprint, RefreshStatus, RefreshTrigger, TokenRefreshRecord};
