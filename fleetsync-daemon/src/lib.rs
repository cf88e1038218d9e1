//! fleetsync daemon: worker supervisor, leadership gating, and the local
//! directory substrate.

mod error;
pub mod leadership;
pub mod paths;
mod runtime;
pub mod substrate;
pub mod supervisor;

pub use error::DaemonError;
pub use leadership::{run_with_leadership, standalone};
pub use runtime::{build_workers, reconciler_for, run, start_blocking};
pub use substrate::{report_status_at, LocalSubstrate};
pub use supervisor::{Runnable, Supervisor, WorkerSet};
