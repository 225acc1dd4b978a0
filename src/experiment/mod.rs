//! Test execution
//!
//! - **schedule**: drift-corrected clock and cancellable scheduled tasks
//! - **test_run**: the validation → uptake → sampling → save state machine

pub mod schedule;
pub mod test_run;

pub use schedule::{CancelHandle, DriftClock, Scheduler};
pub use test_run::{RunEvent, RunState, RunStatus, TestRun, UPTAKE_STEPS};
