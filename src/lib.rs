//! Core library for the scale_daq test rig.
//!
//! Controls a scale-inhibitor rig of two HPLC pumps: the serial protocol the pumps
//! speak, a state machine that runs one test (validation, uptake, timed sampling,
//! save) and the scoring that turns blank and trial pressure curves into protection
//! results. The `scale_daq` binary is a headless front end over this library.
//!
//! - [`pump`]: wire protocol, blocking link, async controller, simulated pumps
//! - [`experiment`]: the test run state machine and its scheduler
//! - [`scoring`]: protection results with an audit trace
//! - [`project`] and [`data`]: the project document, live readings and persistence

pub mod adapters;
pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod logging;
pub mod project;
pub mod pump;
pub mod scoring;

pub use config::Settings;
pub use error::{AppResult, DaqError};
pub use experiment::{RunEvent, RunState, RunStatus, TestRun};
pub use project::{Clarity, Project, PumpChannel, Reading, Test};
pub use scoring::{score, score_project, Evaluation};
