//! Sandbox analyzer agent.
//!
//! Runs inside the analysis guest, accepts announcements from monitored
//! processes over a local command channel, keeps track of which of them are
//! still alive and decides when the analysis run is over.

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod exporters;
pub mod gateway;
pub mod liveness;
pub mod package;
pub mod protocol;
pub mod registry;

pub use config::Config;
pub use controller::{Collaborators, RunController, RunReport, RunSettings, RunState};
pub use error::AgentError;
pub use registry::{ProcessId, ProcessRegistry};
