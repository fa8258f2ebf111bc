//! phasegate - phase completion and safety gates for autonomous build runs

pub mod baseline;
pub mod ci;
pub mod commands;
pub mod config;
pub mod deliverables;
pub mod error;
pub mod escalation;
pub mod finalizer;
pub mod governance;
pub mod lock;
pub mod orchestrator;
pub mod paths;
pub mod phase;
pub mod quality;
pub mod risk;
pub mod server;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod template;
