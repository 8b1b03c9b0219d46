//! energy-agent: telemetry agent for a power-monitoring device
//!
//! keeps a durable running energy total, keeps wifi up with a bounded,
//! debounced reconnect, and pushes every sample to a REST backend and a
//! realtime database independently. see agent.rs for the tick policy.

pub mod agent;
pub mod backend;
pub mod config;
pub mod connectivity;
pub mod domain;
pub mod error;
pub mod meter;
pub mod realtime;
pub mod status;
pub mod storage;

pub use agent::{AgentSettings, TelemetryAgent, TickReport};
pub use error::{AgentError, Result};
