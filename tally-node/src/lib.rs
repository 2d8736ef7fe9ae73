//! Tally Node Library
//!
//! This library provides the round-robin counting engine: the authoritative
//! count, participant registry and fan-out, stall recovery, throughput-driven
//! display, and the participant, peer and monitor runtimes.

pub mod agent;
pub mod audit;
pub mod broadcaster;
pub mod cli;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod count_state;
pub mod error;
pub mod group;
pub mod monitor;
pub mod operator;
pub mod participant;
pub mod peer;
pub mod rate;
pub mod registry;
pub mod reporter;
pub mod server;
pub mod shutdown;
pub mod stall;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use agent::ParticipantAgent;
pub use config::{TallyConfig, ValidationMode};
pub use coordinator::{Coordinator, Outcome};
pub use count_state::{Accepted, CountState, Rejected};
pub use error::{Result, TallyError};
pub use monitor::{Monitor, MonitorMode};
pub use rate::{DisplayMode, RateTracker};
pub use registry::ParticipantRegistry;
pub use server::CoordinatorServer;
pub use shutdown::ShutdownSignal;
pub use stall::StallDetector;
