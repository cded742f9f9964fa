//! Shared signaling, session and media plumbing for the robot, operator and
//! recorder nodes.

pub mod alignment;
pub mod clock;
pub mod config;
pub mod error;
pub mod latency;
pub mod link;
pub mod media;
pub mod message;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

pub use error::BoxError;
