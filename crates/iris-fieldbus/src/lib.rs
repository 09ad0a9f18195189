//! Fieldbus plane of the IRIS acquisition server.
//!
//! This crate provides:
//! - [`FieldbusMaster`] trait abstracting the master stack
//! - [`FieldbusSession`] bringing the network up and down
//! - [`ExchangeLoop`] decoding inbound frames every cycle
//! - [`HealthMonitor`] driving the slave recovery chain
//! - [`SimulatedMaster`] for testing without hardware (feature `simulated`)

pub mod exchange;
pub mod health;
pub mod image;
pub mod link;
pub mod master;
pub mod session;
#[cfg(feature = "simulated")]
pub mod simulated;
pub mod slave;

pub use exchange::{ChannelFrame, ExchangeLoop, FrameCodes, FrameKind, FrameSink, DATA_CHANNELS};
pub use health::{next_action, HealthMonitor, RecoveryAction, RecoveryOutcome};
pub use image::{ExchangeStats, ProcessImage};
pub use link::BusLink;
pub use master::{shared, FieldbusMaster, ImageLayout, ImageRegion, SharedMaster};
pub use session::{FieldbusSession, SessionBuilder, DEFAULT_ADAPTER};
#[cfg(feature = "simulated")]
pub use simulated::{MasterCall, SimulatedMaster};
pub use slave::*;
