//! Embedded side of plant-ops: owns the sensors and relays, enforces the
//! hardware failsafes and answers the line protocol spoken by the hub.

pub mod adc;
pub mod config;
pub mod controller;
pub mod failsafe;
#[cfg(feature = "hw")]
pub mod hw;
pub mod protocol;
pub mod relay;
pub mod scd4x;
pub mod sensors;
#[cfg(feature = "sim")]
pub mod sim;
pub mod tick;

pub use controller::{ActuatorState, Controller, ControllerConfig};
pub use protocol::StatusRecord;
