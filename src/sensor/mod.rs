//! Particle counter access over Modbus TCP.

pub mod modbus;
pub mod session;

pub use session::{ParticleSensor, SensorSession};
