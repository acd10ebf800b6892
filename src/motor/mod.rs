// Motion driver layer for the Pioneer 3-AT base
//
// Provides:
// - The exclusive-access motion adapter (bus units in, native units out)
// - Unit conversion between bus and controller units
// - Pioneer P2OS serial protocol implementation
// - A simulated base for running without hardware

mod driver;
pub mod p2os;
pub mod sim;
pub mod units;

#[cfg(test)]
pub(crate) mod mock;

pub use driver::{ActuatorGuard, DriverError, MotionAdapter, MotionDriver, NativePose};
pub use p2os::P2osRobot;
pub use sim::SimulatedBase;
