// Teleoperation bridge for the Pioneer 3-AT: velocity commands in over zenoh,
// pose out, with a watchdog stopping the robot when commands go quiet.

pub mod config;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod watchdog;
