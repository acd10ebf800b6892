// Define message types for the bridge

use serde::{Deserialize, Serialize};

// Command from teleop/scripts -> bridge
// Only the latest delivered value matters; nothing is queued
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    /// Forward speed in m/s (signed)
    pub linear_mps: f64,
    /// Turn rate in rad/s (signed, positive = counter-clockwise)
    pub angular_radps: f64,
}

impl VelocityCommand {
    pub fn new(linear_mps: f64, angular_radps: f64) -> Self {
        Self {
            linear_mps,
            angular_radps,
        }
    }
}

// Estimated pose from bridge -> consumers, built fresh every tick
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x_m: f64,
    pub y_m: f64,
    pub heading_rad: f64,
}

/// Health status published by the bridge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    ActuatorFault,
}
