// Timeouts, topics, serial defaults and the command line
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

// Control loop frequency
pub const LOOP_HZ: u64 = 10;

// Command timeout for watchdog (fixed safety constant)
pub const CMD_TIMEOUT: Duration = Duration::from_millis(400);

// Zenoh topics
pub const TOPIC_CMD_VELOCITY: &str = "p3at/cmd/velocity"; // commands
pub const TOPIC_STATE_POSE: &str = "p3at/state/pose"; // estimated pose
pub const TOPIC_HEALTH: &str = "p3at/state/health"; // health status

// Serial defaults for the Pioneer controller
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUD: u32 = 9600; // 57600 for the Pioneer LX

// Absolute velocity caps written at startup
pub const DEFAULT_MAX_TRANS_VEL_MM_S: u16 = 500;
pub const DEFAULT_MAX_ROT_VEL_DEG_S: u16 = 45;

/// Baud rates the P2OS controller can be configured for
pub const SUPPORTED_BAUDS: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Teleoperation bridge for a Pioneer 3-AT base
#[derive(Debug, Clone, Parser)]
#[command(version)]
pub struct Args {
    /// Serial port of the robot controller
    #[arg(long, default_value = DEFAULT_PORT)]
    pub port: String,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Absolute maximum translational velocity (mm/s)
    #[arg(long, default_value_t = DEFAULT_MAX_TRANS_VEL_MM_S)]
    pub max_trans_vel: u16,

    /// Absolute maximum rotational velocity (deg/s)
    #[arg(long, default_value_t = DEFAULT_MAX_ROT_VEL_DEG_S)]
    pub max_rot_vel: u16,

    /// Topic carrying inbound velocity commands
    #[arg(long, default_value = TOPIC_CMD_VELOCITY)]
    pub cmd_topic: String,

    /// Topic the estimated pose is published on
    #[arg(long, default_value = TOPIC_STATE_POSE)]
    pub pose_topic: String,

    /// Topic the runtime health is published on
    #[arg(long, default_value = TOPIC_HEALTH)]
    pub health_topic: String,

    /// Zenoh configuration file (defaults to peer mode)
    #[arg(long)]
    pub zenoh_config: Option<PathBuf>,

    /// Run against a simulated base instead of the serial robot
    #[arg(long)]
    pub simulate: bool,
}

/// Acquisition-time parameters for the robot connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub port: String,
    pub baud: u32,
    pub max_trans_vel_mm_s: u16,
    pub max_rot_vel_deg_s: u16,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud: DEFAULT_BAUD,
            max_trans_vel_mm_s: DEFAULT_MAX_TRANS_VEL_MM_S,
            max_rot_vel_deg_s: DEFAULT_MAX_ROT_VEL_DEG_S,
        }
    }
}

impl ConnectionParams {
    /// Check the parameters before any resource is acquired
    pub fn validate(&self) -> Result<(), String> {
        if self.port.trim().is_empty() {
            return Err("serial port path is empty".to_string());
        }
        if !SUPPORTED_BAUDS.contains(&self.baud) {
            return Err(format!(
                "unsupported baud rate {} (expected one of {:?})",
                self.baud, SUPPORTED_BAUDS
            ));
        }
        if self.max_trans_vel_mm_s == 0 || self.max_rot_vel_deg_s == 0 {
            return Err("velocity caps must be non-zero".to_string());
        }
        Ok(())
    }
}

impl From<&Args> for ConnectionParams {
    fn from(args: &Args) -> Self {
        Self {
            port: args.port.clone(),
            baud: args.baud,
            max_trans_vel_mm_s: args.max_trans_vel,
            max_rot_vel_deg_s: args.max_rot_vel,
        }
    }
}

/// Control loop period derived from LOOP_HZ
pub fn loop_period() -> Duration {
    Duration::from_millis(1000 / LOOP_HZ)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args_match_constants() {
        let args = Args::parse_from(["p3at-zenoh-bridge"]);
        let params = ConnectionParams::from(&args);
        assert_eq!(params, ConnectionParams::default());
        assert_eq!(args.cmd_topic, TOPIC_CMD_VELOCITY);
        assert!(!args.simulate);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_rejects_unsupported_baud() {
        let args = Args::parse_from(["p3at-zenoh-bridge", "--baud", "1234"]);
        let err = ConnectionParams::from(&args).validate().unwrap_err();
        assert!(err.contains("1234"));
    }

    #[test]
    fn test_rejects_zero_caps_and_empty_port() {
        let mut params = ConnectionParams {
            max_rot_vel_deg_s: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        params.max_rot_vel_deg_s = 45;
        params.port = "  ".to_string();
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_loop_period_is_100ms() {
        assert_eq!(loop_period(), Duration::from_millis(100));
    }
}
