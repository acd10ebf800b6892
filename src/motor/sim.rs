// Simulated P3-AT base for running the bridge without hardware

use std::time::{Duration, Instant};

use tracing::info;

use super::driver::{DriverError, MotionDriver, NativePose};
use super::units::normalize_deg;
use crate::config::ConnectionParams;

/// Unicycle model integrating the commanded native velocities
pub struct SimulatedBase {
    pose: NativePose,
    trans_mm_s: f64,
    rot_deg_s: f64,
    max_trans_mm_s: f64,
    max_rot_deg_s: f64,
    last_update: Instant,
}

impl SimulatedBase {
    /// Velocity caps are taken from the same parameters as the real robot
    pub fn new(params: &ConnectionParams) -> Self {
        info!(
            "Using simulated base (caps {} mm/s, {} deg/s)",
            params.max_trans_vel_mm_s, params.max_rot_vel_deg_s
        );
        Self {
            pose: NativePose::default(),
            trans_mm_s: 0.0,
            rot_deg_s: 0.0,
            max_trans_mm_s: params.max_trans_vel_mm_s as f64,
            max_rot_deg_s: params.max_rot_vel_deg_s as f64,
            last_update: Instant::now(),
        }
    }

    /// Integrate the current velocity over `dt`
    pub fn advance(&mut self, dt: Duration) {
        let secs = dt.as_secs_f64();
        let heading_rad = self.pose.heading_deg.to_radians();
        self.pose.x_mm += self.trans_mm_s * heading_rad.cos() * secs;
        self.pose.y_mm += self.trans_mm_s * heading_rad.sin() * secs;
        self.pose.heading_deg = normalize_deg(self.pose.heading_deg + self.rot_deg_s * secs);
    }

    fn catch_up(&mut self) {
        let now = Instant::now();
        self.advance(now.duration_since(self.last_update));
        self.last_update = now;
    }

    pub fn velocity(&self) -> (f64, f64) {
        (self.trans_mm_s, self.rot_deg_s)
    }
}

impl MotionDriver for SimulatedBase {
    fn set_native_velocity(&mut self, trans_mm_s: f64, rot_deg_s: f64) -> Result<(), DriverError> {
        // Motion so far happened at the old setpoint
        self.catch_up();
        self.trans_mm_s = trans_mm_s.clamp(-self.max_trans_mm_s, self.max_trans_mm_s);
        self.rot_deg_s = rot_deg_s.clamp(-self.max_rot_deg_s, self.max_rot_deg_s);
        Ok(())
    }

    fn native_pose(&mut self) -> Result<NativePose, DriverError> {
        self.catch_up();
        Ok(self.pose)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        info!("Simulated base closed");
        self.trans_mm_s = 0.0;
        self.rot_deg_s = 0.0;
        Ok(())
    }
}
