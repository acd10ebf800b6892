// Motion driver adapter for the P3-AT base
//
// Every actuator access goes through one mutex. The write operations only
// exist on the guard, so they cannot be reached without holding the lock.

use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::units::{mps_to_mm_s, radps_to_deg_s};
use crate::messages::Pose;

/// Errors raised by a motion driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Robot did not answer {stage} after {attempts} attempts")]
    SyncFailed { stage: &'static str, attempts: u32 },

    #[error("Invalid packet: {reason}")]
    InvalidPacket { reason: String },

    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{received:04X}")]
    ChecksumMismatch { expected: u16, received: u16 },

    #[error("Actuator connection already released")]
    Released,
}

/// Position as reported by the controller: millimetres and degrees
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NativePose {
    pub x_mm: f64,
    pub y_mm: f64,
    pub heading_deg: f64,
}

/// A connected actuator speaking native units
pub trait MotionDriver: Send {
    /// Write translational (mm/s) and rotational (deg/s) setpoints together
    fn set_native_velocity(&mut self, trans_mm_s: f64, rot_deg_s: f64) -> Result<(), DriverError>;

    /// Latest odometry estimate
    fn native_pose(&mut self) -> Result<NativePose, DriverError>;

    /// Release the underlying connection
    fn close(&mut self) -> Result<(), DriverError>;
}

struct Actuator<D> {
    driver: D,
    released: bool,
}

/// Exclusive-access wrapper around one motion driver
pub struct MotionAdapter<D: MotionDriver> {
    inner: Mutex<Actuator<D>>,
}

impl<D: MotionDriver> MotionAdapter<D> {
    /// Wrap an already connected driver
    pub fn new(driver: D) -> Self {
        Self {
            inner: Mutex::new(Actuator {
                driver,
                released: false,
            }),
        }
    }

    /// Take the actuator lock. Dropping the guard unlocks.
    pub fn lock(&self) -> ActuatorGuard<'_, D> {
        // A panic while holding the lock must not make the stop path unreachable
        let guard = self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Actuator lock was poisoned, recovering");
            poisoned.into_inner()
        });
        ActuatorGuard { guard }
    }

    /// Final stop followed by closing the connection. Only the first call
    /// has any effect.
    pub fn release(&self) -> Result<(), DriverError> {
        let mut actuator = self.lock();
        if actuator.guard.released {
            debug!("Actuator already released");
            return Ok(());
        }

        info!("Releasing actuator");
        let stopped = actuator.stop();
        actuator.guard.released = true;
        let closed = actuator.guard.driver.close();

        // Report the stop failure first; the connection is closed either way
        stopped.and(closed)
    }

    pub fn is_released(&self) -> bool {
        self.lock().guard.released
    }
}

/// Held lock on the actuator
pub struct ActuatorGuard<'a, D: MotionDriver> {
    guard: MutexGuard<'a, Actuator<D>>,
}

impl<D: MotionDriver> ActuatorGuard<'_, D> {
    fn driver(&mut self) -> Result<&mut D, DriverError> {
        if self.guard.released {
            return Err(DriverError::Released);
        }
        Ok(&mut self.guard.driver)
    }

    /// Command linear (m/s) and angular (rad/s) velocity
    pub fn set_velocity(&mut self, linear_mps: f64, angular_radps: f64) -> Result<(), DriverError> {
        let trans = mps_to_mm_s(linear_mps);
        let rot = radps_to_deg_s(angular_radps);
        debug!("Setting velocity: {:.1} mm/s, {:.2} deg/s", trans, rot);
        self.driver()?.set_native_velocity(trans, rot)
    }

    pub fn stop(&mut self) -> Result<(), DriverError> {
        self.set_velocity(0.0, 0.0)
    }

    /// Current pose in metres and radians
    pub fn pose(&mut self) -> Result<Pose, DriverError> {
        let native = self.driver()?.native_pose()?;
        Ok(Pose::from(native))
    }
}
