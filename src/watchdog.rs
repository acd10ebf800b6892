// Command watchdog
// Note: commands only say what the teleoperator wants; the watchdog decides
// whether the robot may keep moving. If commands stop arriving (teleop crashed,
// operator let go of the controls) the robot is stopped.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::messages::VelocityCommand;
use crate::motor::{DriverError, MotionAdapter, MotionDriver};

/// What the control loop must do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    NoAction,
    ForceStop,
}

/// Idle-time bookkeeping between command arrivals
#[derive(Debug, Clone)]
pub struct WatchdogState {
    elapsed_idle: Duration,
    timeout: Duration,
    // Set when an actuator write failed and nothing has succeeded since
    actuator_unknown: bool,
}

impl WatchdogState {
    pub fn new(timeout: Duration) -> Self {
        Self {
            elapsed_idle: Duration::ZERO,
            timeout,
            actuator_unknown: false,
        }
    }

    /// A command was applied
    pub fn reset(&mut self) {
        self.elapsed_idle = Duration::ZERO;
        self.actuator_unknown = false;
    }

    /// Accumulate one tick's delta and evaluate the timeout.
    ///
    /// A zero delta (the loop's stand-in for a clock that went backwards) is
    /// not accumulated, but the current idle time is still evaluated.
    pub fn on_tick(&mut self, delta: Duration) -> WatchdogAction {
        if delta > Duration::ZERO {
            self.elapsed_idle = self.elapsed_idle.saturating_add(delta);
        }

        if self.is_expired() || self.actuator_unknown {
            WatchdogAction::ForceStop
        } else {
            WatchdogAction::NoAction
        }
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed_idle > self.timeout
    }

    pub fn mark_actuator_unknown(&mut self) {
        self.actuator_unknown = true;
    }

    /// A stop reached the actuator, so its state is known again
    pub fn stop_applied(&mut self) {
        self.actuator_unknown = false;
    }

    pub fn is_actuator_unknown(&self) -> bool {
        self.actuator_unknown
    }

    pub fn elapsed_idle(&self) -> Duration {
        self.elapsed_idle
    }
}

/// Watchdog sharing the actuator lock with every write path.
///
/// Lock order is always actuator, then watchdog state.
pub struct CommandWatchdog<D: MotionDriver> {
    adapter: Arc<MotionAdapter<D>>,
    state: Mutex<WatchdogState>,
}

impl<D: MotionDriver> CommandWatchdog<D> {
    pub fn new(adapter: Arc<MotionAdapter<D>>, timeout: Duration) -> Self {
        Self {
            adapter,
            state: Mutex::new(WatchdogState::new(timeout)),
        }
    }

    fn state(&self) -> MutexGuard<'_, WatchdogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a command and reset the idle time in one critical section.
    /// A failed write leaves the idle time running.
    pub fn on_command(&self, cmd: &VelocityCommand) -> Result<(), DriverError> {
        let mut actuator = self.adapter.lock();
        match actuator.set_velocity(cmd.linear_mps, cmd.angular_radps) {
            Ok(()) => {
                self.state().reset();
                Ok(())
            }
            Err(e) => {
                self.state().mark_actuator_unknown();
                Err(e)
            }
        }
    }

    /// Accumulate a tick delta and evaluate. Does not touch the actuator.
    pub fn on_tick(&self, delta: Duration) -> WatchdogAction {
        self.state().on_tick(delta)
    }

    /// Evaluate the tick while holding the actuator lock and stop the robot
    /// if the watchdog says so. A command arriving concurrently is applied
    /// either entirely before the evaluation or after the stop.
    pub fn enforce(&self, delta: Duration) -> Result<WatchdogAction, DriverError> {
        let mut actuator = self.adapter.lock();
        let action = self.on_tick(delta);

        if action == WatchdogAction::ForceStop {
            debug!("Watchdog forcing stop (idle {:?})", self.elapsed_idle());
            if let Err(e) = actuator.stop() {
                warn!("Forced stop failed, retrying next tick: {}", e);
                self.state().mark_actuator_unknown();
                return Err(e);
            }
            self.state().stop_applied();
        }
        Ok(action)
    }

    pub fn elapsed_idle(&self) -> Duration {
        self.state().elapsed_idle()
    }

    pub fn is_actuator_unknown(&self) -> bool {
        self.state().is_actuator_unknown()
    }

    pub fn adapter(&self) -> &Arc<MotionAdapter<D>> {
        &self.adapter
    }
}
