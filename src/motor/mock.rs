// Recording driver shared by the unit tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use super::driver::{DriverError, MotionDriver, NativePose};

/// One velocity write as seen by the driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Write {
    pub trans_mm_s: f64,
    pub rot_deg_s: f64,
}

impl Write {
    pub fn new(trans_mm_s: f64, rot_deg_s: f64) -> Self {
        Self {
            trans_mm_s,
            rot_deg_s,
        }
    }

    pub fn stop() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn is_stop(&self) -> bool {
        self.trans_mm_s == 0.0 && self.rot_deg_s == 0.0
    }
}

#[derive(Default)]
struct Recorded {
    writes: Vec<(Instant, Write)>,
    pose: NativePose,
    fail_writes: bool,
    fail_pose: bool,
    // Blocking sleep per pose read or velocity write, like a slow serial link
    delay: Duration,
    closes: usize,
}

/// Handle for inspecting and steering a MockDriver after it was moved
#[derive(Clone, Default)]
pub struct MockLog(Arc<Mutex<Recorded>>);

impl MockLog {
    fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn writes(&self) -> Vec<Write> {
        self.with(|r| r.writes.iter().map(|&(_, w)| w).collect())
    }

    pub fn timed_writes(&self) -> Vec<(Instant, Write)> {
        self.with(|r| r.writes.clone())
    }

    pub fn close_count(&self) -> usize {
        self.with(|r| r.closes)
    }

    pub fn set_pose(&self, pose: NativePose) {
        self.with(|r| r.pose = pose);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.with(|r| r.fail_writes = fail);
    }

    pub fn fail_pose(&self, fail: bool) {
        self.with(|r| r.fail_pose = fail);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.with(|r| r.delay = delay);
    }

    fn stall(&self) {
        let delay = self.with(|r| r.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

pub struct MockDriver {
    log: MockLog,
}

impl MockDriver {
    pub fn new() -> (Self, MockLog) {
        let log = MockLog::default();
        (Self { log: log.clone() }, log)
    }
}

fn injected() -> DriverError {
    DriverError::Io(std::io::Error::other("injected failure"))
}

impl MotionDriver for MockDriver {
    fn set_native_velocity(&mut self, trans_mm_s: f64, rot_deg_s: f64) -> Result<(), DriverError> {
        self.log.stall();
        self.log.with(|r| {
            if r.fail_writes {
                return Err(injected());
            }
            r.writes
                .push((Instant::now(), Write::new(trans_mm_s, rot_deg_s)));
            Ok(())
        })
    }

    fn native_pose(&mut self) -> Result<NativePose, DriverError> {
        self.log.stall();
        self.log.with(|r| if r.fail_pose { Err(injected()) } else { Ok(r.pose) })
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.log.with(|r| r.closes += 1);
        Ok(())
    }
}
