// 10 Hz control loop with command watchdog
// Note: commands are applied the moment they arrive, from their own task. The
// loop only samples the pose, publishes it, and lets the watchdog stop the
// robot when the teleoperator goes quiet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::{Publisher, Subscriber};
use zenoh::sample::Sample;

// local imports
use crate::config::{Args, CMD_TIMEOUT, ConnectionParams, LOOP_HZ, loop_period};
use crate::messages::{Pose, RuntimeHealth, VelocityCommand};
use crate::motor::{DriverError, MotionAdapter, MotionDriver, P2osRobot, SimulatedBase};
use crate::watchdog::{CommandWatchdog, WatchdogAction};

const TELEMETRY_QUEUE: usize = 32;

/// Errors that end the bridge
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Invalid connection arguments: {0}")]
    InvalidArgs(String),

    #[error("Could not connect to robot: {0}")]
    Connect(#[source] DriverError),

    #[error("Zenoh error: {0}")]
    Zenoh(zenoh::Error),

    #[error("Actuator error: {0}")]
    Driver(#[from] DriverError),

    #[error("Command task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<zenoh::Error> for RuntimeError {
    fn from(e: zenoh::Error) -> Self {
        Self::Zenoh(e)
    }
}

impl RuntimeError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgs(_) => 2,
            Self::Connect(_) => 3,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
}

/// Outbound messages produced by the loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Telemetry {
    Pose(Pose),
    Health(RuntimeHealth),
}

pub struct ControlLoop<D: MotionDriver> {
    watchdog: Arc<CommandWatchdog<D>>,
    period: Duration,
    state: LoopState,
    health: RuntimeHealth,
}

impl<D: MotionDriver + 'static> ControlLoop<D> {
    /// The driver must already be connected and stopped
    pub fn new(watchdog: Arc<CommandWatchdog<D>>, period: Duration) -> Self {
        Self {
            watchdog,
            period,
            state: LoopState::Running,
            health: RuntimeHealth::Ok,
        }
    }

    /// Run until the shutdown signal, then stop the robot and release the
    /// connection.
    pub async fn run(
        mut self,
        telemetry: mpsc::Sender<Telemetry>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        let mut last_tick = Instant::now();
        while self.state == LoopState::Running {
            if *shutdown.borrow() {
                self.state = LoopState::Stopping;
                break;
            }

            // Non-monotonic readings count as no time passing
            let now = Instant::now();
            let delta = now.checked_duration_since(last_tick).unwrap_or_default();
            last_tick = now;

            self.iterate(delta, &telemetry).await;

            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed, stopping");
                        self.state = LoopState::Stopping;
                    }
                }
            }
        }

        info!("Control loop stopping");
        let adapter = self.watchdog.adapter().clone();
        match tokio::task::spawn_blocking(move || adapter.release()).await {
            Ok(result) => result,
            Err(e) => Err(DriverError::Io(std::io::Error::other(e))),
        }
    }

    async fn iterate(&mut self, delta: Duration, telemetry: &mpsc::Sender<Telemetry>) {
        let mut fault = false;

        // Serial reads and writes block, so the actuator is only touched on
        // the blocking pool
        let watchdog = self.watchdog.clone();
        let sampled = tokio::task::spawn_blocking(move || {
            let pose = watchdog.adapter().lock().pose();
            // Watchdog evaluation and forced stop, under the actuator lock
            (pose, watchdog.enforce(delta))
        })
        .await;
        let (pose, enforced) = match sampled {
            Ok(sampled) => sampled,
            Err(e) => {
                error!("Actuator task failed: {}", e);
                (
                    Err(DriverError::Io(std::io::Error::other(e.to_string()))),
                    Err(DriverError::Io(std::io::Error::other(e))),
                )
            }
        };

        // 1. Publish pose
        match pose {
            Ok(pose) => self.publish(telemetry, Telemetry::Pose(pose)).await,
            Err(e) => {
                warn!("Failed to read pose: {}", e);
                fault = true;
            }
        }

        // 2 + 3. Outcome of the watchdog evaluation
        let action = match enforced {
            Ok(action) => action,
            Err(_) => {
                // Already logged; the watchdog retries on the next tick
                fault = true;
                WatchdogAction::ForceStop
            }
        };

        let health = if fault || self.watchdog.is_actuator_unknown() {
            RuntimeHealth::ActuatorFault
        } else if action == WatchdogAction::ForceStop {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        };
        self.set_health(health);
        self.publish(telemetry, Telemetry::Health(health)).await;
    }

    fn set_health(&mut self, health: RuntimeHealth) {
        if health == self.health {
            return;
        }
        match health {
            RuntimeHealth::CmdStale => warn!(
                "Command stale ({:?} idle), stopping robot",
                self.watchdog.elapsed_idle()
            ),
            RuntimeHealth::ActuatorFault => warn!("Actuator state unknown"),
            RuntimeHealth::Ok => info!("Runtime healthy"),
        }
        self.health = health;
    }

    async fn publish(&self, telemetry: &mpsc::Sender<Telemetry>, msg: Telemetry) {
        if telemetry.send(msg).await.is_err() {
            debug!("Telemetry receiver gone, dropping {:?}", msg);
        }
    }
}

/// Decode a velocity command payload
pub fn parse_command(payload: &[u8]) -> Option<VelocityCommand> {
    match serde_json::from_slice::<VelocityCommand>(payload) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            warn!("Failed to parse command: {}", e);
            None
        }
    }
}

/// Latest parseable command in a burst; unparseable payloads are skipped
pub fn latest_command<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Option<VelocityCommand> {
    payloads.into_iter().filter_map(parse_command).last()
}

/// Apply one command on the blocking pool (the serial write blocks)
pub async fn apply_command<D: MotionDriver + 'static>(
    watchdog: &Arc<CommandWatchdog<D>>,
    cmd: VelocityCommand,
) -> Result<(), DriverError> {
    let watchdog = watchdog.clone();
    match tokio::task::spawn_blocking(move || watchdog.on_command(&cmd)).await {
        Ok(result) => result,
        Err(e) => Err(DriverError::Io(std::io::Error::other(e))),
    }
}

/// Command intake task: applies the latest received command
async fn handle_commands<D: MotionDriver + 'static>(
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
    watchdog: Arc<CommandWatchdog<D>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let sample = tokio::select! {
            received = subscriber.recv_async() => match received {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("Command subscriber closed: {}", e);
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        // Drain whatever queued up behind it, keep latest
        let mut burst = vec![sample.payload().to_bytes().into_owned()];
        while let Ok(Some(sample)) = subscriber.try_recv() {
            burst.push(sample.payload().to_bytes().into_owned());
        }
        if burst.len() > 1 {
            debug!("Command burst of {}, applying the latest", burst.len());
        }
        let Some(cmd) = latest_command(burst.iter().map(Vec::as_slice)) else {
            continue;
        };

        match apply_command(&watchdog, cmd).await {
            Ok(()) => debug!("Applied command: {:?}", cmd),
            Err(DriverError::Released) => {
                debug!("Actuator released, ignoring further commands");
                break;
            }
            Err(e) => warn!("Failed to apply command {:?}: {}", cmd, e),
        }
    }
    debug!("Command task finished");
}

async fn forward_telemetry(
    mut telemetry: mpsc::Receiver<Telemetry>,
    pub_pose: &Publisher<'_>,
    pub_health: &Publisher<'_>,
) {
    while let Some(msg) = telemetry.recv().await {
        let (publisher, payload) = match msg {
            Telemetry::Pose(pose) => (pub_pose, serde_json::to_string(&pose)),
            Telemetry::Health(health) => (pub_health, serde_json::to_string(&health)),
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode telemetry: {}", e);
                continue;
            }
        };
        if let Err(e) = publisher.put(payload).await {
            warn!("Failed to publish telemetry: {}", e);
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for Ctrl-C: {}", e);
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}

/// Connect to the robot (or the simulator) and run the bridge until signaled
pub async fn run(args: Args) -> Result<(), RuntimeError> {
    let params = ConnectionParams::from(&args);
    params.validate().map_err(RuntimeError::InvalidArgs)?;

    if args.simulate {
        serve(SimulatedBase::new(&params), &args).await
    } else {
        // The SYNC handshake blocks for up to a few seconds
        let robot = tokio::task::spawn_blocking(move || P2osRobot::connect(&params))
            .await?
            .map_err(RuntimeError::Connect)?;
        serve(robot, &args).await
    }
}

async fn serve<D: MotionDriver + 'static>(driver: D, args: &Args) -> Result<(), RuntimeError> {
    let adapter = Arc::new(MotionAdapter::new(driver));
    let result = bridge(adapter.clone(), args).await;

    // No-op when the control loop already released it
    if let Err(e) = adapter.release() {
        warn!("Failed to release actuator: {}", e);
    }
    result
}

async fn bridge<D: MotionDriver + 'static>(
    adapter: Arc<MotionAdapter<D>>,
    args: &Args,
) -> Result<(), RuntimeError> {
    info!("Opening Zenoh session...");
    let config = match &args.zenoh_config {
        Some(path) => zenoh::Config::from_file(path)?,
        None => zenoh::Config::default(),
    };
    let session = zenoh::open(config).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(args.cmd_topic.clone()).await?;
    let pub_pose = session.declare_publisher(args.pose_topic.clone()).await?;
    let pub_health = session.declare_publisher(args.health_topic.clone()).await?;

    let watchdog = Arc::new(CommandWatchdog::new(adapter, CMD_TIMEOUT));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_QUEUE);

    info!(
        "Bridge started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}", args.cmd_topic);
    info!("Publishing to: {}, {}", args.pose_topic, args.health_topic);

    let commands = tokio::spawn(handle_commands(
        subscriber,
        watchdog.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let control = ControlLoop::new(watchdog, loop_period());
    let (stopped, ()) = tokio::join!(
        control.run(telemetry_tx, shutdown_rx),
        forward_telemetry(telemetry_rx, &pub_pose, &pub_health),
    );

    commands.await?;
    session.close().await?;
    stopped?;
    info!("Bridge stopped");
    Ok(())
}
