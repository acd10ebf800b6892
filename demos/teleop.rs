// Keyboard teleop: W/S drive, A/D turn, R/F speed, Q quit
//
// Usage: cargo run --example teleop -- [topic]
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use p3at_zenoh_bridge::config::TOPIC_CMD_VELOCITY;
use p3at_zenoh_bridge::messages::VelocityCommand;
use std::time::{Duration, Instant};
use tracing::info;

const SPEEDS: [f64; 3] = [0.1, 0.25, 0.5]; // m/s
const TURN_SPEEDS: [f64; 3] = [0.2, 0.4, 0.78]; // rad/s
const INPUT_TIMEOUT_MS: u64 = 150; // Release controls after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let topic = std::env::args()
        .nth(1)
        .unwrap_or_else(|| TOPIC_CMD_VELOCITY.to_string());

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(topic.clone()).await?;

    info!("Publishing to {}", topic);
    info!("Controls: W/S=drive, A/D=turn, R/F=speed, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut cmd = VelocityCommand::new(0.0, 0.0);
    let mut last_input = Instant::now();

    loop {
        // Poll for key with 50ms timeout (20Hz publish rate)
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('w') if pressed => {
                        cmd.linear_mps = SPEEDS[speed_idx];
                        last_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        cmd.linear_mps = -SPEEDS[speed_idx];
                        last_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        cmd.angular_radps = TURN_SPEEDS[speed_idx];
                        last_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        cmd.angular_radps = -TURN_SPEEDS[speed_idx];
                        last_input = Instant::now();
                    }

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            cmd = VelocityCommand::new(0.0, 0.0);
        }

        // Keep publishing so the bridge watchdog stays fed
        publisher.put(serde_json::to_string(&cmd)?).await?;
    }

    // Leave the robot stopped
    publisher
        .put(serde_json::to_string(&VelocityCommand::new(0.0, 0.0))?)
        .await?;
    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
