// P2OS diagnostic: connect to the robot and watch odometry
//
// This tool never commands motion - the robot stays at zero velocity.
//
// Usage: cargo run --example p2os_diagnostic -- [port] [baud]
// Example: cargo run --example p2os_diagnostic -- /dev/ttyUSB0 9600

use p3at_zenoh_bridge::config::{ConnectionParams, DEFAULT_BAUD, DEFAULT_PORT};
use p3at_zenoh_bridge::messages::Pose;
use p3at_zenoh_bridge::motor::{MotionDriver, P2osRobot};
use std::thread::sleep;
use std::time::Duration;

const SAMPLES: usize = 20;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let params = ConnectionParams {
        port: args.next().unwrap_or_else(|| DEFAULT_PORT.to_string()),
        baud: match args.next() {
            Some(baud) => baud.parse()?,
            None => DEFAULT_BAUD,
        },
        ..Default::default()
    };
    params.validate()?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                P3-AT P2OS Diagnostic (NO MOTION)             ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Serial port: {} @ {} baud", params.port, params.baud);
    println!();

    println!("Step 1: Synchronising with the controller...");
    let mut robot = match P2osRobot::connect(&params) {
        Ok(robot) => {
            let id = robot.identity();
            println!("  ✓ Connected to {} ({} {})", id.name, id.class, id.subclass);
            robot
        }
        Err(e) => {
            println!("  ✗ Connection failed: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path and that the robot is powered on");
            println!("  - Most Pioneers run at 9600 baud, the Pioneer LX at 57600");
            println!("  - Make sure no other client holds the port");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Reading odometry (push the robot to see it change)...");
    for _ in 0..SAMPLES {
        sleep(Duration::from_millis(250));
        let pose = Pose::from(robot.native_pose()?);
        let battery = robot
            .last_sip()
            .map(|sip| format!("{:.1} V", sip.battery_volts()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  x={:+.3} m  y={:+.3} m  heading={:+.3} rad  battery={}",
            pose.x_m, pose.y_m, pose.heading_rad, battery
        );
    }
    println!();

    println!("Step 3: Closing connection...");
    robot.close()?;
    println!("  ✓ Done");
    Ok(())
}
