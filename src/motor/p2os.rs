// Pioneer P2OS serial protocol implementation
//
// Packet format: [0xFA, 0xFB, Count, Payload..., Checksum hi, Checksum lo]
// Count covers the payload and the two checksum bytes.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::driver::{DriverError, MotionDriver, NativePose};
use super::units::normalize_deg;
use crate::config::ConnectionParams;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFA, 0xFB];

/// The controller never sends packets longer than this
const MAX_COUNT: usize = 200;

pub const DEFAULT_TIMEOUT_MS: u64 = 100;
const SYNC_ATTEMPTS: u32 = 5;

/// The controller halts the motors if it hears nothing for ~2 s
const PULSE_INTERVAL: Duration = Duration::from_secs(1);

/// Heading resolution reported in SIPs
const ANGLE_UNITS_PER_REV: f64 = 4096.0;

/// Encoder ticks to millimetres for the P3-AT
const DIST_CONV_FACTOR: f64 = 1.0;

/// Client command numbers
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Command {
    Pulse = 0,
    Open = 1,
    Close = 2,
    Enable = 4,
    SetV = 6,
    SetRv = 10,
    Vel = 11,
    RVel = 21,
}

/// Synchronisation handshake packets, sent in order
const SYNC_STAGES: [(u8, &str); 3] = [(0, "SYNC0"), (1, "SYNC1"), (2, "SYNC2")];

/// Argument type markers
const ARG_POS_INT: u8 = 0x3B;
const ARG_NEG_INT: u8 = 0x1B;

/// 16-bit checksum over the payload: big-endian word sum, odd byte XORed in
fn checksum(data: &[u8]) -> u16 {
    let mut words = data.chunks_exact(2);
    let mut sum: u16 = 0;
    for pair in &mut words {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = words.remainder() {
        sum ^= *last as u16;
    }
    sum
}

/// Frame a payload with header, count and checksum
fn build_packet(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 5);
    packet.extend_from_slice(&HEADER);
    packet.push((payload.len() + 2) as u8);
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&checksum(payload).to_be_bytes());
    packet
}

/// Build a command packet with an optional signed integer argument
fn command_packet(command: Command, arg: Option<i16>) -> Vec<u8> {
    let mut payload = vec![command as u8];
    if let Some(value) = arg {
        payload.push(if value < 0 { ARG_NEG_INT } else { ARG_POS_INT });
        payload.extend_from_slice(&value.unsigned_abs().to_le_bytes());
    }
    build_packet(&payload)
}

/// Round and saturate a native setpoint to the wire range
fn to_wire(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Reassembles packets from an arbitrary byte stream
#[derive(Debug, Default)]
pub struct PacketReader {
    buf: Vec<u8>,
}

impl PacketReader {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete packet payload, if one is buffered
    pub fn next_packet(&mut self) -> Option<Result<Vec<u8>>> {
        match self.buf.windows(2).position(|w| w == HEADER) {
            Some(start) => {
                self.buf.drain(..start);
            }
            None => {
                // Keep a trailing first header byte, the second may still come
                let keep = usize::from(self.buf.last() == Some(&HEADER[0]));
                self.buf.drain(..self.buf.len() - keep);
                return None;
            }
        }

        if self.buf.len() < 3 {
            return None;
        }

        let count = self.buf[2] as usize;
        if !(3..=MAX_COUNT).contains(&count) {
            // Skip this header and resynchronise on the next one
            self.buf.drain(..2);
            return Some(Err(DriverError::InvalidPacket {
                reason: format!("bad byte count {}", count),
            }));
        }

        if self.buf.len() < 3 + count {
            return None;
        }

        let packet: Vec<u8> = self.buf.drain(..3 + count).collect();
        let payload = &packet[3..packet.len() - 2];
        let received = u16::from_be_bytes([packet[packet.len() - 2], packet[packet.len() - 1]]);
        let expected = checksum(payload);

        if expected != received {
            return Some(Err(DriverError::ChecksumMismatch { expected, received }));
        }
        Some(Ok(payload.to_vec()))
    }
}

/// Standard server information packet (the fields the bridge uses)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sip {
    pub moving: bool,
    pub x_raw: u16,
    pub y_raw: u16,
    pub th_raw: i16,
    pub left_vel_mm_s: i16,
    pub right_vel_mm_s: i16,
    /// Battery charge in tenths of a volt
    pub battery_dv: u8,
}

impl Sip {
    const MIN_LEN: usize = 12;

    /// Decode a payload. Packets that are not standard SIPs yield `None`.
    pub fn decode(payload: &[u8]) -> Result<Option<Self>> {
        let Some(&kind) = payload.first() else {
            return Ok(None);
        };
        if !matches!(kind, 0x32..=0x34) {
            return Ok(None);
        }
        if payload.len() < Self::MIN_LEN {
            return Err(DriverError::InvalidPacket {
                reason: format!("SIP too short: {} bytes", payload.len()),
            });
        }

        let word = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
        Ok(Some(Self {
            moving: kind == 0x33,
            x_raw: word(1),
            y_raw: word(3),
            th_raw: word(5) as i16,
            left_vel_mm_s: word(7) as i16,
            right_vel_mm_s: word(9) as i16,
            battery_dv: payload[11],
        }))
    }

    pub fn battery_volts(&self) -> f64 {
        self.battery_dv as f64 / 10.0
    }
}

/// Difference of two 15-bit wrapping encoder counters
fn wrap_delta(new: u16, old: u16) -> i32 {
    let delta = (new & 0x7FFF) as i32 - (old & 0x7FFF) as i32;
    if delta > 0x4000 {
        delta - 0x8000
    } else if delta < -0x4000 {
        delta + 0x8000
    } else {
        delta
    }
}

/// Dead-reckoned position built from successive SIPs
#[derive(Debug, Default)]
pub struct Odometry {
    last_raw: Option<(u16, u16)>,
    pose: NativePose,
}

impl Odometry {
    pub fn update(&mut self, sip: &Sip) {
        if let Some((last_x, last_y)) = self.last_raw {
            self.pose.x_mm += wrap_delta(sip.x_raw, last_x) as f64 * DIST_CONV_FACTOR;
            self.pose.y_mm += wrap_delta(sip.y_raw, last_y) as f64 * DIST_CONV_FACTOR;
        }
        self.last_raw = Some((sip.x_raw, sip.y_raw));
        self.pose.heading_deg = normalize_deg(sip.th_raw as f64 * 360.0 / ANGLE_UNITS_PER_REV);
    }

    pub fn pose(&self) -> NativePose {
        self.pose
    }
}

/// Name, class and subclass reported during the SYNC2 handshake
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotIdentity {
    pub name: String,
    pub class: String,
    pub subclass: String,
}

impl RobotIdentity {
    fn parse(data: &[u8]) -> Self {
        let mut fields = data
            .split(|&b| b == 0)
            .map(|s| String::from_utf8_lossy(s).trim().to_string());
        Self {
            name: fields.next().unwrap_or_default(),
            class: fields.next().unwrap_or_default(),
            subclass: fields.next().unwrap_or_default(),
        }
    }
}

/// Open connection to a Pioneer controller
pub struct P2osRobot {
    port: Box<dyn SerialPort>,
    reader: PacketReader,
    odometry: Odometry,
    identity: RobotIdentity,
    last_sip: Option<Sip>,
    last_write: Instant,
    closed: bool,
}

impl P2osRobot {
    /// Open the port, synchronise, enable the motors and write the velocity
    /// caps. The robot is left stopped.
    pub fn connect(params: &ConnectionParams) -> Result<Self> {
        info!("Opening robot connection on {} at {} baud", params.port, params.baud);
        let port = serialport::new(&params.port, params.baud)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        let mut robot = Self {
            port,
            reader: PacketReader::default(),
            odometry: Odometry::default(),
            identity: RobotIdentity::default(),
            last_sip: None,
            last_write: Instant::now(),
            // Nothing to close until OPEN has been sent
            closed: true,
        };

        // A controller left open by a previous client keeps streaming SIPs
        robot.send(Command::Close, None)?;
        robot.port.clear(ClearBuffer::Input)?;

        robot.sync()?;
        robot.send(Command::Open, None)?;
        robot.closed = false;
        info!(
            "Connected to {} ({} {})",
            robot.identity.name, robot.identity.class, robot.identity.subclass
        );

        robot.send(Command::SetV, Some(to_wire(params.max_trans_vel_mm_s as f64)))?;
        robot.send(Command::SetRv, Some(to_wire(params.max_rot_vel_deg_s as f64)))?;
        robot.send(Command::Enable, Some(1))?;
        robot.set_native_velocity(0.0, 0.0)?;

        Ok(robot)
    }

    pub fn identity(&self) -> &RobotIdentity {
        &self.identity
    }

    /// Most recent SIP, refreshed by `native_pose`
    pub fn last_sip(&self) -> Option<&Sip> {
        self.last_sip.as_ref()
    }

    fn sync(&mut self) -> Result<()> {
        for (stage, name) in SYNC_STAGES {
            self.sync_stage(stage, name)?;
        }
        Ok(())
    }

    fn sync_stage(&mut self, stage: u8, name: &'static str) -> Result<()> {
        for attempt in 1..=SYNC_ATTEMPTS {
            self.write_packet(&build_packet(&[stage]))?;
            match self.read_packet() {
                Ok(Some(payload)) if payload.first() == Some(&stage) => {
                    debug!("{} acknowledged", name);
                    if stage == 2 {
                        self.identity = RobotIdentity::parse(&payload[1..]);
                    }
                    return Ok(());
                }
                Ok(_) => debug!("{} attempt {}: no echo", name, attempt),
                Err(e) => debug!("{} attempt {}: {}", name, attempt, e),
            }
        }
        Err(DriverError::SyncFailed {
            stage: name,
            attempts: SYNC_ATTEMPTS,
        })
    }

    fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        self.last_write = Instant::now();
        Ok(())
    }

    fn send(&mut self, command: Command, arg: Option<i16>) -> Result<()> {
        debug!("Sending {:?} {:?}", command, arg);
        self.write_packet(&command_packet(command, arg))
    }

    /// Block until one packet arrives or the read timeout passes
    fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
        let mut chunk = [0u8; 64];
        loop {
            if let Some(packet) = self.reader.next_packet() {
                return packet.map(Some);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match self.port.read(&mut chunk) {
                Ok(n) => self.reader.feed(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Consume every SIP already waiting on the port
    fn drain_sips(&mut self) -> Result<()> {
        let available = self.port.bytes_to_read()? as usize;
        if available > 0 {
            let mut buf = vec![0u8; available];
            self.port.read_exact(&mut buf)?;
            self.reader.feed(&buf);
        }

        while let Some(packet) = self.reader.next_packet() {
            match packet.and_then(|payload| Sip::decode(&payload)) {
                Ok(Some(sip)) => {
                    self.odometry.update(&sip);
                    self.last_sip = Some(sip);
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping robot packet: {}", e),
            }
        }
        Ok(())
    }
}

impl MotionDriver for P2osRobot {
    fn set_native_velocity(&mut self, trans_mm_s: f64, rot_deg_s: f64) -> Result<()> {
        self.send(Command::Vel, Some(to_wire(trans_mm_s)))?;
        self.send(Command::RVel, Some(to_wire(rot_deg_s)))
    }

    fn native_pose(&mut self) -> Result<NativePose> {
        self.drain_sips()?;
        if self.last_write.elapsed() >= PULSE_INTERVAL {
            self.send(Command::Pulse, None)?;
        }
        Ok(self.odometry.pose())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Closing robot connection");
        self.set_native_velocity(0.0, 0.0)?;
        self.send(Command::Close, None)
    }
}

impl Drop for P2osRobot {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close robot connection on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sip_payload(x: u16, y: u16, th: i16) -> Vec<u8> {
        let mut payload = vec![0x33];
        payload.extend_from_slice(&x.to_le_bytes());
        payload.extend_from_slice(&y.to_le_bytes());
        payload.extend_from_slice(&th.to_le_bytes());
        payload.extend_from_slice(&120i16.to_le_bytes());
        payload.extend_from_slice(&(-80i16).to_le_bytes());
        payload.push(125);
        payload
    }

    #[test]
    fn test_sync_packets() {
        assert_eq!(build_packet(&[0]), vec![0xFA, 0xFB, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(build_packet(&[1]), vec![0xFA, 0xFB, 0x03, 0x01, 0x00, 0x01]);
        assert_eq!(build_packet(&[2]), vec![0xFA, 0xFB, 0x03, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn test_enable_packet() {
        let packet = command_packet(Command::Enable, Some(1));
        assert_eq!(packet, vec![0xFA, 0xFB, 0x06, 0x04, 0x3B, 0x01, 0x00, 0x05, 0x3B]);
    }

    #[test]
    fn test_negative_argument() {
        // VEL -100: 0x0B1B + 0x6400 = 0x6F1B
        let packet = command_packet(Command::Vel, Some(-100));
        assert_eq!(packet, vec![0xFA, 0xFB, 0x06, 0x0B, 0x1B, 0x64, 0x00, 0x6F, 0x1B]);
    }

    #[test]
    fn test_to_wire_rounds_and_saturates() {
        assert_eq!(to_wire(999.6), 1000);
        assert_eq!(to_wire(-57.29), -57);
        assert_eq!(to_wire(1e9), i16::MAX);
        assert_eq!(to_wire(-1e9), i16::MIN);
        assert_eq!(to_wire(f64::NAN), 0);
    }

    #[test]
    fn test_reader_reassembles_split_packets() {
        let packet = build_packet(&sip_payload(10, 20, 1024));
        let mut reader = PacketReader::default();

        // Line noise, then the packet split across two reads
        reader.feed(&[0x00, 0x42, 0xFA]);
        reader.feed(&packet[..5]);
        assert!(reader.next_packet().is_none());

        reader.feed(&packet[5..]);
        let payload = reader.next_packet().unwrap().unwrap();
        assert_eq!(payload, sip_payload(10, 20, 1024));
        assert!(reader.next_packet().is_none());
    }

    #[test]
    fn test_reader_flags_corrupt_checksum() {
        let mut packet = build_packet(&[0x33, 1, 2, 3]);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;

        let mut reader = PacketReader::default();
        reader.feed(&packet);
        reader.feed(&build_packet(&[0x01]));

        assert!(matches!(
            reader.next_packet(),
            Some(Err(DriverError::ChecksumMismatch { .. }))
        ));
        // The reader recovers on the following packet
        assert_eq!(reader.next_packet().unwrap().unwrap(), vec![0x01]);
    }

    #[test]
    fn test_reader_rejects_bad_count() {
        let mut reader = PacketReader::default();
        reader.feed(&[0xFA, 0xFB, 0x01]);
        assert!(matches!(
            reader.next_packet(),
            Some(Err(DriverError::InvalidPacket { .. }))
        ));
    }

    #[test]
    fn test_decode_sip() {
        let sip = Sip::decode(&sip_payload(300, 0x7FFF, -1024)).unwrap().unwrap();
        assert!(sip.moving);
        assert_eq!(sip.x_raw, 300);
        assert_eq!(sip.y_raw, 0x7FFF);
        assert_eq!(sip.th_raw, -1024);
        assert_eq!(sip.left_vel_mm_s, 120);
        assert_eq!(sip.right_vel_mm_s, -80);
        assert_eq!(sip.battery_volts(), 12.5);

        // Echo and config packets are not SIPs
        assert_eq!(Sip::decode(&[0x02, b'P', 0]).unwrap(), None);
        assert!(Sip::decode(&[0x32, 0, 0]).is_err());
    }

    #[test]
    fn test_odometry_unwraps_encoder_counters() {
        let mut odometry = Odometry::default();
        let decode = |x, y, th| Sip::decode(&sip_payload(x, y, th)).unwrap().unwrap();

        odometry.update(&decode(0x7FF0, 100, 0));
        assert_eq!(odometry.pose(), NativePose::default());

        // X wraps forward past 0x7FFF, Y moves backwards
        odometry.update(&decode(0x0010, 40, 1024));
        let pose = odometry.pose();
        assert_eq!(pose.x_mm, 32.0);
        assert_eq!(pose.y_mm, -60.0);
        assert_eq!(pose.heading_deg, 90.0);

        // Backwards across the wrap
        odometry.update(&decode(0x7FF0, 40, -2048));
        let pose = odometry.pose();
        assert_eq!(pose.x_mm, 0.0);
        assert_eq!(pose.heading_deg, 180.0);
    }

    #[test]
    fn test_robot_identity() {
        let identity = RobotIdentity::parse(b"P3AT-1\0Pioneer\0p3at\0");
        assert_eq!(identity.name, "P3AT-1");
        assert_eq!(identity.class, "Pioneer");
        assert_eq!(identity.subclass, "p3at");
    }
}
