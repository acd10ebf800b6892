// Conversions between bus units (m, m/s, rad) and the controller's
// native units (mm, mm/s, deg).

use std::f64::consts::PI;

use super::driver::NativePose;
use crate::messages::Pose;

const MM_PER_M: f64 = 1000.0;

/// m/s -> mm/s
pub fn mps_to_mm_s(linear_mps: f64) -> f64 {
    linear_mps * MM_PER_M
}

/// rad/s -> deg/s
pub fn radps_to_deg_s(angular_radps: f64) -> f64 {
    angular_radps * 180.0 / PI
}

/// mm -> m
pub fn mm_to_m(mm: f64) -> f64 {
    mm / MM_PER_M
}

/// deg -> rad
pub fn deg_to_rad(deg: f64) -> f64 {
    deg * PI / 180.0
}

/// Normalise an angle in degrees into (-180, 180]
pub fn normalize_deg(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped > 180.0 { wrapped - 360.0 } else { wrapped }
}

impl From<NativePose> for Pose {
    fn from(native: NativePose) -> Self {
        Self {
            x_m: mm_to_m(native.x_mm),
            y_m: mm_to_m(native.y_mm),
            heading_rad: deg_to_rad(native.heading_deg),
        }
    }
}

impl From<Pose> for NativePose {
    fn from(pose: Pose) -> Self {
        Self {
            x_mm: pose.x_m * MM_PER_M,
            y_mm: pose.y_m * MM_PER_M,
            heading_deg: pose.heading_rad * 180.0 / PI,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_velocity_conversion() {
        assert_eq!(mps_to_mm_s(1.0), 1000.0);
        assert_eq!(mps_to_mm_s(-0.5), -500.0);
        assert!((radps_to_deg_s(PI) - 180.0).abs() < EPS);
        assert!((radps_to_deg_s(-PI / 4.0) + 45.0).abs() < EPS);
        assert_eq!(radps_to_deg_s(0.0), 0.0);
    }

    #[test]
    fn test_native_pose_to_pose() {
        let pose = Pose::from(NativePose {
            x_mm: 1500.0,
            y_mm: -250.0,
            heading_deg: 90.0,
        });
        assert!((pose.x_m - 1.5).abs() < EPS);
        assert!((pose.y_m + 0.25).abs() < EPS);
        assert!((pose.heading_rad - PI / 2.0).abs() < EPS);
    }

    #[test]
    fn test_pose_round_trip_recovers_native_values() {
        let samples = [
            NativePose { x_mm: 0.0, y_mm: 0.0, heading_deg: 0.0 },
            NativePose { x_mm: 12345.0, y_mm: -6789.0, heading_deg: 179.9 },
            NativePose { x_mm: -1.0, y_mm: 32767.0, heading_deg: -179.5 },
            NativePose { x_mm: 0.001, y_mm: 1e6, heading_deg: 45.0 },
        ];
        for native in samples {
            let back = NativePose::from(Pose::from(native));
            assert!((back.x_mm - native.x_mm).abs() < 1e-6, "{:?}", native);
            assert!((back.y_mm - native.y_mm).abs() < 1e-6, "{:?}", native);
            assert!((back.heading_deg - native.heading_deg).abs() < 1e-9, "{:?}", native);
        }
    }

    #[test]
    fn test_normalize_deg() {
        assert_eq!(normalize_deg(0.0), 0.0);
        assert_eq!(normalize_deg(180.0), 180.0);
        assert_eq!(normalize_deg(-180.0), 180.0);
        assert_eq!(normalize_deg(270.0), -90.0);
        assert_eq!(normalize_deg(-450.0), -90.0);
        assert!((normalize_deg(359.5) + 0.5).abs() < EPS);
    }
}
