// arcfuse_core/src/frames.rs

//! Geodetic reference frames.
//!
//! The world frame of the estimator is a local East-North-Up (ENU) tangent
//! plane anchored at a reference origin. GNSS fixes arrive as WGS-84 geodetic
//! coordinates and are converted through ECEF.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// WGS-84 semi-major axis (m).
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

fn eccentricity_sq() -> f64 {
    WGS84_F * (2.0 - WGS84_F)
}

/// A geodetic position (degrees, degrees, metres above the ellipsoid).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeodeticPoint {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
}

impl GeodeticPoint {
    pub fn new(latitude_deg: f64, longitude_deg: f64, altitude_m: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
            altitude_m,
        }
    }

    /// Earth-centred, Earth-fixed coordinates of this point.
    pub fn to_ecef(&self) -> Vector3<f64> {
        let lat = self.latitude_deg.to_radians();
        let lon = self.longitude_deg.to_radians();
        let e2 = eccentricity_sq();
        let n = WGS84_A / (1.0 - e2 * lat.sin().powi(2)).sqrt();
        Vector3::new(
            (n + self.altitude_m) * lat.cos() * lon.cos(),
            (n + self.altitude_m) * lat.cos() * lon.sin(),
            (n * (1.0 - e2) + self.altitude_m) * lat.sin(),
        )
    }

    /// Inverse of [`GeodeticPoint::to_ecef`] by fixed-point iteration on latitude.
    pub fn from_ecef(ecef: &Vector3<f64>) -> Self {
        let e2 = eccentricity_sq();
        let p = (ecef.x * ecef.x + ecef.y * ecef.y).sqrt();
        let lon = ecef.y.atan2(ecef.x);
        let mut lat = ecef.z.atan2(p * (1.0 - e2));
        let mut alt = 0.0;
        for _ in 0..20 {
            let n = WGS84_A / (1.0 - e2 * lat.sin().powi(2)).sqrt();
            alt = p / lat.cos() - n;
            let next = ecef.z.atan2(p * (1.0 - e2 * n / (n + alt)));
            let converged = (next - lat).abs() < 1e-15;
            lat = next;
            if converged {
                break;
            }
        }
        Self {
            latitude_deg: lat.to_degrees(),
            longitude_deg: lon.to_degrees(),
            altitude_m: alt,
        }
    }
}

/// A local ENU tangent frame anchored at a geodetic origin.
#[derive(Debug, Clone)]
pub struct LocalFrame {
    origin: GeodeticPoint,
    origin_ecef: Vector3<f64>,
    /// Rotation taking ECEF difference vectors into ENU.
    enu_from_ecef: Matrix3<f64>,
}

impl LocalFrame {
    pub fn new(origin: GeodeticPoint) -> Self {
        let lat = origin.latitude_deg.to_radians();
        let lon = origin.longitude_deg.to_radians();
        let (slat, clat) = lat.sin_cos();
        let (slon, clon) = lon.sin_cos();
        #[rustfmt::skip]
        let enu_from_ecef = Matrix3::new(
            -slon,         clon,        0.0,
            -slat * clon, -slat * slon, clat,
             clat * clon,  clat * slon, slat,
        );
        Self {
            origin,
            origin_ecef: origin.to_ecef(),
            enu_from_ecef,
        }
    }

    pub fn origin(&self) -> &GeodeticPoint {
        &self.origin
    }

    /// Geodetic → local ENU.
    pub fn to_enu(&self, point: &GeodeticPoint) -> Vector3<f64> {
        self.enu_from_ecef * (point.to_ecef() - self.origin_ecef)
    }

    /// Local ENU → geodetic.
    pub fn to_geodetic(&self, enu: &Vector3<f64>) -> GeodeticPoint {
        let ecef = self.origin_ecef + self.enu_from_ecef.transpose() * enu;
        GeodeticPoint::from_ecef(&ecef)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn origin_maps_to_zero() {
        let frame = LocalFrame::new(GeodeticPoint::new(48.1351, 11.5820, 520.0));
        let enu = frame.to_enu(frame.origin());
        assert_abs_diff_eq!(enu.norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn enu_round_trip_is_sub_millimetre() {
        let frame = LocalFrame::new(GeodeticPoint::new(48.1351, 11.5820, 520.0));
        let enu = Vector3::new(812.5, -240.25, 3.5);
        let back = frame.to_enu(&frame.to_geodetic(&enu));
        assert_abs_diff_eq!(back.x, enu.x, epsilon = 1e-6);
        assert_abs_diff_eq!(back.y, enu.y, epsilon = 1e-6);
        assert_abs_diff_eq!(back.z, enu.z, epsilon = 1e-6);
    }

    #[test]
    fn north_offset_increases_latitude() {
        let frame = LocalFrame::new(GeodeticPoint::new(10.0, 20.0, 0.0));
        let north = frame.to_geodetic(&Vector3::new(0.0, 1000.0, 0.0));
        assert!(north.latitude_deg > 10.0);
        assert_abs_diff_eq!(north.longitude_deg, 20.0, epsilon = 1e-9);
    }
}
