//! Geographic primitives: GPS coordinates, great-circle distance and
//! network endpoints.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Distance between two locations, in kilometres.
pub type Distance = f32;

/// Mean Earth radius in kilometres (WGS-84 mean radius sphere).
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point on the Earth surface in decimal degrees.
///
/// Construction is validated: latitude must lie in [-90, 90] and longitude
/// in [-180, 180]. Deserialization goes through the same check, so values
/// outside those ranges never enter the system, not even off the wire.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "(f64, f64)", into = "(f64, f64)")]
pub struct GpsLocation {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<(f64, f64)> for GpsLocation {
    type Error = Error;

    fn try_from((latitude, longitude): (f64, f64)) -> Result<Self> {
        Self::new(latitude, longitude)
    }
}

impl From<GpsLocation> for (f64, f64) {
    fn from(loc: GpsLocation) -> Self {
        (loc.latitude, loc.longitude)
    }
}

impl GpsLocation {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::InvalidValue(format!(
                "latitude {} out of range [-90,90]",
                latitude
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::InvalidValue(format!(
                "longitude {} out of range [-180,180]",
                longitude
            )));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance to `other` in kilometres, by the spherical law
    /// of cosines. Computed in double precision, reported single precision.
    pub fn distance_km(&self, other: &GpsLocation) -> Distance {
        let lat_a = self.latitude.to_radians();
        let lat_b = other.latitude.to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        // Rounding can push the cosine sum epsilon outside [-1, 1].
        let central = (lat_a.sin() * lat_b.sin() + lat_a.cos() * lat_b.cos() * delta_lon.cos())
            .clamp(-1.0, 1.0);

        (central.acos() * EARTH_RADIUS_KM) as Distance
    }
}

impl fmt::Debug for GpsLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4},{:.4})", self.latitude, self.longitude)
    }
}

impl fmt::Display for GpsLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4},{:.4}", self.latitude, self.longitude)
    }
}

/// A contactable network address: textual IPv4/IPv6 literal plus port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl NetworkEndpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Parse a textual IP literal. Host names are not resolved.
    pub fn parse(addr: &str, port: u16) -> Result<Self> {
        let addr = IpAddr::from_str(addr)
            .map_err(|_| Error::InvalidValue(format!("not an IP literal: {}", addr)))?;
        Ok(Self { addr, port })
    }

    /// The overlay refuses loopback endpoints as relations.
    pub fn is_loopback(&self) -> bool {
        self.addr.is_loopback()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<SocketAddr> for NetworkEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self { addr: addr.ip(), port: addr.port() }
    }
}

impl fmt::Debug for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}
