//! Device identity types shared by the server and the client.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device number as used on the wire (the low 16 bits of a device address).
pub type DevNum = u16;

/// Session identity, unique per device.  Zero means "not yet assigned".
pub type SessionId = u16;

/// Size of the CKD track header (`HA`: bin, cc, hh) kept uncompressed in READ replies.
pub const CKD_TRACK_HEADER_SIZE: usize = 5;

/// Addressing geometry of a shared device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Count-Key-Data: track-addressed.
    Ckd,
    /// Fixed-Block Architecture: block-group-addressed.
    Fba,
}

impl DeviceKind {
    /// Number of leading image bytes that should stay uncompressed on READ.
    pub fn image_prefix(self) -> usize {
        match self {
            DeviceKind::Ckd => CKD_TRACK_HEADER_SIZE,
            DeviceKind::Fba => 0,
        }
    }

    /// Name of the addressable unit, for log output.
    pub fn unit_name(self) -> &'static str {
        match self {
            DeviceKind::Ckd => "track",
            DeviceKind::Fba => "block",
        }
    }
}

/// Error returned when a device address string cannot be parsed.
#[derive(Debug, Error, PartialEq)]
#[error("invalid device address '{0}': expected [lcss:]hhhh")]
pub struct DevAddrError(pub String);

/// A device address in `lcss:devnum` form, e.g. `0:0190`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevAddr {
    pub lcss: u8,
    pub devnum: DevNum,
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:04X}", self.lcss, self.devnum)
    }
}

impl FromStr for DevAddr {
    type Err = DevAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DevAddrError(s.to_string());
        let (lcss, num) = match s.split_once(':') {
            Some((l, n)) => (l.parse::<u8>().map_err(|_| err())?, n),
            None => (0, s),
        };
        if num.is_empty() || num.len() > 4 {
            return Err(err());
        }
        let devnum = u16::from_str_radix(num, 16).map_err(|_| err())?;
        Ok(DevAddr { lcss, devnum })
    }
}
