//! The device handler seam: everything the server needs from the emulated device.
//!
//! The server never interprets track or block images.  It moves them between
//! the wire and a [`DeviceHandler`], which owns the real storage (an image
//! file, an in-memory image, or a compressed store outside this crate).
//!
//! Calls are serialized by the owning `Device`: a handler is only ever used
//! by one caller at a time, so implementations need no locking of their own.

use shrd_core::protocol::{QuerySelector, SENSE_SIZE};
use shrd_core::DeviceKind;
use thiserror::Error;

/// Errors reported by a device handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The device failed the I/O.  Details are available through `sense()`.
    #[error("I/O error on {unit} {number}: {message}")]
    Io {
        unit: &'static str,
        number: u32,
        message: String,
    },

    /// The track or block number is beyond the end of the device.
    #[error("{0} is beyond the end of the device")]
    OutOfRange(u32),

    /// The handler cannot answer this QUERY selector.
    #[error("query selector {0:?} is not supported by this device")]
    UnsupportedQuery(QuerySelector),

    /// The handler has not been initialised or was already closed.
    #[error("device is not open")]
    NotOpen,
}

/// Operations the server performs on a shared device.
///
/// `block` is a track number for CKD devices and a block-group number for
/// FBA devices.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceHandler: Send {
    /// Addressing geometry of the device.
    fn kind(&self) -> DeviceKind;

    /// Opens the device.  Called once when the device is registered.
    fn init(&mut self) -> Result<(), HandlerError>;

    /// Returns the full image of `block`.
    fn read(&mut self, block: u32) -> Result<Vec<u8>, HandlerError>;

    /// Writes `data` into `block` at byte `offset`.
    fn write(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<(), HandlerError>;

    /// Flushes and closes the device.
    fn close(&mut self) -> Result<(), HandlerError>;

    /// A user became the active owner.
    fn start(&mut self);

    /// The active owner finished.
    fn end(&mut self);

    /// The active owner suspended its use.
    fn suspend(&mut self);

    /// A suspended user resumed.
    fn resume(&mut self);

    /// The active owner reserved the device.
    fn reserve(&mut self);

    /// The active owner released its reservation.
    fn release(&mut self);

    /// Number of tracks/blocks currently in use.
    fn used(&self) -> u32;

    /// Sense bytes describing the most recent I/O error.
    fn sense(&self) -> [u8; SENSE_SIZE];

    /// Answers a QUERY request.
    fn query(&self, selector: QuerySelector) -> Result<Vec<u8>, HandlerError>;

    /// Number of leading image bytes kept uncompressed in READ replies.
    fn image_prefix(&self) -> usize {
        self.kind().image_prefix()
    }
}

/// Sense bytes for an equipment check on `number`, in the layout both
/// bundled handlers use: byte 0 = equipment check, bytes 4..8 = unit number.
pub fn equipment_check_sense(number: u32) -> [u8; SENSE_SIZE] {
    let mut sense = [0u8; SENSE_SIZE];
    sense[0] = 0x10;
    sense[4..8].copy_from_slice(&number.to_be_bytes());
    sense
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equipment_check_sense_carries_unit_number() {
        let sense = equipment_check_sense(0x0102_0304);
        assert_eq!(sense[0], 0x10);
        assert_eq!(&sense[4..8], &[1, 2, 3, 4]);
        assert!(sense[8..].iter().all(|&b| b == 0));
    }
}
