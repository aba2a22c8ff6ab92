//! Bundled [`DeviceHandler`](crate::application::handler::DeviceHandler) implementations.
//!
//! - [`memory::MemoryDevice`] keeps the image in memory and records every
//!   call; tests and demos use it.
//! - [`file::FileDevice`] stores fixed-size tracks/blocks in a flat image file.

pub mod file;
pub mod memory;

use shrd_core::protocol::QuerySelector;
use shrd_core::{DevNum, DeviceKind};

use crate::application::handler::{DeviceHandler, HandlerError};
use crate::infrastructure::storage::config::{ConfigError, DeviceEntry};

/// Tracks per cylinder on the emulated CKD geometry.
pub const TRACKS_PER_CYLINDER: u32 = 15;

/// Physical block size on the emulated FBA geometry.
pub const FBA_BLOCK_SIZE: u32 = 512;

/// Builds the handler a `[[devices]]` entry describes.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidDevice`] for a malformed entry.
pub fn handler_for(entry: &DeviceEntry) -> Result<(DevNum, Box<dyn DeviceHandler>), ConfigError> {
    let devnum = entry.devnum()?;
    let unit_size = entry.unit_size as usize;
    let handler: Box<dyn DeviceHandler> = match &entry.path {
        Some(path) => Box::new(file::FileDevice::new(path, entry.kind, devnum, entry.units, unit_size)),
        None => Box::new(memory::MemoryDevice::new(entry.kind, devnum, entry.units, unit_size)),
    };
    Ok((devnum, handler))
}

/// Size and identity of an emulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub kind: DeviceKind,
    /// Number of tracks (CKD) or block groups (FBA).
    pub units: u32,
    /// Bytes per track or block group.
    pub unit_size: usize,
    pub serial: [u8; 12],
}

impl Geometry {
    pub fn new(kind: DeviceKind, devnum: DevNum, units: u32, unit_size: usize) -> Self {
        let mut serial = [b'0'; 12];
        serial[..4].copy_from_slice(b"SHRD");
        serial[8..].copy_from_slice(format!("{devnum:04X}").as_bytes());
        Self {
            kind,
            units,
            unit_size,
            serial,
        }
    }

    /// Validates a unit number.
    pub fn check(&self, block: u32) -> Result<(), HandlerError> {
        if block >= self.units {
            return Err(HandlerError::OutOfRange(block));
        }
        Ok(())
    }

    /// Image of a never-written unit.
    ///
    /// CKD tracks start with their home-address header (`bin cc hh`), so a
    /// blank track still identifies itself.
    pub fn blank_unit(&self, block: u32) -> Vec<u8> {
        let mut image = vec![0u8; self.unit_size];
        if self.kind == DeviceKind::Ckd && self.unit_size >= 5 {
            let cc = (block / TRACKS_PER_CYLINDER) as u16;
            let hh = (block % TRACKS_PER_CYLINDER) as u16;
            image[1..3].copy_from_slice(&cc.to_be_bytes());
            image[3..5].copy_from_slice(&hh.to_be_bytes());
        }
        image
    }

    /// Answers a QUERY selector from the geometry and the used-unit count.
    pub fn answer(&self, selector: QuerySelector, used: u32) -> Result<Vec<u8>, HandlerError> {
        let (device_type, cu_type): (u16, u16) = match self.kind {
            DeviceKind::Ckd => (0x3390, 0x3990),
            DeviceKind::Fba => (0x3370, 0x3880),
        };
        let fba_blocks = (self.units as u64 * self.unit_size as u64 / FBA_BLOCK_SIZE as u64) as u32;

        match (selector, self.kind) {
            (QuerySelector::Used, _) => Ok(used.to_be_bytes().to_vec()),
            (QuerySelector::DeviceCharacteristics, _) => {
                let mut chars = Vec::with_capacity(16);
                chars.extend_from_slice(&device_type.to_be_bytes());
                chars.extend_from_slice(&self.units.to_be_bytes());
                chars.extend_from_slice(&(self.unit_size as u32).to_be_bytes());
                chars.resize(16, 0);
                Ok(chars)
            }
            (QuerySelector::DeviceId, _) => {
                let mut id = vec![0xFF];
                id.extend_from_slice(&cu_type.to_be_bytes());
                id.push(0x01);
                id.extend_from_slice(&device_type.to_be_bytes());
                id.push(0x01);
                Ok(id)
            }
            (QuerySelector::SerialNumber, _) => Ok(self.serial.to_vec()),
            (QuerySelector::CkdCylinders, DeviceKind::Ckd) => {
                Ok(self.units.div_ceil(TRACKS_PER_CYLINDER).to_be_bytes().to_vec())
            }
            (QuerySelector::FbaOrigin, DeviceKind::Fba) => Ok(0u32.to_be_bytes().to_vec()),
            (QuerySelector::FbaBlockCount, DeviceKind::Fba) => Ok(fba_blocks.to_be_bytes().to_vec()),
            (QuerySelector::FbaBlockSize, DeviceKind::Fba) => {
                Ok(FBA_BLOCK_SIZE.to_be_bytes().to_vec())
            }
            (other, _) => Err(HandlerError::UnsupportedQuery(other)),
        }
    }
}
