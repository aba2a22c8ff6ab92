//! Device handler backed by a flat image file of fixed-size tracks/blocks.
//!
//! Unit `n` lives at byte offset `n * unit_size`.  A missing file is created
//! and formatted with blank units on `init`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use shrd_core::protocol::{QuerySelector, SENSE_SIZE};
use shrd_core::{DevNum, DeviceKind};
use tracing::{debug, info};

use crate::application::handler::{equipment_check_sense, DeviceHandler, HandlerError};
use crate::infrastructure::device::Geometry;

/// A device stored in an image file.
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    geometry: Geometry,
    file: Option<File>,
    sense: [u8; SENSE_SIZE],
}

impl FileDevice {
    pub fn new(
        path: impl Into<PathBuf>,
        kind: DeviceKind,
        devnum: DevNum,
        units: u32,
        unit_size: usize,
    ) -> Self {
        Self {
            path: path.into(),
            geometry: Geometry::new(kind, devnum, units, unit_size),
            file: None,
            sense: [0; SENSE_SIZE],
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&mut self, block: u32, err: std::io::Error) -> HandlerError {
        self.sense = equipment_check_sense(block);
        HandlerError::Io {
            unit: self.geometry.kind.unit_name(),
            number: block,
            message: err.to_string(),
        }
    }

    fn format(&mut self) -> std::io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.seek(SeekFrom::Start(0))?;
        for block in 0..self.geometry.units {
            file.write_all(&self.geometry.blank_unit(block))?;
        }
        file.flush()
    }

    fn unit_offset(&self, block: u32) -> u64 {
        block as u64 * self.geometry.unit_size as u64
    }
}

impl DeviceHandler for FileDevice {
    fn kind(&self) -> DeviceKind {
        self.geometry.kind
    }

    fn init(&mut self) -> Result<(), HandlerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error(0, e))?;
        let len = file.metadata().map_err(|e| self.io_error(0, e))?.len();
        self.file = Some(file);
        if len == 0 {
            info!(
                "formatting new image {} ({} {}s)",
                self.path.display(),
                self.geometry.units,
                self.geometry.kind.unit_name()
            );
            self.format().map_err(|e| self.io_error(0, e))?;
        }
        Ok(())
    }

    fn read(&mut self, block: u32) -> Result<Vec<u8>, HandlerError> {
        self.geometry.check(block)?;
        let offset = self.unit_offset(block);
        let mut image = vec![0u8; self.geometry.unit_size];
        let file = self.file.as_mut().ok_or(HandlerError::NotOpen)?;
        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut image));
        result.map_err(|e| self.io_error(block, e))?;
        Ok(image)
    }

    fn write(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<(), HandlerError> {
        self.geometry.check(block)?;
        if offset as usize + data.len() > self.geometry.unit_size {
            return Err(HandlerError::OutOfRange(block));
        }
        let position = self.unit_offset(block) + offset as u64;
        let file = self.file.as_mut().ok_or(HandlerError::NotOpen)?;
        let result = file
            .seek(SeekFrom::Start(position))
            .and_then(|_| file.write_all(data));
        result.map_err(|e| self.io_error(block, e))?;
        debug!("wrote {} bytes to {} {block}", data.len(), self.geometry.kind.unit_name());
        Ok(())
    }

    fn close(&mut self) -> Result<(), HandlerError> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|e| self.io_error(0, e))?;
        }
        Ok(())
    }

    fn start(&mut self) {}

    fn end(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    fn suspend(&mut self) {}

    fn resume(&mut self) {}

    fn reserve(&mut self) {}

    fn release(&mut self) {}

    fn used(&self) -> u32 {
        self.geometry.units
    }

    fn sense(&self) -> [u8; SENSE_SIZE] {
        self.sense
    }

    fn query(&self, selector: QuerySelector) -> Result<Vec<u8>, HandlerError> {
        self.geometry.answer(selector, self.used())
    }
}
