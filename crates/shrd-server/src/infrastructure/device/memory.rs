//! In-memory device handler with call recording and fault injection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use shrd_core::protocol::{QuerySelector, SENSE_SIZE};
use shrd_core::{DevNum, DeviceKind};

use crate::application::handler::{equipment_check_sense, DeviceHandler, HandlerError};
use crate::infrastructure::device::Geometry;

#[derive(Debug, Default)]
struct ProbeState {
    calls: Vec<String>,
    failing: HashSet<u32>,
    image: HashMap<u32, Vec<u8>>,
}

/// Shared view into a [`MemoryDevice`] that stays usable after the device is
/// boxed and handed to the server.
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MemoryProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of the handler methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Makes every read or write of `block` fail with an I/O error.
    pub fn fail_block(&self, block: u32) {
        self.lock().failing.insert(block);
    }

    pub fn heal_block(&self, block: u32) {
        self.lock().failing.remove(&block);
    }

    /// Stored image of `block`, if it was ever written.
    pub fn image(&self, block: u32) -> Option<Vec<u8>> {
        self.lock().image.get(&block).cloned()
    }
}

/// A device whose image lives in memory.
#[derive(Debug)]
pub struct MemoryDevice {
    geometry: Geometry,
    open: bool,
    sense: [u8; SENSE_SIZE],
    probe: MemoryProbe,
}

impl MemoryDevice {
    pub fn new(kind: DeviceKind, devnum: DevNum, units: u32, unit_size: usize) -> Self {
        Self {
            geometry: Geometry::new(kind, devnum, units, unit_size),
            open: false,
            sense: [0; SENSE_SIZE],
            probe: MemoryProbe::default(),
        }
    }

    /// Returns a probe sharing this device's state.
    pub fn probe(&self) -> MemoryProbe {
        self.probe.clone()
    }

    fn record(&self, call: &str) {
        self.probe.lock().calls.push(call.to_string());
    }

    fn check_io(&mut self, block: u32) -> Result<(), HandlerError> {
        if !self.open {
            return Err(HandlerError::NotOpen);
        }
        self.geometry.check(block)?;
        if self.probe.lock().failing.contains(&block) {
            self.sense = equipment_check_sense(block);
            return Err(HandlerError::Io {
                unit: self.geometry.kind.unit_name(),
                number: block,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl DeviceHandler for MemoryDevice {
    fn kind(&self) -> DeviceKind {
        self.geometry.kind
    }

    fn init(&mut self) -> Result<(), HandlerError> {
        self.record("init");
        self.open = true;
        Ok(())
    }

    fn read(&mut self, block: u32) -> Result<Vec<u8>, HandlerError> {
        self.record("read");
        self.check_io(block)?;
        let stored = self.probe.lock().image.get(&block).cloned();
        Ok(stored.unwrap_or_else(|| self.geometry.blank_unit(block)))
    }

    fn write(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<(), HandlerError> {
        self.record("write");
        self.check_io(block)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > self.geometry.unit_size {
            return Err(HandlerError::OutOfRange(block));
        }
        let blank = self.geometry.blank_unit(block);
        let mut state = self.probe.lock();
        let image = state.image.entry(block).or_insert(blank);
        image[start..end].copy_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> Result<(), HandlerError> {
        self.record("close");
        self.open = false;
        Ok(())
    }

    fn start(&mut self) {
        self.record("start");
    }

    fn end(&mut self) {
        self.record("end");
    }

    fn suspend(&mut self) {
        self.record("suspend");
    }

    fn resume(&mut self) {
        self.record("resume");
    }

    fn reserve(&mut self) {
        self.record("reserve");
    }

    fn release(&mut self) {
        self.record("release");
    }

    fn used(&self) -> u32 {
        self.probe.lock().image.len() as u32
    }

    fn sense(&self) -> [u8; SENSE_SIZE] {
        self.sense
    }

    fn query(&self, selector: QuerySelector) -> Result<Vec<u8>, HandlerError> {
        self.geometry.answer(selector, self.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_device() -> MemoryDevice {
        let mut dev = MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256);
        dev.init().unwrap();
        dev
    }

    #[test]
    fn test_write_then_read_returns_updated_image() {
        // Arrange
        let mut dev = open_device();

        // Act
        dev.write(5, 16, &[0xAB; 8]).unwrap();
        let image = dev.read(5).unwrap();

        // Assert
        assert_eq!(&image[16..24], &[0xAB; 8]);
        assert_eq!(&image[..5], &[0, 0, 0, 0, 5], "home address must survive");
        assert_eq!(dev.used(), 1);
    }

    #[test]
    fn test_injected_failure_sets_sense() {
        let mut dev = open_device();
        dev.probe().fail_block(3);

        let err = dev.read(3).unwrap_err();

        assert!(matches!(err, HandlerError::Io { number: 3, .. }));
        assert_eq!(dev.sense(), equipment_check_sense(3));
    }

    #[test]
    fn test_write_past_unit_end_is_rejected() {
        let mut dev = open_device();
        assert_eq!(dev.write(1, 250, &[0; 10]), Err(HandlerError::OutOfRange(1)));
    }

    #[test]
    fn test_read_before_init_is_not_open() {
        let mut dev = MemoryDevice::new(DeviceKind::Fba, 0x0200, 4, 512);
        assert_eq!(dev.read(0), Err(HandlerError::NotOpen));
    }

    #[test]
    fn test_probe_records_calls_in_order() {
        let mut dev = open_device();
        dev.start();
        dev.read(0).unwrap();
        dev.end();
        assert_eq!(dev.probe().calls(), ["init", "start", "read", "end"]);
    }
}
