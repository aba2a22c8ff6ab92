//! A shared device as seen by one emulator instance.
//!
//! [`RemoteDevice`] turns device operations into requests on a
//! [`RemoteTransport`] and keeps track/block images in a local [`Cache`]:
//!
//! - **Reads** of a cached unit cost no round trip.  The unit being worked
//!   on is held as the *current buffer*.
//! - **Writes** only modify the current buffer and widen its dirty range.
//!   The dirty bytes are sent as one WRITE when the buffer is switched to
//!   another unit, or on END, SUSPEND or close.
//! - **START/RESUME** replies may carry an invalidation list; the listed
//!   units (or, for an empty list, every unit of this device) are purged.
//! - **IOERR** replies surface as [`ClientError::DeviceError`] so the caller
//!   can report an equipment check and fetch the sense bytes.
//!
//! One [`Cache`] may back devices on several servers.  Each server then needs
//! its own scope (see [`RemoteDevice::with_scope`]) so that the same device
//! number on two servers maps to different cache keys.

use shrd_core::protocol::{
    decode_block_list, read_u32, Command, ErrorStatus, QuerySelector, SENSE_SIZE, START_NOWAIT,
};
use shrd_core::{Cache, CacheHandle, CacheKey, DevNum};
use tracing::{debug, warn};

use crate::infrastructure::network::{ClientError, RemoteTransport, Response};

/// The unit currently held out of the cache.
#[derive(Debug)]
struct Current {
    block: u32,
    handle: CacheHandle,
    /// Modified byte range `lo..hi`, if any.
    dirty: Option<(usize, usize)>,
}

/// Cached, write-deferring view of one remote device.
#[derive(Debug)]
pub struct RemoteDevice<T: RemoteTransport> {
    transport: T,
    devnum: DevNum,
    /// Cache-wide device id: the server scope above the device number.
    cache_device: u32,
    cache: Cache,
    current: Option<Current>,
}

impl<T: RemoteTransport> RemoteDevice<T> {
    pub fn new(transport: T, devnum: DevNum, cache: Cache) -> Self {
        Self::with_scope(transport, devnum, cache, 0)
    }

    /// Like [`RemoteDevice::new`], keying cached units under `scope` so
    /// devices of different servers can share `cache`.
    pub fn with_scope(transport: T, devnum: DevNum, cache: Cache, scope: u16) -> Self {
        Self {
            transport,
            devnum,
            cache_device: (u32::from(scope) << 16) | u32::from(devnum),
            cache,
            current: None,
        }
    }

    pub fn devnum(&self) -> DevNum {
        self.devnum
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn key(&self, block: u32) -> CacheKey {
        CacheKey::new(self.cache_device, block)
    }

    /// Whether the current buffer holds unsent changes.
    pub fn is_dirty(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.dirty.is_some())
    }

    // ── Ownership ────────────────────────────────────────────────────────────

    /// Becomes the active user, waiting for the device unless `nowait`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Busy`] when `nowait` is set and the device is in use.
    pub async fn start(&mut self, nowait: bool) -> Result<(), ClientError> {
        self.acquire(Command::Start, nowait).await
    }

    /// Resumes after a SUSPEND.
    pub async fn resume(&mut self, nowait: bool) -> Result<(), ClientError> {
        self.acquire(Command::Resume, nowait).await
    }

    async fn acquire(&mut self, command: Command, nowait: bool) -> Result<(), ClientError> {
        let flags = if nowait { START_NOWAIT } else { 0 };
        let reply = self.transport.request(command, flags, &[]).await?.into_ok()?;
        if reply.has_purge() {
            self.apply_purge(&reply)?;
        }
        Ok(())
    }

    fn apply_purge(&mut self, reply: &Response) -> Result<(), ClientError> {
        let device = self.cache_device;
        if reply.payload.is_empty() {
            self.current = None;
            let purged = self.cache.purge_device(device);
            debug!("device {:04X}: purged all {purged} cached units", self.devnum);
            return Ok(());
        }
        let blocks = decode_block_list(&reply.payload)?;
        if self.current.as_ref().is_some_and(|c| blocks.contains(&c.block)) {
            self.current = None;
        }
        let purged = self.cache.purge_blocks(device, &blocks);
        debug!("device {:04X}: purged {purged} of {} listed units", self.devnum, blocks.len());
        Ok(())
    }

    /// Flushes pending writes and gives up the device.
    pub async fn end(&mut self) -> Result<(), ClientError> {
        self.flush().await?;
        self.simple(Command::End, 0).await.map(drop)
    }

    /// Flushes pending writes and parks the device for a later RESUME.
    pub async fn suspend(&mut self) -> Result<(), ClientError> {
        self.flush().await?;
        self.simple(Command::Suspend, 0).await.map(drop)
    }

    pub async fn reserve(&mut self) -> Result<(), ClientError> {
        self.simple(Command::Reserve, 0).await.map(drop)
    }

    pub async fn release(&mut self) -> Result<(), ClientError> {
        self.simple(Command::Release, 0).await.map(drop)
    }

    async fn simple(&mut self, command: Command, flags: u8) -> Result<Response, ClientError> {
        self.transport.request(command, flags, &[]).await?.into_ok()
    }

    // ── Image access ─────────────────────────────────────────────────────────

    /// Makes `block` the current buffer and returns a copy of its image.
    ///
    /// # Errors
    ///
    /// [`ClientError::DeviceError`] if the server could not read the unit.
    pub async fn read(&mut self, block: u32) -> Result<Vec<u8>, ClientError> {
        self.select(block).await?;
        Ok(self.current_image())
    }

    fn current_image(&self) -> Vec<u8> {
        self.current
            .as_ref()
            .map(|c| c.handle.buffer().clone())
            .unwrap_or_default()
    }

    async fn select(&mut self, block: u32) -> Result<(), ClientError> {
        if self.current.as_ref().is_some_and(|c| c.block == block) {
            return Ok(());
        }
        self.flush().await?;
        self.current = None;

        let (handle, found) = self.cache.lookup(self.key(block)).await;
        if !found {
            let reply = self
                .transport
                .request(Command::Read, 0, &block.to_be_bytes())
                .await
                .and_then(Response::into_ok);
            match reply {
                Ok(reply) => handle.fill(&reply.payload),
                Err(e) => {
                    handle.discard();
                    return Err(e);
                }
            }
        }
        self.current = Some(Current {
            block,
            handle,
            dirty: None,
        });
        Ok(())
    }

    /// Changes `data.len()` bytes of `block` at `offset`.  The change is sent
    /// later, see the module docs.
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] with INVALID if the range falls outside the
    /// unit, or any error from reading the unit first.
    pub async fn write(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<(), ClientError> {
        self.select(block).await?;
        let Some(current) = self.current.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        let lo = offset as usize;
        let hi = lo + data.len();
        {
            let mut buf = current.handle.buffer();
            if hi > buf.len() {
                return Err(ClientError::Rejected {
                    status: ErrorStatus::Invalid,
                });
            }
            buf[lo..hi].copy_from_slice(data);
        }
        current.dirty = Some(match current.dirty {
            Some((a, b)) => (a.min(lo), b.max(hi)),
            None => (lo, hi),
        });
        Ok(())
    }

    /// Sends the dirty range of the current buffer, if any.
    pub async fn flush(&mut self) -> Result<(), ClientError> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        let Some((lo, hi)) = current.dirty else {
            return Ok(());
        };
        let mut payload = Vec::with_capacity(8 + hi - lo);
        payload.extend_from_slice(&current.block.to_be_bytes());
        payload.extend_from_slice(&(lo as u32).to_be_bytes());
        payload.extend_from_slice(&current.handle.buffer()[lo..hi]);
        let block = current.block;

        match self.transport.request(Command::Write, 0, &payload).await.and_then(Response::into_ok) {
            Ok(_) => {
                if let Some(current) = self.current.as_mut() {
                    current.dirty = None;
                }
                Ok(())
            }
            Err(e) => {
                warn!("device {:04X}: write of unit {block} failed: {e}", self.devnum);
                if matches!(e, ClientError::DeviceError) {
                    // The server's copy is unknown now; drop ours.
                    if let Some(current) = self.current.take() {
                        current.handle.discard();
                    }
                }
                Err(e)
            }
        }
    }

    // ── Diagnostics ──────────────────────────────────────────────────────────

    /// Fetches the sense bytes describing the last device error.
    pub async fn sense(&mut self) -> Result<[u8; SENSE_SIZE], ClientError> {
        let reply = self.simple(Command::Sense, 0).await?;
        let mut sense = [0u8; SENSE_SIZE];
        let n = reply.payload.len().min(SENSE_SIZE);
        sense[..n].copy_from_slice(&reply.payload[..n]);
        Ok(sense)
    }

    pub async fn query(&mut self, selector: QuerySelector) -> Result<Vec<u8>, ClientError> {
        Ok(self.simple(Command::Query, selector as u8).await?.payload)
    }

    /// Number of units in use on the device.
    pub async fn used(&mut self) -> Result<u32, ClientError> {
        let payload = self.query(QuerySelector::Used).await?;
        Ok(read_u32(&payload, 0)?)
    }

    /// Flushes, drops this device's cached units, and ends the session.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        let flushed = self.flush().await;
        self.current = None;
        self.cache.purge_device(self.cache_device);
        self.transport.disconnect().await?;
        flushed
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shrd_core::protocol::{encode_block_list, Header, ResponseCode, PURGE_FLAG};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Records every request and answers from a script (default: empty OK).
    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(Command, u8, Vec<u8>)>>>,
        replies: Arc<Mutex<VecDeque<Response>>>,
        disconnected: Arc<Mutex<bool>>,
    }

    impl RecordingTransport {
        fn script(&self, cmd: u8, flags: u8, payload: Vec<u8>) {
            self.replies.lock().unwrap().push_back(Response {
                header: Header {
                    cmd,
                    flags,
                    devnum: 0x0190,
                    id: 1,
                    length: 0,
                },
                payload,
            });
        }

        fn commands(&self) -> Vec<Command> {
            self.sent.lock().unwrap().iter().map(|(c, _, _)| *c).collect()
        }

        fn last(&self) -> (Command, u8, Vec<u8>) {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl RemoteTransport for RecordingTransport {
        async fn request(&mut self, command: Command, flags: u8, payload: &[u8]) -> Result<Response, ClientError> {
            self.sent.lock().unwrap().push((command, flags, payload.to_vec()));
            let scripted = self.replies.lock().unwrap().pop_front();
            Ok(scripted.unwrap_or(Response {
                header: Header::response(ResponseCode::Ok, 0, 0x0190, 1),
                payload: Vec::new(),
            }))
        }

        async fn disconnect(&mut self) -> Result<(), ClientError> {
            *self.disconnected.lock().unwrap() = true;
            Ok(())
        }
    }

    fn device() -> (RemoteDevice<RecordingTransport>, RecordingTransport) {
        let transport = RecordingTransport::default();
        (RemoteDevice::new(transport.clone(), 0x0190, Cache::new(4)), transport)
    }

    #[tokio::test]
    async fn test_same_devnum_on_two_servers_does_not_share_cached_units() {
        // Arrange: one cache, device 0190 on two servers.
        let cache = Cache::new(4);
        let east = RecordingTransport::default();
        let west = RecordingTransport::default();
        let mut on_east = RemoteDevice::with_scope(east.clone(), 0x0190, cache.clone(), 1);
        let mut on_west = RemoteDevice::with_scope(west.clone(), 0x0190, cache.clone(), 2);
        east.script(ResponseCode::Ok as u8, 0, vec![0xEE; 16]);
        east.script(ResponseCode::Ok as u8, 0, vec![0x44; 16]);
        west.script(ResponseCode::Ok as u8, 0, vec![0x77; 16]);

        // Act
        let from_east = on_east.read(3).await.unwrap();
        let from_west = on_west.read(3).await.unwrap();
        on_west.close().await.unwrap();
        on_east.read(4).await.unwrap();
        let east_again = on_east.read(3).await.unwrap();

        // Assert
        assert_eq!(from_east, vec![0xEE; 16]);
        assert_eq!(from_west, vec![0x77; 16]);
        assert_eq!(west.commands(), vec![Command::Read]);
        assert_eq!(east_again, vec![0xEE; 16]);
        assert_eq!(
            east.commands(),
            vec![Command::Read, Command::Read],
            "unit 3 of east is still cached after west closed"
        );
    }

    #[tokio::test]
    async fn test_second_read_of_same_unit_is_served_from_cache() {
        // Arrange
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![9; 32]);

        // Act
        let first = dev.read(3).await.unwrap();
        let second = dev.read(3).await.unwrap();

        // Assert
        assert_eq!(first, second);
        assert_eq!(transport.commands(), vec![Command::Read]);
    }

    #[tokio::test]
    async fn test_switching_units_keeps_the_old_one_cached() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![1; 16]);
        transport.script(ResponseCode::Ok as u8, 0, vec![2; 16]);

        dev.read(1).await.unwrap();
        dev.read(2).await.unwrap();
        let again = dev.read(1).await.unwrap();

        assert_eq!(again, vec![1; 16]);
        assert_eq!(transport.commands(), vec![Command::Read, Command::Read]);
    }

    #[tokio::test]
    async fn test_writes_are_deferred_and_merged_until_end() {
        // Arrange
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![0; 64]);

        // Act
        dev.write(5, 10, &[1, 2]).await.unwrap();
        dev.write(5, 4, &[3]).await.unwrap();
        assert!(dev.is_dirty());
        assert_eq!(transport.commands(), vec![Command::Read], "nothing sent yet");
        dev.end().await.unwrap();

        // Assert: one WRITE covering 4..12, then END.
        assert_eq!(
            transport.commands(),
            vec![Command::Read, Command::Write, Command::End]
        );
        let write = transport.sent.lock().unwrap()[1].2.clone();
        assert_eq!(&write[..4], &5u32.to_be_bytes());
        assert_eq!(&write[4..8], &4u32.to_be_bytes());
        assert_eq!(write.len(), 8 + 8);
        assert_eq!(write[8], 3);
        assert_eq!(&write[14..16], &[1, 2]);
        assert!(!dev.is_dirty());
    }

    #[tokio::test]
    async fn test_switching_units_flushes_dirty_buffer_first() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![0; 16]);
        dev.write(1, 0, &[7]).await.unwrap();

        dev.read(2).await.unwrap();

        assert_eq!(
            transport.commands(),
            vec![Command::Read, Command::Write, Command::Read]
        );
    }

    #[tokio::test]
    async fn test_write_outside_unit_is_invalid() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![0; 8]);

        let result = dev.write(1, 6, &[1, 2, 3]).await;

        assert!(matches!(
            result,
            Err(ClientError::Rejected {
                status: ErrorStatus::Invalid
            })
        ));
        assert!(!dev.is_dirty());
    }

    #[tokio::test]
    async fn test_start_purge_list_invalidates_listed_units() {
        // Arrange: units 1 and 2 cached.
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![1; 8]);
        transport.script(ResponseCode::Ok as u8, 0, vec![2; 8]);
        dev.read(1).await.unwrap();
        dev.read(2).await.unwrap();
        transport.script(PURGE_FLAG, 0, encode_block_list(&[1]));

        // Act
        dev.start(false).await.unwrap();

        // Assert
        assert!(!dev.cache().contains(CacheKey::new(0x0190, 1)));
        assert!(dev.cache().contains(CacheKey::new(0x0190, 2)));
    }

    #[tokio::test]
    async fn test_empty_purge_list_invalidates_everything() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![1; 8]);
        dev.read(1).await.unwrap();
        transport.script(PURGE_FLAG, 0, Vec::new());

        dev.resume(false).await.unwrap();

        assert!(!dev.cache().contains(CacheKey::new(0x0190, 1)));
        assert_eq!(transport.last().0, Command::Resume);
    }

    #[tokio::test]
    async fn test_nowait_start_on_busy_device_fails_with_busy() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Busy as u8, 0, Vec::new());

        let result = dev.start(true).await;

        assert!(matches!(result, Err(ClientError::Busy)));
        assert_eq!(transport.last().1, START_NOWAIT);
    }

    #[tokio::test]
    async fn test_read_ioerr_is_device_error_and_not_cached() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::IoError as u8, 0, Vec::new());

        let result = dev.read(4).await;

        assert!(matches!(result, Err(ClientError::DeviceError)));
        assert!(!dev.cache().contains(CacheKey::new(0x0190, 4)));
    }

    #[tokio::test]
    async fn test_end_without_ownership_is_rejected() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Error as u8, ErrorStatus::NotActive as u8, Vec::new());

        let result = dev.end().await;

        assert!(matches!(
            result,
            Err(ClientError::Rejected {
                status: ErrorStatus::NotActive
            })
        ));
    }

    #[tokio::test]
    async fn test_sense_pads_short_payload() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![0x10, 0, 0, 0]);

        let sense = dev.sense().await.unwrap();

        assert_eq!(sense[0], 0x10);
        assert_eq!(sense.len(), SENSE_SIZE);
    }

    #[tokio::test]
    async fn test_close_flushes_and_disconnects() {
        let (mut dev, transport) = device();
        transport.script(ResponseCode::Ok as u8, 0, vec![0; 8]);
        dev.write(0, 0, &[1]).await.unwrap();

        dev.close().await.unwrap();

        assert_eq!(transport.commands(), vec![Command::Read, Command::Write]);
        assert!(*transport.disconnected.lock().unwrap());
        assert!(!dev.cache().contains(CacheKey::new(0x0190, 0)));
    }
}
