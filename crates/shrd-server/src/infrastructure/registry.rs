//! Device registry and the per-device sharing state.
//!
//! # Locking (for beginners)
//!
//! Each [`Device`] has three independent locks:
//!
//! - `state`: arbitration state and the session table.  A plain
//!   `std::sync::Mutex`; it is never held across an `.await`.
//! - `handler`: the device handler.  Held only for the duration of one
//!   handler call, and never taken while `state` is held by the same task.
//! - the shared image [`Cache`]'s own lock.
//!
//! Two `Notify`s carry wakeups: `loop_wakeup` tells the dispatch loop to
//! re-examine the session table, and `released` tells local callers blocked
//! in [`Device::local_start`] that the device may have become free.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use shrd_core::{Cache, CacheKey, DevNum, DeviceKind, SessionId};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::application::arbiter::{Arbiter, ArbiterError, ArbiterState, Requester, StartDecision};
use crate::application::handler::{DeviceHandler, HandlerError};
use crate::infrastructure::network::session::{Inbound, Session, SessionStatus};
use crate::infrastructure::trace::TraceRing;
use crate::infrastructure::ServerError;

/// Sharing parameters applied to every registered device.
#[derive(Debug, Clone, PartialEq)]
pub struct SharingSettings {
    /// Maximum number of sessions per device.
    pub max_sessions: usize,
    /// Sessions idle for longer than this are disconnected.  `None` disables reaping.
    pub idle_timeout: Option<Duration>,
    /// Upper bound on how long a dispatch loop sleeps between checks.
    pub poll_interval: Duration,
    /// Capacity of each session's purge list before it collapses to "purge all".
    pub purge_list_capacity: usize,
    /// Number of slots in the server-side image cache.
    pub cache_slots: usize,
    /// Highest zlib level the server will agree to.
    pub compression_level: u8,
}

impl Default for SharingSettings {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            idle_timeout: None,
            poll_interval: Duration::from_millis(500),
            purge_list_capacity: 16,
            cache_slots: 64,
            compression_level: 9,
        }
    }
}

/// Result of attaching a connection to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    pub id: SessionId,
    pub generation: u64,
    /// The device had no dispatch loop; the caller must spawn one.
    pub spawn_loop: bool,
    /// The session already existed and was re-bound to the new socket.
    pub reconnected: bool,
}

/// Mutable sharing state of a device, guarded by `Device::state`.
#[derive(Debug)]
pub struct DeviceState {
    pub arbiter: Arbiter,
    pub sessions: BTreeMap<SessionId, Session>,
    /// A request is being executed by the dispatch loop.
    pub busy: bool,
    pub next_ticket: u64,
    /// Last session served, for round-robin fairness.
    pub last_served: SessionId,
    next_id: SessionId,
    next_generation: u64,
    loop_running: bool,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            arbiter: Arbiter::new(),
            sessions: BTreeMap::new(),
            busy: false,
            next_ticket: 0,
            last_served: 0,
            next_id: 0,
            next_generation: 0,
            loop_running: false,
        }
    }

    fn allocate_id(&mut self) -> SessionId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.sessions.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    /// Queues `block` for invalidation on every session except `except`.
    pub fn queue_purge(&mut self, block: u32, except: Option<SessionId>) {
        for session in self.sessions.values_mut() {
            if Some(session.id) != except {
                session.purge.push(block);
            }
        }
    }
}

/// Point-in-time view of a device, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub devnum: DevNum,
    pub kind: DeviceKind,
    pub state: ArbiterState,
    pub reserved: bool,
    pub busy: bool,
    pub sessions: Vec<SessionStatus>,
}

/// One shared device.
pub struct Device {
    pub devnum: DevNum,
    pub kind: DeviceKind,
    image_prefix: usize,
    settings: Arc<SharingSettings>,
    state: Mutex<DeviceState>,
    handler: Mutex<Box<dyn DeviceHandler>>,
    cache: Cache,
    trace: Arc<TraceRing>,
    loop_wakeup: Notify,
    released: Notify,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("devnum", &format_args!("{:04X}", self.devnum))
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Device {
    fn new(
        devnum: DevNum,
        handler: Box<dyn DeviceHandler>,
        settings: Arc<SharingSettings>,
        cache: Cache,
        trace: Arc<TraceRing>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            devnum,
            kind: handler.kind(),
            image_prefix: handler.image_prefix(),
            settings,
            state: Mutex::new(DeviceState::new()),
            handler: Mutex::new(handler),
            cache,
            trace,
            loop_wakeup: Notify::new(),
            released: Notify::new(),
            inbound_tx: tx,
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn settings(&self) -> &SharingSettings {
        &self.settings
    }

    pub fn trace(&self) -> &TraceRing {
        &self.trace
    }

    /// Uncompressed prefix length for READ replies.
    pub fn image_prefix(&self) -> usize {
        self.image_prefix
    }

    /// Key of `block` in the shared image cache.
    pub fn cache_key(&self, block: u32) -> CacheKey {
        CacheKey::new(self.devnum as u32, block)
    }

    pub fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` with exclusive access to the device handler.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut dyn DeviceHandler) -> R) -> R {
        let mut handler = self.handler.lock().unwrap_or_else(|e| e.into_inner());
        f(handler.as_mut())
    }

    pub fn inbound(&self) -> mpsc::UnboundedSender<Inbound> {
        self.inbound_tx.clone()
    }

    pub(crate) fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Hands the inbound receiver back and marks the loop stopped.
    ///
    /// Must be called with `state` locked so a concurrent attach either sees
    /// the loop running or finds the receiver in place.
    pub(crate) fn park_loop(
        &self,
        state: &mut DeviceState,
        rx: mpsc::UnboundedReceiver<Inbound>,
    ) {
        *self.inbound_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
        state.loop_running = false;
    }

    pub(crate) async fn wait_for_work(&self) {
        self.loop_wakeup.notified().await;
    }

    /// Wakes the dispatch loop and any local waiters.
    pub fn wake(&self) {
        self.loop_wakeup.notify_one();
        self.released.notify_waiters();
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Adds a session for a new connection, or re-binds an existing session
    /// when the client presents a known non-zero id.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::SessionTableFull`] when no slot is free.
    pub fn attach_session(&self, requested: SessionId, addr: String) -> Result<Attached, ServerError> {
        let mut state = self.lock_state();
        state.next_generation += 1;
        let generation = state.next_generation;

        if requested != 0 {
            if let Some(session) = state.sessions.get_mut(&requested) {
                session.reattach(addr, generation);
                info!("session {requested} re-attached to device {:04X}", self.devnum);
                return Ok(Attached {
                    id: requested,
                    generation,
                    spawn_loop: false,
                    reconnected: true,
                });
            }
        }

        if state.sessions.len() >= self.settings.max_sessions {
            return Err(ServerError::SessionTableFull(self.devnum));
        }

        let id = if requested != 0 {
            requested
        } else {
            state.allocate_id()
        };
        state.sessions.insert(
            id,
            Session::new(id, addr, generation, self.settings.purge_list_capacity),
        );
        let spawn_loop = !state.loop_running;
        state.loop_running = true;
        Ok(Attached {
            id,
            generation,
            spawn_loop,
            reconnected: false,
        })
    }

    /// Marks every session for removal; the dispatch loop extricates owners.
    pub fn disconnect_all(&self) {
        let mut state = self.lock_state();
        for session in state.sessions.values_mut() {
            session.dropped = true;
        }
        drop(state);
        self.wake();
    }

    pub fn status(&self) -> DeviceStatus {
        let state = self.lock_state();
        DeviceStatus {
            devnum: self.devnum,
            kind: self.kind,
            state: state.arbiter.state(),
            reserved: state.arbiter.is_reserved(),
            busy: state.busy,
            sessions: state.sessions.values().map(SessionStatus::from).collect(),
        }
    }

    // ── Image access ─────────────────────────────────────────────────────────

    /// Reads `block`, serving it from the image cache when possible.
    pub async fn read_block(&self, block: u32) -> Result<Vec<u8>, HandlerError> {
        let (handle, found) = self.cache.lookup(self.cache_key(block)).await;
        if found {
            let image = handle.buffer().clone();
            return Ok(image);
        }
        match self.with_handler(|h| h.read(block)) {
            Ok(image) => {
                handle.fill(&image);
                Ok(image)
            }
            Err(e) => {
                handle.discard();
                Err(e)
            }
        }
    }

    /// Writes into `block` on behalf of `writer` and invalidates every other
    /// user's copy of it.
    pub fn write_block(
        &self,
        writer: Requester,
        block: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), HandlerError> {
        self.with_handler(|h| h.write(block, offset, data))?;
        self.cache.purge_blocks(self.devnum as u32, &[block]);
        let except = match writer {
            Requester::Remote(id) => Some(id),
            Requester::Local => None,
        };
        self.lock_state().queue_purge(block, except);
        Ok(())
    }

    /// Records that the local system updated `block` outside this server, so
    /// every remote must drop its copy.
    pub fn notify_local_update(&self, block: u32) {
        self.cache.purge_blocks(self.devnum as u32, &[block]);
        self.lock_state().queue_purge(block, None);
        debug!("device {:04X}: local update of {} {block}", self.devnum, self.kind.unit_name());
    }

    // ── Local use ────────────────────────────────────────────────────────────

    /// Makes the local system the active owner, waiting for remote owners
    /// to finish unless `nowait` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ArbiterError::Busy`] when `nowait` is set and the device is taken.
    pub async fn local_start(&self, nowait: bool) -> Result<(), ArbiterError> {
        self.local_acquire(nowait, false).await
    }

    /// Resumes local use after [`Device::local_suspend`].
    pub async fn local_resume(&self, nowait: bool) -> Result<(), ArbiterError> {
        self.local_acquire(nowait, true).await
    }

    async fn local_acquire(&self, nowait: bool, resume: bool) -> Result<(), ArbiterError> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let decision = self.lock_state().arbiter.start(Requester::Local, nowait);
            match decision {
                StartDecision::Granted => {
                    self.with_handler(|h| if resume { h.resume() } else { h.start() });
                    return Ok(());
                }
                StartDecision::Busy => return Err(ArbiterError::Busy),
                StartDecision::Wait => {
                    debug!("device {:04X}: local start waiting", self.devnum);
                }
            }
            released.await;
        }
    }

    pub fn local_end(&self) -> Result<(), ArbiterError> {
        self.lock_state().arbiter.end(Requester::Local)?;
        self.with_handler(|h| h.end());
        self.wake();
        Ok(())
    }

    pub fn local_suspend(&self) -> Result<(), ArbiterError> {
        self.lock_state().arbiter.suspend(Requester::Local)?;
        self.with_handler(|h| h.suspend());
        self.wake();
        Ok(())
    }

    pub fn local_reserve(&self) -> Result<(), ArbiterError> {
        self.lock_state().arbiter.reserve(Requester::Local)?;
        self.with_handler(|h| h.reserve());
        Ok(())
    }

    pub fn local_release(&self) -> Result<(), ArbiterError> {
        self.lock_state().arbiter.release(Requester::Local)?;
        self.with_handler(|h| h.release());
        Ok(())
    }

    /// Closes the handler and drops the device's cached images.
    fn close(&self) -> Result<(), HandlerError> {
        self.cache.purge_device(self.devnum as u32);
        self.with_handler(|h| h.close())
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// All shared devices served by this process.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DevNum, Arc<Device>>>,
    settings: Arc<SharingSettings>,
    cache: Cache,
    trace: Arc<TraceRing>,
}

impl DeviceRegistry {
    pub fn new(settings: SharingSettings) -> Self {
        let cache = Cache::new(settings.cache_slots);
        Self {
            devices: Mutex::new(HashMap::new()),
            settings: Arc::new(settings),
            cache,
            trace: Arc::new(TraceRing::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DevNum, Arc<Device>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &SharingSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn trace(&self) -> &Arc<TraceRing> {
        &self.trace
    }

    /// Initialises `handler` and makes it available for sharing as `devnum`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::DuplicateDevice`] if `devnum` is taken, or the
    /// handler's initialisation error.
    pub fn register(
        &self,
        devnum: DevNum,
        mut handler: Box<dyn DeviceHandler>,
    ) -> Result<Arc<Device>, ServerError> {
        let mut devices = self.lock();
        if devices.contains_key(&devnum) {
            return Err(ServerError::DuplicateDevice(devnum));
        }
        handler.init()?;
        let device = Arc::new(Device::new(
            devnum,
            handler,
            Arc::clone(&self.settings),
            self.cache.clone(),
            Arc::clone(&self.trace),
        ));
        info!("device {devnum:04X} ({:?}) registered for sharing", device.kind);
        devices.insert(devnum, Arc::clone(&device));
        Ok(device)
    }

    /// Removes a device, disconnecting its sessions and closing its handler.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownDevice`] or the handler's close error.
    pub fn unregister(&self, devnum: DevNum) -> Result<(), ServerError> {
        let device = self
            .lock()
            .remove(&devnum)
            .ok_or(ServerError::UnknownDevice(devnum))?;
        device.disconnect_all();
        device.close()?;
        info!("device {devnum:04X} unregistered");
        Ok(())
    }

    pub fn get(&self, devnum: DevNum) -> Option<Arc<Device>> {
        self.lock().get(&devnum).cloned()
    }

    /// All devices, ordered by device number.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut list: Vec<_> = self.lock().values().cloned().collect();
        list.sort_by_key(|d| d.devnum);
        list
    }

    /// Forces every session on every device to disconnect.
    pub fn disconnect_all(&self) {
        for device in self.devices() {
            device.disconnect_all();
        }
    }

    /// Closes every device handler.
    pub fn close_all(&self) {
        for device in self.devices() {
            if let Err(e) = device.close() {
                warn!("device {:04X}: close failed: {e}", device.devnum);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::handler::MockDeviceHandler;
    use crate::infrastructure::device::memory::MemoryDevice;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(SharingSettings {
            max_sessions: 2,
            ..SharingSettings::default()
        })
    }

    fn memory(devnum: DevNum) -> Box<dyn DeviceHandler> {
        Box::new(MemoryDevice::new(DeviceKind::Ckd, devnum, 30, 256))
    }

    #[test]
    fn test_register_initialises_handler_once() {
        // Arrange
        let reg = registry();
        let mut mock = MockDeviceHandler::new();
        mock.expect_init().times(1).returning(|| Ok(()));
        mock.expect_kind().return_const(DeviceKind::Fba);
        mock.expect_image_prefix().return_const(0usize);

        // Act
        let device = reg.register(0x0200, Box::new(mock)).unwrap();

        // Assert
        assert_eq!(device.kind, DeviceKind::Fba);
        assert!(reg.get(0x0200).is_some());
    }

    #[test]
    fn test_register_duplicate_devnum_is_rejected() {
        let reg = registry();
        reg.register(0x0190, memory(0x0190)).unwrap();
        assert!(matches!(
            reg.register(0x0190, memory(0x0190)),
            Err(ServerError::DuplicateDevice(0x0190))
        ));
    }

    #[test]
    fn test_register_propagates_init_failure() {
        let reg = registry();
        let mut mock = MockDeviceHandler::new();
        mock.expect_init().returning(|| Err(HandlerError::NotOpen));
        assert!(matches!(reg.register(1, Box::new(mock)), Err(ServerError::Handler(_))));
        assert!(reg.get(1).is_none());
    }

    #[test]
    fn test_attach_assigns_distinct_ids_until_full() {
        // Arrange
        let reg = registry();
        let dev = reg.register(0x0190, memory(0x0190)).unwrap();

        // Act
        let a = dev.attach_session(0, "a".into()).unwrap();
        let b = dev.attach_session(0, "b".into()).unwrap();
        let c = dev.attach_session(0, "c".into());

        // Assert
        assert_ne!(a.id, b.id);
        assert!(a.spawn_loop, "first session starts the loop");
        assert!(!b.spawn_loop);
        assert!(matches!(c, Err(ServerError::SessionTableFull(0x0190))));
    }

    #[test]
    fn test_attach_with_known_id_reattaches() {
        let reg = registry();
        let dev = reg.register(0x0190, memory(0x0190)).unwrap();
        let first = dev.attach_session(0, "a".into()).unwrap();

        let again = dev.attach_session(first.id, "a2".into()).unwrap();

        assert!(again.reconnected);
        assert_eq!(again.id, first.id);
        assert!(again.generation > first.generation);
        assert_eq!(dev.status().sessions.len(), 1);
        assert_eq!(dev.status().sessions[0].addr, "a2");
    }

    #[test]
    fn test_write_queues_purge_for_other_sessions_only() {
        // Arrange
        let reg = registry();
        let dev = reg.register(0x0190, memory(0x0190)).unwrap();
        let a = dev.attach_session(0, "a".into()).unwrap();
        let b = dev.attach_session(0, "b".into()).unwrap();

        // Act
        dev.write_block(Requester::Remote(a.id), 5, 0, &[1; 64]).unwrap();

        // Assert
        let status = dev.status();
        let purge_of = |id| status.sessions.iter().find(|s| s.id == id).unwrap().purge_pending;
        assert_eq!(purge_of(a.id), 0);
        assert_eq!(purge_of(b.id), 1);
    }

    #[tokio::test]
    async fn test_read_block_is_served_from_cache_after_first_read() {
        let reg = registry();
        let device = MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256);
        let probe = device.probe();
        let dev = reg.register(0x0190, Box::new(device)).unwrap();

        let first = dev.read_block(3).await.unwrap();
        let second = dev.read_block(3).await.unwrap();

        assert_eq!(first, second);
        let reads = probe.calls().iter().filter(|c| *c == "read").count();
        assert_eq!(reads, 1);
        assert_eq!(reg.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_local_update_invalidates_cached_image() {
        let reg = registry();
        let device = MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256);
        let probe = device.probe();
        let dev = reg.register(0x0190, Box::new(device)).unwrap();
        dev.read_block(3).await.unwrap();

        dev.notify_local_update(3);
        dev.read_block(3).await.unwrap();

        assert_eq!(probe.calls().iter().filter(|c| *c == "read").count(), 2);
    }

    #[tokio::test]
    async fn test_failed_read_is_not_cached() {
        let reg = registry();
        let device = MemoryDevice::new(DeviceKind::Fba, 0x0200, 4, 512);
        let probe = device.probe();
        let dev = reg.register(0x0200, Box::new(device)).unwrap();
        probe.fail_block(1);

        assert!(dev.read_block(1).await.is_err());
        probe.heal_block(1);

        assert!(dev.read_block(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_start_nowait_on_remote_owned_device_is_busy() {
        let reg = registry();
        let dev = reg.register(0x0190, memory(0x0190)).unwrap();
        dev.lock_state().arbiter.start(Requester::Remote(1), false);

        assert_eq!(dev.local_start(true).await, Err(ArbiterError::Busy));
    }

    #[test]
    fn test_local_start_waits_for_remote_end() {
        // Arrange: a remote session owns the device.
        let reg = registry();
        let dev = reg.register(0x0190, memory(0x0190)).unwrap();
        dev.lock_state().arbiter.start(Requester::Remote(1), false);
        let mut waiter = tokio_test::task::spawn(dev.local_start(false));

        // Act / Assert
        tokio_test::assert_pending!(waiter.poll());
        dev.lock_state().arbiter.end(Requester::Remote(1)).unwrap();
        dev.wake();
        assert!(waiter.is_woken());
        tokio_test::assert_ready_eq!(waiter.poll(), Ok(()));
        assert_eq!(dev.status().state, ArbiterState::LocalActive);
    }

    #[test]
    fn test_unregister_closes_handler() {
        let reg = registry();
        let device = MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256);
        let probe = device.probe();
        reg.register(0x0190, Box::new(device)).unwrap();

        reg.unregister(0x0190).unwrap();

        assert!(probe.calls().contains(&"close".to_string()));
        assert!(matches!(reg.unregister(0x0190), Err(ServerError::UnknownDevice(0x0190))));
    }
}
