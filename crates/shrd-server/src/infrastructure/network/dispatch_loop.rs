//! The per-device dispatch loop.
//!
//! One loop task runs for each device that has at least one session.  It is
//! the only place remote requests are executed, so requests for a device
//! run one at a time, in the order the loop picks them:
//!
//! 1. Apply everything that arrived on the inbound channel (new sockets,
//!    frames, socket failures).
//! 2. Under the device lock: reap sessions that disconnected, failed, or
//!    sat idle too long, forcibly releasing the device if one of them owned
//!    it; then pick the next request.  Parked START/RESUME requests are
//!    replayed first, oldest ticket first; other sessions are served
//!    round-robin.
//! 3. Without the lock: execute the request and write the reply.
//! 4. With nothing to do, sleep until a frame arrives, the device is
//!    released, or the poll interval passes.
//!
//! The loop stops once the last session has gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use shrd_core::protocol::{write_frame, Command, Header, ResponseCode, START_NOWAIT};
use shrd_core::SessionId;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::arbiter::{Requester, StartDecision};
use crate::application::dispatch::{execute, Job, Reply};
use crate::infrastructure::network::session::{spawn_reader, Inbound, Request};
use crate::infrastructure::registry::{Device, DeviceState};
use crate::infrastructure::trace::TraceEntry;

/// Socket halves of an attached session, owned by the loop.
struct SessionIo {
    generation: u64,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// A session removed from the table by [`reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reaped {
    id: SessionId,
    /// The session asked to disconnect and expects an OK.
    graceful: bool,
    was_owner: bool,
    /// The session held a reservation that the handler must see released.
    was_reserved: bool,
}

/// Runs the dispatch loop for `device` until its last session leaves.
pub async fn run(device: Arc<Device>) {
    let Some(mut rx) = device.take_inbound() else {
        error!("device {:04X}: dispatch loop is already running", device.devnum);
        return;
    };
    let mut io: HashMap<SessionId, SessionIo> = HashMap::new();
    info!("device {:04X}: dispatch loop started", device.devnum);

    loop {
        while let Ok(msg) = rx.try_recv() {
            apply(&device, &mut io, msg);
        }

        let (reaped, job) = {
            let mut state = device.lock_state();
            let reaped = reap(&device, &mut state);
            let job = pick(&mut state);
            state.busy = job.is_some();
            (reaped, job)
        };
        finish_reaped(&device, &mut io, &reaped).await;

        if let Some(job) = job {
            let reply = execute(&device, &job).await;
            record(&device, &job, &reply);
            send_reply(&device, &mut io, job.id, &reply).await;
            let mut state = device.lock_state();
            state.busy = false;
            if let Some(session) = state.sessions.get_mut(&job.id) {
                session.last_activity = Instant::now();
            }
            continue;
        }

        {
            let mut state = device.lock_state();
            if state.sessions.is_empty() {
                for (_, sio) in io.drain() {
                    sio.reader.abort();
                }
                device.park_loop(&mut state, rx);
                info!("device {:04X}: dispatch loop stopped", device.devnum);
                return;
            }
        }

        tokio::select! {
            msg = rx.recv() => {
                if let Some(msg) = msg {
                    apply(&device, &mut io, msg);
                }
            }
            _ = device.wait_for_work() => {}
            _ = tokio::time::sleep(device.settings().poll_interval) => {}
        }
    }
}

// ── Inbound messages ─────────────────────────────────────────────────────────

fn apply(device: &Device, io: &mut HashMap<SessionId, SessionIo>, msg: Inbound) {
    match msg {
        Inbound::Attach {
            id,
            generation,
            reader,
            writer,
        } => {
            let current = device
                .lock_state()
                .sessions
                .get(&id)
                .is_some_and(|s| s.generation == generation);
            if !current {
                debug!("session {id}: dropping socket for a session that is gone");
                return;
            }
            let reader = spawn_reader(device.inbound(), id, generation, reader);
            let replaced = io.insert(
                id,
                SessionIo {
                    generation,
                    writer,
                    reader,
                },
            );
            if let Some(old) = replaced {
                debug!("session {id}: replacing socket of generation {}", old.generation);
                old.reader.abort();
            }
        }

        Inbound::Frame {
            id,
            generation,
            request,
        } => {
            let mut state = device.lock_state();
            let Some(session) = state.sessions.get_mut(&id) else {
                return;
            };
            if session.generation != generation {
                return;
            }
            session.last_activity = Instant::now();
            if request.header.command() == Some(Command::Disconnect) {
                session.disconnect = true;
            } else {
                session.queue.push_back(request);
            }
        }

        Inbound::Closed {
            id,
            generation,
            reason,
        } => {
            let mut state = device.lock_state();
            if let Some(session) = state.sessions.get_mut(&id) {
                if session.generation == generation {
                    debug!("session {id}: socket closed: {reason}");
                    session.dropped = true;
                }
            }
        }
    }
}

// ── Reaping ──────────────────────────────────────────────────────────────────

/// Removes sessions that are gone or idle, extricating any that owned the device.
fn reap(device: &Device, state: &mut DeviceState) -> Vec<Reaped> {
    let now = Instant::now();
    let idle_timeout = device.settings().idle_timeout;
    let arbiter = &state.arbiter;
    let doomed: Vec<SessionId> = state
        .sessions
        .values()
        .filter(|s| {
            // The active owner is never idle, however long it sits.
            let idle = idle_timeout.is_some_and(|limit| {
                !s.is_pending()
                    && !arbiter.is_owner(Requester::Remote(s.id))
                    && now.duration_since(s.last_activity) > limit
            });
            s.dropped || s.disconnect || idle
        })
        .map(|s| s.id)
        .collect();

    let mut reaped = Vec::with_capacity(doomed.len());
    for id in doomed {
        let Some(session) = state.sessions.remove(&id) else {
            continue;
        };
        let was_reserved =
            state.arbiter.is_owner(Requester::Remote(id)) && state.arbiter.is_reserved();
        let was_owner = state.arbiter.extricate(id);
        if was_owner && !session.disconnect {
            warn!(
                "device {:04X}: forcibly releasing device held by session {id} ({})",
                device.devnum, session.addr
            );
        }
        info!(
            "device {:04X}: session {id} ({}) removed",
            device.devnum, session.addr
        );
        reaped.push(Reaped {
            id,
            graceful: session.disconnect,
            was_owner,
            was_reserved,
        });
    }
    reaped
}

async fn finish_reaped(device: &Device, io: &mut HashMap<SessionId, SessionIo>, reaped: &[Reaped]) {
    let mut released = false;
    for r in reaped {
        if r.was_owner {
            device.with_handler(|h| {
                if r.was_reserved {
                    h.release();
                }
                h.end();
            });
            released = true;
        }
        if let Some(mut sio) = io.remove(&r.id) {
            if r.graceful {
                let ok = Header::response(ResponseCode::Ok, 0, device.devnum, r.id);
                let _ = write_frame(&mut sio.writer, &ok, &[], None).await;
            }
            sio.reader.abort();
        }
    }
    if released {
        device.wake();
    }
}

// ── Scheduling ───────────────────────────────────────────────────────────────

/// Chooses the next request to run, or `None` if nothing can run now.
fn pick(state: &mut DeviceState) -> Option<Job> {
    // Parked START/RESUME requests, oldest ticket first.
    let mut waiters: Vec<(u64, SessionId)> = state
        .sessions
        .values()
        .filter_map(|s| s.ticket.map(|t| (t, s.id)))
        .collect();
    waiters.sort_unstable();
    if let Some(&(_, id)) = waiters.first() {
        if state.arbiter.start(Requester::Remote(id), false) == StartDecision::Granted {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.ticket = None;
                if let Some(request) = session.queue.pop_front() {
                    state.last_served = id;
                    return Some(Job {
                        id,
                        request,
                        start: Some(StartDecision::Granted),
                    });
                }
            }
        }
    }

    // Everyone else, round-robin starting after the last session served.
    let last = state.last_served;
    let (after, upto): (Vec<SessionId>, Vec<SessionId>) =
        state.sessions.keys().copied().partition(|id| *id > last);

    for id in after.into_iter().chain(upto) {
        let Some(session) = state.sessions.get_mut(&id) else {
            continue;
        };
        if session.is_waiting() || session.dropped || session.disconnect {
            continue;
        }
        let Some(front) = session.queue.front() else {
            continue;
        };
        let command = front.header.command();
        let nowait = front.header.flags & START_NOWAIT != 0;

        let start = if matches!(command, Some(Command::Start | Command::Resume)) {
            match state.arbiter.start(Requester::Remote(id), nowait) {
                StartDecision::Wait => {
                    session.ticket = Some(state.next_ticket);
                    state.next_ticket += 1;
                    debug!("session {id}: waiting for the device");
                    continue;
                }
                decision => Some(decision),
            }
        } else {
            None
        };

        let request: Request = session.queue.pop_front()?;
        state.last_served = id;
        return Some(Job { id, request, start });
    }
    None
}

// ── Replies ──────────────────────────────────────────────────────────────────

async fn send_reply(
    device: &Device,
    io: &mut HashMap<SessionId, SessionIo>,
    id: SessionId,
    reply: &Reply,
) {
    let negotiated = device
        .lock_state()
        .sessions
        .get(&id)
        .and_then(|s| s.compression);
    let Some(sio) = io.get_mut(&id) else {
        debug!("session {id}: no socket for reply");
        return;
    };
    let compression = reply.compression(negotiated);
    if let Err(e) = write_frame(&mut sio.writer, &reply.header, &reply.payload, compression.as_ref()).await {
        warn!("session {id}: failed to send reply: {e}");
        if let Some(session) = device.lock_state().sessions.get_mut(&id) {
            session.dropped = true;
        }
    }
}

fn record(device: &Device, job: &Job, reply: &Reply) {
    device.trace().record(TraceEntry {
        at: SystemTime::now(),
        devnum: device.devnum,
        id: job.id,
        cmd: job.request.header.cmd,
        flags: job.request.header.flags,
        length: job.request.payload.len() as u32,
        response: reply.header.cmd,
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use shrd_core::DeviceKind;

    use crate::infrastructure::device::memory::MemoryDevice;
    use crate::infrastructure::registry::{DeviceRegistry, SharingSettings};

    fn setup(sessions: usize) -> (DeviceRegistry, Arc<Device>, Vec<SessionId>) {
        let reg = DeviceRegistry::new(SharingSettings::default());
        let dev = reg
            .register(0x0190, Box::new(MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256)))
            .unwrap();
        let ids = (0..sessions)
            .map(|i| dev.attach_session(0, format!("peer{i}")).unwrap().id)
            .collect();
        (reg, dev, ids)
    }

    fn enqueue(dev: &Device, id: SessionId, command: Command, flags: u8) {
        dev.lock_state()
            .sessions
            .get_mut(&id)
            .unwrap()
            .queue
            .push_back(Request {
                header: Header::request(command, flags, 0x0190, id),
                payload: Vec::new(),
            });
    }

    #[test]
    fn test_pick_parks_start_on_owned_device() {
        // Arrange
        let (_reg, dev, ids) = setup(2);
        dev.lock_state().arbiter.start(Requester::Remote(ids[0]), false);
        enqueue(&dev, ids[1], Command::Start, 0);

        // Act
        let job = pick(&mut dev.lock_state());

        // Assert
        assert!(job.is_none());
        let state = dev.lock_state();
        assert!(state.sessions[&ids[1]].is_waiting());
        assert!(state.sessions[&ids[1]].is_pending(), "parked request is kept");
    }

    #[test]
    fn test_pick_answers_nowait_start_with_busy() {
        let (_reg, dev, ids) = setup(2);
        dev.lock_state().arbiter.start(Requester::Remote(ids[0]), false);
        enqueue(&dev, ids[1], Command::Start, START_NOWAIT);

        let job = pick(&mut dev.lock_state()).unwrap();

        assert_eq!(job.start, Some(StartDecision::Busy));
    }

    #[test]
    fn test_waiters_are_granted_in_ticket_order() {
        // Arrange: session 0 owns; sessions 2 then 1 start waiting.
        let (_reg, dev, ids) = setup(3);
        dev.lock_state().arbiter.start(Requester::Remote(ids[0]), false);
        enqueue(&dev, ids[2], Command::Start, 0);
        assert!(pick(&mut dev.lock_state()).is_none());
        enqueue(&dev, ids[1], Command::Start, 0);
        assert!(pick(&mut dev.lock_state()).is_none());

        // Act: owner leaves.
        dev.lock_state().arbiter.end(Requester::Remote(ids[0])).unwrap();
        let first = pick(&mut dev.lock_state()).unwrap();

        // Assert: the earlier waiter wins; the later one keeps waiting.
        assert_eq!(first.id, ids[2]);
        assert_eq!(first.start, Some(StartDecision::Granted));
        assert!(pick(&mut dev.lock_state()).is_none());
        assert!(dev.lock_state().sessions[&ids[1]].is_waiting());
    }

    #[test]
    fn test_round_robin_serves_each_session_in_turn() {
        let (_reg, dev, ids) = setup(2);
        for _ in 0..2 {
            enqueue(&dev, ids[0], Command::Sense, 0);
            enqueue(&dev, ids[1], Command::Sense, 0);
        }

        let order: Vec<SessionId> = (0..4)
            .map(|_| pick(&mut dev.lock_state()).unwrap().id)
            .collect();

        assert_eq!(order, vec![ids[0], ids[1], ids[0], ids[1]]);
    }

    #[tokio::test]
    async fn test_reap_extricates_dropped_owner() {
        // Arrange
        let reg = DeviceRegistry::new(SharingSettings::default());
        let memory = MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256);
        let handler_log = memory.probe();
        let dev = reg.register(0x0190, Box::new(memory)).unwrap();
        let ids: Vec<SessionId> = (0..2)
            .map(|i| dev.attach_session(0, format!("peer{i}")).unwrap().id)
            .collect();
        {
            let mut state = dev.lock_state();
            state.arbiter.start(Requester::Remote(ids[0]), false);
            state.arbiter.reserve(Requester::Remote(ids[0])).unwrap();
            state.sessions.get_mut(&ids[0]).unwrap().dropped = true;
        }
        dev.with_handler(|h| h.reserve());

        // Act
        let reaped = reap(&dev, &mut dev.lock_state());
        finish_reaped(&dev, &mut HashMap::new(), &reaped).await;

        // Assert
        assert_eq!(
            reaped,
            vec![Reaped {
                id: ids[0],
                graceful: false,
                was_owner: true,
                was_reserved: true,
            }]
        );
        let status = dev.status();
        assert_eq!(status.state, crate::application::arbiter::ArbiterState::Idle);
        assert!(!status.reserved);
        assert_eq!(status.sessions.len(), 1);
        let calls = handler_log.calls();
        assert_eq!(&calls[calls.len() - 3..], &["reserve", "release", "end"]);
    }

    fn idle_device() -> (DeviceRegistry, Arc<Device>) {
        let reg = DeviceRegistry::new(SharingSettings {
            idle_timeout: Some(std::time::Duration::from_millis(0)),
            ..SharingSettings::default()
        });
        let dev = reg
            .register(0x0190, Box::new(MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256)))
            .unwrap();
        (reg, dev)
    }

    #[test]
    fn test_reap_removes_idle_sessions_when_enabled() {
        let (_reg, dev) = idle_device();
        dev.attach_session(0, "idle".into()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let reaped = reap(&dev, &mut dev.lock_state());

        assert_eq!(reaped.len(), 1);
        assert!(dev.status().sessions.is_empty());
    }

    #[test]
    fn test_idle_owner_keeps_the_device() {
        // Arrange: the owner reserves, then goes quiet past the idle limit.
        let (_reg, dev) = idle_device();
        let id = dev.attach_session(0, "owner".into()).unwrap().id;
        {
            let mut state = dev.lock_state();
            state.arbiter.start(Requester::Remote(id), false);
            state.arbiter.reserve(Requester::Remote(id)).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(5));

        // Act
        let reaped = reap(&dev, &mut dev.lock_state());

        // Assert
        assert!(reaped.is_empty());
        let status = dev.status();
        assert_eq!(status.state, crate::application::arbiter::ArbiterState::RemoteActive(id));
        assert!(status.reserved);
        assert_eq!(status.sessions.len(), 1);
    }

    #[test]
    fn test_disconnect_frame_marks_session_without_queueing() {
        let (_reg, dev, ids) = setup(1);
        let generation = dev.lock_state().sessions[&ids[0]].generation;
        let mut io = HashMap::new();

        apply(
            &dev,
            &mut io,
            Inbound::Frame {
                id: ids[0],
                generation,
                request: Request {
                    header: Header::request(Command::Disconnect, 0, 0x0190, ids[0]),
                    payload: Vec::new(),
                },
            },
        );

        let state = dev.lock_state();
        assert!(state.sessions[&ids[0]].disconnect);
        assert!(!state.sessions[&ids[0]].is_pending());
    }

    #[test]
    fn test_frames_from_stale_generation_are_ignored() {
        let (_reg, dev, ids) = setup(1);
        let mut io = HashMap::new();

        apply(
            &dev,
            &mut io,
            Inbound::Frame {
                id: ids[0],
                generation: 999,
                request: Request {
                    header: Header::request(Command::Sense, 0, 0x0190, ids[0]),
                    payload: Vec::new(),
                },
            },
        );

        assert!(!dev.lock_state().sessions[&ids[0]].is_pending());
    }
}
