//! Executes one remote request against a shared device and builds the reply.
//!
//! The dispatch loop has already decided *which* request runs next and, for
//! START/RESUME, whether the device was granted.  This module performs the
//! request end-to-end: arbiter transition, handler call, purge-list
//! delivery, and reply construction.  The device state lock is only taken
//! for short, synchronous sections.

use shrd_core::protocol::{
    compress_flags, encode_block_list, read_u32, split_compress_flags, Command, CompressionSpec,
    ErrorStatus, Header, QuerySelector, ResponseCode, MAX_COMPRESS_OFFSET, PURGE_FLAG,
    SUPPORTED_ALGORITHMS,
};
use shrd_core::SessionId;
use tracing::{debug, info, warn};

use crate::application::arbiter::{ArbiterError, Requester, StartDecision};
use crate::application::purge_list::PurgeNotice;
use crate::infrastructure::network::session::Request;
use crate::infrastructure::registry::Device;

/// A request selected for execution.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: SessionId,
    pub request: Request,
    /// Arbiter decision for START/RESUME, made when the job was picked.
    pub start: Option<StartDecision>,
}

/// A reply ready to be written to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub header: Header,
    pub payload: Vec<u8>,
    /// Leading payload bytes to keep uncompressed.
    pub prefix: usize,
}

impl Reply {
    fn ok(device: &Device, id: SessionId) -> Self {
        Self::with_code(device, id, ResponseCode::Ok, 0)
    }

    fn data(device: &Device, id: SessionId, payload: Vec<u8>, prefix: usize) -> Self {
        Self {
            payload,
            prefix,
            ..Self::ok(device, id)
        }
    }

    fn error(device: &Device, id: SessionId, status: ErrorStatus) -> Self {
        Self::with_code(device, id, ResponseCode::Error, status as u8)
    }

    fn with_code(device: &Device, id: SessionId, code: ResponseCode, flags: u8) -> Self {
        Self {
            header: Header::response(code, flags, device.devnum, id),
            payload: Vec::new(),
            prefix: 0,
        }
    }

    /// Compression to use for this reply given the session's negotiated spec.
    pub fn compression(&self, negotiated: Option<CompressionSpec>) -> Option<CompressionSpec> {
        negotiated.map(|spec| spec.with_offset(self.prefix.min(MAX_COMPRESS_OFFSET)))
    }
}

fn not_active(device: &Device, id: SessionId, err: ArbiterError) -> Reply {
    debug!("device {:04X} session {id}: {err}", device.devnum);
    Reply::error(device, id, ErrorStatus::NotActive)
}

/// Executes `job` and returns the reply to send.
pub async fn execute(device: &Device, job: &Job) -> Reply {
    let id = job.id;
    let who = Requester::Remote(id);
    let header = &job.request.header;
    let payload = &job.request.payload;

    let Some(command) = header.command() else {
        warn!("device {:04X} session {id}: unknown command 0x{:02X}", device.devnum, header.cmd);
        return Reply::error(device, id, ErrorStatus::Invalid);
    };

    match command {
        Command::Start | Command::Resume => match job.start {
            Some(StartDecision::Granted) => grant(device, id, command),
            Some(StartDecision::Busy) => Reply::with_code(device, id, ResponseCode::Busy, 0),
            _ => Reply::error(device, id, ErrorStatus::Invalid),
        },

        Command::End => {
            let result = device.lock_state().arbiter.end(who);
            match result {
                Ok(()) => {
                    device.with_handler(|h| h.end());
                    device.wake();
                    Reply::ok(device, id)
                }
                Err(e) => not_active(device, id, e),
            }
        }

        Command::Suspend => {
            let result = device.lock_state().arbiter.suspend(who);
            match result {
                Ok(()) => {
                    device.with_handler(|h| h.suspend());
                    device.wake();
                    Reply::ok(device, id)
                }
                Err(e) => not_active(device, id, e),
            }
        }

        Command::Reserve => {
            let result = device.lock_state().arbiter.reserve(who);
            match result {
                Ok(()) => {
                    device.with_handler(|h| h.reserve());
                    Reply::ok(device, id)
                }
                Err(e) => not_active(device, id, e),
            }
        }

        Command::Release => {
            let result = device.lock_state().arbiter.release(who);
            match result {
                Ok(()) => {
                    device.with_handler(|h| h.release());
                    Reply::ok(device, id)
                }
                Err(e) => not_active(device, id, e),
            }
        }

        Command::Read => {
            let owner = device.lock_state().arbiter.is_owner(who);
            if !owner {
                return not_active(device, id, ArbiterError::NotActive);
            }
            let Ok(block) = read_u32(payload, 0) else {
                return Reply::error(device, id, ErrorStatus::Invalid);
            };
            match device.read_block(block).await {
                Ok(image) => Reply::data(device, id, image, device.image_prefix()),
                Err(e) => {
                    warn!("device {:04X} session {id}: read failed: {e}", device.devnum);
                    Reply::with_code(device, id, ResponseCode::IoError, 0)
                }
            }
        }

        Command::Write => {
            if !device.lock_state().arbiter.is_owner(who) {
                return not_active(device, id, ArbiterError::NotActive);
            }
            let (Ok(block), Ok(offset)) = (read_u32(payload, 0), read_u32(payload, 4)) else {
                return Reply::error(device, id, ErrorStatus::Invalid);
            };
            match device.write_block(who, block, offset, &payload[8..]) {
                Ok(()) => Reply::ok(device, id),
                Err(e) => {
                    warn!("device {:04X} session {id}: write failed: {e}", device.devnum);
                    Reply::with_code(device, id, ResponseCode::IoError, 0)
                }
            }
        }

        Command::Sense => {
            let sense = device.with_handler(|h| h.sense());
            Reply::data(device, id, sense.to_vec(), 0)
        }

        Command::Query => {
            let Ok(selector) = QuerySelector::try_from(header.flags) else {
                return Reply::error(device, id, ErrorStatus::Invalid);
            };
            match device.with_handler(|h| h.query(selector)) {
                Ok(answer) => Reply::data(device, id, answer, 0),
                Err(e) => {
                    debug!("device {:04X} session {id}: {e}", device.devnum);
                    Reply::error(device, id, ErrorStatus::Invalid)
                }
            }
        }

        Command::Compress => negotiate_compression(device, id, header.flags),

        // A session is connected exactly once; DISCONNECT never reaches here.
        Command::Connect | Command::Disconnect => Reply::error(device, id, ErrorStatus::Invalid),
    }
}

/// Builds the OK reply for a granted START/RESUME, delivering the purge list.
fn grant(device: &Device, id: SessionId, command: Command) -> Reply {
    let notice = {
        let mut state = device.lock_state();
        state.sessions.get_mut(&id).and_then(|s| s.purge.take())
    };
    device.with_handler(|h| {
        if command == Command::Resume {
            h.resume()
        } else {
            h.start()
        }
    });

    let mut reply = Reply::ok(device, id);
    match notice {
        Some(PurgeNotice::Blocks(blocks)) => {
            debug!("device {:04X} session {id}: purging {} blocks", device.devnum, blocks.len());
            reply.header.cmd |= PURGE_FLAG;
            reply.payload = encode_block_list(&blocks);
        }
        Some(PurgeNotice::All) => {
            debug!("device {:04X} session {id}: purging all blocks", device.devnum);
            reply.header.cmd |= PURGE_FLAG;
        }
        None => {}
    }
    reply
}

fn negotiate_compression(device: &Device, id: SessionId, flags: u8) -> Reply {
    let (mask, requested_level) = split_compress_flags(flags);
    let accepted = mask & SUPPORTED_ALGORITHMS;
    let level = requested_level.min(device.settings().compression_level).min(9);

    let spec = (accepted != 0).then(|| CompressionSpec::zlib(level));
    if let Some(session) = device.lock_state().sessions.get_mut(&id) {
        session.compression = spec;
    }
    info!(
        "device {:04X} session {id}: compression {}",
        device.devnum,
        if spec.is_some() { "zlib" } else { "off" }
    );
    Reply::with_code(device, id, ResponseCode::Ok, compress_flags(accepted, level))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use shrd_core::protocol::{decode_block_list, START_NOWAIT};
    use shrd_core::DeviceKind;
    use std::sync::Arc;

    use crate::application::handler::{HandlerError, MockDeviceHandler};
    use crate::infrastructure::device::memory::{MemoryDevice, MemoryProbe};
    use crate::infrastructure::registry::{DeviceRegistry, SharingSettings};

    fn setup() -> (DeviceRegistry, Arc<Device>, MemoryProbe, SessionId, SessionId) {
        let reg = DeviceRegistry::new(SharingSettings::default());
        let handler = MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256);
        let probe = handler.probe();
        let dev = reg.register(0x0190, Box::new(handler)).unwrap();
        let a = dev.attach_session(0, "a".into()).unwrap().id;
        let b = dev.attach_session(0, "b".into()).unwrap().id;
        (reg, dev, probe, a, b)
    }

    fn job(id: SessionId, command: Command, flags: u8, payload: Vec<u8>) -> Job {
        Job {
            id,
            request: Request {
                header: Header::request(command, flags, 0x0190, id),
                payload,
            },
            start: None,
        }
    }

    fn write_payload(block: u32, offset: u32, data: &[u8]) -> Vec<u8> {
        let mut p = block.to_be_bytes().to_vec();
        p.extend_from_slice(&offset.to_be_bytes());
        p.extend_from_slice(data);
        p
    }

    fn own(dev: &Device, id: SessionId) {
        assert_eq!(
            dev.lock_state().arbiter.start(Requester::Remote(id), false),
            StartDecision::Granted
        );
    }

    #[tokio::test]
    async fn test_granted_start_delivers_and_clears_purge_list() {
        // Arrange
        let (_reg, dev, _probe, a, b) = setup();
        own(&dev, a);
        dev.write_block(Requester::Remote(a), 5, 0, &[1; 64]).unwrap();
        dev.lock_state().arbiter.end(Requester::Remote(a)).unwrap();
        own(&dev, b);
        let mut start = job(b, Command::Start, 0, Vec::new());
        start.start = Some(StartDecision::Granted);

        // Act
        let reply = execute(&dev, &start).await;

        // Assert
        assert!(reply.header.has_purge());
        assert_eq!(decode_block_list(&reply.payload).unwrap(), vec![5]);
        let again = execute(&dev, &start).await;
        assert!(!again.header.has_purge(), "purge list must be delivered once");
    }

    #[tokio::test]
    async fn test_busy_decision_replies_busy() {
        let (_reg, dev, _probe, a, _b) = setup();
        let mut start = job(a, Command::Start, START_NOWAIT, Vec::new());
        start.start = Some(StartDecision::Busy);

        let reply = execute(&dev, &start).await;

        assert_eq!(reply.header.response_code(), Some(ResponseCode::Busy));
    }

    #[tokio::test]
    async fn test_end_by_non_owner_is_not_active() {
        let (_reg, dev, _probe, a, b) = setup();
        own(&dev, a);

        let reply = execute(&dev, &job(b, Command::End, 0, Vec::new())).await;

        assert_eq!(reply.header.response_code(), Some(ResponseCode::Error));
        assert_eq!(reply.header.flags, ErrorStatus::NotActive as u8);
    }

    #[tokio::test]
    async fn test_read_requires_ownership() {
        let (_reg, dev, _probe, a, _b) = setup();
        let reply = execute(&dev, &job(a, Command::Read, 0, 1u32.to_be_bytes().to_vec())).await;
        assert_eq!(reply.header.flags, ErrorStatus::NotActive as u8);
    }

    #[tokio::test]
    async fn test_write_then_read_round_trips_through_handler() {
        // Arrange
        let (_reg, dev, probe, a, _b) = setup();
        own(&dev, a);

        // Act
        let w = execute(&dev, &job(a, Command::Write, 0, write_payload(5, 8, &[0xEE; 32]))).await;
        let r = execute(&dev, &job(a, Command::Read, 0, 5u32.to_be_bytes().to_vec())).await;

        // Assert
        assert_eq!(w.header.response_code(), Some(ResponseCode::Ok));
        assert_eq!(&r.payload[8..40], &[0xEE; 32]);
        assert_eq!(r.prefix, 5, "CKD reads keep the track header uncompressed");
        assert_eq!(probe.image(5).unwrap()[8], 0xEE);
    }

    #[tokio::test]
    async fn test_failed_read_replies_ioerr_and_sense_is_available() {
        let (_reg, dev, probe, a, _b) = setup();
        own(&dev, a);
        probe.fail_block(2);

        let r = execute(&dev, &job(a, Command::Read, 0, 2u32.to_be_bytes().to_vec())).await;
        let s = execute(&dev, &job(a, Command::Sense, 0, Vec::new())).await;

        assert_eq!(r.header.response_code(), Some(ResponseCode::IoError));
        assert_eq!(s.payload[0], 0x10);
        assert_eq!(&s.payload[4..8], &2u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_short_write_payload_is_invalid() {
        let (_reg, dev, _probe, a, _b) = setup();
        own(&dev, a);
        let reply = execute(&dev, &job(a, Command::Write, 0, vec![0, 0, 0, 1])).await;
        assert_eq!(reply.header.flags, ErrorStatus::Invalid as u8);
    }

    #[tokio::test]
    async fn test_query_unknown_selector_is_invalid() {
        let (_reg, dev, _probe, a, _b) = setup();
        let reply = execute(&dev, &job(a, Command::Query, 0x7F, Vec::new())).await;
        assert_eq!(reply.header.flags, ErrorStatus::Invalid as u8);
    }

    #[tokio::test]
    async fn test_query_serial_number() {
        let (_reg, dev, _probe, a, _b) = setup();
        let reply =
            execute(&dev, &job(a, Command::Query, QuerySelector::SerialNumber as u8, Vec::new())).await;
        assert_eq!(reply.payload, b"SHRD00000190");
    }

    #[tokio::test]
    async fn test_compress_negotiation_keeps_only_supported_algorithms() {
        let (_reg, dev, _probe, a, _b) = setup();

        let reply = execute(&dev, &job(a, Command::Compress, compress_flags(0x03, 6), Vec::new())).await;

        assert_eq!(split_compress_flags(reply.header.flags), (SUPPORTED_ALGORITHMS, 6));
        let state = dev.lock_state();
        assert_eq!(state.sessions[&a].compression, Some(CompressionSpec::zlib(6)));
    }

    #[tokio::test]
    async fn test_unknown_command_is_invalid() {
        let (_reg, dev, _probe, a, _b) = setup();
        let mut bad = job(a, Command::Sense, 0, Vec::new());
        bad.request.header.cmd = 0x3F;
        let reply = execute(&dev, &bad).await;
        assert_eq!(reply.header.flags, ErrorStatus::Invalid as u8);
    }

    #[tokio::test]
    async fn test_handler_write_error_maps_to_ioerr() {
        // Arrange: a handler that rejects every write.
        let reg = DeviceRegistry::new(SharingSettings::default());
        let mut mock = MockDeviceHandler::new();
        mock.expect_init().returning(|| Ok(()));
        mock.expect_kind().return_const(DeviceKind::Fba);
        mock.expect_image_prefix().return_const(0usize);
        mock.expect_write().times(1).returning(|block, _, _| {
            Err(HandlerError::Io {
                unit: "block",
                number: block,
                message: "disk on fire".into(),
            })
        });
        let dev = reg.register(0x0200, Box::new(mock)).unwrap();
        let a = dev.attach_session(0, "a".into()).unwrap().id;
        own(&dev, a);

        // Act
        let mut w = job(a, Command::Write, 0, write_payload(1, 0, &[1, 2, 3]));
        w.request.header.devnum = 0x0200;
        let reply = execute(&dev, &w).await;

        // Assert
        assert_eq!(reply.header.response_code(), Some(ResponseCode::IoError));
    }
}
