//! TCP listener: accept loop and the CONNECT handshake.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting connections, each in its own short-lived Tokio task.
//! 3. Running the handshake: the first frame must be a CONNECT naming a
//!    shared device and a protocol version the server speaks.
//! 4. Attaching the new session to the device and handing both socket
//!    halves to the device's dispatch loop, starting the loop if the device
//!    had no sessions.
//! 5. Stopping when [`ServerHandle::shutdown`] clears the `running` flag.
//!
//! After the handshake the listener task is done; everything else about the
//! session happens in the dispatch loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shrd_core::protocol::{
    read_frame, write_frame, Command, ErrorStatus, FrameError, Header, ResponseCode,
    PROTOCOL_RELEASE, PROTOCOL_VERSION,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::infrastructure::network::dispatch_loop;
use crate::infrastructure::network::session::Inbound;
use crate::infrastructure::registry::DeviceRegistry;
use crate::infrastructure::trace::TraceRing;
use crate::infrastructure::ServerError;

/// How long `accept()` may block before the shutdown flag is checked again.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Upper bound on how long shutdown waits for dispatch loops to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ── Public API ────────────────────────────────────────────────────────────────

/// A running server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
    registry: Arc<DeviceRegistry>,
}

impl ServerHandle {
    /// Address the listener is bound to (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Diagnostic trace of processed requests.
    pub fn trace(&self) -> &Arc<TraceRing> {
        self.registry.trace()
    }

    /// Stops accepting, waits for the accept loop to exit, then forces every
    /// session off every device.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::Relaxed);
        if let Err(e) = self.task.await {
            error!("accept loop ended abnormally: {e}");
        }
        self.registry.disconnect_all();

        let drained = timeout(DRAIN_TIMEOUT, async {
            while self
                .registry
                .devices()
                .iter()
                .any(|d| !d.status().sessions.is_empty())
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("sessions still attached after {DRAIN_TIMEOUT:?}");
        }
        info!("server on {} stopped", self.local_addr);
    }
}

/// Binds `bind` and starts accepting connections for the devices in `registry`.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the listener cannot be bound (e.g. the
/// port is in use).
pub async fn start(bind: SocketAddr, registry: Arc<DeviceRegistry>) -> Result<ServerHandle, ServerError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind { addr: bind, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Bind { addr: bind, source })?;
    info!("shared device server listening on {local_addr}");

    let running = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(accept_loop(
        listener,
        Arc::clone(&registry),
        Arc::clone(&running),
    ));

    Ok(ServerHandle {
        local_addr,
        running,
        task,
        registry,
    })
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, registry: Arc<DeviceRegistry>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("new connection from {peer}");
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = handshake(stream, peer, &registry).await {
                        debug!("connection from {peer} failed during handshake: {e}");
                    }
                });
            }
            Ok(Err(e)) => {
                // Transient (e.g. out of file descriptors); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Runs the CONNECT exchange on a fresh socket.
///
/// Rejections are answered on the socket and return `Ok(())`; only transport
/// and decode failures are errors.
async fn handshake(stream: TcpStream, peer: SocketAddr, registry: &DeviceRegistry) -> Result<(), FrameError> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (header, payload) = read_frame(&mut reader).await?;
    let reject = |status: ErrorStatus| {
        Header::response(ResponseCode::Error, status as u8, header.devnum, header.id)
    };

    match header.command() {
        Some(Command::Connect) => {}
        Some(Command::Disconnect) => {
            let ok = Header::response(ResponseCode::Ok, 0, header.devnum, header.id);
            return write_frame(&mut writer, &ok, &[], None).await;
        }
        _ => {
            debug!("{peer}: request before CONNECT");
            return write_frame(&mut writer, &reject(ErrorStatus::NotConnected), &[], None).await;
        }
    }

    if payload.first() != Some(&PROTOCOL_VERSION) {
        warn!("{peer}: unsupported protocol version {:?}", payload.first());
        return write_frame(&mut writer, &reject(ErrorStatus::BadVersion), &[], None).await;
    }

    let Some(device) = registry.get(header.devnum) else {
        warn!("{peer}: device {:04X} is not shared", header.devnum);
        return write_frame(&mut writer, &reject(ErrorStatus::NoDevice), &[], None).await;
    };

    let attached = match device.attach_session(header.id, peer.to_string()) {
        Ok(attached) => attached,
        Err(e) => {
            warn!("{peer}: connect refused: {e}");
            return write_frame(&mut writer, &reject(ErrorStatus::NotAvailable), &[], None).await;
        }
    };

    let ok = Header::response(ResponseCode::Ok, 0, device.devnum, attached.id);
    let sent = write_frame(&mut writer, &ok, &[PROTOCOL_VERSION, PROTOCOL_RELEASE], None).await;

    // Hand the socket over even if the reply failed: the reader will report
    // the broken socket and the loop will drop the session.
    let _ = device.inbound().send(Inbound::Attach {
        id: attached.id,
        generation: attached.generation,
        reader,
        writer,
    });
    if attached.spawn_loop {
        tokio::spawn(dispatch_loop::run(Arc::clone(&device)));
    }

    if attached.reconnected {
        info!("{peer}: session {} reconnected to device {:04X}", attached.id, device.devnum);
    } else {
        info!("{peer}: session {} connected to device {:04X}", attached.id, device.devnum);
    }
    sent
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use shrd_core::DeviceKind;

    use crate::infrastructure::device::memory::MemoryDevice;
    use crate::infrastructure::registry::SharingSettings;

    async fn server() -> ServerHandle {
        let registry = Arc::new(DeviceRegistry::new(SharingSettings::default()));
        registry
            .register(0x0190, Box::new(MemoryDevice::new(DeviceKind::Ckd, 0x0190, 30, 256)))
            .unwrap();
        start("127.0.0.1:0".parse().unwrap(), registry).await.unwrap()
    }

    async fn exchange(addr: SocketAddr, header: Header, payload: &[u8]) -> (Header, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &header, payload, None).await.unwrap();
        read_frame(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_assigns_session_id_and_reports_version() {
        // Arrange
        let handle = server().await;

        // Act
        let (reply, payload) = exchange(
            handle.local_addr(),
            Header::request(Command::Connect, 0, 0x0190, 0),
            &[PROTOCOL_VERSION, PROTOCOL_RELEASE],
        )
        .await;

        // Assert
        assert_eq!(reply.response_code(), Some(ResponseCode::Ok));
        assert_ne!(reply.id, 0);
        assert_eq!(payload, vec![PROTOCOL_VERSION, PROTOCOL_RELEASE]);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_to_unknown_device_is_rejected() {
        let handle = server().await;

        let (reply, _) = exchange(
            handle.local_addr(),
            Header::request(Command::Connect, 0, 0x0999, 0),
            &[PROTOCOL_VERSION, PROTOCOL_RELEASE],
        )
        .await;

        assert_eq!(reply.response_code(), Some(ResponseCode::Error));
        assert_eq!(reply.flags, ErrorStatus::NoDevice as u8);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_with_wrong_version_is_rejected() {
        let handle = server().await;

        let (reply, _) = exchange(
            handle.local_addr(),
            Header::request(Command::Connect, 0, 0x0190, 0),
            &[PROTOCOL_VERSION + 1, 0],
        )
        .await;

        assert_eq!(reply.flags, ErrorStatus::BadVersion as u8);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_before_connect_is_rejected() {
        let handle = server().await;

        let (reply, _) = exchange(
            handle.local_addr(),
            Header::request(Command::Start, 0, 0x0190, 0),
            &[],
        )
        .await;

        assert_eq!(reply.flags, ErrorStatus::NotConnected as u8);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_on_used_port_fails() {
        let handle = server().await;
        let registry = Arc::new(DeviceRegistry::new(SharingSettings::default()));

        let result = start(handle.local_addr(), registry).await;

        assert!(matches!(result, Err(ServerError::Bind { .. })));
        handle.shutdown().await;
    }
}
