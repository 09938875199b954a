//! Read pumps feeding the forwarding engines
//!
//! Each direction gets one task that reads into a fresh pooled frame, hands
//! the filled frame to the engine through a single-slot channel and goes
//! straight back to reading. The engine therefore works on one frame while
//! the next is already queued.
//!
//! When the slot is still occupied the pump holds its filled frame in
//! `send` and does not read again until the engine catches up. That wait is
//! the backpressure: at most three frames per direction are in flight (one
//! being processed, one queued, one held by the pump).
//!
//! Pumps stop silently when the engine drops its receivers or the task is
//! aborted; read errors are logged and retried after a short pause.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Role;
use crate::protocol::{Frame, FramePool, HEADER_LEN};
use crate::tunnel::PacketDevice;

/// Pause after a failed read before trying again
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Requested kernel buffer size for the UDP socket
pub const SOCKET_BUFFER_SIZE: usize = 1 << 20;

/// Frames waiting for the engine per direction
const QUEUE_DEPTH: usize = 1;

/// Pump tasks owned by a running engine; aborted on drop
pub struct Pumps {
    handles: Vec<JoinHandle<()>>,
}

impl Pumps {
    pub fn new(handles: Vec<JoinHandle<()>>) -> Self {
        Self { handles }
    }
}

impl Drop for Pumps {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Start reading interface packets
///
/// Frames are read with [`HEADER_LEN`] bytes of headroom so the codec can
/// prepend the wire header in place.
pub fn spawn_device_pump(
    role: Role,
    device: Arc<dyn PacketDevice>,
    pool: FramePool,
) -> (mpsc::Receiver<Frame>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

    let handle = tokio::spawn(async move {
        loop {
            let mut frame = pool.acquire(HEADER_LEN);
            match device.recv(frame.spare_mut()).await {
                Ok(0) => continue,
                Ok(len) => {
                    frame.set_len(len);
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log_read_error(role, "read", &e);
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
    });

    (rx, handle)
}

/// Start receiving datagrams together with their source address
pub fn spawn_socket_pump(
    role: Role,
    socket: Arc<UdpSocket>,
    pool: FramePool,
) -> (mpsc::Receiver<(Frame, SocketAddr)>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

    let handle = tokio::spawn(async move {
        loop {
            let mut frame = pool.acquire(0);
            match socket.recv_from(frame.spare_mut()).await {
                Ok((len, from)) => {
                    frame.set_len(len);
                    if tx.send((frame, from)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log_read_error(role, "receive", &e);
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
    });

    (rx, handle)
}

fn log_read_error(role: Role, op: &str, error: &std::io::Error) {
    match role {
        Role::Client => tracing::error!("client {} error: {}", op, error),
        Role::Server => tracing::warn!("server {} error: {}", op, error),
    }
}

/// Enlarge the socket's kernel buffers; failures only matter for throughput
pub fn tune_socket(socket: &UdpSocket) {
    let sock = SockRef::from(socket);
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::debug!("failed to set SO_RCVBUF: {}", e);
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::debug!("failed to set SO_SNDBUF: {}", e);
    }
}
