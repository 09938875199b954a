//! Channel-backed device for exercising the engines without a real interface

use std::io;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{Framing, PacketDevice};

/// In-memory interface: packets injected through [`MemoryHandle::inject`] are
/// read by the engine, packets the engine writes show up on [`MemoryHandle::written`].
pub struct MemoryDevice {
    name: String,
    framing: Framing,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Test side of a [`MemoryDevice`]
pub struct MemoryHandle {
    pub inject: mpsc::UnboundedSender<Vec<u8>>,
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn memory_device(name: &str, framing: Framing) -> (MemoryDevice, MemoryHandle) {
    let (inject, inbound) = mpsc::unbounded_channel();
    let (outbound, written) = mpsc::unbounded_channel();
    let device = MemoryDevice {
        name: name.to_string(),
        framing,
        inbound: Mutex::new(inbound),
        outbound,
    };
    (device, MemoryHandle { inject, written })
}

#[async_trait]
impl PacketDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => std::future::pending().await,
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory device closed"))?;
        Ok(packet.len())
    }
}
