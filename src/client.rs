//! Client forwarding engine
//!
//! Main event loop that coordinates:
//! - interface reads -> encode with our generation -> connected UDP socket
//! - UDP datagrams -> decode -> generation check -> interface writes
//!
//! The server address is fixed at startup; there is no roaming on this side.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::config::{BridgeConfig, ClientId, Role};
use crate::error::{BridgeError, NetworkError, ProtocolError};
use crate::pipeline::{spawn_device_pump, spawn_socket_pump, tune_socket, Pumps};
use crate::protocol::codec::{self, header_hex};
use crate::protocol::{generation_from_clock, Frame, FramePool};
use crate::tunnel::{log_setup_hints, Framing, PacketDevice, TunDevice};

/// Tunnel client
pub struct BridgeClient {
    /// Virtual interface
    device: Arc<dyn PacketDevice>,
    /// UDP socket connected to the server
    socket: Arc<UdpSocket>,
    /// Shared tunnel identifier
    client_id: ClientId,
    /// Our generation for this process run
    generation: u64,
    /// Interface framing
    framing: Framing,
    /// Buffers for both read pumps
    pool: FramePool,
    /// Packets sent; also the last sequence number used
    tx_count: u64,
    /// Packets accepted from the server
    rx_count: u64,
}

impl BridgeClient {
    /// Create the interface and connect to the server named in `config`
    pub async fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let server = config.resolve().await?;

        let device = TunDevice::create(config)?;
        log_setup_hints(config, device.name());

        let socket = connect_socket(server).await?;
        tracing::info!(
            "Client socket {} connected to {}",
            socket.local_addr()?,
            server
        );

        Ok(Self::with_parts(
            Arc::new(device),
            socket,
            config.client_id,
            generation_from_clock(),
        ))
    }

    /// Assemble a client from an open device and a connected socket
    pub fn with_parts(
        device: Arc<dyn PacketDevice>,
        socket: UdpSocket,
        client_id: ClientId,
        generation: u64,
    ) -> Self {
        let framing = device.framing();
        Self {
            device,
            socket: Arc::new(socket),
            client_id,
            generation,
            framing,
            pool: FramePool::default(),
            tx_count: 0,
            rx_count: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tx_count(&self) -> u64 {
        self.tx_count
    }

    pub fn rx_count(&self) -> u64 {
        self.rx_count
    }

    /// Run the client (main event loop)
    ///
    /// Only returns on error-free shutdown of both pumps; callers normally
    /// race it against a shutdown signal and drop it.
    pub async fn run(&mut self) -> Result<(), BridgeError> {
        let (mut device_rx, device_pump) =
            spawn_device_pump(Role::Client, self.device.clone(), self.pool.clone());
        let (mut socket_rx, socket_pump) =
            spawn_socket_pump(Role::Client, self.socket.clone(), self.pool.clone());
        let _pumps = Pumps::new(vec![device_pump, socket_pump]);

        tracing::info!(
            "Client event loop started (generation {}, framing {})",
            self.generation,
            self.framing
        );

        loop {
            tokio::select! {
                // Interface -> encode -> UDP
                Some(frame) = device_rx.recv() => {
                    if let Err(e) = self.handle_device_frame(frame).await {
                        tracing::trace!("Dropping interface packet: {}", e);
                    }
                }

                // UDP -> decode -> interface
                Some((frame, _from)) = socket_rx.recv() => {
                    if let Err(e) = self.handle_socket_frame(frame).await {
                        tracing::trace!("Dropping datagram: {}", e);
                    }
                }

                else => break,
            }
        }

        Ok(())
    }

    /// Handle a packet read from the interface (outgoing traffic)
    async fn handle_device_frame(&mut self, mut frame: Frame) -> Result<(), BridgeError> {
        self.framing.strip(&mut frame)?;

        self.tx_count += 1;
        if let Err(e) = codec::seal(self.client_id, self.generation, self.tx_count, &mut frame) {
            self.tx_count -= 1;
            return Err(e.into());
        }

        if let Err(e) = self.socket.send(frame.as_slice()).await {
            tracing::trace!("Send to server failed: {}", e);
        }

        Ok(())
    }

    /// Handle a datagram from the server
    async fn handle_socket_frame(&mut self, mut frame: Frame) -> Result<(), BridgeError> {
        let header = codec::open(self.client_id, &mut frame).map_err(|e| {
            tracing::trace!("Undecodable datagram, header {}", header_hex(frame.as_slice()));
            e
        })?;

        if header.generation != self.generation {
            return Err(ProtocolError::ForeignGeneration {
                got: header.generation,
                own: self.generation,
            }
            .into());
        }

        self.rx_count += 1;

        self.framing.restore(&mut frame)?;
        if let Err(e) = self.device.send(frame.as_slice()).await {
            tracing::trace!("Write to {} failed: {}", self.device.name(), e);
        }

        Ok(())
    }
}

/// Bind an ephemeral port of the server's address family and connect it
async fn connect_socket(server: SocketAddr) -> Result<UdpSocket, BridgeError> {
    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| NetworkError::BindFailed {
            addr: bind_addr.to_string(),
            reason: e.to_string(),
        })?;

    socket
        .connect(server)
        .await
        .map_err(|e| NetworkError::ConnectFailed {
            endpoint: server.to_string(),
            reason: e.to_string(),
        })?;

    tune_socket(&socket);
    Ok(socket)
}
