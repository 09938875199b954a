//! Server forwarding engine
//!
//! Main event loop for server mode that handles:
//! - Listening on the bound UDP address for the single remote peer
//! - Admitting datagrams through the session policy (replay, roaming, takeover)
//! - Sending interface packets back to the peer's last known address
//! - Expiring the session after a run of idle liveness windows

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::config::{BridgeConfig, ClientId, Role};
use crate::error::{BridgeError, NetworkError};
use crate::pipeline::{spawn_device_pump, spawn_socket_pump, tune_socket, Pumps};
use crate::protocol::codec::{self, header_hex};
use crate::protocol::{Admission, Frame, FramePool, LivenessMonitor, SessionRecord, WindowOutcome};
use crate::tunnel::{log_setup_hints, Framing, PacketDevice, TunDevice};

/// Tunnel server
pub struct BridgeServer {
    /// Virtual interface
    device: Arc<dyn PacketDevice>,
    /// Listening UDP socket
    socket: Arc<UdpSocket>,
    /// Shared tunnel identifier
    client_id: ClientId,
    /// Interface framing
    framing: Framing,
    /// Buffers for both read pumps
    pool: FramePool,
    /// State of the one remote peer
    session: SessionRecord,
    /// Idle expiry settings
    liveness: LivenessMonitor,
}

impl BridgeServer {
    /// Create the interface and bind the address named in `config`
    pub async fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let listen = config.resolve().await?;

        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: listen.to_string(),
                reason: e.to_string(),
            })?;
        tune_socket(&socket);
        tracing::info!("Server listening on {}", socket.local_addr()?);

        let device = TunDevice::create(config)?;
        log_setup_hints(config, device.name());

        Ok(Self::with_parts(Arc::new(device), socket, config.client_id))
    }

    /// Assemble a server from an open device and a bound socket
    pub fn with_parts(device: Arc<dyn PacketDevice>, socket: UdpSocket, client_id: ClientId) -> Self {
        let framing = device.framing();
        Self {
            device,
            socket: Arc::new(socket),
            client_id,
            framing,
            pool: FramePool::default(),
            session: SessionRecord::new(),
            liveness: LivenessMonitor::default(),
        }
    }

    /// Replace the default liveness period and idle limit
    pub fn with_liveness(mut self, liveness: LivenessMonitor) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    /// Run the server (main event loop)
    pub async fn run(&mut self) -> Result<(), BridgeError> {
        let (mut device_rx, device_pump) =
            spawn_device_pump(Role::Server, self.device.clone(), self.pool.clone());
        let (mut socket_rx, socket_pump) =
            spawn_socket_pump(Role::Server, self.socket.clone(), self.pool.clone());
        let _pumps = Pumps::new(vec![device_pump, socket_pump]);

        let mut ticker = self.liveness.interval();

        tracing::info!(
            "Server event loop started (liveness every {:?}, expiry after {} idle windows)",
            self.liveness.period(),
            self.liveness.idle_limit()
        );

        loop {
            tokio::select! {
                Some(frame) = device_rx.recv() => {
                    if let Err(e) = self.handle_device_frame(frame).await {
                        tracing::trace!("Dropping interface packet: {}", e);
                    }
                }

                Some((frame, from)) = socket_rx.recv() => {
                    if let Err(e) = self.handle_socket_frame(frame, from).await {
                        tracing::trace!("Dropping datagram from {}: {}", from, e);
                    }
                }

                _ = ticker.tick() => {
                    self.handle_liveness_tick();
                }
            }
        }
    }

    /// Handle a packet read from the interface (traffic for the peer)
    async fn handle_device_frame(&mut self, mut frame: Frame) -> Result<(), BridgeError> {
        self.framing.strip(&mut frame)?;

        let outbound = self.session.next_outbound()?;
        if let Err(e) = codec::seal(
            self.client_id,
            outbound.generation,
            outbound.sequence,
            &mut frame,
        ) {
            self.session.rollback_outbound();
            return Err(e.into());
        }

        match self.socket.send_to(frame.as_slice(), outbound.peer).await {
            Ok(_) => self.session.mark_sent(),
            Err(e) => tracing::trace!("Send to {} failed: {}", outbound.peer, e),
        }

        Ok(())
    }

    /// Handle a datagram from the network
    async fn handle_socket_frame(
        &mut self,
        mut frame: Frame,
        from: SocketAddr,
    ) -> Result<(), BridgeError> {
        let header = codec::open(self.client_id, &mut frame).map_err(|e| {
            tracing::trace!("Undecodable datagram, header {}", header_hex(frame.as_slice()));
            e
        })?;

        match self.session.admit(header.generation, header.sequence, from)? {
            Admission::Takeover { previous } => {
                tracing::info!(
                    "Session from {} (generation {} -> {})",
                    from,
                    previous,
                    header.generation
                );
            }
            Admission::Advanced { roamed: true } => {
                tracing::info!("Peer endpoint changed to {}", from);
            }
            Admission::Advanced { roamed: false } => {}
            Admission::Duplicate => {
                tracing::trace!("Duplicate sequence {} from {}", header.sequence, from);
            }
        }

        self.framing.restore(&mut frame)?;
        if let Err(e) = self.device.send(frame.as_slice()).await {
            tracing::trace!("Write to {} failed: {}", self.device.name(), e);
        }

        Ok(())
    }

    fn handle_liveness_tick(&mut self) {
        match self.liveness.tick(&mut self.session) {
            WindowOutcome::Live { rx, tx } => {
                let pool = self.pool.stats();
                tracing::debug!(
                    "Liveness window: rx {} tx {} (buffers: {} allocated, {} idle)",
                    rx,
                    tx,
                    pool.allocations,
                    pool.idle
                );
            }
            WindowOutcome::Idle { windows } => {
                tracing::debug!("Liveness window idle ({}/{})", windows, self.liveness.idle_limit());
            }
            WindowOutcome::Expired { was_active: true } => {
                tracing::info!(
                    "Session expired after {} idle windows",
                    self.liveness.idle_limit()
                );
            }
            WindowOutcome::Expired { was_active: false } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::client::BridgeClient;
    use crate::error::ProtocolError;
    use crate::protocol::HEADER_LEN;
    use crate::tunnel::memory::{memory_device, MemoryHandle};

    fn id() -> ClientId {
        ClientId::new(42).unwrap()
    }

    fn ipv4_packet(payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[9] = 17;
        packet[12..16].copy_from_slice(&[10, 0, 0, 254]);
        packet[16..20].copy_from_slice(&[10, 0, 0, 1]);
        packet.extend_from_slice(payload);
        packet
    }

    async fn server() -> (BridgeServer, MemoryHandle) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (device, handle) = memory_device("tun0", Framing::Raw);
        (BridgeServer::with_parts(Arc::new(device), socket, id()), handle)
    }

    fn wire(generation: u64, sequence: u64, payload: &[u8]) -> Frame {
        let mut frame = Frame::with_payload(HEADER_LEN, payload).unwrap();
        codec::seal(id(), generation, sequence, &mut frame).unwrap();
        Frame::with_payload(0, frame.as_slice()).unwrap()
    }

    #[tokio::test]
    async fn test_interface_packet_discarded_without_session() {
        let (mut server, _handle) = server().await;

        let frame = Frame::with_payload(HEADER_LEN, &ipv4_packet(b"")).unwrap();
        let err = server.handle_device_frame(frame).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(ProtocolError::Inactive)));
        assert_eq!(server.session().counters().tx, 0);
    }

    #[tokio::test]
    async fn test_admitted_peer_receives_return_traffic() {
        let (mut server, mut handle) = server().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let inbound = ipv4_packet(b"hello");
        server
            .handle_socket_frame(wire(500, 1, &inbound), peer_addr)
            .await
            .unwrap();
        assert_eq!(handle.written.recv().await.unwrap(), inbound);
        assert_eq!(server.session().generation(), 500);
        assert_eq!(server.session().peer(), Some(peer_addr));

        let reply = ipv4_packet(b"world");
        let frame = Frame::with_payload(HEADER_LEN, &reply).unwrap();
        server.handle_device_frame(frame).await.unwrap();

        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let mut received = Frame::with_payload(0, &buf[..len]).unwrap();
        let header = codec::open(id(), &mut received).unwrap();
        assert_eq!(header.generation, 500);
        assert_eq!(header.sequence, 1);
        assert_eq!(received.as_slice(), &reply[..]);
        assert_eq!(server.session().counters().windowed_tx, 1);
    }

    #[tokio::test]
    async fn test_replay_from_other_address_not_written() {
        let (mut server, mut handle) = server().await;
        let first: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:41001".parse().unwrap();

        server
            .handle_socket_frame(wire(7, 10, &ipv4_packet(b"a")), first)
            .await
            .unwrap();
        handle.written.recv().await.unwrap();

        let err = server
            .handle_socket_frame(wire(7, 10, &ipv4_packet(b"a")), other)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::ReplayFromOtherAddress { .. })
        ));
        assert!(handle.written.try_recv().is_err());
        assert_eq!(server.session().peer(), Some(first));
    }

    #[tokio::test]
    async fn test_encode_failure_rolls_back_sequence() {
        let (mut server, _handle) = server().await;
        let peer: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        server
            .handle_socket_frame(wire(7, 1, &ipv4_packet(b"")), peer)
            .await
            .unwrap();

        let frame = Frame::with_payload(0, &ipv4_packet(b"")).unwrap();
        assert!(server.handle_device_frame(frame).await.is_err());
        assert_eq!(server.session().counters().tx, 0);
    }

    #[tokio::test]
    async fn test_idle_windows_expire_session() {
        let (mut server, _handle) = server().await;
        let peer: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        server
            .handle_socket_frame(wire(7, 1, &ipv4_packet(b"")), peer)
            .await
            .unwrap();

        // First tick closes the window holding the packet.
        server.handle_liveness_tick();
        assert!(server.session().is_active());

        for _ in 0..4 {
            server.handle_liveness_tick();
        }
        assert!(server.session().is_active());

        server.handle_liveness_tick();
        assert!(!server.session().is_active());
        assert_eq!(server.session().generation(), 0);

        // Any generation is a takeover again.
        server
            .handle_socket_frame(wire(3, 1, &ipv4_packet(b"")), peer)
            .await
            .unwrap();
        assert_eq!(server.session().generation(), 3);
    }

    #[tokio::test]
    async fn test_return_traffic_follows_roaming_peer() {
        let (mut server, mut handle) = server().await;
        let old_addr: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let roamed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let roamed_addr = roamed.local_addr().unwrap();

        server
            .handle_socket_frame(wire(5, 10, &ipv4_packet(b"a")), old_addr)
            .await
            .unwrap();
        server
            .handle_socket_frame(wire(5, 11, &ipv4_packet(b"b")), roamed_addr)
            .await
            .unwrap();
        assert_eq!(server.session().peer(), Some(roamed_addr));
        handle.written.recv().await.unwrap();
        handle.written.recv().await.unwrap();

        // An old sequence from the previous address must not pull the peer back.
        assert!(server
            .handle_socket_frame(wire(5, 10, &ipv4_packet(b"a")), old_addr)
            .await
            .is_err());
        assert_eq!(server.session().peer(), Some(roamed_addr));
        assert_eq!(server.session().rx_sequence(), 11);

        let reply = ipv4_packet(b"reply");
        let frame = Frame::with_payload(HEADER_LEN, &reply).unwrap();
        server.handle_device_frame(frame).await.unwrap();

        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(1), roamed.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let mut received = Frame::with_payload(0, &buf[..len]).unwrap();
        let header = codec::open(id(), &mut received).unwrap();
        assert_eq!(header.generation, 5);
        assert_eq!(received.as_slice(), &reply[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_expires_idle_session() {
        let (server, _handle) = server().await;
        let mut server =
            server.with_liveness(LivenessMonitor::new(Duration::from_secs(10), 2));
        let peer: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        server
            .handle_socket_frame(wire(7, 1, &ipv4_packet(b"")), peer)
            .await
            .unwrap();
        assert!(server.session().is_active());

        // Ticks at 10 s (live), 20 s (idle 1) and 30 s (idle 2, expired).
        assert!(timeout(Duration::from_secs(35), server.run()).await.is_err());

        assert!(!server.session().is_active());
        assert_eq!(server.session().generation(), 0);
    }

    #[tokio::test]
    async fn test_client_and_server_over_loopback() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let (server_device, mut server_tun) = memory_device("tun0", Framing::Raw);
        let mut server = BridgeServer::with_parts(Arc::new(server_device), server_socket, id());

        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_socket.connect(server_addr).await.unwrap();
        let (client_device, mut client_tun) = memory_device("utun9", Framing::Raw);
        let mut client =
            BridgeClient::with_parts(Arc::new(client_device), client_socket, id(), 1_234_567);

        let server_task = tokio::spawn(async move { server.run().await });
        let client_task = tokio::spawn(async move { client.run().await });

        let upstream = ipv4_packet(b"request");
        client_tun.inject.send(upstream.clone()).unwrap();
        let arrived = timeout(Duration::from_secs(2), server_tun.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(arrived, upstream);

        let downstream = ipv4_packet(b"response");
        server_tun.inject.send(downstream.clone()).unwrap();
        let arrived = timeout(Duration::from_secs(2), client_tun.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(arrived, downstream);

        server_task.abort();
        client_task.abort();
    }
}
