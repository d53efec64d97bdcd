//! The per-connection lifecycle state machine. A channel owns its socket and
//!  both framing directions; the dispatcher owns the channel and is the only
//!  thread that ever touches it. All lifecycle work happens in small, resumable
//!  steps driven by readiness events.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::transport::capabilities::{
    ChannelEvents, ChannelParams, HandshakeIo, Handshaker, PacketReader, PacketSerializer, PacketWriter, RateLimiter,
};
use crate::transport::config::TransportConfig;
use crate::transport::error::ChannelError;
use crate::transport::framing::{PacketReadState, PacketWriteState, ReadEvent, WriteEvent};
use crate::transport::packet::Packet;
use crate::transport::socket::{PlainTcpSocket, StreamSocket};

/// The connection lifecycle. Regular progression is top to bottom; `close`
///  short-circuits any state straight to `Disconnected`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelState {
    NotConnected,
    /// transport-level handshake in progress (connect completion, TLS, ...)
    SocketHandshaking,
    /// protocol-level handshake in progress
    Handshaking,
    Connected,
    /// graceful disconnect: drain outbound data and the farewell exchange
    Disconnecting,
    /// transport-level shutdown in progress
    SocketDisconnecting,
    Disconnected,
}

pub struct Channel {
    name: String,
    state: ChannelState,
    socket: Box<dyn StreamSocket>,
    peer_addr: SocketAddr,
    token: Option<Token>,
    registered_interest: Option<Interest>,

    reader: Arc<dyn PacketReader>,
    writer: Arc<dyn PacketWriter>,
    events: Arc<dyn ChannelEvents>,
    handshaker: Arc<dyn Handshaker>,
    serializer: Arc<dyn PacketSerializer>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,

    read_state: PacketReadState,
    write_state: PacketWriteState,
    handshake_outbox: VecDeque<Packet>,
    handshake_inbox: VecDeque<Packet>,

    last_read: Instant,
    last_write: Instant,

    disconnect_hook_done: bool,
    closed: bool,
}

impl Channel {
    /// Initiate an outbound plain-TCP connection. The channel is usable once
    ///  it is registered with a dispatcher and the handshakes complete.
    pub fn connect(
        name: impl Into<String>,
        peer_addr: SocketAddr,
        params: ChannelParams,
        config: &TransportConfig,
    ) -> anyhow::Result<Channel> {
        let socket = PlainTcpSocket::connect(peer_addr)?;
        Ok(Self::from_socket(name.into(), Box::new(socket), peer_addr, params, config))
    }

    /// Wrap an accepted connection. Skips the outbound connect but follows the
    ///  same handshake / connected / disconnect path as a client channel.
    pub fn accepted(
        name: impl Into<String>,
        socket: Box<dyn StreamSocket>,
        peer_addr: SocketAddr,
        params: ChannelParams,
        config: &TransportConfig,
    ) -> Channel {
        Self::from_socket(name.into(), socket, peer_addr, params, config)
    }

    fn from_socket(
        name: String,
        socket: Box<dyn StreamSocket>,
        peer_addr: SocketAddr,
        params: ChannelParams,
        config: &TransportConfig,
    ) -> Channel {
        let now = Instant::now();
        let mut channel = Channel {
            name,
            state: ChannelState::NotConnected,
            socket,
            peer_addr,
            token: None,
            registered_interest: None,
            reader: params.reader,
            writer: params.writer,
            events: params.events,
            handshaker: params.handshaker,
            serializer: params.serializer,
            rate_limiter: params.rate_limiter,
            read_state: PacketReadState::new(config.max_packet_size, config.keep_received_files),
            write_state: PacketWriteState::new(config.max_packet_size),
            handshake_outbox: VecDeque::new(),
            handshake_inbox: VecDeque::new(),
            last_read: now,
            last_write: now,
            disconnect_hook_done: false,
            closed: false,
        };
        channel.set_state(ChannelState::SocketHandshaking);
        channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn events(&self) -> &Arc<dyn ChannelEvents> {
        &self.events
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_read.max(self.last_write)
    }

    pub(crate) fn has_buffered_read_data(&self) -> bool {
        self.socket.has_buffered_read_data()
    }

    pub(crate) fn on_cleanup_timer(&self, now: Instant) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.on_timer(now);
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_interest(&self) -> Option<Interest> {
        self.registered_interest
    }

    fn set_state(&mut self, state: ChannelState) {
        trace!(channel = %self.name, "state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Bind the channel to the dispatcher's poll object. Both interests are
    ///  requested up front: the transport handshake needs either direction.
    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;
        self.socket.register(registry, token, interest)?;
        self.token = Some(token);
        self.registered_interest = Some(interest);
        Ok(())
    }

    /// Drive the transport-level handshake (connect completion included).
    pub(crate) fn on_connectable(&mut self, registry: &Registry) -> Result<(), ChannelError> {
        if self.state != ChannelState::SocketHandshaking {
            return Ok(());
        }
        if self.socket.finish_handshake()? {
            debug!(channel = %self.name, "transport handshake complete");
            self.set_state(ChannelState::Handshaking);
            self.drive_handshake(registry)?;
        }
        Ok(())
    }

    /// Handle read readiness. Returns true when the channel wants to be
    ///  retained in the ready set: it holds transport-buffered data that will
    ///  not produce another readiness notification.
    pub(crate) fn on_readable(&mut self, registry: &Registry) -> Result<bool, ChannelError> {
        loop {
            match self.state {
                ChannelState::SocketHandshaking => {
                    self.on_connectable(registry)?;
                    if self.state == ChannelState::SocketHandshaking {
                        break;
                    }
                }
                ChannelState::Handshaking => match self.read_state.advance(self.socket.as_mut())? {
                    ReadEvent::Packet(packet) => {
                        let packet = self.serializer.decode(packet).map_err(ChannelError::Serializer)?;
                        self.handshake_inbox.push_back(packet);
                        self.drive_handshake(registry)?;
                    }
                    ReadEvent::Blocked => break,
                    ReadEvent::Closed => {
                        debug!(channel = %self.name, "peer closed the connection during handshake");
                        self.close(registry);
                        break;
                    }
                },
                ChannelState::Connected => {
                    if !self.can_read() {
                        break;
                    }
                    match self.read_state.advance(self.socket.as_mut())? {
                        ReadEvent::Packet(packet) => {
                            let packet = self.serializer.decode(packet).map_err(ChannelError::Serializer)?;
                            if self.handshaker.is_disconnect(&packet) {
                                debug!(channel = %self.name, "peer initiated disconnect");
                                self.handshake_inbox.push_back(packet);
                                self.begin_disconnect(registry)?;
                            } else {
                                self.reader.on_packet(&self.name, packet);
                            }
                        }
                        ReadEvent::Blocked => break,
                        ReadEvent::Closed => {
                            debug!(channel = %self.name, "peer closed the connection");
                            self.close(registry);
                            break;
                        }
                    }
                }
                ChannelState::Disconnecting => match self.read_state.advance(self.socket.as_mut())? {
                    ReadEvent::Packet(packet) => {
                        // a graceful disconnect drops undelivered application
                        //  reads; the disconnect hook still sees the packet in
                        //  case it is the peer's farewell
                        let packet = self.serializer.decode(packet).map_err(ChannelError::Serializer)?;
                        self.handshake_inbox.push_back(packet);
                        self.drive_disconnect(registry)?;
                    }
                    ReadEvent::Blocked => {
                        self.drive_disconnect(registry)?;
                        break;
                    }
                    ReadEvent::Closed => {
                        self.close(registry);
                        break;
                    }
                },
                ChannelState::NotConnected | ChannelState::SocketDisconnecting | ChannelState::Disconnected => break,
            }
        }

        let retain = !self.closed && self.socket.has_buffered_read_data();
        self.note_transfer();
        Ok(retain)
    }

    /// Handle write readiness.
    pub(crate) fn on_writable(&mut self, registry: &Registry) -> Result<(), ChannelError> {
        if self.state == ChannelState::SocketHandshaking {
            self.on_connectable(registry)?;
        }
        match self.state {
            ChannelState::Handshaking => {
                self.pump_writes()?;
                self.drive_handshake(registry)?;
            }
            ChannelState::Connected => {
                self.pump_writes()?;
            }
            ChannelState::Disconnecting => {
                self.drive_disconnect(registry)?;
            }
            ChannelState::SocketDisconnecting => {
                self.drive_socket_shutdown(registry)?;
            }
            _ => {}
        }
        self.note_transfer();
        Ok(())
    }

    /// Frame and send until the socket blocks or there is nothing left to
    ///  send. Handshake output takes priority over application packets.
    fn pump_writes(&mut self) -> Result<(), ChannelError> {
        loop {
            match self.write_state.advance(self.socket.as_mut())? {
                WriteEvent::Blocked => return Ok(()),
                WriteEvent::Completed => continue,
                WriteEvent::Idle => {
                    let next = if let Some(packet) = self.handshake_outbox.pop_front() {
                        Some(packet)
                    } else if self.state == ChannelState::Connected
                        && self.limiter_allows_write()
                        && self.writer.can_write()
                    {
                        self.writer.next_packet(&self.name)
                    } else {
                        None
                    };

                    match next {
                        Some(packet) => {
                            let packet = self.serializer.encode(packet).map_err(ChannelError::Serializer)?;
                            self.write_state.begin_packet(packet)?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn drive_handshake(&mut self, registry: &Registry) -> Result<(), ChannelError> {
        if self.state != ChannelState::Handshaking {
            return Ok(());
        }
        let handshaker = self.handshaker.clone();
        let mut io = HandshakeIo::new(&mut self.handshake_outbox, &mut self.handshake_inbox);
        let complete = handshaker.handshake(&mut io).map_err(ChannelError::Handshake)?;
        self.pump_writes()?;
        if complete {
            self.enter_connected(registry)?;
        }
        Ok(())
    }

    fn enter_connected(&mut self, registry: &Registry) -> Result<(), ChannelError> {
        self.set_state(ChannelState::Connected);
        let now = Instant::now();
        self.last_read = now;
        self.last_write = now;
        debug!(channel = %self.name, peer = %self.peer_addr, "connected");
        self.events.on_connected(&self.name, self.peer_addr);

        // packets that arrived piggybacked on the tail of the handshake
        while let Some(packet) = self.handshake_inbox.pop_front() {
            if self.handshaker.is_disconnect(&packet) {
                self.handshake_inbox.push_front(packet);
                return self.begin_disconnect(registry);
            }
            self.reader.on_packet(&self.name, packet);
        }

        self.pump_writes()
    }

    /// Request a graceful disconnect. On a connected channel this starts the
    ///  farewell exchange; a channel that never reached `Connected` has no peer
    ///  agreement to wind down and is closed outright.
    pub(crate) fn disconnect(&mut self, registry: &Registry) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Connected => self.begin_disconnect(registry),
            ChannelState::NotConnected | ChannelState::SocketHandshaking | ChannelState::Handshaking => {
                self.close(registry);
                Ok(())
            }
            ChannelState::Disconnecting | ChannelState::SocketDisconnecting | ChannelState::Disconnected => Ok(()),
        }
    }

    fn begin_disconnect(&mut self, registry: &Registry) -> Result<(), ChannelError> {
        self.set_state(ChannelState::Disconnecting);
        self.drive_disconnect(registry)
    }

    fn drive_disconnect(&mut self, registry: &Registry) -> Result<(), ChannelError> {
        if self.state != ChannelState::Disconnecting {
            return Ok(());
        }

        if !self.disconnect_hook_done {
            let handshaker = self.handshaker.clone();
            let mut io = HandshakeIo::new(&mut self.handshake_outbox, &mut self.handshake_inbox);
            self.disconnect_hook_done = handshaker.disconnect(&mut io).map_err(ChannelError::Handshake)?;
        }

        self.pump_writes()?;

        if self.disconnect_hook_done
            && self.handshake_outbox.is_empty()
            && self.write_state.is_idle()
            && self.socket.flush()?
        {
            self.set_state(ChannelState::SocketDisconnecting);
            self.drive_socket_shutdown(registry)?;
        }
        Ok(())
    }

    fn drive_socket_shutdown(&mut self, registry: &Registry) -> Result<(), ChannelError> {
        if self.state != ChannelState::SocketDisconnecting {
            return Ok(());
        }
        if self.socket.finish_shutdown()? {
            self.close(registry);
        }
        Ok(())
    }

    /// Unconditionally tear the channel down. Idempotent; fires
    ///  `on_disconnected` exactly once and never fails.
    pub(crate) fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.socket.deregister(registry) {
            trace!(channel = %self.name, "deregistering on close failed: {}", e);
        }
        self.registered_interest = None;
        self.set_state(ChannelState::Disconnected);
        debug!(channel = %self.name, peer = %self.peer_addr, "closed");
        self.events.on_disconnected(&self.name, self.peer_addr);
    }

    /// Recompute the interest set and apply it only if it differs from what is
    ///  currently registered, so unchanged interest never touches the poll
    ///  object.
    pub(crate) fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let desired = self.desired_interest();
        if desired == self.registered_interest {
            return Ok(());
        }
        let token = match self.token {
            Some(token) => token,
            None => return Ok(()),
        };

        match (self.registered_interest, desired) {
            (Some(_), None) => self.socket.deregister(registry)?,
            (None, Some(interest)) => self.socket.register(registry, token, interest)?,
            (Some(_), Some(interest)) => self.socket.reregister(registry, token, interest)?,
            (None, None) => {}
        }
        trace!(channel = %self.name, "interest {:?} -> {:?}", self.registered_interest, desired);
        self.registered_interest = desired;
        Ok(())
    }

    fn desired_interest(&self) -> Option<Interest> {
        match self.state {
            ChannelState::NotConnected | ChannelState::Disconnected => None,
            // the transport handshake makes progress on either readiness, and
            //  connect completion is signalled as writability
            ChannelState::SocketHandshaking => Some(Interest::READABLE | Interest::WRITABLE),
            ChannelState::Handshaking => {
                let mut interest = Interest::READABLE;
                if self.wants_write_readiness() {
                    interest = interest | Interest::WRITABLE;
                }
                Some(interest)
            }
            ChannelState::Connected => {
                let read = self.can_read();
                let write = self.wants_write_readiness()
                    || (self.limiter_allows_write() && self.writer.can_write());
                match (read, write) {
                    (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                    (true, false) => Some(Interest::READABLE),
                    (false, true) => Some(Interest::WRITABLE),
                    (false, false) => None,
                }
            }
            // both directions stay enabled so final in-flight data can drain
            ChannelState::Disconnecting | ChannelState::SocketDisconnecting => {
                Some(Interest::READABLE | Interest::WRITABLE)
            }
        }
    }

    /// write readiness needed regardless of new application packets: a framing
    ///  operation mid-flight, queued handshake output, or transport-buffered
    ///  write data
    fn wants_write_readiness(&self) -> bool {
        !self.write_state.is_idle()
            || !self.handshake_outbox.is_empty()
            || self.socket.has_pending_write_data()
    }

    fn can_read(&self) -> bool {
        self.rate_limiter.as_ref().map_or(true, |l| l.can_read()) && self.reader.can_read()
    }

    fn limiter_allows_write(&self) -> bool {
        self.rate_limiter.as_ref().map_or(true, |l| l.can_write())
    }

    /// Update idle timestamps and rate accounting from the framing layers'
    ///  transfer counters. Timestamps move only on non-zero transfers.
    fn note_transfer(&mut self) {
        let bytes_read = self.read_state.take_bytes_read();
        if bytes_read > 0 {
            self.last_read = Instant::now();
            if let Some(limiter) = &self.rate_limiter {
                limiter.record_read(bytes_read);
            }
        }
        let bytes_written = self.write_state.take_bytes_written();
        if bytes_written > 0 {
            self.last_write = Instant::now();
            if let Some(limiter) = &self.rate_limiter {
                limiter.record_write(bytes_written);
            }
        }
    }
}


#[cfg(test)]
mod test {
    use std::sync::Arc;

    use mio::{Poll, Token};

    use crate::test_util::capabilities::{
        CountingEvents, FarewellHandshake, QueueWriter, RecordingReader, StallingDisconnect, FAREWELL_MARKER,
    };
    use crate::test_util::memory_socket::{MemorySocket, MemorySocketHandle};
    use crate::transport::capabilities::ChannelParams;
    use crate::transport::error::{ChannelError, ProtocolViolation};
    use crate::transport::framing::{PacketWriteState, WriteEvent};
    use crate::transport::packet::Packet;

    use super::*;

    struct Fixture {
        poll: Poll,
        channel: Channel,
        socket: MemorySocketHandle,
        reader: Arc<RecordingReader>,
        writer: Arc<QueueWriter>,
        events: Arc<CountingEvents>,
    }

    fn fixture_with(customize: impl FnOnce(&mut ChannelParams)) -> Fixture {
        let poll = Poll::new().unwrap();
        let (socket, handle) = MemorySocket::new();
        let reader = Arc::new(RecordingReader::new());
        let writer = Arc::new(QueueWriter::new());
        let events = Arc::new(CountingEvents::new());

        let mut params = ChannelParams::new(reader.clone(), writer.clone());
        params.events = events.clone();
        customize(&mut params);

        let config = TransportConfig::new();
        let mut channel = Channel::accepted("test-channel", Box::new(socket), "127.0.0.1:7777".parse().unwrap(), params, &config);
        channel.register(poll.registry(), Token(1)).unwrap();

        Fixture {
            poll,
            channel,
            socket: handle,
            reader,
            writer,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn encode_packets(packets: Vec<Packet>) -> Vec<u8> {
        let (mut socket, handle) = MemorySocket::new();
        let mut write_state = PacketWriteState::new(0);
        for packet in packets {
            write_state.begin_packet(packet).unwrap();
            while !matches!(write_state.advance(&mut socket).unwrap(), WriteEvent::Completed) {}
        }
        handle.take_written()
    }

    #[test]
    fn test_accepted_channel_reaches_connected() {
        let mut f = fixture();
        assert_eq!(f.channel.state(), ChannelState::SocketHandshaking);

        f.channel.on_writable(f.poll.registry()).unwrap();
        assert_eq!(f.channel.state(), ChannelState::Connected);
        assert_eq!(f.events.num_connected(), 1);
    }

    #[test]
    fn test_transport_handshake_takes_multiple_rounds() {
        let mut f = fixture();
        f.socket.set_handshake_rounds(2);

        f.channel.on_writable(f.poll.registry()).unwrap();
        assert_eq!(f.channel.state(), ChannelState::SocketHandshaking);
        f.channel.on_readable(f.poll.registry()).unwrap();
        assert_eq!(f.channel.state(), ChannelState::SocketHandshaking);
        f.channel.on_writable(f.poll.registry()).unwrap();
        assert_eq!(f.channel.state(), ChannelState::Connected);
        assert_eq!(f.events.num_connected(), 1);
    }

    #[test]
    fn test_read_delivers_packets_in_order() {
        let mut f = fixture();
        f.channel.on_writable(f.poll.registry()).unwrap();

        let wire = encode_packets(vec![
            Packet::from_buffer(&b"first"[..]),
            Packet::from_buffer(&b"second"[..]),
        ]);
        f.socket.push_inbound(&wire);

        f.channel.on_readable(f.poll.registry()).unwrap();
        let packets = f.reader.take_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].buffers()[0].as_ref(), b"first");
        assert_eq!(packets[1].buffers()[0].as_ref(), b"second");
    }

    #[test]
    fn test_reader_backpressure_defers_delivery() {
        let mut f = fixture();
        f.channel.on_writable(f.poll.registry()).unwrap();
        f.reader.set_can_read(false);

        let wire = encode_packets(vec![Packet::from_buffer(&b"held back"[..])]);
        f.socket.push_inbound(&wire);

        f.channel.on_readable(f.poll.registry()).unwrap();
        assert_eq!(f.reader.num_received(), 0);

        f.reader.set_can_read(true);
        f.channel.on_readable(f.poll.registry()).unwrap();
        assert_eq!(f.reader.num_received(), 1);
    }

    #[test]
    fn test_write_drains_application_packets() {
        let mut f = fixture();
        f.channel.on_writable(f.poll.registry()).unwrap();

        f.writer.enqueue(Packet::from_buffer(&b"outbound"[..]));
        f.channel.on_writable(f.poll.registry()).unwrap();

        let expected = encode_packets(vec![Packet::from_buffer(&b"outbound"[..])]);
        assert_eq!(f.socket.take_written(), expected);
        assert_eq!(f.writer.pending(), 0);
    }

    #[test]
    fn test_graceful_disconnect_completes_immediately_with_default_handshaker() {
        let mut f = fixture();
        f.channel.on_writable(f.poll.registry()).unwrap();
        assert!(f.channel.is_connected());

        f.channel.disconnect(f.poll.registry()).unwrap();
        assert_eq!(f.channel.state(), ChannelState::Disconnected);
        assert!(f.socket.is_shut_down());
        assert_eq!(f.events.num_disconnected(), 1);
    }

    #[test]
    fn test_stalling_disconnect_hook_keeps_channel_disconnecting() {
        let mut f = fixture_with(|params| params.handshaker = Arc::new(StallingDisconnect));
        f.channel.on_writable(f.poll.registry()).unwrap();

        f.channel.disconnect(f.poll.registry()).unwrap();
        assert_eq!(f.channel.state(), ChannelState::Disconnecting);
        assert!(!f.socket.is_shut_down());
    }

    #[test]
    fn test_peer_farewell_triggers_disconnect_instead_of_delivery() {
        let mut f = fixture_with(|params| params.handshaker = Arc::new(FarewellHandshake::new()));
        f.channel.on_writable(f.poll.registry()).unwrap();

        let wire = encode_packets(vec![Packet::from_buffer(FAREWELL_MARKER)]);
        f.socket.push_inbound(&wire);
        f.channel.on_readable(f.poll.registry()).unwrap();

        // the farewell is answered in kind, never delivered to the reader
        assert_eq!(f.reader.num_received(), 0);
        assert_eq!(f.channel.state(), ChannelState::Disconnected);
        let answered = encode_packets(vec![Packet::from_buffer(FAREWELL_MARKER)]);
        assert_eq!(f.socket.take_written(), answered);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut f = fixture();
        f.channel.on_writable(f.poll.registry()).unwrap();

        f.channel.close(f.poll.registry());
        f.channel.close(f.poll.registry());
        assert_eq!(f.channel.state(), ChannelState::Disconnected);
        assert_eq!(f.events.num_disconnected(), 1);
    }

    #[test]
    fn test_protocol_violation_surfaces_as_error() {
        let mut f = fixture();
        f.channel.on_writable(f.poll.registry()).unwrap();

        f.socket.push_inbound(b"\xde\xad\xbe\xef\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0");
        match f.channel.on_readable(f.poll.registry()) {
            Err(ChannelError::Protocol(ProtocolViolation::BadMagic(0xdead))) => {}
            other => panic!("expected a bad-magic violation, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_eof_at_boundary_closes_gracefully() {
        let mut f = fixture();
        f.channel.on_writable(f.poll.registry()).unwrap();

        f.socket.set_eof();
        f.channel.on_readable(f.poll.registry()).unwrap();
        assert_eq!(f.channel.state(), ChannelState::Disconnected);
        assert_eq!(f.events.num_disconnected(), 1);
        assert!(f.events.failures().is_empty());
    }

    #[test]
    fn test_rate_limiter_gates_reading() {
        use crate::transport::capabilities::MockRateLimiter;

        let mut limiter = MockRateLimiter::new();
        limiter.expect_can_read().return_const(false);
        limiter.expect_can_write().return_const(true);
        limiter.expect_record_read().return_const(());
        limiter.expect_record_write().return_const(());

        let mut f = fixture_with(move |params| params.rate_limiter = Some(Arc::new(limiter)));
        f.channel.on_writable(f.poll.registry()).unwrap();
        assert!(f.channel.is_connected());

        let wire = encode_packets(vec![Packet::from_buffer(&b"throttled"[..])]);
        f.socket.push_inbound(&wire);
        f.channel.on_readable(f.poll.registry()).unwrap();
        assert_eq!(f.reader.num_received(), 0);
    }

    #[test]
    fn test_interest_narrows_to_read_only_when_nothing_to_write() {
        let mut f = fixture();
        f.channel.on_writable(f.poll.registry()).unwrap();

        f.channel.update_interest(f.poll.registry()).unwrap();
        assert_eq!(f.channel.registered_interest(), Some(Interest::READABLE));

        f.writer.enqueue(Packet::from_buffer(&b"pending"[..]));
        f.channel.update_interest(f.poll.registry()).unwrap();
        assert_eq!(
            f.channel.registered_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }
}
