//! The seams between the transport core and its collaborators. Everything the
//!  core does not decide itself - what to send, whether to accept a peer, how
//!  to throttle, what a handshake looks like - enters through one of these
//!  traits.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

#[cfg(test)] use mockall::automock;

use crate::transport::error::ChannelFailure;
use crate::transport::packet::Packet;

/// The application's inbound side of a channel. Consulted only while the
///  channel is `Connected`.
pub trait PacketReader: Send + Sync {
    /// whether the application is currently willing to accept another packet.
    ///  Returning false exerts back-pressure: the channel stops reading from
    ///  the socket until the dispatcher re-consults this predicate
    fn can_read(&self) -> bool {
        true
    }

    fn on_packet(&self, channel: &str, packet: Packet);
}

/// The application's outbound side of a channel. Consulted only while the
///  channel is `Connected`.
pub trait PacketWriter: Send + Sync {
    /// whether the application currently has outbound packets pending
    fn can_write(&self) -> bool;

    /// the next packet to frame, or None if `can_write` raced with a consumer
    fn next_packet(&self, channel: &str) -> Option<Packet>;
}

/// Rate limiting policy, consulted before every read/write admission decision
///  and informed of every transferred byte. The policy itself (token bucket,
///  windowed, ...) lives with the application.
#[cfg_attr(test, automock)]
pub trait RateLimiter: Send + Sync {
    fn can_read(&self) -> bool;
    fn can_write(&self) -> bool;
    fn record_read(&self, num_bytes: u64);
    fn record_write(&self, num_bytes: u64);
    /// invoked by the dispatcher's periodic cleanup sweep, e.g. to refresh
    ///  token buckets
    fn on_timer(&self, now: Instant);
}

/// Bidirectional packet conversion applied between the application and the
///  wire - the hook for packet-level compression or similar transformations.
pub trait PacketSerializer: Send + Sync {
    fn encode(&self, packet: Packet) -> anyhow::Result<Packet>;
    fn decode(&self, packet: Packet) -> anyhow::Result<Packet>;
}

/// The default serializer: packets go to the wire as they are.
pub struct IdentitySerializer;

impl PacketSerializer for IdentitySerializer {
    fn encode(&self, packet: Packet) -> anyhow::Result<Packet> {
        Ok(packet)
    }

    fn decode(&self, packet: Packet) -> anyhow::Result<Packet> {
        Ok(packet)
    }
}


/// Packet access for [Handshaker] implementations: an outbox whose packets are
///  framed before any application write, and an inbox of packets received
///  while the channel was not `Connected`.
pub struct HandshakeIo<'a> {
    outbox: &'a mut VecDeque<Packet>,
    inbox: &'a mut VecDeque<Packet>,
}

impl<'a> HandshakeIo<'a> {
    pub(crate) fn new(outbox: &'a mut VecDeque<Packet>, inbox: &'a mut VecDeque<Packet>) -> HandshakeIo<'a> {
        HandshakeIo { outbox, inbox }
    }

    pub fn send(&mut self, packet: Packet) {
        self.outbox.push_back(packet);
    }

    pub fn receive(&mut self) -> Option<Packet> {
        self.inbox.pop_front()
    }
}

/// Protocol-level handshake and disconnect hooks. Both driving functions are
///  called repeatedly (once per readiness event and received packet) until
///  they report completion; they must be prepared for that.
pub trait Handshaker: Send + Sync {
    /// drive the connect handshake; Ok(true) once it is complete
    fn handshake(&self, io: &mut HandshakeIo) -> anyhow::Result<bool>;

    /// drive the disconnect handshake; Ok(true) once the farewell exchange is
    ///  complete and the transport may shut down
    fn disconnect(&self, io: &mut HandshakeIo) -> anyhow::Result<bool>;

    /// whether a packet received on a connected channel is the peer's
    ///  disconnect signal
    fn is_disconnect(&self, packet: &Packet) -> bool;
}

/// The default handshaker: no protocol handshake, no farewell exchange.
pub struct ImmediateHandshake;

impl Handshaker for ImmediateHandshake {
    fn handshake(&self, _io: &mut HandshakeIo) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn disconnect(&self, _io: &mut HandshakeIo) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn is_disconnect(&self, _packet: &Packet) -> bool {
        false
    }
}


/// Lifecycle notifications for a channel. Channel failures reach the
///  application through these callbacks rather than as propagated errors -
///  only the synchronous construction APIs return errors directly.
pub trait ChannelEvents: Send + Sync {
    fn on_connected(&self, _channel: &str, _peer: SocketAddr) {}
    fn on_disconnected(&self, _channel: &str, _peer: SocketAddr) {}
    fn on_failed(&self, _channel: &str, _failure: &ChannelFailure) {}
}

pub struct NoChannelEvents;

impl ChannelEvents for NoChannelEvents {}


/// Decides whether an inbound connection is accepted, given the peer address
///  and the addresses of all currently registered connections.
pub trait AdmissionFilter: Send + Sync {
    fn admit(&self, peer: SocketAddr, connected_peers: &mut dyn Iterator<Item = SocketAddr>) -> bool;
}

pub struct AdmitAll;

impl AdmissionFilter for AdmitAll {
    fn admit(&self, _peer: SocketAddr, _connected_peers: &mut dyn Iterator<Item = SocketAddr>) -> bool {
        true
    }
}

/// Classifies peers that bypass the ordinary admission filter.
pub trait AdminMatcher: Send + Sync {
    fn is_admin(&self, peer: SocketAddr) -> bool;
}

/// Supplies the capability bundle for a newly accepted connection, or None to
///  turn the peer away after admission.
pub trait Acceptor: Send + Sync {
    fn channel_params(&self, peer: SocketAddr) -> Option<ChannelParams>;
}


/// The full set of collaborator capabilities a channel is constructed with.
#[derive(Clone)]
pub struct ChannelParams {
    pub reader: Arc<dyn PacketReader>,
    pub writer: Arc<dyn PacketWriter>,
    pub events: Arc<dyn ChannelEvents>,
    pub handshaker: Arc<dyn Handshaker>,
    pub serializer: Arc<dyn PacketSerializer>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl ChannelParams {
    pub fn new(reader: Arc<dyn PacketReader>, writer: Arc<dyn PacketWriter>) -> ChannelParams {
        ChannelParams {
            reader,
            writer,
            events: Arc::new(NoChannelEvents),
            handshaker: Arc::new(ImmediateHandshake),
            serializer: Arc::new(IdentitySerializer),
            rate_limiter: None,
        }
    }
}
