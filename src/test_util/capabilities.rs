//! Canned capability implementations for tests: a reader that records what it
//!  receives, a writer fed from a queue, counting lifecycle listeners, and a
//!  farewell-exchanging disconnect handshaker.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::transport::capabilities::{
    Acceptor, AdmissionFilter, ChannelEvents, ChannelParams, HandshakeIo, Handshaker, PacketReader, PacketWriter,
};
use crate::transport::error::ChannelFailure;
use crate::transport::packet::Packet;

pub struct RecordingReader {
    packets: Mutex<Vec<Packet>>,
    accepting: AtomicBool,
}

impl RecordingReader {
    pub fn new() -> RecordingReader {
        RecordingReader {
            packets: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn set_can_read(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn num_received(&self) -> usize {
        self.packets.lock().expect("reader lock poisoned").len()
    }

    pub fn take_packets(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.packets.lock().expect("reader lock poisoned"))
    }
}

impl Default for RecordingReader {
    fn default() -> Self {
        RecordingReader::new()
    }
}

impl PacketReader for RecordingReader {
    fn can_read(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn on_packet(&self, _channel: &str, packet: Packet) {
        self.packets.lock().expect("reader lock poisoned").push(packet);
    }
}


pub struct QueueWriter {
    queue: Mutex<VecDeque<Packet>>,
}

impl QueueWriter {
    pub fn new() -> QueueWriter {
        QueueWriter {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, packet: Packet) {
        self.queue.lock().expect("writer lock poisoned").push_back(packet);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("writer lock poisoned").len()
    }
}

impl Default for QueueWriter {
    fn default() -> Self {
        QueueWriter::new()
    }
}

impl PacketWriter for QueueWriter {
    fn can_write(&self) -> bool {
        !self.queue.lock().expect("writer lock poisoned").is_empty()
    }

    fn next_packet(&self, _channel: &str) -> Option<Packet> {
        self.queue.lock().expect("writer lock poisoned").pop_front()
    }
}


pub struct CountingEvents {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    failures: Mutex<Vec<String>>,
}

impl CountingEvents {
    pub fn new() -> CountingEvents {
        CountingEvents {
            connected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn num_connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn num_disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().expect("events lock poisoned").clone()
    }
}

impl Default for CountingEvents {
    fn default() -> Self {
        CountingEvents::new()
    }
}

impl ChannelEvents for CountingEvents {
    fn on_connected(&self, _channel: &str, _peer: SocketAddr) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self, _channel: &str, _peer: SocketAddr) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failed(&self, _channel: &str, failure: &ChannelFailure) {
        self.failures
            .lock()
            .expect("events lock poisoned")
            .push(failure.to_string());
    }
}


pub const FAREWELL_MARKER: &[u8] = b"<<farewell>>";

/// A disconnect handshaker that announces the disconnect with a farewell
///  packet. The peer recognizes it via `is_disconnect` and responds in kind,
///  so both sides wind down gracefully.
pub struct FarewellHandshake {
    farewell_sent: AtomicBool,
}

impl FarewellHandshake {
    pub fn new() -> FarewellHandshake {
        FarewellHandshake {
            farewell_sent: AtomicBool::new(false),
        }
    }
}

impl Default for FarewellHandshake {
    fn default() -> Self {
        FarewellHandshake::new()
    }
}

impl Handshaker for FarewellHandshake {
    fn handshake(&self, _io: &mut HandshakeIo) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn disconnect(&self, io: &mut HandshakeIo) -> anyhow::Result<bool> {
        if !self.farewell_sent.swap(true, Ordering::SeqCst) {
            io.send(Packet::from_buffer(FAREWELL_MARKER));
        }
        Ok(true)
    }

    fn is_disconnect(&self, packet: &Packet) -> bool {
        packet
            .buffers()
            .first()
            .map(|buf| buf.as_ref() == FAREWELL_MARKER)
            .unwrap_or(false)
    }
}


/// A handshaker whose disconnect hook never completes - for exercising the
///  channel-timeout force-close path.
pub struct StallingDisconnect;

impl Handshaker for StallingDisconnect {
    fn handshake(&self, _io: &mut HandshakeIo) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn disconnect(&self, _io: &mut HandshakeIo) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn is_disconnect(&self, _packet: &Packet) -> bool {
        false
    }
}


/// Hands every accepted connection the same (cloned) capability bundle.
pub struct StaticAcceptor {
    params: ChannelParams,
}

impl StaticAcceptor {
    pub fn new(params: ChannelParams) -> StaticAcceptor {
        StaticAcceptor { params }
    }
}

impl Acceptor for StaticAcceptor {
    fn channel_params(&self, _peer: SocketAddr) -> Option<ChannelParams> {
        Some(self.params.clone())
    }
}

/// Rejects every connection once `limit` peers are registered.
pub struct MaxConnectionsFilter {
    pub limit: usize,
}

impl AdmissionFilter for MaxConnectionsFilter {
    fn admit(&self, _peer: SocketAddr, connected_peers: &mut dyn Iterator<Item = SocketAddr>) -> bool {
        connected_peers.count() < self.limit
    }
}
