use std::net::SocketAddr;

use thiserror::Error;

/// A peer that violates the framing protocol is considered compromised: these
///  errors always close the channel and are never retried.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolViolation {
    #[error("bad magic number 0x{0:04x}")]
    BadMagic(u16),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("out-of-sequence packet: expected #{expected}, received #{received}")]
    SequenceMismatch { expected: u64, received: u64 },
    #[error("packet buffer of {size} bytes exceeds the configured maximum of {max}")]
    OversizedPacket { size: u64, max: u32 },
}

/// Everything that can kill a single channel. All variants are fatal to the
///  channel they occur on; none of them affects the rest of the reactor.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    /// the peer closed the stream while a packet was partially transferred
    #[error("connection broke mid-packet")]
    TruncatedStream,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol handshake failed: {0}")]
    Handshake(anyhow::Error),
    #[error("packet serializer failed: {0}")]
    Serializer(anyhow::Error),
}

/// A [ChannelError] annotated with the channel it occurred on. This is what
///  reaches application listeners through `ChannelEvents::on_failed`.
#[derive(Debug, Error)]
#[error("channel {channel} ({peer}): {cause}")]
pub struct ChannelFailure {
    pub channel: String,
    pub peer: SocketAddr,
    #[source]
    pub cause: ChannelError,
}

#[derive(Debug, Error)]
#[error("no bindable port in range {start}..={end}")]
pub struct PortRangeExhausted {
    pub start: u16,
    pub end: u16,
}
