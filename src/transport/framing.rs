//! The per-direction framing state machines. Each direction of a channel owns
//!  exactly one of these; they are resumable after *any* byte boundary, so a
//!  packet can trickle through arbitrarily many readiness events.
//!
//! Exactly one packet is in flight per direction. The read side will not parse
//!  ahead into the next packet before the current one is delivered, and the
//!  write side will not accept the next packet before the transport confirms a
//!  full flush of the current one.

use std::cmp::min;
use std::fs::File;
use std::io::{self, ErrorKind, IoSlice, Read};

use bytes::{Buf, Bytes, BytesMut};
use tempfile::NamedTempFile;
use tracing::{trace, warn};

use crate::transport::error::{ChannelError, ProtocolViolation};
use crate::transport::packet::{Packet, PacketFile, PacketHeader};
use crate::transport::socket::StreamSocket;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// fixed-size copy buffer for file bodies on transports without a file fast path
const SPILL_BUFFER_LEN: usize = 64 * 1024;

fn awaiting_header() -> ReadFraming {
    ReadFraming::Header {
        scratch: [0u8; PacketHeader::SERIALIZED_LEN],
        filled: 0,
    }
}


/// Outcome of driving the read side.
#[derive(Debug)]
pub enum ReadEvent {
    /// no further progress without a new readiness notification
    Blocked,
    /// one packet completed; the socket may hold more
    Packet(Packet),
    /// the peer closed the stream cleanly at a packet boundary
    Closed,
}

enum ReadFraming {
    Header { scratch: [u8; PacketHeader::SERIALIZED_LEN], filled: usize },
    Body(InboundBody),
    Files(InboundFiles),
}

struct InboundBody {
    header: PacketHeader,
    /// file length table followed by the buffer payload
    buf: BytesMut,
    filled: usize,
}

struct InboundFiles {
    sequence: u64,
    payload: Bytes,
    file_lens: Vec<u64>,
    finished: Vec<PacketFile>,
    current: Option<NamedTempFile>,
    current_written: u64,
    spill: Box<[u8]>,
}

pub struct PacketReadState {
    framing: ReadFraming,
    next_sequence: u64,
    max_packet_size: u32,
    keep_received_files: bool,
    bytes_read: u64,
}

impl PacketReadState {
    pub fn new(max_packet_size: u32, keep_received_files: bool) -> PacketReadState {
        PacketReadState {
            framing: awaiting_header(),
            next_sequence: 0,
            max_packet_size,
            keep_received_files,
            bytes_read: 0,
        }
    }

    /// whether any bytes of the current packet have been committed - EOF is
    ///  only graceful when this is false
    pub fn mid_packet(&self) -> bool {
        !matches!(self.framing, ReadFraming::Header { filled: 0, .. })
    }

    /// bytes transferred since the last call, for idle and rate bookkeeping
    pub fn take_bytes_read(&mut self) -> u64 {
        std::mem::take(&mut self.bytes_read)
    }

    pub fn advance(&mut self, socket: &mut dyn StreamSocket) -> Result<ReadEvent, ChannelError> {
        loop {
            match &mut self.framing {
                ReadFraming::Header { scratch, filled } => {
                    while *filled < PacketHeader::SERIALIZED_LEN {
                        match socket.read(&mut scratch[*filled..]) {
                            Ok(0) => {
                                return if *filled == 0 {
                                    Ok(ReadEvent::Closed)
                                } else {
                                    Err(ChannelError::TruncatedStream)
                                };
                            }
                            Ok(n) => {
                                *filled += n;
                                self.bytes_read += n.safe_cast();
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadEvent::Blocked),
                            Err(e) => return Err(e.into()),
                        }
                    }

                    let header = PacketHeader::deser(&mut &scratch[..])?;
                    if header.sequence != self.next_sequence {
                        return Err(ProtocolViolation::SequenceMismatch {
                            expected: self.next_sequence,
                            received: header.sequence,
                        }
                        .into());
                    }
                    if self.max_packet_size != 0 && header.buffer_size > self.max_packet_size {
                        return Err(ProtocolViolation::OversizedPacket {
                            size: header.buffer_size.safe_cast(),
                            max: self.max_packet_size,
                        }
                        .into());
                    }
                    self.next_sequence += 1;
                    trace!("receiving packet #{}: {} buffer bytes, {} files", header.sequence, header.buffer_size, header.file_count);

                    let table_len: usize = SafeCast::<usize>::safe_cast(header.file_count) * 8;
                    let target = table_len + SafeCast::<usize>::safe_cast(header.buffer_size);
                    self.framing = ReadFraming::Body(InboundBody {
                        header,
                        buf: BytesMut::zeroed(target),
                        filled: 0,
                    });
                }

                ReadFraming::Body(body) => {
                    while body.filled < body.buf.len() {
                        match socket.read(&mut body.buf[body.filled..]) {
                            Ok(0) => return Err(ChannelError::TruncatedStream),
                            Ok(n) => {
                                body.filled += n;
                                self.bytes_read += n.safe_cast();
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadEvent::Blocked),
                            Err(e) => return Err(e.into()),
                        }
                    }

                    let header = body.header;
                    let mut whole = std::mem::take(&mut body.buf).freeze();

                    if header.file_count == 0 {
                        let mut packet = Packet::new();
                        if !whole.is_empty() {
                            packet.add_buffer(whole);
                        }
                        trace!("completed packet #{}", header.sequence);
                        self.framing = awaiting_header();
                        return Ok(ReadEvent::Packet(packet));
                    }

                    let file_lens: Vec<u64> = (0..header.file_count).map(|_| whole.get_u64()).collect();
                    self.framing = ReadFraming::Files(InboundFiles {
                        sequence: header.sequence,
                        payload: whole,
                        file_lens,
                        finished: Vec::new(),
                        current: None,
                        current_written: 0,
                        spill: vec![0u8; SPILL_BUFFER_LEN].into_boxed_slice(),
                    });
                }

                ReadFraming::Files(files) => {
                    while files.finished.len() < files.file_lens.len() {
                        let expected = files.file_lens[files.finished.len()];
                        if files.current.is_none() {
                            files.current = Some(NamedTempFile::new().map_err(ChannelError::Io)?);
                            files.current_written = 0;
                        }
                        let temp = files.current.as_mut().expect("just ensured a current temp file");

                        while files.current_written < expected {
                            let remaining = expected - files.current_written;

                            if let Some(result) = socket.read_into_file(temp.as_file_mut(), remaining) {
                                match result {
                                    Ok(0) => return Err(ChannelError::TruncatedStream),
                                    Ok(n) => {
                                        files.current_written += n;
                                        self.bytes_read += n;
                                    }
                                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadEvent::Blocked),
                                    Err(e) => return Err(e.into()),
                                }
                                continue;
                            }

                            let chunk: usize = min(remaining, files.spill.len().safe_cast()).prechecked_cast();
                            match socket.read(&mut files.spill[..chunk]) {
                                Ok(0) => return Err(ChannelError::TruncatedStream),
                                Ok(n) => {
                                    use std::io::Write;
                                    temp.as_file_mut().write_all(&files.spill[..n]).map_err(ChannelError::Io)?;
                                    files.current_written += n.safe_cast();
                                    self.bytes_read += n.safe_cast();
                                }
                                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadEvent::Blocked),
                                Err(e) => return Err(e.into()),
                            }
                        }

                        let temp = files.current.take().expect("current temp file vanished");
                        let (_, temp_path) = temp.into_parts();
                        let packet_file = if self.keep_received_files {
                            let path = temp_path.keep().map_err(|e| ChannelError::Io(e.error))?;
                            PacketFile::received_kept(path, expected)
                        } else {
                            PacketFile::received(temp_path, expected)
                        };
                        files.finished.push(packet_file);
                    }

                    let mut packet = Packet::new();
                    if !files.payload.is_empty() {
                        packet.add_buffer(files.payload.clone());
                    }
                    for file in files.finished.drain(..) {
                        packet.add_received_file(file);
                    }
                    trace!("completed packet #{} with {} files", files.sequence, packet.file_count());
                    self.framing = awaiting_header();
                    return Ok(ReadEvent::Packet(packet));
                }
            }
        }
    }
}


/// Outcome of driving the write side.
#[derive(Debug)]
pub enum WriteEvent {
    /// no further progress without a new readiness notification
    Blocked,
    /// the current packet is fully framed and flushed; the next one may begin
    Completed,
    /// nothing is in flight
    Idle,
}

enum WriteFraming {
    Idle,
    Frame(OutboundPacket),
    Flush { sequence: u64 },
}

struct OutboundPacket {
    sequence: u64,
    /// header plus file length table, drained front to back
    prefix: BytesMut,
    /// buffer payload cursor: fully written buffers are popped, the front one
    ///  is advanced on partial writes
    buffers: Vec<Bytes>,
    files: Vec<OutboundFile>,
    current_file: usize,
    spill: Box<[u8]>,
    spill_filled: usize,
    spill_sent: usize,
}

struct OutboundFile {
    file: File,
    len: u64,
    sent: u64,
}

pub struct PacketWriteState {
    framing: WriteFraming,
    next_sequence: u64,
    max_packet_size: u32,
    bytes_written: u64,
}

impl PacketWriteState {
    pub fn new(max_packet_size: u32) -> PacketWriteState {
        PacketWriteState {
            framing: WriteFraming::Idle,
            next_sequence: 0,
            max_packet_size,
            bytes_written: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.framing, WriteFraming::Idle)
    }

    /// bytes transferred since the last call, for idle and rate bookkeeping
    pub fn take_bytes_written(&mut self) -> u64 {
        std::mem::take(&mut self.bytes_written)
    }

    /// Make `packet` the in-flight outbound packet. Must only be called while
    ///  idle - single-packet pipelining is the framing invariant.
    pub fn begin_packet(&mut self, mut packet: Packet) -> Result<(), ChannelError> {
        assert!(self.is_idle(), "began framing a packet while another was in flight");

        let buffer_size = packet.buffer_size();
        if self.max_packet_size != 0 && buffer_size > self.max_packet_size.safe_cast() {
            // refusing locally keeps an oversized application packet from
            //  poisoning the peer's side of the connection
            return Err(ProtocolViolation::OversizedPacket {
                size: buffer_size,
                max: self.max_packet_size,
            }
            .into());
        }

        let files: Vec<OutboundFile> = packet
            .take_files()
            .into_iter()
            .map(|packet_file| {
                Ok(OutboundFile {
                    file: File::open(packet_file.path())?,
                    len: packet_file.len(),
                    sent: 0,
                })
            })
            .collect::<io::Result<_>>()
            .map_err(ChannelError::Io)?;

        let header = PacketHeader {
            sequence: self.next_sequence,
            buffer_size: buffer_size.prechecked_cast(),
            file_count: files.len().prechecked_cast(),
        };
        let mut prefix = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + files.len() * 8);
        header.ser(&mut prefix);
        for file in &files {
            use bytes::BufMut;
            prefix.put_u64(file.len);
        }

        trace!("framing packet #{}: {} buffer bytes, {} files", header.sequence, header.buffer_size, header.file_count);
        self.next_sequence += 1;
        self.framing = WriteFraming::Frame(OutboundPacket {
            sequence: header.sequence,
            prefix,
            buffers: packet.take_buffers().into_iter().filter(|b| !b.is_empty()).collect(),
            files,
            current_file: 0,
            spill: vec![0u8; SPILL_BUFFER_LEN].into_boxed_slice(),
            spill_filled: 0,
            spill_sent: 0,
        });
        Ok(())
    }

    pub fn advance(&mut self, socket: &mut dyn StreamSocket) -> Result<WriteEvent, ChannelError> {
        loop {
            match &mut self.framing {
                WriteFraming::Idle => return Ok(WriteEvent::Idle),

                WriteFraming::Frame(out) => {
                    // 1: header and file length table
                    while out.prefix.has_remaining() {
                        match socket.write(out.prefix.chunk()) {
                            Ok(0) => {
                                warn!("write to socket returned 0 - treating as blocked");
                                return Ok(WriteEvent::Blocked);
                            }
                            Ok(n) => {
                                out.prefix.advance(n);
                                self.bytes_written += n.safe_cast();
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(WriteEvent::Blocked),
                            Err(e) => return Err(e.into()),
                        }
                    }

                    // 2: buffer payload, scatter/gather
                    while !out.buffers.is_empty() {
                        let slices: Vec<IoSlice<'_>> = out.buffers.iter().map(|b| IoSlice::new(b)).collect();
                        match socket.write_vectored(&slices) {
                            Ok(0) => {
                                warn!("vectored write to socket returned 0 - treating as blocked");
                                return Ok(WriteEvent::Blocked);
                            }
                            Ok(mut n) => {
                                self.bytes_written += n.safe_cast();
                                while n > 0 {
                                    if n >= out.buffers[0].len() {
                                        n -= out.buffers[0].len();
                                        out.buffers.remove(0);
                                    } else {
                                        out.buffers[0].advance(n);
                                        n = 0;
                                    }
                                }
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(WriteEvent::Blocked),
                            Err(e) => return Err(e.into()),
                        }
                    }

                    // 3: file bodies
                    while out.current_file < out.files.len() {
                        // drain spilled bytes before touching the file again
                        while out.spill_sent < out.spill_filled {
                            match socket.write(&out.spill[out.spill_sent..out.spill_filled]) {
                                Ok(0) => {
                                    warn!("write to socket returned 0 - treating as blocked");
                                    return Ok(WriteEvent::Blocked);
                                }
                                Ok(n) => {
                                    out.spill_sent += n;
                                    self.bytes_written += n.safe_cast();
                                }
                                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(WriteEvent::Blocked),
                                Err(e) => return Err(e.into()),
                            }
                        }

                        let file = &mut out.files[out.current_file];
                        if file.sent < file.len {
                            let remaining = file.len - file.sent;

                            if let Some(result) = socket.write_from_file(&mut file.file, file.sent, remaining) {
                                match result {
                                    Ok(0) => return Ok(WriteEvent::Blocked),
                                    Ok(n) => {
                                        file.sent += n;
                                        self.bytes_written += n;
                                    }
                                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(WriteEvent::Blocked),
                                    Err(e) => return Err(e.into()),
                                }
                                continue;
                            }

                            let chunk: usize = min(remaining, out.spill.len().safe_cast()).prechecked_cast();
                            let n = file.file.read(&mut out.spill[..chunk]).map_err(ChannelError::Io)?;
                            if n == 0 {
                                return Err(ChannelError::Io(io::Error::new(
                                    ErrorKind::UnexpectedEof,
                                    "file shrank while being sent",
                                )));
                            }
                            out.spill_filled = n;
                            out.spill_sent = 0;
                            file.sent += n.safe_cast();
                            continue;
                        }

                        out.current_file += 1;
                        out.spill_filled = 0;
                        out.spill_sent = 0;
                    }

                    let sequence = out.sequence;
                    self.framing = WriteFraming::Flush { sequence };
                }

                WriteFraming::Flush { sequence } => {
                    if socket.flush()? {
                        trace!("packet #{} fully framed and flushed", sequence);
                        self.framing = WriteFraming::Idle;
                        return Ok(WriteEvent::Completed);
                    }
                    return Ok(WriteEvent::Blocked);
                }
            }
        }
    }
}


#[cfg(test)]
mod test {
    use std::io::Write;

    use rstest::rstest;

    use crate::test_util::memory_socket::MemorySocket;
    use crate::transport::error::ChannelError;
    use crate::transport::error::ProtocolViolation;

    use super::*;

    fn drive_write_to_completion(write_state: &mut PacketWriteState, socket: &mut MemorySocket) {
        loop {
            match write_state.advance(socket).unwrap() {
                WriteEvent::Completed => return,
                WriteEvent::Blocked => panic!("memory socket should never block writes here"),
                WriteEvent::Idle => panic!("nothing in flight"),
            }
        }
    }

    fn encode_packets(packets: Vec<Packet>) -> Vec<u8> {
        let (mut socket, handle) = MemorySocket::new();
        let mut write_state = PacketWriteState::new(0);
        for packet in packets {
            write_state.begin_packet(packet).unwrap();
            drive_write_to_completion(&mut write_state, &mut socket);
        }
        handle.take_written()
    }

    fn temp_file_with_content(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_write_single_buffer_wire_layout() {
        let wire = encode_packets(vec![Packet::from_buffer(&b"hello"[..])]);

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0x17, 0x17, 0x00, 0x01]); // magic, version
        expected.extend_from_slice(&0u64.to_be_bytes()); // sequence
        expected.extend_from_slice(&5u32.to_be_bytes()); // buffer size
        expected.extend_from_slice(&0u32.to_be_bytes()); // file count
        expected.extend_from_slice(b"hello");
        assert_eq!(wire, expected);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::five(5)]
    fn test_round_trip_buffers(#[case] num_buffers: usize) {
        let mut packet = Packet::new();
        let mut expected_content = Vec::new();
        for i in 0..num_buffers {
            let buf = patterned(100 + i * 37);
            expected_content.extend_from_slice(&buf);
            packet.add_buffer(buf);
        }

        let wire = encode_packets(vec![packet]);

        let (mut socket, handle) = MemorySocket::new();
        handle.push_inbound(&wire);
        let mut read_state = PacketReadState::new(0, false);
        let received = match read_state.advance(&mut socket).unwrap() {
            ReadEvent::Packet(p) => p,
            other => panic!("expected a packet, got {:?}", other),
        };

        let received_content: Vec<u8> = received.buffers().iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(received_content, expected_content);
        assert_eq!(received.file_count(), 0);
    }

    #[rstest]
    #[case::no_files(0)]
    #[case::one_file(1)]
    #[case::five_files(5)]
    fn test_round_trip_files(#[case] num_files: usize) {
        let contents: Vec<Vec<u8>> = (0..num_files).map(|i| patterned(1000 + i * 333)).collect();
        let temp_files: Vec<_> = contents.iter().map(|c| temp_file_with_content(c)).collect();

        let mut packet = Packet::from_buffer(&b"accompanying buffer"[..]);
        for file in &temp_files {
            packet.add_file(file.path()).unwrap();
        }

        let wire = encode_packets(vec![packet]);

        let (mut socket, handle) = MemorySocket::new();
        handle.push_inbound(&wire);
        let mut read_state = PacketReadState::new(0, false);
        let received = match read_state.advance(&mut socket).unwrap() {
            ReadEvent::Packet(p) => p,
            other => panic!("expected a packet, got {:?}", other),
        };

        assert_eq!(received.file_count(), num_files);
        for (packet_file, content) in received.files().iter().zip(&contents) {
            assert_eq!(packet_file.len(), content.len() as u64);
            let actual = std::fs::read(packet_file.path()).unwrap();
            assert_eq!(&actual, content);
        }
        assert_eq!(received.buffers()[0].as_ref(), b"accompanying buffer");
    }

    #[test]
    fn test_received_files_deleted_with_packet() {
        let temp = temp_file_with_content(&patterned(5000));
        let mut packet = Packet::new();
        packet.add_file(temp.path()).unwrap();

        let wire = encode_packets(vec![packet]);
        let (mut socket, handle) = MemorySocket::new();
        handle.push_inbound(&wire);

        let mut read_state = PacketReadState::new(0, false);
        let received = match read_state.advance(&mut socket).unwrap() {
            ReadEvent::Packet(p) => p,
            other => panic!("expected a packet, got {:?}", other),
        };
        let received_path = received.files()[0].path().to_path_buf();
        assert!(received_path.exists());
        drop(received);
        assert!(!received_path.exists());
    }

    #[test]
    fn test_zero_length_packet_is_valid() {
        let wire = encode_packets(vec![Packet::new()]);
        assert_eq!(wire.len(), PacketHeader::SERIALIZED_LEN);

        let (mut socket, handle) = MemorySocket::new();
        handle.push_inbound(&wire);
        let mut read_state = PacketReadState::new(0, false);
        match read_state.advance(&mut socket).unwrap() {
            ReadEvent::Packet(p) => {
                assert!(p.buffers().is_empty());
                assert_eq!(p.file_count(), 0);
            }
            other => panic!("expected a packet, got {:?}", other),
        }
    }

    #[test]
    fn test_read_resumes_across_single_byte_reads() {
        let temp = temp_file_with_content(&patterned(300));
        let mut packet = Packet::from_buffer(patterned(64));
        packet.add_file(temp.path()).unwrap();
        let wire = encode_packets(vec![packet]);

        let (mut socket, handle) = MemorySocket::new();
        handle.set_max_chunk(1);
        let mut read_state = PacketReadState::new(0, false);

        // feed the wire one byte at a time, driving the state machine after each
        let mut received = None;
        for byte in &wire {
            handle.push_inbound(std::slice::from_ref(byte));
            match read_state.advance(&mut socket).unwrap() {
                ReadEvent::Packet(p) => {
                    received = Some(p);
                }
                ReadEvent::Blocked => {}
                ReadEvent::Closed => panic!("unexpected close"),
            }
        }

        let received = received.expect("packet never completed");
        assert_eq!(received.buffers()[0].as_ref(), &patterned(64)[..]);
        assert_eq!(std::fs::read(received.files()[0].path()).unwrap(), patterned(300));
    }

    #[test]
    fn test_write_resumes_across_tiny_write_capacity() {
        let temp = temp_file_with_content(&patterned(300));
        let mut packet = Packet::from_buffer(patterned(64));
        packet.add_file(temp.path()).unwrap();
        let expected = encode_packets(vec![{
            let mut p = Packet::from_buffer(patterned(64));
            p.add_file(temp.path()).unwrap();
            p
        }]);

        let (mut socket, handle) = MemorySocket::new();
        let mut write_state = PacketWriteState::new(0);
        write_state.begin_packet(packet).unwrap();

        loop {
            handle.add_write_capacity(3);
            match write_state.advance(&mut socket).unwrap() {
                WriteEvent::Completed => break,
                WriteEvent::Blocked => {}
                WriteEvent::Idle => panic!("nothing in flight"),
            }
        }

        assert_eq!(handle.take_written(), expected);
    }

    #[test]
    fn test_sequence_mismatch_is_fatal() {
        // two packets framed in order, but the reader only sees the second one
        let first = encode_packets(vec![Packet::from_buffer(&b"a"[..])]);
        let both = encode_packets(vec![Packet::from_buffer(&b"a"[..]), Packet::from_buffer(&b"b"[..])]);
        let second = &both[first.len()..];

        let (mut socket, handle) = MemorySocket::new();
        handle.push_inbound(second);
        let mut read_state = PacketReadState::new(0, false);
        match read_state.advance(&mut socket) {
            Err(ChannelError::Protocol(ProtocolViolation::SequenceMismatch { expected: 0, received: 1 })) => {}
            other => panic!("expected a sequence violation, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_oversized_packet_is_fatal_on_read() {
        let wire = encode_packets(vec![Packet::from_buffer(patterned(100))]);

        let (mut socket, handle) = MemorySocket::new();
        handle.push_inbound(&wire);
        let mut read_state = PacketReadState::new(50, false);
        match read_state.advance(&mut socket) {
            Err(ChannelError::Protocol(ProtocolViolation::OversizedPacket { size: 100, max: 50 })) => {}
            other => panic!("expected an oversize violation, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_oversized_packet_is_refused_on_write() {
        let mut write_state = PacketWriteState::new(10);
        match write_state.begin_packet(Packet::from_buffer(patterned(11))) {
            Err(ChannelError::Protocol(ProtocolViolation::OversizedPacket { size: 11, max: 10 })) => {}
            other => panic!("expected an oversize violation, got {:?}", other.map(|_| ())),
        }
        assert!(write_state.is_idle());
    }

    #[test]
    fn test_eof_at_packet_boundary_is_graceful() {
        let (mut socket, handle) = MemorySocket::new();
        handle.set_eof();
        let mut read_state = PacketReadState::new(0, false);
        assert!(matches!(read_state.advance(&mut socket).unwrap(), ReadEvent::Closed));
        assert!(!read_state.mid_packet());
    }

    #[test]
    fn test_eof_mid_header_is_abrupt() {
        let wire = encode_packets(vec![Packet::from_buffer(&b"payload"[..])]);

        let (mut socket, handle) = MemorySocket::new();
        handle.push_inbound(&wire[..7]);
        handle.set_eof();
        let mut read_state = PacketReadState::new(0, false);
        match read_state.advance(&mut socket) {
            Err(ChannelError::TruncatedStream) => {}
            other => panic!("expected a truncated stream, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_eof_mid_body_is_abrupt() {
        let wire = encode_packets(vec![Packet::from_buffer(&b"payload"[..])]);

        let (mut socket, handle) = MemorySocket::new();
        handle.push_inbound(&wire[..wire.len() - 2]);
        handle.set_eof();
        let mut read_state = PacketReadState::new(0, false);
        match read_state.advance(&mut socket) {
            Err(ChannelError::TruncatedStream) => {}
            other => panic!("expected a truncated stream, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_flush_gates_packet_completion() {
        let (mut socket, handle) = MemorySocket::new();
        handle.set_flush_pending(2);

        let mut write_state = PacketWriteState::new(0);
        write_state.begin_packet(Packet::from_buffer(&b"x"[..])).unwrap();

        // all bytes are written, but the transport has not confirmed the flush
        assert!(matches!(write_state.advance(&mut socket).unwrap(), WriteEvent::Blocked));
        assert!(!write_state.is_idle());
        assert!(matches!(write_state.advance(&mut socket).unwrap(), WriteEvent::Blocked));
        assert!(matches!(write_state.advance(&mut socket).unwrap(), WriteEvent::Completed));
        assert!(write_state.is_idle());
    }
}
