use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, ErrorKind, IoSlice};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use mio::{Interest, Registry, Token};

use crate::transport::socket::StreamSocket;

struct MemoryState {
    inbound: VecDeque<u8>,
    eof: bool,
    written: Vec<u8>,
    /// per-call transfer cap, to exercise partial-I/O resumption
    max_chunk: usize,
    /// None = unlimited; Some(n) = writes block once n bytes are consumed
    write_capacity: Option<usize>,
    handshake_rounds: u32,
    flush_pending: u32,
    buffered_read_data: bool,
    shut_down: bool,
}

/// A scripted in-memory [StreamSocket]: tests feed inbound bytes and inspect
///  written bytes through the cloneable handle, while the socket itself is
///  owned by the code under test. Registration calls are no-ops - this socket
///  is never actually polled.
pub struct MemorySocket {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Clone)]
pub struct MemorySocketHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySocket {
    pub fn new() -> (MemorySocket, MemorySocketHandle) {
        let state = Arc::new(Mutex::new(MemoryState {
            inbound: VecDeque::new(),
            eof: false,
            written: Vec::new(),
            max_chunk: usize::MAX,
            write_capacity: None,
            handshake_rounds: 0,
            flush_pending: 0,
            buffered_read_data: false,
            shut_down: false,
        }));
        (
            MemorySocket { state: state.clone() },
            MemorySocketHandle { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory socket lock poisoned")
    }
}

impl MemorySocketHandle {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory socket lock poisoned")
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.state().inbound.extend(bytes.iter().copied());
    }

    /// after the scripted inbound bytes are drained, reads return EOF instead
    ///  of would-block
    pub fn set_eof(&self) {
        self.state().eof = true;
    }

    pub fn set_max_chunk(&self, max_chunk: usize) {
        self.state().max_chunk = max_chunk;
    }

    /// switch writes to limited mode and grant `n` more writable bytes
    pub fn add_write_capacity(&self, n: usize) {
        let mut state = self.state();
        state.write_capacity = Some(state.write_capacity.unwrap_or(0) + n);
    }

    /// make `finish_handshake` report "still pending" this many times
    pub fn set_handshake_rounds(&self, rounds: u32) {
        self.state().handshake_rounds = rounds;
    }

    /// make `flush` report "still pending" this many times
    pub fn set_flush_pending(&self, rounds: u32) {
        self.state().flush_pending = rounds;
    }

    pub fn set_buffered_read_data(&self, buffered: bool) {
        self.state().buffered_read_data = buffered;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().written)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }
}

fn test_addr() -> SocketAddr {
    "127.0.0.1:7777".parse().expect("hardcoded address is valid")
}

impl StreamSocket for MemorySocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(test_addr())
    }

    fn peer_addr(&self) -> SocketAddr {
        test_addr()
    }

    fn finish_handshake(&mut self) -> io::Result<bool> {
        let mut state = self.state();
        if state.handshake_rounds > 0 {
            state.handshake_rounds -= 1;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn finish_shutdown(&mut self) -> io::Result<bool> {
        self.state().shut_down = true;
        Ok(true)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.inbound.is_empty() {
            return if state.eof {
                Ok(0)
            } else {
                Err(io::Error::from(ErrorKind::WouldBlock))
            };
        }
        let n = buf.len().min(state.max_chunk).min(state.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.inbound.pop_front().expect("length checked above");
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        let mut n = buf.len().min(state.max_chunk);
        if let Some(capacity) = state.write_capacity {
            if capacity == 0 {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            n = n.min(capacity);
            state.write_capacity = Some(capacity - n);
        }
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        // writing only the first non-empty slice is valid vectored semantics
        //  and exercises the caller's cursor logic
        match bufs.iter().find(|slice| !slice.is_empty()) {
            Some(slice) => self.write(slice),
            None => Ok(0),
        }
    }

    fn flush(&mut self) -> io::Result<bool> {
        let mut state = self.state();
        if state.flush_pending > 0 {
            state.flush_pending -= 1;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn has_buffered_read_data(&self) -> bool {
        self.state().buffered_read_data
    }

    fn has_pending_write_data(&self) -> bool {
        self.state().flush_pending > 0
    }

    fn read_into_file(&mut self, _file: &mut File, _max: u64) -> Option<io::Result<u64>> {
        None
    }

    fn write_from_file(&mut self, _file: &mut File, _offset: u64, _max: u64) -> Option<io::Result<u64>> {
        None
    }

    fn register(&mut self, _registry: &Registry, _token: Token, _interests: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _registry: &Registry, _token: Token, _interests: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }
}
