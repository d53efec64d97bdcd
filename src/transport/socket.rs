//! The socket capability: what the transport core requires from a stream
//!  transport. Plain TCP ships here; a TLS transport would implement the same
//!  traits with a real `finish_handshake` / `finish_shutdown` and buffered-data
//!  predicates.

use std::fs::File;
use std::io::{self, ErrorKind, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::warn;

/// A non-blocking stream socket with an explicit transport-level handshake and
///  shutdown step. All read/write operations follow `std::io` non-blocking
///  conventions (`WouldBlock` when the operation cannot make progress).
pub trait StreamSocket: Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> SocketAddr;

    /// drive the transport-level handshake (connect completion for plain TCP,
    ///  the TLS handshake for TLS, ...); Ok(true) once complete
    fn finish_handshake(&mut self) -> io::Result<bool>;

    /// drive the transport-level graceful shutdown; Ok(true) once complete
    fn finish_shutdown(&mut self) -> io::Result<bool>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// push out transport-buffered data; Ok(true) once nothing is buffered.
    ///  Plain TCP buffers nothing and always reports completion
    fn flush(&mut self) -> io::Result<bool>;

    /// whether the transport holds already-decrypted/-received data that can
    ///  be read without another readiness notification
    fn has_buffered_read_data(&self) -> bool;

    /// whether the transport holds data it still needs write readiness for
    fn has_pending_write_data(&self) -> bool;

    /// Transfer up to `max` bytes from the socket straight into `file`,
    ///  bypassing userspace. None if this transport has no such fast path -
    ///  the caller then copies through its spill buffer instead.
    fn read_into_file(&mut self, _file: &mut File, _max: u64) -> Option<io::Result<u64>> {
        None
    }

    /// Transfer up to `max` bytes from `file` (starting at `offset`) straight
    ///  to the socket. None if this transport has no such fast path.
    fn write_from_file(&mut self, _file: &mut File, _offset: u64, _max: u64) -> Option<io::Result<u64>> {
        None
    }

    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()>;
    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
}

/// A non-blocking listening socket.
pub trait ListenSocket: Send {
    fn local_addr(&self) -> SocketAddr;

    /// the next pending connection, or None once the backlog is drained.
    ///  Transient per-connection accept failures are skipped internally
    fn accept(&mut self) -> io::Result<Option<(Box<dyn StreamSocket>, SocketAddr)>>;

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
}


pub struct PlainTcpSocket {
    stream: TcpStream,
    peer_addr: SocketAddr,
    connected: bool,
    shutdown_initiated: bool,
}

impl PlainTcpSocket {
    /// Initiate a non-blocking connect. The connection is not usable until
    ///  `finish_handshake` reports completion (signalled by write readiness).
    pub fn connect(peer_addr: SocketAddr) -> io::Result<PlainTcpSocket> {
        let stream = TcpStream::connect(peer_addr)?;
        Ok(PlainTcpSocket {
            stream,
            peer_addr,
            connected: false,
            shutdown_initiated: false,
        })
    }

    pub fn accepted(stream: TcpStream, peer_addr: SocketAddr) -> PlainTcpSocket {
        PlainTcpSocket {
            stream,
            peer_addr,
            connected: true,
            shutdown_initiated: false,
        }
    }
}

impl StreamSocket for PlainTcpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn finish_handshake(&mut self) -> io::Result<bool> {
        if self.connected {
            return Ok(true);
        }

        // the mio connect protocol: a pending error means the connect failed,
        //  a resolvable peer address means it succeeded, NotConnected means it
        //  is still in progress
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.stream.set_nodelay(true)?;
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(115) => Ok(false), // EINPROGRESS
            Err(e) => Err(e),
        }
    }

    fn finish_shutdown(&mut self) -> io::Result<bool> {
        if !self.shutdown_initiated {
            match self.stream.shutdown(Shutdown::Write) {
                Ok(()) => {}
                // the peer may already have torn the connection down
                Err(e) if e.kind() == ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
            self.shutdown_initiated = true;
        }
        Ok(true)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.stream.write(buf) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        loop {
            match self.stream.write_vectored(bufs) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    fn flush(&mut self) -> io::Result<bool> {
        self.stream.flush()?;
        Ok(true)
    }

    fn has_buffered_read_data(&self) -> bool {
        false
    }

    fn has_pending_write_data(&self) -> bool {
        false
    }

    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}


pub struct PlainTcpListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl PlainTcpListener {
    pub fn bind(addr: SocketAddr) -> io::Result<PlainTcpListener> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(PlainTcpListener { listener, local_addr })
    }
}

impl ListenSocket for PlainTcpListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn accept(&mut self) -> io::Result<Option<(Box<dyn StreamSocket>, SocketAddr)>> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer_addr, "failed to set nodelay on accepted connection, dropping it: {}", e);
                        continue;
                    }
                    return Ok(Some((Box::new(PlainTcpSocket::accepted(stream, peer_addr)), peer_addr)));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset) => {
                    // the peer gave up between connecting and being accepted
                    warn!(local_addr = %self.local_addr, "transient accept error: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.listener, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.listener)
    }
}


#[cfg(test)]
mod test {
    use std::time::Duration;

    use mio::{Events, Poll};

    use super::*;

    #[test]
    fn test_plain_tcp_connect_and_accept() {
        let mut listener = PlainTcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = listener.local_addr();

        let mut poll = Poll::new().unwrap();
        let mut client = PlainTcpSocket::connect(server_addr).unwrap();
        client
            .register(poll.registry(), Token(1), Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        listener.register(poll.registry(), Token(2)).unwrap();

        let mut accepted = None;
        let mut client_connected = false;
        let mut events = Events::with_capacity(16);
        for _ in 0..100 {
            poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
            for event in events.iter() {
                match event.token() {
                    Token(1) if event.is_writable() => {
                        client_connected |= client.finish_handshake().unwrap();
                    }
                    Token(2) => {
                        if let Some((socket, peer)) = listener.accept().unwrap() {
                            assert_eq!(peer, socket.peer_addr());
                            accepted = Some(socket);
                        }
                    }
                    _ => {}
                }
            }
            if client_connected && accepted.is_some() {
                break;
            }
        }

        assert!(client_connected);
        let mut accepted = accepted.expect("no connection accepted");
        assert!(accepted.finish_handshake().unwrap());
        assert_eq!(client.peer_addr(), server_addr);
    }
}
