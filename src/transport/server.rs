//! The listening endpoint: binds somewhere in a configured port range, applies
//!  admission filtering to inbound connections and hands admitted sockets to
//!  the channel layer in accepted mode.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use mio::{Registry, Token};
use tracing::{debug, info, warn};

use crate::transport::capabilities::{Acceptor, AdminMatcher, AdmissionFilter};
use crate::transport::channel::Channel;
use crate::transport::config::TransportConfig;
use crate::transport::error::PortRangeExhausted;
use crate::transport::socket::{ListenSocket, PlainTcpListener};

pub struct Server {
    name: String,
    listener: Box<dyn ListenSocket>,
    local_addr: SocketAddr,
    token: Option<Token>,
    acceptor: Arc<dyn Acceptor>,
    admission: Arc<dyn AdmissionFilter>,
    admin_matcher: Option<Arc<dyn AdminMatcher>>,
    config: Arc<TransportConfig>,
    accepted_count: u64,
    open: bool,
}

impl Server {
    /// Bind within the configured port range, skipping ports that are not
    ///  bindable right now. Fails only after the whole range is exhausted.
    pub fn bind(
        name: impl Into<String>,
        ip: IpAddr,
        acceptor: Arc<dyn Acceptor>,
        admission: Arc<dyn AdmissionFilter>,
        admin_matcher: Option<Arc<dyn AdminMatcher>>,
        config: Arc<TransportConfig>,
    ) -> Result<Server, PortRangeExhausted> {
        let name = name.into();
        let (start, end) = (config.port_range_start, config.port_range_end);

        for port in start..=end {
            match PlainTcpListener::bind(SocketAddr::new(ip, port)) {
                Ok(listener) => {
                    let local_addr = listener.local_addr();
                    info!(server = %name, %local_addr, "listening");
                    return Ok(Server {
                        name,
                        listener: Box::new(listener),
                        local_addr,
                        token: None,
                        acceptor,
                        admission,
                        admin_matcher,
                        config,
                        accepted_count: 0,
                        open: true,
                    });
                }
                Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable | ErrorKind::PermissionDenied) => {
                    debug!(server = %name, port, "port not bindable ({}), trying the next one", e);
                }
                Err(e) => {
                    warn!(server = %name, port, "unexpected bind error ({}), trying the next one", e);
                }
            }
        }
        Err(PortRangeExhausted { start, end })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.listener.register(registry, token)?;
        self.token = Some(token);
        Ok(())
    }

    pub(crate) fn close(&mut self, registry: &Registry) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.listener.deregister(registry) {
            debug!(server = %self.name, "deregistering on close failed: {}", e);
        }
        info!(server = %self.name, local_addr = %self.local_addr, "closed");
    }

    /// Drain the accept backlog. `connected_peers` are the addresses of all
    ///  currently registered connections, for the admission filter's global and
    ///  per-peer limits. Returns the channels to register with the dispatcher.
    pub(crate) fn accept_ready(&mut self, connected_peers: &[SocketAddr]) -> io::Result<Vec<Channel>> {
        let mut new_channels = Vec::new();

        while let Some((socket, peer_addr)) = self.listener.accept()? {
            let is_admin = self.admin_matcher.as_ref().map_or(false, |m| m.is_admin(peer_addr));
            if !is_admin && !self.admission.admit(peer_addr, &mut connected_peers.iter().copied()) {
                info!(server = %self.name, %peer_addr, "connection rejected by admission filter");
                drop(socket);
                continue;
            }

            let params = match self.acceptor.channel_params(peer_addr) {
                Some(params) => params,
                None => {
                    info!(server = %self.name, %peer_addr, "acceptor supplied no channel parameters - dropping connection");
                    continue;
                }
            };

            self.accepted_count += 1;
            let name = format!("{}#{}@{}", self.name, self.accepted_count, peer_addr);
            debug!(server = %self.name, %peer_addr, channel = %name, "accepted connection");
            new_channels.push(Channel::accepted(name, socket, peer_addr, params, &self.config));
        }

        Ok(new_channels)
    }
}


#[cfg(test)]
mod test {
    use std::net::TcpListener as StdTcpListener;
    use std::sync::Arc;

    use crate::test_util::capabilities::StaticAcceptor;
    use crate::test_util::capabilities::{QueueWriter, RecordingReader};
    use crate::transport::capabilities::{AdmitAll, ChannelParams};

    use super::*;

    fn test_acceptor() -> Arc<dyn Acceptor> {
        Arc::new(StaticAcceptor::new(ChannelParams::new(
            Arc::new(RecordingReader::new()),
            Arc::new(QueueWriter::new()),
        )))
    }

    #[test]
    fn test_bind_skips_occupied_ports() {
        // occupy a port, then configure a range starting at it
        let occupied = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let occupied_port = occupied.local_addr().unwrap().port();

        let mut config = TransportConfig::new();
        config.port_range_start = occupied_port;
        config.port_range_end = occupied_port.checked_add(20).unwrap();

        let server = Server::bind(
            "test-server",
            "127.0.0.1".parse().unwrap(),
            test_acceptor(),
            Arc::new(AdmitAll),
            None,
            Arc::new(config),
        )
        .unwrap();

        let port = server.local_addr().port();
        assert_ne!(port, occupied_port);
        assert!(port > occupied_port && port <= occupied_port + 20);
    }

    #[test]
    fn test_bind_fails_after_exhausting_range() {
        let occupied = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let occupied_port = occupied.local_addr().unwrap().port();

        let mut config = TransportConfig::new();
        config.port_range_start = occupied_port;
        config.port_range_end = occupied_port;

        let result = Server::bind(
            "test-server",
            "127.0.0.1".parse().unwrap(),
            test_acceptor(),
            Arc::new(AdmitAll),
            None,
            Arc::new(config),
        );

        match result {
            Err(PortRangeExhausted { start, end }) => {
                assert_eq!(start, occupied_port);
                assert_eq!(end, occupied_port);
            }
            Ok(server) => panic!("bind unexpectedly succeeded on {}", server.local_addr()),
        }
    }
}
