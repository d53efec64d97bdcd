//! The reactor: one thread owns the poll object and every registration, and
//!  drives all channel and server state machines from readiness events. Other
//!  threads interact only through the [DispatcherHandle] mailbox - all
//!  registration mutation is pinned to the dispatcher thread, which removes
//!  the need for any locking around the poll set.

use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::{channel as mpsc_channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::transport::capabilities::{Acceptor, AdminMatcher, AdmissionFilter, ChannelParams};
use crate::transport::channel::{Channel, ChannelState};
use crate::transport::config::TransportConfig;
use crate::transport::error::{ChannelError, ChannelFailure};
use crate::transport::server::Server;

const WAKER_TOKEN: Token = Token(0);
const FIRST_REGISTRATION_TOKEN: usize = 1;

/// Everything that can be bound to a poll token: a connection or a listener.
enum Registration {
    Channel(Channel),
    Server(Server),
}

enum Command {
    RegisterChannel(Channel),
    RegisterServer(Server),
    Disconnect(Token),
    Close(Token),
    UpdateReadStatus(Token),
    UpdateWriteStatus(Token),
}

/// The cross-thread face of a [Dispatcher]: a mailbox plus a wakeup handle.
///  Commands are executed by the dispatcher thread at the start of its next
///  loop turn - channel state is never touched from any other thread.
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: Sender<Command>,
    waker: Arc<Waker>,
}

impl DispatcherHandle {
    fn send(&self, command: Command) {
        if self.sender.send(command).is_ok() {
            // a failed wake means the dispatcher is gone; the command is moot
            self.waker.wake().ok();
        }
    }

    pub fn register_channel(&self, channel: Channel) {
        self.send(Command::RegisterChannel(channel));
    }

    pub fn register_server(&self, server: Server) {
        self.send(Command::RegisterServer(server));
    }

    /// request a graceful disconnect, executed on the dispatcher thread
    pub fn request_disconnect(&self, token: Token) {
        self.send(Command::Disconnect(token));
    }

    /// request an unconditional close, executed on the dispatcher thread
    pub fn request_close(&self, token: Token) {
        self.send(Command::Close(token));
    }

    /// announce that the application's read appetite changed (e.g. back
    ///  pressure released) so the channel re-evaluates its interest set and
    ///  re-drains buffered data
    pub fn update_read_status(&self, token: Token) {
        self.send(Command::UpdateReadStatus(token));
    }

    /// announce that the application has new outbound work so the channel
    ///  re-evaluates its interest set
    pub fn update_write_status(&self, token: Token) {
        self.send(Command::UpdateWriteStatus(token));
    }
}


pub struct Dispatcher {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    registrations: FxHashMap<Token, Registration>,
    next_token: usize,
    commands: Receiver<Command>,
    command_sender: Sender<Command>,
    /// channels that asked to be re-drained without a new readiness event
    retained_ready: Vec<Token>,
    last_cleanup: Instant,
    config: Arc<TransportConfig>,
}

impl Dispatcher {
    pub fn new(config: TransportConfig) -> anyhow::Result<Dispatcher> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (command_sender, commands) = mpsc_channel();
        let events = Events::with_capacity(config.poll_capacity);

        Ok(Dispatcher {
            poll,
            events,
            waker,
            registrations: FxHashMap::default(),
            next_token: FIRST_REGISTRATION_TOKEN,
            commands,
            command_sender,
            retained_ready: Vec::new(),
            last_cleanup: Instant::now(),
            config: Arc::new(config),
        })
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            sender: self.command_sender.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    pub fn num_channels(&self) -> usize {
        self.registrations
            .values()
            .filter(|r| matches!(r, Registration::Channel(_)))
            .count()
    }

    pub fn num_servers(&self) -> usize {
        self.registrations
            .values()
            .filter(|r| matches!(r, Registration::Server(_)))
            .count()
    }

    pub fn channel_state(&self, token: Token) -> Option<ChannelState> {
        match self.registrations.get(&token) {
            Some(Registration::Channel(channel)) => Some(channel.state()),
            _ => None,
        }
    }

    pub fn server_addr(&self, token: Token) -> Option<SocketAddr> {
        match self.registrations.get(&token) {
            Some(Registration::Server(server)) => Some(server.local_addr()),
            _ => None,
        }
    }

    /// Construct a client channel and register it. Must be called on the
    ///  dispatcher thread; other threads build the [Channel] themselves and
    ///  pass it through the handle.
    pub fn create_client(
        &mut self,
        name: impl Into<String>,
        peer_addr: SocketAddr,
        params: ChannelParams,
    ) -> anyhow::Result<Token> {
        let channel = Channel::connect(name, peer_addr, params, &self.config)?;
        Ok(self.add_channel(channel)?)
    }

    /// Bind a server within the configured port range and register it.
    pub fn create_server(
        &mut self,
        name: impl Into<String>,
        ip: IpAddr,
        acceptor: Arc<dyn Acceptor>,
        admission: Arc<dyn AdmissionFilter>,
        admin_matcher: Option<Arc<dyn AdminMatcher>>,
    ) -> anyhow::Result<Token> {
        let server = Server::bind(name, ip, acceptor, admission, admin_matcher, self.config.clone())?;
        Ok(self.add_server(server)?)
    }

    /// Register a pre-built channel (dispatcher thread only).
    pub fn register_channel(&mut self, channel: Channel) -> anyhow::Result<Token> {
        Ok(self.add_channel(channel)?)
    }

    /// Register a pre-built server (dispatcher thread only).
    pub fn register_server(&mut self, server: Server) -> anyhow::Result<Token> {
        Ok(self.add_server(server)?)
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.checked_add(1).unwrap_or(FIRST_REGISTRATION_TOKEN);
            if token != WAKER_TOKEN && !self.registrations.contains_key(&token) {
                return token;
            }
        }
    }

    fn add_channel(&mut self, mut channel: Channel) -> std::io::Result<Token> {
        let token = self.allocate_token();
        channel.register(self.poll.registry(), token)?;
        debug!(channel = %channel.name(), peer = %channel.peer_addr(), ?token, "channel registered");
        self.registrations.insert(token, Registration::Channel(channel));
        Ok(token)
    }

    fn add_server(&mut self, mut server: Server) -> std::io::Result<Token> {
        let token = self.allocate_token();
        server.register(self.poll.registry(), token)?;
        debug!(server = %server.name(), local_addr = %server.local_addr(), ?token, "server registered");
        self.registrations.insert(token, Registration::Server(server));
        Ok(token)
    }

    /// One loop turn: drain the mailbox, re-drain retained channels, poll once
    ///  (zero timeout when `Some(ZERO)` or retained work exists, blocking up to
    ///  `timeout` otherwise) and route every readiness event. Failures of one
    ///  registration never abort the turn.
    pub fn poll_and_dispatch(&mut self, timeout: Option<Duration>) -> anyhow::Result<()> {
        self.drain_commands();
        self.service_retained();

        let timeout = if self.retained_ready.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            self.dispatch_event(token, readable, writable);
        }

        self.cleanup();
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::RegisterChannel(channel) => {
                    let name = channel.name().to_string();
                    if let Err(e) = self.add_channel(channel) {
                        warn!(channel = %name, "registering channel failed: {}", e);
                    }
                }
                Command::RegisterServer(server) => {
                    let name = server.name().to_string();
                    if let Err(e) = self.add_server(server) {
                        warn!(server = %name, "registering server failed: {}", e);
                    }
                }
                Command::Disconnect(token) => self.disconnect_channel(token),
                Command::Close(token) => self.close_channel(token),
                Command::UpdateReadStatus(token) => {
                    // interest alone is not enough: data already buffered in
                    //  the kernel produces no new readiness event, so force a
                    //  re-drain on this turn
                    if matches!(self.registrations.get(&token), Some(Registration::Channel(_)))
                        && !self.retained_ready.contains(&token)
                    {
                        self.retained_ready.push(token);
                    }
                    self.finish_channel_turn(token);
                }
                Command::UpdateWriteStatus(token) => self.finish_channel_turn(token),
            }
        }
    }

    fn service_retained(&mut self) {
        if self.retained_ready.is_empty() {
            return;
        }
        let tokens = std::mem::take(&mut self.retained_ready);
        for token in tokens {
            self.dispatch_event(token, true, false);
        }
    }

    fn dispatch_event(&mut self, token: Token, readable: bool, writable: bool) {
        if token == WAKER_TOKEN {
            // nothing to do - commands are drained at the top of every turn
            return;
        }

        match self.registrations.get(&token) {
            Some(Registration::Server(_)) => self.accept_connections(token),
            Some(Registration::Channel(_)) => {
                match self.handle_channel_event(token, readable, writable) {
                    Ok(retain) => {
                        if retain && !self.retained_ready.contains(&token) {
                            self.retained_ready.push(token);
                        }
                    }
                    Err(cause) => self.fail_channel(token, cause),
                }
                self.finish_channel_turn(token);
            }
            None => {
                // the owner was closed earlier in this turn
                trace!(?token, "readiness event for a cancelled registration - ignoring");
            }
        }
    }

    fn handle_channel_event(&mut self, token: Token, readable: bool, writable: bool) -> Result<bool, ChannelError> {
        let registry = self.poll.registry();
        let channel = match self.registrations.get_mut(&token) {
            Some(Registration::Channel(channel)) => channel,
            _ => return Ok(false),
        };

        let mut retain = false;
        if channel.state() == ChannelState::SocketHandshaking {
            // covers connect completion, which is signalled as writability
            channel.on_connectable(registry)?;
        }
        if readable || channel.has_buffered_read_data() {
            retain = channel.on_readable(registry)?;
        }
        if writable {
            channel.on_writable(registry)?;
        }
        Ok(retain)
    }

    fn fail_channel(&mut self, token: Token, cause: ChannelError) {
        let registry = self.poll.registry();
        if let Some(Registration::Channel(channel)) = self.registrations.get_mut(&token) {
            let failure = ChannelFailure {
                channel: channel.name().to_string(),
                peer: channel.peer_addr(),
                cause,
            };
            warn!(channel = %channel.name(), "closing failed channel: {}", failure);
            channel.close(registry);
            channel.events().on_failed(channel.name(), &failure);
        }
    }

    /// Apply the channel's recomputed interest set and drop it from the
    ///  registration table once it reaches `Disconnected`.
    fn finish_channel_turn(&mut self, token: Token) {
        let registry = self.poll.registry();
        let remove = match self.registrations.get_mut(&token) {
            Some(Registration::Channel(channel)) => {
                if channel.state() == ChannelState::Disconnected {
                    true
                } else {
                    match channel.update_interest(registry) {
                        Ok(()) => channel.state() == ChannelState::Disconnected,
                        Err(e) => {
                            warn!(channel = %channel.name(), "updating interest failed, closing: {}", e);
                            channel.close(registry);
                            true
                        }
                    }
                }
            }
            _ => false,
        };

        if remove {
            self.registrations.remove(&token);
            self.retained_ready.retain(|t| *t != token);
        }
    }

    fn accept_connections(&mut self, token: Token) {
        let connected_peers: Vec<SocketAddr> = self
            .registrations
            .values()
            .filter_map(|r| match r {
                Registration::Channel(channel) if !channel.is_closed() => Some(channel.peer_addr()),
                _ => None,
            })
            .collect();

        let (server_name, result) = match self.registrations.get_mut(&token) {
            Some(Registration::Server(server)) => (server.name().to_string(), server.accept_ready(&connected_peers)),
            _ => return,
        };
        let accepted = match result {
            Ok(channels) => channels,
            Err(e) => {
                warn!(server = %server_name, "accepting failed, closing server: {}", e);
                self.close_server(token);
                return;
            }
        };

        for channel in accepted {
            let name = channel.name().to_string();
            if let Err(e) = self.add_channel(channel) {
                warn!(channel = %name, "registering accepted channel failed: {}", e);
            }
        }
    }

    fn disconnect_channel(&mut self, token: Token) {
        let registry = self.poll.registry();
        let result = match self.registrations.get_mut(&token) {
            Some(Registration::Channel(channel)) => channel.disconnect(registry),
            _ => return,
        };
        if let Err(cause) = result {
            self.fail_channel(token, cause);
        }
        self.finish_channel_turn(token);
    }

    fn close_channel(&mut self, token: Token) {
        let registry = self.poll.registry();
        if let Some(Registration::Channel(channel)) = self.registrations.get_mut(&token) {
            channel.close(registry);
        }
        self.finish_channel_turn(token);
    }

    fn close_server(&mut self, token: Token) {
        if let Some(Registration::Server(mut server)) = self.registrations.remove(&token) {
            server.close(self.poll.registry());
        }
    }

    /// Throttled sweep: refresh rate limiters, force-close channels stuck
    ///  outside `Connected` past the channel timeout, gracefully disconnect
    ///  connected channels idle past the max idle period.
    fn cleanup(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_cleanup) < self.config.cleanup_interval {
            return;
        }
        self.last_cleanup = now;

        enum Action {
            None,
            ForceClose,
            Disconnect,
        }

        let tokens: Vec<Token> = self.registrations.keys().copied().collect();
        for token in tokens {
            let (action, name) = match self.registrations.get(&token) {
                Some(Registration::Channel(channel)) => {
                    channel.on_cleanup_timer(now);
                    let idle = now.saturating_duration_since(channel.last_activity());
                    let action = if !channel.is_connected()
                        && !self.config.channel_timeout.is_zero()
                        && idle > self.config.channel_timeout
                    {
                        Action::ForceClose
                    } else if channel.is_connected()
                        && !self.config.max_channel_idle_period.is_zero()
                        && idle > self.config.max_channel_idle_period
                    {
                        Action::Disconnect
                    } else {
                        Action::None
                    };
                    (action, channel.name().to_string())
                }
                _ => (Action::None, String::new()),
            };

            match action {
                Action::ForceClose => {
                    info!(channel = %name, "channel timed out without becoming connected - force-closing");
                    self.close_channel(token);
                }
                Action::Disconnect => {
                    info!(channel = %name, "connected channel exceeded the max idle period - disconnecting");
                    self.disconnect_channel(token);
                }
                Action::None => {}
            }
        }
    }

    /// Wind everything down: disconnect connected channels, close channels
    ///  that never became connected, close all servers. Returns true once the
    ///  registration set is empty - callers pump the loop until then (or give
    ///  up and drop the dispatcher).
    pub fn request_stop(&mut self) -> bool {
        enum Kind {
            Server,
            Disconnect,
            Close,
            Leave,
        }

        let tokens: Vec<Token> = self.registrations.keys().copied().collect();
        for token in tokens {
            let kind = match self.registrations.get(&token) {
                Some(Registration::Server(_)) => Kind::Server,
                Some(Registration::Channel(channel)) => match channel.state() {
                    ChannelState::Connected => Kind::Disconnect,
                    ChannelState::Disconnecting | ChannelState::SocketDisconnecting => Kind::Leave,
                    _ => Kind::Close,
                },
                None => Kind::Leave,
            };
            match kind {
                Kind::Server => self.close_server(token),
                Kind::Disconnect => self.disconnect_channel(token),
                Kind::Close => self.close_channel(token),
                Kind::Leave => {}
            }
        }
        self.registrations.is_empty()
    }
}


#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::test_util::capabilities::{QueueWriter, RecordingReader};
    use crate::test_util::memory_socket::MemorySocket;
    use crate::transport::capabilities::ChannelParams;

    use super::*;

    fn memory_channel(config: &TransportConfig) -> Channel {
        let (socket, _handle) = MemorySocket::new();
        let params = ChannelParams::new(Arc::new(RecordingReader::new()), Arc::new(QueueWriter::new()));
        Channel::accepted("mem-channel", Box::new(socket), "127.0.0.1:7777".parse().unwrap(), params, config)
    }

    #[test]
    fn test_cross_thread_registration_through_handle() {
        let mut dispatcher = Dispatcher::new(TransportConfig::new()).unwrap();
        let handle = dispatcher.handle();
        let channel = memory_channel(dispatcher.config());

        let registrar = std::thread::spawn(move || {
            handle.register_channel(channel);
        });
        registrar.join().unwrap();

        dispatcher.poll_and_dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(dispatcher.num_channels(), 1);
    }

    #[test]
    fn test_queued_close_executes_on_next_turn() {
        let mut dispatcher = Dispatcher::new(TransportConfig::new()).unwrap();
        let channel = memory_channel(dispatcher.config());
        let token = dispatcher.register_channel(channel).unwrap();

        dispatcher.handle().request_close(token);
        assert_eq!(dispatcher.num_channels(), 1);

        dispatcher.poll_and_dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(dispatcher.num_channels(), 0);
    }

    #[test]
    fn test_cleanup_force_closes_stuck_handshake() {
        let mut config = TransportConfig::new();
        config.cleanup_interval = Duration::from_millis(1);
        config.channel_timeout = Duration::from_millis(5);
        let mut dispatcher = Dispatcher::new(config).unwrap();

        let (socket, handle) = MemorySocket::new();
        handle.set_handshake_rounds(u32::MAX);
        let params = ChannelParams::new(Arc::new(RecordingReader::new()), Arc::new(QueueWriter::new()));
        let channel = Channel::accepted("stuck", Box::new(socket), "127.0.0.1:7777".parse().unwrap(), params, dispatcher.config());
        dispatcher.register_channel(channel).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        dispatcher.poll_and_dispatch(Some(Duration::ZERO)).unwrap();
        assert_eq!(dispatcher.num_channels(), 0);
    }

    #[test]
    fn test_request_stop_empties_the_registration_set() {
        let mut dispatcher = Dispatcher::new(TransportConfig::new()).unwrap();
        let channel = memory_channel(dispatcher.config());
        dispatcher.register_channel(channel).unwrap();
        assert_eq!(dispatcher.num_channels(), 1);

        // the channel never became connected, so stopping closes it outright
        assert!(dispatcher.request_stop());
        assert_eq!(dispatcher.num_channels(), 0);
    }
}
