//! End-to-end coverage over real loopback TCP: two dispatchers (one hosting
//!  the server, one hosting the client) are pumped alternately on the test
//!  thread until the expected observable state is reached.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::test_util::capabilities::{
    CountingEvents, MaxConnectionsFilter, QueueWriter, RecordingReader, StallingDisconnect, StaticAcceptor,
};
use crate::transport::capabilities::{AdminMatcher, AdmitAll, ChannelParams};
use crate::transport::channel::ChannelState;
use crate::transport::config::TransportConfig;
use crate::transport::dispatcher::Dispatcher;
use crate::transport::packet::Packet;

const PUMP_SLICE: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(10);

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Side {
    dispatcher: Dispatcher,
    reader: Arc<RecordingReader>,
    writer: Arc<QueueWriter>,
    events: Arc<CountingEvents>,
}

impl Side {
    fn new(config: TransportConfig) -> Side {
        Side {
            dispatcher: Dispatcher::new(config).unwrap(),
            reader: Arc::new(RecordingReader::new()),
            writer: Arc::new(QueueWriter::new()),
            events: Arc::new(CountingEvents::new()),
        }
    }

    fn params(&self) -> ChannelParams {
        let mut params = ChannelParams::new(self.reader.clone(), self.writer.clone());
        params.events = self.events.clone();
        params
    }
}

fn fast_cleanup_config() -> TransportConfig {
    let mut config = TransportConfig::new();
    config.cleanup_interval = Duration::from_millis(20);
    config
}

/// Pump both dispatchers until `condition` holds. Panics on timeout.
fn pump_until(server: &mut Dispatcher, client: &mut Dispatcher, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        server.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        client.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        if condition() {
            return;
        }
    }
    panic!("timed out waiting for: {}", what);
}

fn start_server(side: &mut Side) -> SocketAddr {
    let acceptor = Arc::new(StaticAcceptor::new(side.params()));
    let token = side
        .dispatcher
        .create_server("server", "127.0.0.1".parse().unwrap(), acceptor, Arc::new(AdmitAll), None)
        .unwrap();
    side.dispatcher.server_addr(token).unwrap()
}

#[test]
fn test_scenario_small_buffer_packet_round_trip() {
    let mut server = Side::new(fast_cleanup_config());
    let mut client = Side::new(fast_cleanup_config());
    let server_addr = start_server(&mut server);

    let payload = patterned(20);
    client.writer.enqueue(Packet::from_buffer(payload.clone()));
    let client_params = client.params();
    let client_token = client
        .dispatcher
        .create_client("client", server_addr, client_params)
        .unwrap();

    {
        let reader = server.reader.clone();
        pump_until(&mut server.dispatcher, &mut client.dispatcher, "first packet delivery", || {
            reader.num_received() == 1
        });
    }
    let packets = server.reader.take_packets();
    assert_eq!(packets[0].buffers()[0].as_ref(), &payload[..]);

    // a second packet enqueued after the fact needs the write-status kick
    let second = patterned(64);
    client.writer.enqueue(Packet::from_buffer(second.clone()));
    client.dispatcher.handle().update_write_status(client_token);

    {
        let reader = server.reader.clone();
        pump_until(&mut server.dispatcher, &mut client.dispatcher, "second packet delivery", || {
            reader.num_received() == 1
        });
    }
    let packets = server.reader.take_packets();
    assert_eq!(packets[0].buffers()[0].as_ref(), &second[..]);
    assert!(client.events.failures().is_empty());
    assert!(server.events.failures().is_empty());
}

#[test]
fn test_scenario_packets_arrive_in_order() {
    let mut server = Side::new(fast_cleanup_config());
    let mut client = Side::new(fast_cleanup_config());
    let server_addr = start_server(&mut server);

    let num_packets = 25;
    for i in 0..num_packets {
        client.writer.enqueue(Packet::from_buffer(patterned(10 + i * 13)));
    }
    client
        .dispatcher
        .create_client("client", server_addr, client.params())
        .unwrap();

    {
        let reader = server.reader.clone();
        pump_until(&mut server.dispatcher, &mut client.dispatcher, "all packets delivered", || {
            reader.num_received() == num_packets
        });
    }
    let packets = server.reader.take_packets();
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet.buffers()[0].as_ref(), &patterned(10 + i * 13)[..]);
    }
}

#[test]
fn test_scenario_file_transfer_round_trip() {
    let mut server = Side::new(fast_cleanup_config());
    let mut client = Side::new(fast_cleanup_config());
    let server_addr = start_server(&mut server);

    let content_a = patterned(100_000);
    let content_b = patterned(250_000);
    let buffer = patterned(50);

    let mut file_a = tempfile::NamedTempFile::new().unwrap();
    file_a.write_all(&content_a).unwrap();
    file_a.flush().unwrap();
    let mut file_b = tempfile::NamedTempFile::new().unwrap();
    file_b.write_all(&content_b).unwrap();
    file_b.flush().unwrap();

    let mut packet = Packet::from_buffer(buffer.clone());
    packet.add_file(file_a.path()).unwrap();
    packet.add_file(file_b.path()).unwrap();
    client.writer.enqueue(packet);

    client
        .dispatcher
        .create_client("client", server_addr, client.params())
        .unwrap();

    {
        let reader = server.reader.clone();
        pump_until(&mut server.dispatcher, &mut client.dispatcher, "file packet delivery", || {
            reader.num_received() == 1
        });
    }

    let mut packets = server.reader.take_packets();
    let received = packets.remove(0);
    assert_eq!(received.buffers()[0].as_ref(), &buffer[..]);
    assert_eq!(received.file_count(), 2);
    assert_eq!(received.files()[0].len(), content_a.len() as u64);
    assert_eq!(received.files()[1].len(), content_b.len() as u64);
    assert_eq!(std::fs::read(received.files()[0].path()).unwrap(), content_a);
    assert_eq!(std::fs::read(received.files()[1].path()).unwrap(), content_b);

    // the materialized files belong to the packet and vanish with it
    let path_a = received.files()[0].path().to_path_buf();
    let path_b = received.files()[1].path().to_path_buf();
    drop(received);
    assert!(!path_a.exists());
    assert!(!path_b.exists());
}

#[test]
fn test_scenario_idle_channel_is_gracefully_disconnected() {
    let mut config = fast_cleanup_config();
    config.max_channel_idle_period = Duration::from_millis(150);
    let mut server = Side::new(config.clone());
    let mut client = Side::new(config);
    let server_addr = start_server(&mut server);

    let payload = patterned(32);
    client.writer.enqueue(Packet::from_buffer(payload.clone()));
    client
        .dispatcher
        .create_client("client", server_addr, client.params())
        .unwrap();

    {
        let reader = server.reader.clone();
        pump_until(&mut server.dispatcher, &mut client.dispatcher, "packet before idling", || {
            reader.num_received() == 1
        });
    }

    // no more traffic: the cleanup sweep disconnects both sides gracefully
    let deadline = Instant::now() + DEADLINE;
    while (server.dispatcher.num_channels() > 0 || client.dispatcher.num_channels() > 0) && Instant::now() < deadline {
        server.dispatcher.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        client.dispatcher.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
    }
    assert_eq!(server.dispatcher.num_channels(), 0);
    assert_eq!(client.dispatcher.num_channels(), 0);

    // the fully received packet survived the disconnect
    let packets = server.reader.take_packets();
    assert_eq!(packets[0].buffers()[0].as_ref(), &payload[..]);
    assert!(server.events.failures().is_empty());
    assert!(client.events.failures().is_empty());
}

#[test]
fn test_scenario_admission_filter_rejects_connection() {
    // pick a small dedicated port range the way a service configuration would
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut config = fast_cleanup_config();
    config.port_range_start = base_port;
    config.port_range_end = base_port.saturating_add(10);

    let mut server = Side::new(config.clone());
    let mut client = Side::new(config);

    let acceptor = Arc::new(StaticAcceptor::new(server.params()));
    let server_token = server
        .dispatcher
        .create_server(
            "server",
            "127.0.0.1".parse().unwrap(),
            acceptor,
            Arc::new(MaxConnectionsFilter { limit: 0 }),
            None,
        )
        .unwrap();
    let server_addr = server.dispatcher.server_addr(server_token).unwrap();
    assert!(server_addr.port() >= base_port && server_addr.port() <= base_port + 10);

    let client_token = client
        .dispatcher
        .create_client("client", server_addr, client.params())
        .unwrap();

    // the server drops the socket without registering a channel; the client
    //  observes the close
    let deadline = Instant::now() + DEADLINE;
    loop {
        server.dispatcher.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        client.dispatcher.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        if client.dispatcher.channel_state(client_token).is_none() {
            break;
        }
        assert!(Instant::now() < deadline, "client channel never closed");
    }
    assert_eq!(server.dispatcher.num_channels(), 0);
    assert_eq!(server.reader.num_received(), 0);
}

struct LoopbackAdmin;

impl AdminMatcher for LoopbackAdmin {
    fn is_admin(&self, peer: SocketAddr) -> bool {
        peer.ip().is_loopback()
    }
}

#[test]
fn test_scenario_admin_peer_bypasses_admission_filter() {
    let mut server = Side::new(fast_cleanup_config());
    let mut client = Side::new(fast_cleanup_config());

    let acceptor = Arc::new(StaticAcceptor::new(server.params()));
    let server_token = server
        .dispatcher
        .create_server(
            "server",
            "127.0.0.1".parse().unwrap(),
            acceptor,
            Arc::new(MaxConnectionsFilter { limit: 0 }),
            Some(Arc::new(LoopbackAdmin)),
        )
        .unwrap();
    let server_addr = server.dispatcher.server_addr(server_token).unwrap();

    client.writer.enqueue(Packet::from_buffer(&b"admin traffic"[..]));
    client
        .dispatcher
        .create_client("client", server_addr, client.params())
        .unwrap();

    {
        let reader = server.reader.clone();
        pump_until(&mut server.dispatcher, &mut client.dispatcher, "admin packet delivery", || {
            reader.num_received() == 1
        });
    }
}

#[test]
fn test_scenario_stalled_disconnect_is_force_closed_after_timeout() {
    let mut config = fast_cleanup_config();
    config.channel_timeout = Duration::from_millis(150);
    let mut server = Side::new(config.clone());
    let mut client = Side::new(config);
    let server_addr = start_server(&mut server);

    let mut client_params = client.params();
    client_params.handshaker = Arc::new(StallingDisconnect);
    let client_token = client
        .dispatcher
        .create_client("client", server_addr, client_params)
        .unwrap();

    pump_until(&mut server.dispatcher, &mut client.dispatcher, "client connected", {
        let events = client.events.clone();
        move || events.num_connected() == 1
    });

    // the disconnect hook never completes, so only the timeout can finish this
    client.dispatcher.handle().request_disconnect(client_token);

    let deadline = Instant::now() + DEADLINE;
    loop {
        server.dispatcher.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        client.dispatcher.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        match client.dispatcher.channel_state(client_token) {
            None => break,
            Some(state) => assert!(
                matches!(state, ChannelState::Connected | ChannelState::Disconnecting),
                "unexpected state {:?}",
                state
            ),
        }
        assert!(Instant::now() < deadline, "stalled channel never timed out");
    }
    assert_eq!(client.events.num_disconnected(), 1);
}

#[test]
fn test_scenario_request_stop_drains_everything() {
    let mut server = Side::new(fast_cleanup_config());
    let mut client = Side::new(fast_cleanup_config());
    let server_addr = start_server(&mut server);

    client
        .dispatcher
        .create_client("client", server_addr, client.params())
        .unwrap();

    pump_until(&mut server.dispatcher, &mut client.dispatcher, "connection established", {
        let events = client.events.clone();
        move || events.num_connected() == 1
    });

    let deadline = Instant::now() + DEADLINE;
    loop {
        let server_stopped = server.dispatcher.request_stop();
        let client_stopped = client.dispatcher.request_stop();
        if server_stopped && client_stopped {
            break;
        }
        server.dispatcher.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        client.dispatcher.poll_and_dispatch(Some(PUMP_SLICE)).unwrap();
        assert!(Instant::now() < deadline, "graceful stop never completed");
    }
    assert_eq!(server.dispatcher.num_channels(), 0);
    assert_eq!(server.dispatcher.num_servers(), 0);
    assert_eq!(client.dispatcher.num_channels(), 0);
}
