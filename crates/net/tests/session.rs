use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether::net::{
    EventTarget, MAX_RELIABLE_PAYLOAD, MSG_IQUIT, OUT_OF_BAND_PREFIX, is_out_of_band,
};
use tether::{
    BootstrapReply, BootstrapRequest, BootstrapTransport, ConnectionState, DatagramTransport,
    DatagramWriter, NetAddress, NetClient, NetConfig, NetError, SessionHooks, SessionMessage,
    SessionReader, StaticIdentity, command_hash,
};

const SERVER: &str = "127.0.0.1:30120";

#[derive(Default)]
struct LinkState {
    inbound: VecDeque<(Vec<u8>, SocketAddr)>,
    sent: Vec<(Vec<u8>, SocketAddr)>,
}

#[derive(Clone, Default)]
struct MemoryLink {
    state: Arc<Mutex<LinkState>>,
}

impl DatagramTransport for MemoryLink {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.state.lock().unwrap().sent.push((data.to_vec(), addr));
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.state.lock().unwrap().inbound.pop_front() {
            Some((data, from)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(Some((data.len(), from)))
            }
            None => Ok(None),
        }
    }
}

impl MemoryLink {
    fn deliver_from(&self, data: &[u8], from: SocketAddr) {
        self.state.lock().unwrap().inbound.push_back((data.to_vec(), from));
    }

    fn deliver(&self, data: &[u8]) {
        self.deliver_from(data, SERVER.parse().unwrap());
    }

    fn deliver_text(&self, text: &str) {
        let mut data = OUT_OF_BAND_PREFIX.to_le_bytes().to_vec();
        data.extend_from_slice(text.as_bytes());
        self.deliver(&data);
    }

    fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().unwrap().sent)
            .into_iter()
            .map(|(data, _)| data)
            .collect()
    }
}

struct ScriptedBootstrap {
    body: String,
}

impl BootstrapTransport for ScriptedBootstrap {
    fn post(&mut self, _request: BootstrapRequest, reply: BootstrapReply) {
        reply.succeed(self.body.as_bytes().to_vec());
    }
}

#[derive(Clone, Default)]
struct RecordingHooks {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingHooks {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl SessionHooks for RecordingHooks {
    fn on_connect_ok(&mut self, _server: &NetAddress) {
        self.push("connect_ok".to_string());
    }

    fn on_connection_error(&mut self, message: &str) {
        self.push(format!("error:{}", message));
    }

    fn on_connection_timed_out(&mut self) {
        self.push("timed_out".to_string());
    }

    fn on_finalize_disconnect(&mut self, _server: &NetAddress) {
        self.push("finalize".to_string());
    }

    fn on_attempt_disconnect(&mut self, reason: &str) {
        self.push(format!("disconnect:{}", reason));
    }
}

struct Harness {
    client: NetClient,
    link: MemoryLink,
    hooks: RecordingHooks,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        Self::with_bootstrap(r#"{"token":"tok","protocol":3}"#)
    }

    fn with_bootstrap(body: &str) -> Self {
        Self::build(NetConfig::default(), body)
    }

    fn with_config(config: NetConfig) -> Self {
        Self::build(config, r#"{"token":"tok","protocol":3}"#)
    }

    fn build(config: NetConfig, body: &str) -> Self {
        let link = MemoryLink::default();
        let hooks = RecordingHooks::default();
        let client = NetClient::new(
            config,
            Box::new(link.clone()),
            Box::new(ScriptedBootstrap {
                body: body.to_string(),
            }),
            Arc::new(StaticIdentity::new(99, "player")),
        );
        client.set_hooks(Box::new(hooks.clone()));

        Self {
            client,
            link,
            hooks,
            now: Instant::now(),
        }
    }

    fn frame(&mut self) -> Result<(), NetError> {
        self.client.run_frame_at(self.now)
    }

    fn advance(&mut self, ms: u64) {
        self.now += Duration::from_millis(ms);
    }

    fn connect_until_connecting(&mut self) {
        self.client.connect_to_server("127.0.0.1", 30120).unwrap();
        assert_eq!(self.client.state(), ConnectionState::Initing);

        self.frame().unwrap();
        assert_eq!(self.client.state(), ConnectionState::InitReceived);
        self.frame().unwrap();
        assert_eq!(self.client.state(), ConnectionState::Downloading);

        self.client.downloads_complete();
        assert_eq!(self.client.state(), ConnectionState::DownloadComplete);
        self.frame().unwrap();
        assert_eq!(self.client.state(), ConnectionState::Connecting);
    }

    fn establish(&mut self) {
        self.connect_until_connecting();
        self.frame().unwrap();

        self.link.deliver_text("connectOK 7 1 1000");
        self.frame().unwrap();
        assert_eq!(self.client.state(), ConnectionState::Connected);

        self.link.deliver(&DatagramWriter::new(0).finish());
        self.frame().unwrap();
        assert_eq!(self.client.state(), ConnectionState::Active);

        self.link.take_sent();
    }

    /// Session datagrams the client sent, decoded.
    fn sent_messages(&self) -> Vec<(u32, Vec<SessionMessage>)> {
        self.link
            .take_sent()
            .into_iter()
            .filter(|data| !is_out_of_band(data))
            .map(|data| {
                let mut reader = SessionReader::new(&data, 3);
                let ack = reader.read_header().unwrap();
                let _frame_echo = reader.read_header().unwrap();
                let mut messages = Vec::new();
                loop {
                    match reader.next_message().unwrap() {
                        SessionMessage::End => break,
                        message => messages.push(message),
                    }
                }
                (ack, messages)
            })
            .collect()
    }
}

fn connect_requests(sent: &[Vec<u8>]) -> usize {
    sent.iter()
        .filter(|data| is_out_of_band(data) && data[4..].starts_with(b"connect token=tok&guid=99"))
        .count()
}

#[test]
fn test_connect_ok_then_first_datagram_activates() {
    let mut harness = Harness::new();
    harness.connect_until_connecting();

    harness.frame().unwrap();
    assert_eq!(connect_requests(&harness.link.take_sent()), 1);

    harness.link.deliver_text("connectOK 7 1 1000");
    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Connected);

    let info = harness.client.session_info();
    assert_eq!(info.server_net_id, 7);
    assert_eq!(info.host_net_id, 1);
    assert_eq!(info.host_base, 1000);
    assert_eq!(info.protocol, 3);

    harness.link.deliver(&DatagramWriter::new(0).finish());
    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Active);
    assert_eq!(harness.hooks.count("connect_ok"), 1);
}

#[test]
fn test_malformed_and_duplicate_connect_ok() {
    let mut harness = Harness::new();
    harness.connect_until_connecting();
    harness.frame().unwrap();

    harness.link.deliver_text("connectOK 7 1");
    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Connecting);

    harness.link.deliver_text("connectOK 7 1 1000");
    harness.link.deliver_text("connectOK 8 2 2000");
    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Connected);
    assert_eq!(harness.client.session_info().server_net_id, 7);
    assert_eq!(harness.hooks.count("connect_ok"), 1);
}

#[test]
fn test_datagrams_from_other_addresses_are_dropped() {
    let mut harness = Harness::new();
    harness.connect_until_connecting();
    harness.frame().unwrap();

    let mut spoofed = OUT_OF_BAND_PREFIX.to_le_bytes().to_vec();
    spoofed.extend_from_slice(b"connectOK 7 1 1000");
    harness
        .link
        .deliver_from(&spoofed, "10.0.0.1:30120".parse().unwrap());
    harness.frame().unwrap();

    assert_eq!(harness.client.state(), ConnectionState::Connecting);
    assert_eq!(harness.client.stats().packets_dropped, 1);
}

#[test]
fn test_idle_timeout_reported_once() {
    let mut harness = Harness::new();
    harness.establish();

    harness.advance(15000);
    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Active);

    harness.advance(1);
    let err = harness.frame().unwrap_err();
    assert!(matches!(err, NetError::IdleTimeout(15)));
    assert!(err.is_timeout());
    assert_eq!(harness.client.state(), ConnectionState::Idle);

    harness.advance(20000);
    harness.frame().unwrap();
    assert_eq!(harness.hooks.count("timed_out"), 1);
}

#[test]
fn test_connect_attempts_exhausted() {
    let mut harness = Harness::new();
    harness.connect_until_connecting();

    for attempt in 1..=3 {
        harness.frame().unwrap();
        assert_eq!(connect_requests(&harness.link.take_sent()), 1, "attempt {}", attempt);
        harness.advance(1000);
        harness.frame().unwrap();
        assert!(harness.link.take_sent().is_empty());
        harness.advance(4001);
    }

    // the fourth request goes out and the session gives up in the same frame
    let err = harness.frame().unwrap_err();
    assert_eq!(connect_requests(&harness.link.take_sent()), 1);
    assert!(matches!(err, NetError::ConnectTimeout(3)));
    assert_eq!(err.to_string(), "Failed to connect to server after 3 attempts.");
    assert_eq!(harness.client.state(), ConnectionState::Idle);
    assert_eq!(harness.hooks.count("timed_out"), 1);

    harness.advance(5001);
    harness.frame().unwrap();
    assert!(harness.link.take_sent().is_empty());
    assert_eq!(harness.hooks.count("timed_out"), 1);
}

#[test]
fn test_connected_waits_for_first_datagram() {
    let mut harness = Harness::new();
    harness.connect_until_connecting();
    harness.frame().unwrap();

    harness.link.deliver_text("connectOK 7 1 1000");
    harness.frame().unwrap();

    harness.advance(20000);
    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Connected);
    assert_eq!(harness.hooks.count("timed_out"), 0);

    harness.link.deliver(&DatagramWriter::new(0).finish());
    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Active);
}

#[test]
fn test_routed_round_trip() {
    let mut harness = Harness::new();
    harness.establish();

    let mut writer = DatagramWriter::new(0);
    writer.write_routed(42, b"hello");
    harness.link.deliver(&writer.finish());
    harness.advance(20);
    harness.frame().unwrap();

    let packet = harness.client.dequeue_routed_packet().unwrap();
    assert_eq!(packet.peer_id, 42);
    assert_eq!(packet.payload, b"hello");
    assert!(harness.client.dequeue_routed_packet().is_none());
    harness.link.take_sent();

    harness.client.route_packet(9, b"ping".to_vec()).unwrap();
    harness.advance(20);
    harness.frame().unwrap();

    let sent = harness.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].1,
        vec![SessionMessage::Routed {
            peer_id: 9,
            payload: b"ping".to_vec()
        }]
    );
}

#[test]
fn test_routed_mailbox_drops_beyond_backlog() {
    let mut harness = Harness::with_config(NetConfig {
        max_routed_backlog: 2,
        ..Default::default()
    });
    harness.establish();

    let mut writer = DatagramWriter::new(0);
    for payload in [b"a", b"b", b"c"] {
        writer.write_routed(4, payload);
    }
    harness.link.deliver(&writer.finish());
    harness.advance(20);
    harness.frame().unwrap();

    assert_eq!(harness.client.mailbox().inbound_len(), 2);
    assert_eq!(harness.client.stats().routed_dropped, 1);
    assert_eq!(harness.client.dequeue_routed_packet().unwrap().payload, b"a");
    assert_eq!(harness.client.dequeue_routed_packet().unwrap().payload, b"b");
    assert!(harness.client.dequeue_routed_packet().is_none());
}

#[test]
fn test_routed_packets_from_previous_session_discarded() {
    let mut harness = Harness::new();
    harness.establish();

    let mut writer = DatagramWriter::new(0);
    writer.write_routed(4, b"old-session");
    harness.link.deliver(&writer.finish());
    harness.advance(20);
    harness.frame().unwrap();
    assert_eq!(harness.client.mailbox().inbound_len(), 1);

    harness.client.connect_to_server("127.0.0.1", 30120).unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Initing);
    assert!(harness.client.dequeue_routed_packet().is_none());
}

#[test]
fn test_finalize_discards_undelivered_routed_packets() {
    let mut harness = Harness::new();
    harness.establish();

    let mut writer = DatagramWriter::new(0);
    writer.write_routed(4, b"late");
    harness.link.deliver(&writer.finish());
    harness.advance(20);
    harness.frame().unwrap();

    harness.client.finalize_disconnect_at(harness.now);
    assert!(harness.client.dequeue_routed_packet().is_none());
    assert!(!harness.client.wait_for_routed_packet(Duration::from_millis(1)));
}

#[test]
fn test_oversized_routed_payload_rejected() {
    let harness = Harness::new();
    let err = harness
        .client
        .route_packet(1, vec![0u8; u16::MAX as usize + 1])
        .unwrap_err();
    assert!(matches!(err, NetError::RoutedPayloadTooLarge(65536)));
}

#[test]
fn test_duplicate_reliable_runs_once() {
    let mut harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    harness
        .client
        .add_reliable_handler("msgChat", move |payload| {
            assert_eq!(payload, b"hi");
            counter.fetch_add(1, Ordering::SeqCst);
        });
    harness.establish();

    let mut writer = DatagramWriter::new(0);
    writer.write_reliable(command_hash("msgChat"), 1, b"hi");
    let datagram = writer.finish();
    harness.link.deliver(&datagram);
    harness.link.deliver(&datagram);
    harness.advance(20);
    harness.frame().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.client.stats().duplicate_reliables, 1);

    let sent = harness.sent_messages();
    assert_eq!(sent.last().unwrap().0, 1);
}

#[test]
fn test_out_of_window_reliable_rejects_datagram() {
    let mut harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    harness.client.add_reliable_handler("msgChat", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    harness.establish();

    let mut writer = DatagramWriter::new(0);
    writer.write_routed(5, b"dropped");
    writer.write_reliable(command_hash("msgChat"), 1, b"a");
    writer.write_reliable(command_hash("msgChat"), 66, b"b");
    harness.link.deliver(&writer.finish());
    harness.advance(20);
    harness.frame().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(harness.client.dequeue_routed_packet().is_none());
    assert_eq!(harness.client.stats().packets_dropped, 1);
    assert_eq!(harness.sent_messages().last().unwrap().0, 0);
    assert_eq!(harness.client.state(), ConnectionState::Active);
}

#[test]
fn test_malformed_datagram_still_applies_ack() {
    let mut harness = Harness::new();
    harness.establish();

    harness.client.send_reliable_command("msgChat", b"x").unwrap();
    harness.advance(20);
    harness.frame().unwrap();
    assert_eq!(harness.client.reliable_backlog(), 1);

    let mut truncated = 1u32.to_le_bytes().to_vec();
    truncated.extend_from_slice(&tether::net::MSG_ROUTE.to_le_bytes());
    truncated.extend_from_slice(&[1, 0, 200, 0, b'x']);
    harness.link.deliver(&truncated);
    harness.advance(20);
    harness.frame().unwrap();

    assert_eq!(harness.client.reliable_backlog(), 0);
    assert_eq!(harness.client.stats().packets_dropped, 1);
    assert_eq!(harness.client.state(), ConnectionState::Active);
}

#[test]
fn test_reliables_retransmitted_until_acknowledged() {
    let mut harness = Harness::new();
    harness.establish();

    let first = harness.client.send_reliable_command("msgChat", b"one").unwrap();
    let second = harness
        .client
        .send_net_event("chat", b"[]", EventTarget::Server)
        .unwrap();
    assert_eq!((first, second), (1, 2));

    for _ in 0..2 {
        harness.advance(20);
        harness.frame().unwrap();
    }

    let sent = harness.sent_messages();
    assert_eq!(sent.len(), 2);
    for (_, messages) in &sent {
        let tags: Vec<u32> = messages
            .iter()
            .map(|message| match message {
                SessionMessage::Reliable { tag, .. } => *tag,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(tags, vec![command_hash("msgChat"), command_hash("msgServerEvent")]);
    }

    harness.link.deliver(&DatagramWriter::new(1).finish());
    harness.advance(20);
    harness.frame().unwrap();

    let sent = harness.sent_messages();
    assert_eq!(sent[0].1.len(), 1);
    assert_eq!(harness.client.reliable_backlog(), 1);
}

#[test]
fn test_reliable_overflow_is_fatal() {
    let mut harness = Harness::new();
    harness.establish();

    for _ in 0..64 {
        harness.client.send_reliable_command("msgChat", b"x").unwrap();
    }
    let err = harness.client.send_reliable_command("msgChat", b"x").unwrap_err();
    assert!(matches!(err, NetError::ReliableOverflow));
    assert_eq!(harness.client.reliable_backlog(), 64);

    harness.advance(20);
    let err = harness.frame().unwrap_err();
    assert!(matches!(err, NetError::ReliableOverflow));
    assert_eq!(harness.client.state(), ConnectionState::Idle);
    assert_eq!(
        harness.hooks.count("error:Reliable client command overflow."),
        1
    );
}

#[test]
fn test_overflow_is_fatal_with_split_pump() {
    let mut harness = Harness::new();
    harness.establish();

    for _ in 0..64 {
        harness.client.send_reliable_command("msgChat", b"x").unwrap();
    }
    assert!(harness.client.send_reliable_command("msgChat", b"x").is_err());

    harness.advance(20);
    let err = harness.client.post_process_net_at(harness.now).unwrap_err();
    assert!(matches!(err, NetError::ReliableOverflow));
    assert_eq!(harness.client.state(), ConnectionState::Idle);

    harness.establish();
    for _ in 0..64 {
        harness.client.send_reliable_command("msgChat", b"x").unwrap();
    }
    assert!(harness.client.send_reliable_command("msgChat", b"x").is_err());

    harness.advance(20);
    let err = harness.client.pre_process_net_at(harness.now).unwrap_err();
    assert!(matches!(err, NetError::ReliableOverflow));
    assert_eq!(harness.client.state(), ConnectionState::Idle);
    assert_eq!(
        harness.hooks.count("error:Reliable client command overflow."),
        2
    );
}

#[test]
fn test_oversized_reliable_rejected_at_enqueue() {
    let mut harness = Harness::new();
    harness.establish();

    let err = harness
        .client
        .send_reliable_command("msgChat", &vec![0u8; MAX_RELIABLE_PAYLOAD + 1])
        .unwrap_err();
    assert!(matches!(err, NetError::ReliablePayloadTooLarge(_)));
    assert_eq!(harness.client.reliable_backlog(), 0);

    harness.advance(20);
    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Active);

    harness
        .client
        .send_reliable_command("msgChat", &vec![0u8; MAX_RELIABLE_PAYLOAD])
        .unwrap();
    assert_eq!(harness.client.reliable_backlog(), 1);
}

#[test]
fn test_finalize_sends_quit_twice() {
    let mut harness = Harness::new();
    harness.establish();

    harness.client.disconnect("Leaving");
    assert_eq!(harness.client.state(), ConnectionState::Active);
    harness.client.finalize_disconnect_at(harness.now);

    let sent = harness.sent_messages();
    assert_eq!(sent.len(), 2);
    for (_, messages) in &sent {
        assert_eq!(
            messages,
            &vec![SessionMessage::Reliable {
                tag: command_hash(MSG_IQUIT),
                id: 1,
                payload: b"Leaving\0".to_vec()
            }]
        );
    }

    assert_eq!(harness.client.state(), ConnectionState::Idle);
    assert_eq!(harness.client.server_address(), None);
    assert_eq!(
        harness.hooks.events(),
        vec!["connect_ok", "disconnect:Leaving", "finalize"]
    );
}

#[test]
fn test_server_error_is_fatal() {
    let mut harness = Harness::new();
    harness.connect_until_connecting();
    harness.frame().unwrap();

    harness.link.deliver_text("error Server is full");
    let err = harness.frame().unwrap_err();
    assert_eq!(err.to_string(), "Server is full");
    assert_eq!(harness.client.state(), ConnectionState::Idle);
}

#[test]
fn test_handshake_rejection_returns_to_idle() {
    let mut harness = Harness::with_bootstrap(r#"{"error":"Banned"}"#);
    harness.client.connect_to_server("127.0.0.1", 30120).unwrap();

    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Idle);
    assert_eq!(harness.hooks.count("error:Banned"), 1);
    assert_eq!(harness.hooks.count("finalize"), 0);
}

#[test]
fn test_reconnect_tears_down_previous_session() {
    let mut harness = Harness::new();
    harness.establish();
    harness.client.send_reliable_command("msgChat", b"x").unwrap();

    harness.client.connect_to_server("127.0.0.1", 30120).unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Initing);
    assert_eq!(harness.client.reliable_backlog(), 0);
    assert_eq!(harness.hooks.count("disconnect:Bye!"), 1);
    assert_eq!(harness.hooks.count("finalize"), 1);
}

#[test]
fn test_suspended_pump_skips_frames() {
    let mut harness = Harness::new();
    harness.client.connect_to_server("127.0.0.1", 30120).unwrap();

    {
        let _suspended = harness.client.suspend_pump();
        harness.client.run_frame_at(harness.now).unwrap();
        assert_eq!(harness.client.state(), ConnectionState::Initing);
    }

    harness.frame().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::InitReceived);
}

#[test]
fn test_pre_game_tick_runs_frames_while_connecting() {
    let harness = Harness::new();
    assert!(harness.client.process_pre_game_tick().unwrap());

    harness.client.connect_to_server("127.0.0.1", 30120).unwrap();
    assert!(!harness.client.process_pre_game_tick().unwrap());
    assert_eq!(harness.client.state(), ConnectionState::InitReceived);
}
