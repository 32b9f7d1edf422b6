use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use super::address::NetAddress;
use super::channel::{NetChannel, decode_session_body};
use super::event::{EventTarget, encode_net_event};
use super::handshake::{BootstrapTransport, HandshakeClient, HandshakeOutcome};
use super::hooks::{NoHooks, SessionHooks};
use super::identity::IdentityProvider;
use super::mailbox::{RoutedMailbox, RoutingPacket};
use super::metrics::{MetricSink, NetworkStats, PacketCategory, PacketMetrics};
use super::protocol::{
    DatagramWriter, FRAME_ECHO_MIN_PROTOCOL, MAX_RELIABLE_PAYLOAD, MSG_IQUIT, OutOfBand, SessionMessage, SessionReader,
    command_hash, is_out_of_band,
};
use super::reliable::{Admission, ReliableCommandQueue, ReliableHandlers};
use super::session::{ConnectionState, Session, SessionInfo};
use super::transport::{DatagramTransport, UdpTransport};
use crate::config::NetConfig;
use crate::error::NetError;

const TIMED_OUT_REASON: &str = "Connection timed out.";

/// State reachable from consumer threads without taking the pump lock.
struct Shared {
    reliable: Mutex<ReliableCommandQueue>,
    mailbox: RoutedMailbox,
    pending_fatal: Mutex<Option<NetError>>,
    state: AtomicU8,
}

impl Shared {
    fn lock_reliable(&self) -> MutexGuard<'_, ReliableCommandQueue> {
        self.reliable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn park_fatal(&self, error: NetError) {
        let mut pending = self.pending_fatal.lock().unwrap_or_else(PoisonError::into_inner);
        pending.get_or_insert(error);
    }

    fn take_fatal(&self) -> Option<NetError> {
        self.pending_fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Everything the frame pump touches. Only reachable through the pump mutex.
pub(crate) struct Connection {
    config: NetConfig,
    session: Session,
    channel: NetChannel,
    handshake: HandshakeClient,
    identity: Arc<dyn IdentityProvider>,
    handlers: ReliableHandlers,
    hooks: Box<dyn SessionHooks>,
    metrics: Option<Box<dyn MetricSink>>,
    player_name: String,
    shared: Arc<Shared>,
}

impl Connection {
    fn set_state(&mut self, state: ConnectionState) {
        if self.session.state != state {
            log::debug!("Connection state {:?} -> {:?}", self.session.state, state);
        }
        self.session.state = state;
        self.shared.state.store(state.to_u8(), Ordering::Release);
    }

    fn connect_to_server(&mut self, host: &str, port: u16, now: Instant) -> Result<(), NetError> {
        if self.session.state != ConnectionState::Idle {
            self.disconnect("Bye!");
            self.finalize_disconnect(now);
        }

        let server = match NetAddress::resolve(host, port) {
            Ok(server) => server,
            Err(e) => {
                log::warn!("{}", e);
                self.hooks.on_connection_error(&e.to_string());
                return Err(e);
            }
        };

        self.session.begin(server);
        self.set_state(ConnectionState::Initing);
        self.shared.lock_reliable().reset();
        self.shared.mailbox.clear_outbound();
        self.shared.mailbox.clear_inbound();
        self.shared.take_fatal();
        self.channel.reset(Some(server));

        log::info!("Connecting to {}:{} ({})", host, port, server);
        self.hooks.on_session_created(&server);

        self.handshake.begin(
            host,
            port,
            &self.config.bootstrap_path,
            &self.player_name,
            self.config.protocol_version,
        );

        Ok(())
    }

    /// Acts on a fatal error parked by a consumer thread.
    fn check_parked_fatal(&mut self, now: Instant) -> Result<(), NetError> {
        match self.shared.take_fatal() {
            Some(error) => Err(self.fail(error, now)),
            None => Ok(()),
        }
    }

    fn run_frame(&mut self, now: Instant) -> Result<(), NetError> {
        self.check_parked_fatal(now)?;
        self.process_packets(now)?;
        self.process_send(now, false);
        self.advance(now)
    }

    fn advance(&mut self, now: Instant) -> Result<(), NetError> {
        match self.session.state {
            ConnectionState::Initing => self.poll_handshake(now)?,
            ConnectionState::InitReceived => {
                self.set_state(ConnectionState::Downloading);
                if let Some(server) = self.session.server {
                    self.hooks.on_init_received(&server);
                }
            }
            ConnectionState::DownloadComplete => {
                self.session.connect_attempts = 0;
                self.session.last_connect = None;
                self.set_state(ConnectionState::Connecting);
            }
            ConnectionState::Connecting => {
                let due = self.session.last_connect.is_none_or(|last| {
                    now.saturating_duration_since(last) > self.config.connect_retry_interval
                });

                if due {
                    self.send_connect_request(now);

                    if self.session.connect_attempts > self.config.max_connect_attempts {
                        let attempts = self.config.max_connect_attempts;
                        return Err(self.time_out(NetError::ConnectTimeout(attempts), now));
                    }
                }
            }
            ConnectionState::Active => {
                let silent_for = self
                    .session
                    .last_received_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::ZERO);

                if silent_for > self.config.idle_timeout {
                    let seconds = self.config.idle_timeout.as_secs();
                    return Err(self.time_out(NetError::IdleTimeout(seconds), now));
                }
            }
            ConnectionState::Idle | ConnectionState::Downloading | ConnectionState::Connected => {}
        }

        Ok(())
    }

    fn send_connect_request(&mut self, now: Instant) {
        let Some(server) = self.session.server else {
            return;
        };

        let request = OutOfBand::Connect {
            token: self.session.token.clone(),
            guid: self.identity.guid(),
        };

        self.session.connect_attempts += 1;
        self.session.last_connect = Some(now);

        log::info!(
            "Sending connect request to {} (attempt {})",
            server,
            self.session.connect_attempts
        );
        if let Err(e) = self.channel.send_out_of_band(server, &request) {
            log::warn!("Failed to send connect request: {}", e);
        }
    }

    fn poll_handshake(&mut self, now: Instant) -> Result<(), NetError> {
        let Some(outcome) = self.handshake.poll() else {
            return Ok(());
        };

        match outcome {
            HandshakeOutcome::Accepted(grant) => {
                log::info!("Handshake accepted, protocol {}", grant.protocol);
                self.session.token = grant.token;
                self.session.protocol = grant.protocol;
                self.set_state(ConnectionState::InitReceived);
                Ok(())
            }
            HandshakeOutcome::Rejected(message) | HandshakeOutcome::Failed(message) => {
                log::warn!("Handshake failed: {}", message);
                self.teardown();
                self.hooks.on_connection_error(&message);
                Ok(())
            }
            HandshakeOutcome::Violation(error) => Err(self.fail(error, now)),
        }
    }

    fn process_packets(&mut self, now: Instant) -> Result<(), NetError> {
        let datagrams = match self.channel.receive() {
            Ok(datagrams) => datagrams,
            Err(e) => {
                log::warn!("Socket receive failed: {}", e);
                return Ok(());
            }
        };

        for (data, from) in datagrams {
            if self.session.server != Some(from) {
                log::trace!("Dropping {} bytes from unexpected address {}", data.len(), from);
                self.channel.stats_mut().packets_dropped += 1;
                continue;
            }

            if is_out_of_band(&data) {
                self.process_out_of_band(&data[4..], from, now)?;
            } else if self.session.state.has_session() {
                self.process_server_message(&data, now);
            } else {
                log::trace!("Dropping in-session datagram in state {:?}", self.session.state);
                self.channel.stats_mut().packets_dropped += 1;
            }
        }

        Ok(())
    }

    fn process_out_of_band(&mut self, text: &[u8], from: NetAddress, now: Instant) -> Result<(), NetError> {
        let message = match OutOfBand::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping out-of-band datagram from {}: {}", from, e);
                self.channel.stats_mut().packets_dropped += 1;
                return Ok(());
            }
        };

        match message {
            OutOfBand::ConnectOk {
                client_net_id,
                host_net_id,
                host_base,
            } => {
                if self.session.state != ConnectionState::Connecting {
                    log::debug!("Ignoring connectOK in state {:?}", self.session.state);
                    return Ok(());
                }

                self.session.server_net_id = client_net_id;
                self.session.host_net_id = host_net_id;
                self.session.host_base = host_base;
                self.session.last_received_at = Some(now);
                self.set_state(ConnectionState::Connected);

                log::info!(
                    "Connected to {} as net id {} (host {}, base {})",
                    from,
                    client_net_id,
                    host_net_id,
                    host_base
                );
                self.hooks.on_connect_ok(&from);
            }
            OutOfBand::Error(message) => {
                if self.session.state != ConnectionState::Idle {
                    return Err(self.fail(NetError::Server(message), now));
                }
            }
            other => {
                log::debug!("Ignoring out-of-band message {:?}", other.to_text());
            }
        }

        Ok(())
    }

    fn process_server_message(&mut self, data: &[u8], now: Instant) {
        self.session.last_received_at = Some(now);

        let mut reader = SessionReader::new(data, self.session.protocol);
        let ack = match reader.read_header() {
            Ok(ack) => ack,
            Err(e) => {
                log::warn!("Dropping server datagram: {}", e);
                self.channel.stats_mut().packets_dropped += 1;
                return;
            }
        };

        self.shared.lock_reliable().acknowledge(ack);

        let messages = match decode_session_body(&mut reader, self.session.receive_window) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("Dropping server datagram: {}", e);
                self.channel.stats_mut().packets_dropped += 1;
                return;
            }
        };

        let mut metrics = PacketMetrics::default();
        metrics.add_element_size(PacketCategory::Misc, 4);

        for message in messages {
            let size = 4 + message.body_len();
            match message {
                SessionMessage::Routed { peer_id, payload } => {
                    metrics.add_element_size(PacketCategory::RoutedMessages, size);
                    if !self.shared.mailbox.enqueue_inbound(peer_id, payload) {
                        log::warn!("Routed mailbox full, dropping packet from {}", peer_id);
                        self.channel.stats_mut().routed_dropped += 1;
                    }
                }
                SessionMessage::Frame { number, rtt } => {
                    metrics.add_element_size(PacketCategory::Misc, size);
                    self.session.last_frame_number = number;
                    if let Some(rtt) = rtt {
                        self.channel.stats_mut().last_rtt_ms = Some(rtt);
                        if let Some(sink) = self.metrics.as_mut() {
                            sink.on_ping_result(rtt);
                        }
                    }
                }
                SessionMessage::Reliable { tag, id, payload } => {
                    metrics.add_element_size(PacketCategory::Reliables, size);
                    match self.session.receive_window.admit(id) {
                        Ok(Admission::Fresh) => {
                            if self.handlers.dispatch(tag, &payload) == 0 {
                                log::trace!("No handler for reliable command {:08x}", tag);
                            }
                            self.session.receive_window.advance(id);
                        }
                        Ok(Admission::Duplicate) => {
                            self.channel.stats_mut().duplicate_reliables += 1;
                        }
                        Err(e) => log::warn!("{}", e),
                    }
                }
                SessionMessage::End => {}
            }
        }

        if self.session.state == ConnectionState::Connected {
            self.set_state(ConnectionState::Active);
        }

        if let Some(sink) = self.metrics.as_mut() {
            sink.on_incoming_packet(&metrics);
        }
    }

    fn process_send(&mut self, now: Instant, force: bool) {
        if self.session.state != ConnectionState::Active {
            return;
        }

        if !force
            && self
                .session
                .last_send
                .is_some_and(|last| now.saturating_duration_since(last) < self.config.send_interval)
        {
            return;
        }

        let mut metrics = PacketMetrics::default();
        let mut writer = DatagramWriter::new(self.session.receive_window.last_received());
        metrics.add_element_size(PacketCategory::Misc, 4);

        if self.session.protocol >= FRAME_ECHO_MIN_PROTOCOL {
            writer.put_header(self.session.last_frame_number);
            metrics.add_element_size(PacketCategory::Misc, 4);
        }

        for packet in self.shared.mailbox.drain_outbound() {
            writer.write_routed(packet.peer_id, &packet.payload);
            metrics.add_element_size(PacketCategory::RoutedMessages, 8 + packet.payload.len());
        }

        {
            let queue = self.shared.lock_reliable();
            for command in queue.pending() {
                let before = writer.len();
                writer.write_reliable(command.type_tag, command.id, &command.payload);
                metrics.add_element_size(PacketCategory::Reliables, writer.len() - before);
            }
        }

        let before = writer.len();
        self.hooks.on_build_message(&mut writer);
        metrics.add_element_size(PacketCategory::Misc, writer.len() - before + 4);

        let data = writer.finish();
        if let Err(e) = self.channel.send(&data) {
            log::warn!("Failed to send {} bytes to server: {}", data.len(), e);
        }
        self.session.last_send = Some(now);

        if let Some(sink) = self.metrics.as_mut() {
            sink.on_outgoing_packet(&metrics);
        }
    }

    fn disconnect(&mut self, reason: &str) {
        log::info!("Disconnecting: {}", reason);
        self.session.disconnect_reason = reason.to_string();
        self.hooks.on_attempt_disconnect(reason);
    }

    fn finalize_disconnect(&mut self, now: Instant) {
        if self.session.state == ConnectionState::Idle {
            return;
        }

        if self.session.state == ConnectionState::Active {
            let mut reason = self.session.disconnect_reason.clone().into_bytes();
            reason.push(0);

            let queued = self.shared.lock_reliable().enqueue(command_hash(MSG_IQUIT), reason);
            match queued {
                Ok(_) => {
                    self.process_send(now, true);
                    self.process_send(now, true);
                }
                Err(e) => log::warn!("Could not queue quit notification: {}", e),
            }
        }

        if let Some(server) = self.session.server {
            log::info!("Session with {} finalized", server);
            self.hooks.on_finalize_disconnect(&server);
        }

        self.teardown();
    }

    /// Drops all session state and returns to `Idle` without notifying the
    /// server.
    fn teardown(&mut self) {
        self.handshake.cancel();
        self.session.reset();
        self.set_state(ConnectionState::Idle);
        self.shared.lock_reliable().reset();
        self.shared.mailbox.clear_outbound();
        self.shared.mailbox.clear_inbound();
        self.channel.clear_remote();
    }

    /// Single exit for fatal conditions: tears the session down and hands the
    /// error back for the caller to surface.
    fn fail(&mut self, error: NetError, now: Instant) -> NetError {
        log::error!("{}", error);
        self.session.disconnect_reason = error.to_string();
        self.finalize_disconnect(now);
        self.hooks.on_connection_error(&error.to_string());
        error
    }

    fn time_out(&mut self, error: NetError, now: Instant) -> NetError {
        log::error!("{}", error);
        self.session.disconnect_reason = TIMED_OUT_REASON.to_string();
        self.finalize_disconnect(now);
        self.hooks.on_connection_timed_out();
        error
    }
}

/// Holds the frame pump until dropped. Frames requested meanwhile are skipped.
pub struct PumpSuspension<'a> {
    _guard: MutexGuard<'a, Connection>,
}

/// The client side of a server session.
///
/// The frame pump (`run_frame` and friends) runs on one thread; the mailbox,
/// reliable command submission and state queries are safe from any other.
pub struct NetClient {
    pump: Mutex<Connection>,
    shared: Arc<Shared>,
}

impl NetClient {
    pub fn new(
        config: NetConfig,
        transport: Box<dyn DatagramTransport>,
        bootstrap: Box<dyn BootstrapTransport>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let shared = Arc::new(Shared {
            reliable: Mutex::new(ReliableCommandQueue::new(config.max_reliable_commands)),
            mailbox: RoutedMailbox::new(config.max_routed_backlog),
            pending_fatal: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Idle.to_u8()),
        });

        let connection = Connection {
            session: Session::new(config.reliable_receive_window),
            channel: NetChannel::new(transport, config.max_datagram_size),
            handshake: HandshakeClient::new(bootstrap, Arc::clone(&identity)),
            player_name: identity.display_name(),
            identity,
            handlers: ReliableHandlers::new(),
            hooks: Box::new(NoHooks),
            metrics: None,
            shared: Arc::clone(&shared),
            config,
        };

        Self {
            pump: Mutex::new(connection),
            shared,
        }
    }

    /// Creates a client on a fresh non-blocking UDP socket pair.
    pub fn bind_udp(
        config: NetConfig,
        bootstrap: Box<dyn BootstrapTransport>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, NetError> {
        let transport = UdpTransport::bind()?;
        if let Ok(addr) = transport.local_addr() {
            log::info!("Client socket bound to {}", addr);
        }
        Ok(Self::new(config, Box::new(transport), bootstrap, identity))
    }

    fn lock_pump(&self) -> MutexGuard<'_, Connection> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_pump(&self) -> Option<MutexGuard<'_, Connection>> {
        match self.pump.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn set_hooks(&self, hooks: Box<dyn SessionHooks>) {
        self.lock_pump().hooks = hooks;
    }

    pub fn set_metric_sink(&self, sink: Box<dyn MetricSink>) {
        self.lock_pump().metrics = Some(sink);
    }

    pub fn player_name(&self) -> String {
        self.lock_pump().player_name.clone()
    }

    pub fn set_player_name(&self, name: impl Into<String>) {
        self.lock_pump().player_name = name.into();
    }

    /// Registers a handler for inbound reliable commands of `type_name`.
    pub fn add_reliable_handler<F>(&self, type_name: &str, handler: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.lock_pump().handlers.add(type_name, handler);
    }

    /// Starts a new session, tearing down the current one first.
    pub fn connect_to_server(&self, host: &str, port: u16) -> Result<(), NetError> {
        self.lock_pump().connect_to_server(host, port, Instant::now())
    }

    /// Records the reason sent with the quit notification and notifies the
    /// host. The session stays up until [`NetClient::finalize_disconnect`].
    pub fn disconnect(&self, reason: &str) {
        self.lock_pump().disconnect(reason);
    }

    pub fn finalize_disconnect(&self) {
        self.finalize_disconnect_at(Instant::now());
    }

    pub fn finalize_disconnect_at(&self, now: Instant) {
        self.lock_pump().finalize_disconnect(now);
    }

    /// Signals that the host finished fetching whatever it needed after the
    /// handshake. Ignored outside the downloading state.
    pub fn downloads_complete(&self) {
        let mut connection = self.lock_pump();
        if connection.session.state == ConnectionState::Downloading {
            connection.set_state(ConnectionState::DownloadComplete);
        }
    }

    pub fn run_frame(&self) -> Result<(), NetError> {
        self.run_frame_at(Instant::now())
    }

    /// Receives, sends and advances the state machine as of `now`. Skipped
    /// when the pump is held elsewhere.
    pub fn run_frame_at(&self, now: Instant) -> Result<(), NetError> {
        match self.try_lock_pump() {
            Some(mut connection) => connection.run_frame(now),
            None => Ok(()),
        }
    }

    pub fn pre_process_net(&self) -> Result<(), NetError> {
        self.pre_process_net_at(Instant::now())
    }

    /// Receive half of a frame.
    pub fn pre_process_net_at(&self, now: Instant) -> Result<(), NetError> {
        let Some(mut connection) = self.try_lock_pump() else {
            return Ok(());
        };
        connection.check_parked_fatal(now)?;
        connection.process_packets(now)
    }

    pub fn post_process_net(&self) -> Result<(), NetError> {
        self.post_process_net_at(Instant::now())
    }

    /// Send half of a frame.
    pub fn post_process_net_at(&self, now: Instant) -> Result<(), NetError> {
        let Some(mut connection) = self.try_lock_pump() else {
            return Ok(());
        };
        connection.check_parked_fatal(now)?;
        connection.process_send(now, false);
        Ok(())
    }

    /// Runs a frame while the connection is still being set up. Returns true
    /// once the game may tick (idle or in session).
    pub fn process_pre_game_tick(&self) -> Result<bool, NetError> {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Connected | ConnectionState::Active => Ok(true),
            _ => {
                self.run_frame()?;
                Ok(false)
            }
        }
    }

    pub fn suspend_pump(&self) -> PumpSuspension<'_> {
        PumpSuspension {
            _guard: self.lock_pump(),
        }
    }

    /// Queues a reliable command. Overflowing the queue is fatal: the error
    /// is returned here and the next frame tears the session down.
    pub fn send_reliable_command(&self, type_name: &str, payload: &[u8]) -> Result<u32, NetError> {
        if payload.len() > MAX_RELIABLE_PAYLOAD {
            return Err(NetError::ReliablePayloadTooLarge(payload.len()));
        }

        let result = self
            .shared
            .lock_reliable()
            .enqueue(command_hash(type_name), payload.to_vec());

        result.map_err(|overflow| {
            log::error!("Reliable client command overflow: {}", overflow);
            self.shared.park_fatal(NetError::ReliableOverflow);
            NetError::ReliableOverflow
        })
    }

    pub fn send_net_event(&self, name: &str, payload: &[u8], target: EventTarget) -> Result<u32, NetError> {
        let (command, data) = encode_net_event(name, payload, target);
        self.send_reliable_command(command, &data)
    }

    /// Queues a routed payload for the next send tick.
    pub fn route_packet(&self, peer_id: u16, payload: Vec<u8>) -> Result<(), NetError> {
        if payload.len() > u16::MAX as usize {
            return Err(NetError::RoutedPayloadTooLarge(payload.len()));
        }
        self.shared.mailbox.route(peer_id, payload);
        Ok(())
    }

    pub fn mailbox(&self) -> &RoutedMailbox {
        &self.shared.mailbox
    }

    pub fn wait_for_routed_packet(&self, timeout: Duration) -> bool {
        self.shared.mailbox.wait_for_routed_packet(timeout)
    }

    pub fn dequeue_routed_packet(&self) -> Option<RoutingPacket> {
        self.shared.mailbox.dequeue()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn server_address(&self) -> Option<NetAddress> {
        self.lock_pump().session.server
    }

    pub fn session_info(&self) -> SessionInfo {
        self.lock_pump().session.info()
    }

    pub fn set_host(&self, net_id: u16, base: u32) {
        let mut connection = self.lock_pump();
        connection.session.host_net_id = net_id;
        connection.session.host_base = base;
    }

    pub fn set_base(&self, base: u32) {
        self.lock_pump().session.server_base = base;
    }

    pub fn stats(&self) -> NetworkStats {
        self.lock_pump().channel.stats().clone()
    }

    pub fn reliable_backlog(&self) -> u32 {
        self.shared.lock_reliable().unacknowledged()
    }
}
