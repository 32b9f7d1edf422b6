use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Buf;
use tether::net::{
    Admission, BROADCAST_PEER, FRAME_ECHO_MIN_PROTOCOL, FRAME_RTT_MIN_PROTOCOL, MSG_IQUIT,
    MSG_NET_EVENT, MSG_SERVER_EVENT, WireBufExt, decode_session_body, is_out_of_band,
};
use tether::{DatagramWriter, NetworkStats, OutOfBand, SessionMessage, SessionReader, command_hash};

use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};
use crate::sessions::SessionTable;

const FRAME_HISTORY: usize = 128;

/// A named event as carried in `msgNetEvent` / `msgServerEvent` payloads.
#[derive(Debug, PartialEq, Eq)]
struct NetEvent {
    target: Option<u16>,
    name: String,
    payload: Vec<u8>,
}

fn parse_net_event(mut data: &[u8], targeted: bool) -> Option<NetEvent> {
    let target = if targeted {
        Some(data.try_get_u16_le().ok()?)
    } else {
        None
    };
    let name_length = data.try_get_u16_le().ok()? as usize;
    let name = data.try_get_bytes(name_length).ok()?;
    let name = String::from_utf8_lossy(&name)
        .trim_end_matches('\0')
        .to_string();

    Some(NetEvent {
        target,
        name,
        payload: data.to_vec(),
    })
}

/// Development server speaking the client wire format: accepts out-of-band
/// connects, acknowledges reliable commands, relays routed payloads between
/// clients and sends one frame message per tick.
pub struct DevServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    sessions: SessionTable,
    config: ServerConfig,
    frame: u32,
    frame_history: VecDeque<(u32, Instant)>,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    recv_buffer: Vec<u8>,
    stats: NetworkStats,
    pending_events: VecDeque<ServerEvent>,
}

impl DevServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64);

        Ok(Self {
            socket,
            local_addr,
            sessions: SessionTable::new(
                config.max_clients,
                config.reliable_window,
                config.max_reliable_commands,
            ),
            frame: 0,
            frame_history: VecDeque::with_capacity(FRAME_HISTORY),
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            recv_buffer: vec![0u8; 65536],
            stats: NetworkStats::default(),
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network(now) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Network error: {}", e),
            });
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick(now);
        }
    }

    fn tick(&mut self, now: Instant) {
        self.frame = self.frame.wrapping_add(1);
        if self.frame_history.len() == FRAME_HISTORY {
            self.frame_history.pop_front();
        }
        self.frame_history.push_back((self.frame, now));

        for net_id in self.sessions.net_ids() {
            self.send_frame(net_id);
        }

        for net_id in self.sessions.cleanup_timed_out(now, self.config.client_timeout) {
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                net_id,
                reason: DisconnectReason::Timeout,
            });
        }
    }

    fn send_frame(&mut self, net_id: u16) {
        let Some(session) = self.sessions.get_mut(net_id) else {
            return;
        };

        let mut writer = DatagramWriter::new(session.receive_window.last_received());
        for (peer_id, payload) in session.routed.drain(..) {
            writer.write_routed(peer_id, &payload);
        }

        let rtt = if self.config.protocol >= FRAME_RTT_MIN_PROTOCOL {
            Some(session.rtt_ms.unwrap_or(0))
        } else {
            None
        };
        writer.write_frame(self.frame, rtt);

        for command in session.outgoing.pending() {
            writer.write_reliable(command.type_tag, command.id, &command.payload);
        }

        let addr = session.addr;
        let data = writer.finish();
        self.send_to(&data, addr);
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) {
        match self.socket.send_to(data, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
            }
            Err(e) => {
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("Failed to send to {}: {}", addr, e),
                });
            }
        }
    }

    fn send_out_of_band(&mut self, addr: SocketAddr, message: &OutOfBand) {
        match message.encode() {
            Ok(data) => self.send_to(&data, addr),
            Err(e) => log::warn!("Not sending out-of-band message: {}", e),
        }
    }

    fn process_network(&mut self, now: Instant) -> io::Result<()> {
        loop {
            let (size, addr) = match self.socket.recv_from(&mut self.recv_buffer) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            };

            self.stats.packets_received += 1;
            self.stats.bytes_received += size as u64;

            let data = self.recv_buffer[..size].to_vec();
            if is_out_of_band(&data) {
                self.handle_out_of_band(addr, &data[4..], now);
            } else {
                self.handle_session_datagram(addr, &data, now);
            }
        }

        Ok(())
    }

    fn handle_out_of_band(&mut self, addr: SocketAddr, text: &[u8], now: Instant) {
        match OutOfBand::parse(text) {
            Ok(OutOfBand::Connect { token, guid }) => self.handle_connect(addr, &token, guid, now),
            Ok(other) => log::debug!("Ignoring out-of-band {:?} from {}", other.to_text(), addr),
            Err(e) => {
                log::warn!("Dropping out-of-band datagram from {}: {}", addr, e);
                self.stats.packets_dropped += 1;
            }
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, token: &str, guid: u64, now: Instant) {
        self.pending_events.push_back(ServerEvent::ClientConnecting { addr });

        let token_ok = match &self.config.token {
            Some(expected) => expected == token,
            None => true,
        };
        if !token_ok {
            self.deny(addr, "Invalid session token.");
            return;
        }

        let net_id = match self.sessions.get_or_create(addr, guid, now) {
            Ok((session, created)) => {
                session.last_receive_time = now;
                if created {
                    self.pending_events.push_back(ServerEvent::ClientConnected {
                        net_id: session.net_id,
                        addr,
                        guid,
                    });
                }
                session.net_id
            }
            Err(reason) => {
                self.deny(addr, reason);
                return;
            }
        };

        let reply = OutOfBand::ConnectOk {
            client_net_id: net_id,
            host_net_id: self.sessions.host_net_id(),
            host_base: self.config.host_base,
        };
        self.send_out_of_band(addr, &reply);
    }

    fn deny(&mut self, addr: SocketAddr, reason: &str) {
        self.send_out_of_band(addr, &OutOfBand::Error(reason.to_string()));
        self.pending_events.push_back(ServerEvent::ConnectionDenied {
            addr,
            reason: reason.to_string(),
        });
    }

    fn handle_session_datagram(&mut self, addr: SocketAddr, data: &[u8], now: Instant) {
        let protocol = self.config.protocol;
        let mut reader = SessionReader::new(data, protocol);

        let Ok(ack) = reader.read_header() else {
            self.stats.packets_dropped += 1;
            return;
        };
        let echo = if protocol >= FRAME_ECHO_MIN_PROTOCOL {
            match reader.read_header() {
                Ok(echo) => Some(echo),
                Err(_) => {
                    self.stats.packets_dropped += 1;
                    return;
                }
            }
        } else {
            None
        };

        let rtt = echo.and_then(|echo| {
            self.frame_history
                .iter()
                .find(|(frame, _)| *frame == echo)
                .map(|(_, sent_at)| now.saturating_duration_since(*sent_at).as_millis() as i32)
        });

        let Some(session) = self.sessions.get_by_addr_mut(&addr) else {
            log::trace!("Dropping datagram from unknown client {}", addr);
            self.stats.packets_dropped += 1;
            return;
        };

        session.last_receive_time = now;
        session.outgoing.acknowledge(ack);
        if let Some(echo) = echo {
            session.frame_echo = echo;
        }
        if rtt.is_some() {
            session.rtt_ms = rtt;
        }

        let messages = match decode_session_body(&mut reader, session.receive_window) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("Dropping datagram from {}: {}", addr, e);
                self.stats.packets_dropped += 1;
                return;
            }
        };

        let sender = session.net_id;
        let mut routed = Vec::new();
        let mut commands = Vec::new();

        for message in messages {
            match message {
                SessionMessage::Routed { peer_id, payload } => routed.push((peer_id, payload)),
                SessionMessage::Reliable { tag, id, payload } => {
                    match session.receive_window.admit(id) {
                        Ok(Admission::Fresh) => {
                            session.receive_window.advance(id);
                            commands.push((tag, payload));
                        }
                        Ok(Admission::Duplicate) => self.stats.duplicate_reliables += 1,
                        Err(e) => log::warn!("{}", e),
                    }
                }
                SessionMessage::Frame { .. } | SessionMessage::End => {}
            }
        }

        for (target, payload) in routed {
            self.route(sender, target, payload);
        }
        for (tag, payload) in commands {
            self.handle_reliable(sender, tag, &payload);
        }
    }

    /// Relays a routed payload to another client, or echoes it back when the
    /// target is not connected.
    fn route(&mut self, sender: u16, target: u16, payload: Vec<u8>) {
        if target != sender && self.sessions.contains(target) {
            if let Some(session) = self.sessions.get_mut(target) {
                session.routed.push_back((sender, payload));
            }
        } else if let Some(session) = self.sessions.get_mut(sender) {
            session.routed.push_back((target, payload));
        }
    }

    fn handle_reliable(&mut self, sender: u16, tag: u32, payload: &[u8]) {
        if tag == command_hash(MSG_IQUIT) {
            let reason = String::from_utf8_lossy(payload)
                .trim_end_matches('\0')
                .to_string();
            if self.sessions.remove(sender).is_some() {
                self.pending_events.push_back(ServerEvent::ClientDisconnected {
                    net_id: sender,
                    reason: DisconnectReason::Quit(reason),
                });
            }
        } else if tag == command_hash(MSG_NET_EVENT) {
            match parse_net_event(payload, true) {
                Some(event) => self.relay_net_event(sender, event),
                None => log::warn!("Malformed net event from {}", sender),
            }
        } else if tag == command_hash(MSG_SERVER_EVENT) {
            match parse_net_event(payload, false) {
                Some(event) => self.pending_events.push_back(ServerEvent::NetEvent {
                    source: sender,
                    name: event.name,
                    target: None,
                }),
                None => log::warn!("Malformed server event from {}", sender),
            }
        } else {
            log::debug!("Unhandled reliable command {:08x} from {}", tag, sender);
        }
    }

    /// Forwards a client event to its target. The target field is replaced
    /// with the sender's net id.
    fn relay_net_event(&mut self, sender: u16, event: NetEvent) {
        let target = event.target.unwrap_or(BROADCAST_PEER);
        self.pending_events.push_back(ServerEvent::NetEvent {
            source: sender,
            name: event.name.clone(),
            target: event.target,
        });

        let recipients: Vec<u16> = if target == BROADCAST_PEER {
            self.sessions.net_ids()
        } else {
            vec![target]
        };

        let mut relayed = Vec::with_capacity(event.name.len() + event.payload.len() + 5);
        relayed.extend_from_slice(&sender.to_le_bytes());
        relayed.extend_from_slice(&((event.name.len() + 1) as u16).to_le_bytes());
        relayed.extend_from_slice(event.name.as_bytes());
        relayed.push(0);
        relayed.extend_from_slice(&event.payload);

        for net_id in recipients {
            self.queue_reliable(net_id, MSG_NET_EVENT, relayed.clone());
        }
    }

    fn queue_reliable(&mut self, net_id: u16, command: &str, payload: Vec<u8>) {
        let Some(session) = self.sessions.get_mut(net_id) else {
            return;
        };

        if let Err(e) = session.outgoing.enqueue(command_hash(command), payload) {
            log::warn!("Dropping client {}: {}", net_id, e);
            self.sessions.remove(net_id);
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                net_id,
                reason: DisconnectReason::Overflow,
            });
        }
    }

    pub fn shutdown_connections(&mut self) {
        for net_id in self.sessions.net_ids() {
            if let Some(session) = self.sessions.remove(net_id) {
                self.send_out_of_band(
                    session.addr,
                    &OutOfBand::Error("Server shutting down.".to_string()),
                );
                self.pending_events.push_back(ServerEvent::ClientDisconnected {
                    net_id,
                    reason: DisconnectReason::Shutdown,
                });
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            frame: self.frame,
            client_count: self.sessions.len(),
            max_clients: self.config.max_clients,
            network_stats: self.stats.clone(),
        }
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.sessions
            .iter()
            .map(|session| ClientInfo {
                net_id: session.net_id,
                addr: session.addr,
                guid: session.guid,
                frame_echo: session.frame_echo,
                rtt_ms: session.rtt_ms,
                unacknowledged: session.outgoing.unacknowledged(),
            })
            .collect()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub frame: u32,
    pub client_count: usize,
    pub max_clients: usize,
    pub network_stats: NetworkStats,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub net_id: u16,
    pub addr: SocketAddr,
    pub guid: u64,
    pub frame_echo: u32,
    pub rtt_ms: Option<i32>,
    pub unacknowledged: u32,
}
