use std::time::Instant;

use super::address::NetAddress;
use super::reliable::ReceiveWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Initing,
    InitReceived,
    Downloading,
    DownloadComplete,
    Connecting,
    Connected,
    Active,
}

impl ConnectionState {
    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Initing,
            2 => ConnectionState::InitReceived,
            3 => ConnectionState::Downloading,
            4 => ConnectionState::DownloadComplete,
            5 => ConnectionState::Connecting,
            6 => ConnectionState::Connected,
            7 => ConnectionState::Active,
            _ => ConnectionState::Idle,
        }
    }

    /// Connected or active: the server has accepted us.
    pub fn has_session(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Active)
    }
}

/// Snapshot of the ids the server assigned to this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub server_net_id: u16,
    pub host_net_id: u16,
    pub host_base: u32,
    pub server_base: u32,
    pub protocol: u32,
    pub last_frame_number: u32,
}

#[derive(Debug)]
pub(crate) struct Session {
    pub server: Option<NetAddress>,
    pub state: ConnectionState,
    pub protocol: u32,
    pub token: String,
    pub server_net_id: u16,
    pub host_net_id: u16,
    pub host_base: u32,
    pub server_base: u32,
    pub last_frame_number: u32,
    pub last_send: Option<Instant>,
    pub last_received_at: Option<Instant>,
    pub last_connect: Option<Instant>,
    pub connect_attempts: u32,
    pub receive_window: ReceiveWindow,
    pub disconnect_reason: String,
}

impl Session {
    pub fn new(receive_window: u32) -> Self {
        Self {
            server: None,
            state: ConnectionState::Idle,
            protocol: 0,
            token: String::new(),
            server_net_id: 0,
            host_net_id: 0,
            host_base: 0,
            server_base: 0,
            last_frame_number: 0,
            last_send: None,
            last_received_at: None,
            last_connect: None,
            connect_attempts: 0,
            receive_window: ReceiveWindow::new(receive_window),
            disconnect_reason: String::new(),
        }
    }

    pub fn begin(&mut self, server: NetAddress) {
        self.reset();
        self.server = Some(server);
        self.state = ConnectionState::Initing;
    }

    pub fn reset(&mut self) {
        let server_base = self.server_base;
        *self = Self::new(self.receive_window.size());
        // locally configured, not assigned by the server
        self.server_base = server_base;
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            server_net_id: self.server_net_id,
            host_net_id: self.host_net_id,
            host_base: self.host_base,
            server_base: self.server_base,
            protocol: self.protocol,
            last_frame_number: self.last_frame_number,
        }
    }
}
