use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnecting {
        addr: SocketAddr,
    },
    ClientConnected {
        net_id: u16,
        addr: SocketAddr,
        guid: u64,
    },
    ClientDisconnected {
        net_id: u16,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    NetEvent {
        source: u16,
        name: String,
        target: Option<u16>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum DisconnectReason {
    Quit(String),
    Timeout,
    Overflow,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::Quit(reason) => reason,
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Overflow => "reliable command overflow",
            DisconnectReason::Shutdown => "server shutting down",
        }
    }
}
