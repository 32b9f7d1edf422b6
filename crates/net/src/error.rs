use std::io;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("buffer underflow: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("reliable command {id} is outside the receive window (last executed {last})")]
    OutOfWindow { id: u32, last: u32 },
    #[error("malformed out-of-band message: {0}")]
    MalformedOutOfBand(String),
}

impl From<bytes::TryGetError> for PacketError {
    fn from(e: bytes::TryGetError) -> Self {
        PacketError::Truncated {
            need: e.requested,
            have: e.available,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to connect to server after {0} attempts.")]
    ConnectTimeout(u32),
    #[error("Server connection timed out after {0} seconds.")]
    IdleTimeout(u64),
    #[error("Reliable client command overflow.")]
    ReliableOverflow,
    #[error("server requested an auth ticket again after one was supplied")]
    RepeatedAuthChallenge,
    #[error("{0}")]
    Server(String),
    #[error("out-of-band message too long ({0} bytes)")]
    OutOfBandOverrun(usize),
    #[error("routed payload of {0} bytes does not fit a routed message")]
    RoutedPayloadTooLarge(usize),
    #[error("reliable command of {0} bytes does not fit a datagram")]
    ReliablePayloadTooLarge(usize),
}

impl NetError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::ConnectTimeout(_) | NetError::IdleTimeout(_))
    }
}
