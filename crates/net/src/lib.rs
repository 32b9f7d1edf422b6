pub mod config;
pub mod error;
pub mod net;

pub use config::{DEFAULT_PORT, NetConfig};
pub use error::{NetError, PacketError};
pub use net::{
    BootstrapReply, BootstrapRequest, BootstrapTransport, ConnectionState, DatagramTransport,
    DatagramWriter, EventTarget, HandshakeClient, HandshakeOutcome, IdentityProvider, MetricSink,
    NetAddress, NetClient, NetworkStats, NoHooks, OutOfBand, PacketCategory, PacketMetrics,
    PumpSuspension, RoutedMailbox, RoutingPacket, SessionHooks, SessionInfo, SessionMessage,
    SessionReader, StaticIdentity, UdpTransport, command_hash,
};
