mod address;
mod channel;
mod client;
mod event;
mod handshake;
mod hooks;
mod identity;
mod mailbox;
mod metrics;
mod protocol;
mod reliable;
mod session;
mod transport;
mod wire;

pub use address::NetAddress;
pub use channel::{NetChannel, decode_session_body};
pub use client::{NetClient, PumpSuspension};
pub use event::{BROADCAST_PEER, EventTarget, MSG_NET_EVENT, MSG_SERVER_EVENT, encode_net_event};
pub use handshake::{
    BootstrapReply, BootstrapRequest, BootstrapTransport, GENERAL_HANDSHAKE_FAILURE,
    HandshakeClient, HandshakeOutcome, SessionGrant,
};
pub use hooks::{NoHooks, SessionHooks};
pub use identity::{IdentityProvider, StaticIdentity};
pub use mailbox::{RoutedMailbox, RoutingPacket};
pub use metrics::{MetricSink, NetworkStats, PacketCategory, PacketMetrics};
pub use protocol::{
    CommandIdFlags, DatagramWriter, FRAME_ECHO_MIN_PROTOCOL, FRAME_RTT_MIN_PROTOCOL,
    MAX_OUT_OF_BAND_TEXT, MAX_RELIABLE_PAYLOAD, MAX_UDP_PAYLOAD, MSG_END, MSG_FRAME, MSG_IQUIT,
    MSG_ROUTE, OUT_OF_BAND_PREFIX, OutOfBand, SessionMessage, SessionReader, command_hash,
    is_out_of_band,
};
pub use reliable::{
    Admission, OutReliableCommand, QueueOverflow, ReceiveWindow, ReliableCommandQueue,
    ReliableHandler, ReliableHandlers,
};
pub use session::{ConnectionState, SessionInfo};
pub use transport::{DatagramTransport, UdpTransport};
pub use wire::WireBufExt;
