use bytes::{BufMut, BytesMut};

pub const MSG_NET_EVENT: &str = "msgNetEvent";
pub const MSG_SERVER_EVENT: &str = "msgServerEvent";

pub const BROADCAST_PEER: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Peer(u16),
    Broadcast,
    Server,
}

/// Encodes a named event into a reliable command. Returns the command type
/// name and its payload.
pub fn encode_net_event(name: &str, payload: &[u8], target: EventTarget) -> (&'static str, Vec<u8>) {
    let mut buf = BytesMut::with_capacity(name.len() + payload.len() + 5);

    let command = match target {
        EventTarget::Peer(peer_id) => {
            buf.put_u16_le(peer_id);
            MSG_NET_EVENT
        }
        EventTarget::Broadcast => {
            buf.put_u16_le(BROADCAST_PEER);
            MSG_NET_EVENT
        }
        EventTarget::Server => MSG_SERVER_EVENT,
    };

    buf.put_u16_le((name.len() + 1) as u16);
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
    buf.put_slice(payload);

    (command, buf.to_vec())
}
