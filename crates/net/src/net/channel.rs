use std::io;

use super::address::NetAddress;
use super::metrics::NetworkStats;
use super::protocol::{OutOfBand, SessionMessage, SessionReader};
use super::reliable::{Admission, ReceiveWindow};
use super::transport::DatagramTransport;
use crate::error::{NetError, PacketError};

/// The datagram path to the current server: sends to the bound address,
/// drains the socket and keeps traffic counters.
pub struct NetChannel {
    transport: Box<dyn DatagramTransport>,
    remote: Option<NetAddress>,
    stats: NetworkStats,
    recv_buffer: Vec<u8>,
}

impl NetChannel {
    pub fn new(transport: Box<dyn DatagramTransport>, max_datagram_size: usize) -> Self {
        Self {
            transport,
            remote: None,
            stats: NetworkStats::default(),
            recv_buffer: vec![0u8; max_datagram_size],
        }
    }

    pub fn reset(&mut self, remote: Option<NetAddress>) {
        self.remote = remote;
        self.stats = NetworkStats::default();
    }

    pub fn clear_remote(&mut self) {
        self.remote = None;
    }

    pub fn remote(&self) -> Option<NetAddress> {
        self.remote
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NetworkStats {
        &mut self.stats
    }

    pub fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let remote = self
            .remote
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "No remote address set"))?;
        self.send_to(data, remote)
    }

    fn send_to(&mut self, data: &[u8], addr: NetAddress) -> io::Result<usize> {
        let bytes = self.transport.send_to(data, addr.socket_addr())?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        Ok(bytes)
    }

    pub fn send_out_of_band(&mut self, addr: NetAddress, message: &OutOfBand) -> Result<(), NetError> {
        let data = message
            .encode()
            .map_err(|_| NetError::OutOfBandOverrun(message.to_text().len()))?;
        self.send_to(&data, addr)?;
        Ok(())
    }

    /// Reads until the transport has nothing pending.
    pub fn receive(&mut self) -> io::Result<Vec<(Vec<u8>, NetAddress)>> {
        let mut datagrams = Vec::new();

        while let Some((size, addr)) = self.transport.recv_from(&mut self.recv_buffer)? {
            self.stats.packets_received += 1;
            self.stats.bytes_received += size as u64;
            datagrams.push((self.recv_buffer[..size].to_vec(), NetAddress::new(addr)));
        }

        Ok(datagrams)
    }
}

/// Decodes the messages of an in-session datagram whose ack header has already
/// been read. Reliable ids are checked against `window` as it would advance
/// while the datagram is applied, so either every message is returned or the
/// datagram is rejected as a whole. Running out of bytes on a message boundary
/// ends the datagram like an end tag does.
pub fn decode_session_body(
    reader: &mut SessionReader<'_>,
    window: ReceiveWindow,
) -> Result<Vec<SessionMessage>, PacketError> {
    let mut projected = window;
    let mut messages = Vec::new();

    while !reader.is_empty() {
        let message = reader.next_message()?;
        match &message {
            SessionMessage::End => break,
            SessionMessage::Reliable { id, .. } => {
                if projected.admit(*id)? == Admission::Fresh {
                    projected.advance(*id);
                }
            }
            _ => {}
        }
        messages.push(message);
    }

    Ok(messages)
}
