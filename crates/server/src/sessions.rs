use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tether::net::{ReceiveWindow, ReliableCommandQueue};

/// Server-side view of one connected client.
#[derive(Debug)]
pub struct ClientSession {
    pub addr: SocketAddr,
    pub net_id: u16,
    pub guid: u64,
    pub receive_window: ReceiveWindow,
    pub outgoing: ReliableCommandQueue,
    pub routed: VecDeque<(u16, Vec<u8>)>,
    pub frame_echo: u32,
    pub rtt_ms: Option<i32>,
    pub last_receive_time: Instant,
    pub connected_at: Instant,
}

impl ClientSession {
    fn new(addr: SocketAddr, net_id: u16, guid: u64, window: u32, max_reliable: u32, now: Instant) -> Self {
        Self {
            addr,
            net_id,
            guid,
            receive_window: ReceiveWindow::new(window),
            outgoing: ReliableCommandQueue::new(max_reliable),
            routed: VecDeque::new(),
            frame_echo: 0,
            rtt_ms: None,
            last_receive_time: now,
            connected_at: now,
        }
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_receive_time) > timeout
    }
}

#[derive(Debug)]
pub struct SessionTable {
    by_addr: HashMap<SocketAddr, u16>,
    sessions: BTreeMap<u16, ClientSession>,
    next_net_id: u16,
    max_clients: usize,
    window: u32,
    max_reliable: u32,
}

impl SessionTable {
    pub fn new(max_clients: usize, window: u32, max_reliable: u32) -> Self {
        Self {
            by_addr: HashMap::new(),
            sessions: BTreeMap::new(),
            next_net_id: 1,
            max_clients,
            window,
            max_reliable,
        }
    }

    /// Returns the session for `addr`, creating it if needed. The flag is true
    /// when the session is new.
    pub fn get_or_create(
        &mut self,
        addr: SocketAddr,
        guid: u64,
        now: Instant,
    ) -> Result<(&mut ClientSession, bool), &'static str> {
        if let Some(&net_id) = self.by_addr.get(&addr) {
            return self
                .sessions
                .get_mut(&net_id)
                .map(|session| (session, false))
                .ok_or("Session table out of sync.");
        }

        if self.sessions.len() >= self.max_clients {
            return Err("Server is full.");
        }

        let net_id = self.allocate_net_id().ok_or("No free net ids.")?;
        self.by_addr.insert(addr, net_id);

        let (window, max_reliable) = (self.window, self.max_reliable);
        let session = self
            .sessions
            .entry(net_id)
            .or_insert_with(|| ClientSession::new(addr, net_id, guid, window, max_reliable, now));
        Ok((session, true))
    }

    fn allocate_net_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_net_id;
            self.next_net_id = self.next_net_id.wrapping_add(1).max(1);

            // 0xFFFF addresses every peer
            if candidate != u16::MAX && !self.sessions.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// The longest-connected client acts as host.
    pub fn host_net_id(&self) -> u16 {
        self.sessions
            .values()
            .min_by_key(|session| session.connected_at)
            .map(|session| session.net_id)
            .unwrap_or(u16::MAX)
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut ClientSession> {
        let net_id = self.by_addr.get(addr)?;
        self.sessions.get_mut(net_id)
    }

    pub fn get_mut(&mut self, net_id: u16) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&net_id)
    }

    pub fn contains(&self, net_id: u16) -> bool {
        self.sessions.contains_key(&net_id)
    }

    pub fn remove(&mut self, net_id: u16) -> Option<ClientSession> {
        let session = self.sessions.remove(&net_id)?;
        self.by_addr.remove(&session.addr);
        Some(session)
    }

    pub fn net_ids(&self) -> Vec<u16> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub fn cleanup_timed_out(&mut self, now: Instant, timeout: Duration) -> Vec<u16> {
        let timed_out: Vec<u16> = self
            .sessions
            .values()
            .filter(|session| session.is_timed_out(now, timeout))
            .map(|session| session.net_id)
            .collect();

        for net_id in &timed_out {
            self.remove(*net_id);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
