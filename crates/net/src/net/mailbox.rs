use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPacket {
    pub peer_id: u16,
    pub payload: Vec<u8>,
    pub created_at: Instant,
}

impl RoutingPacket {
    pub fn new(peer_id: u16, payload: Vec<u8>) -> Self {
        Self {
            peer_id,
            payload,
            created_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[derive(Debug, Default)]
struct Inbound {
    packets: VecDeque<RoutingPacket>,
    signaled: bool,
}

/// Routed payloads crossing between the network pump and the consumer thread.
///
/// Inbound packets sit behind a mutex with a manual-reset signal: every
/// enqueue sets it, a dequeue that empties the queue clears it. Waiters
/// re-check the queue under the lock after waking. At most `capacity`
/// inbound packets are held; newer ones are refused until the consumer
/// catches up. Outbound packets go through an unbounded channel that the
/// send tick drains completely.
pub struct RoutedMailbox {
    inbound: Mutex<Inbound>,
    signal: Condvar,
    capacity: usize,
    outbound_tx: Sender<RoutingPacket>,
    outbound_rx: Receiver<RoutingPacket>,
}

impl RoutedMailbox {
    pub fn new(capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        Self {
            inbound: Mutex::new(Inbound::default()),
            signal: Condvar::new(),
            capacity,
            outbound_tx,
            outbound_rx,
        }
    }

    fn lock_inbound(&self) -> MutexGuard<'_, Inbound> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues an inbound packet. Returns false, dropping the packet, when
    /// the mailbox is full.
    pub fn enqueue_inbound(&self, peer_id: u16, payload: Vec<u8>) -> bool {
        let mut inbound = self.lock_inbound();
        if inbound.packets.len() >= self.capacity {
            return false;
        }
        inbound.packets.push_back(RoutingPacket::new(peer_id, payload));
        inbound.signaled = true;
        self.signal.notify_all();
        true
    }

    pub fn dequeue(&self) -> Option<RoutingPacket> {
        let mut inbound = self.lock_inbound();
        let packet = inbound.packets.pop_front();
        if inbound.packets.is_empty() {
            inbound.signaled = false;
        }
        packet
    }

    /// Blocks until at least one packet is queued or `timeout` passes. A
    /// `true` result only means a packet was present at that moment; another
    /// consumer may take it first.
    pub fn wait_for_routed_packet(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inbound = self.lock_inbound();

        while !inbound.signaled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .signal
                .wait_timeout(inbound, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inbound = guard;
        }

        !inbound.packets.is_empty()
    }

    pub fn inbound_len(&self) -> usize {
        self.lock_inbound().packets.len()
    }

    pub fn clear_inbound(&self) {
        let mut inbound = self.lock_inbound();
        inbound.packets.clear();
        inbound.signaled = false;
    }

    pub fn route(&self, peer_id: u16, payload: Vec<u8>) {
        // The receiver lives as long as self, so this cannot fail.
        let _ = self.outbound_tx.send(RoutingPacket::new(peer_id, payload));
    }

    pub fn drain_outbound(&self) -> impl Iterator<Item = RoutingPacket> + '_ {
        self.outbound_rx.try_iter()
    }

    pub fn clear_outbound(&self) {
        while self.outbound_rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_dequeue() {
        let mailbox = RoutedMailbox::new(16);
        mailbox.enqueue_inbound(1, b"a".to_vec());
        mailbox.enqueue_inbound(2, b"b".to_vec());

        let first = mailbox.dequeue().unwrap();
        assert_eq!((first.peer_id, first.payload.as_slice()), (1, &b"a"[..]));
        let second = mailbox.dequeue().unwrap();
        assert_eq!((second.peer_id, second.payload.as_slice()), (2, &b"b"[..]));
        assert!(mailbox.dequeue().is_none());
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let mailbox = RoutedMailbox::new(16);
        let start = Instant::now();
        assert!(!mailbox.wait_for_routed_packet(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_returns_immediately_when_queued() {
        let mailbox = RoutedMailbox::new(16);
        mailbox.enqueue_inbound(3, vec![1]);
        assert!(mailbox.wait_for_routed_packet(Duration::from_secs(5)));
        // spurious repeat calls are fine
        assert!(mailbox.wait_for_routed_packet(Duration::from_secs(5)));
    }

    #[test]
    fn test_signal_cleared_when_drained() {
        let mailbox = RoutedMailbox::new(16);
        mailbox.enqueue_inbound(3, vec![1]);
        mailbox.enqueue_inbound(3, vec![2]);

        mailbox.dequeue();
        assert!(mailbox.wait_for_routed_packet(Duration::ZERO));
        mailbox.dequeue();
        assert!(!mailbox.wait_for_routed_packet(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_wakes_on_enqueue_from_other_thread() {
        let mailbox = Arc::new(RoutedMailbox::new(16));
        let producer = Arc::clone(&mailbox);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue_inbound(42, b"hello".to_vec());
        });

        assert!(mailbox.wait_for_routed_packet(Duration::from_secs(5)));
        let packet = mailbox.dequeue().unwrap();
        assert_eq!(packet.peer_id, 42);
        assert_eq!(packet.payload, b"hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_inbound_refused_when_full() {
        let mailbox = RoutedMailbox::new(2);
        assert!(mailbox.enqueue_inbound(1, vec![1]));
        assert!(mailbox.enqueue_inbound(1, vec![2]));
        assert!(!mailbox.enqueue_inbound(1, vec![3]));
        assert_eq!(mailbox.inbound_len(), 2);

        mailbox.dequeue();
        assert!(mailbox.enqueue_inbound(1, vec![4]));
        let remaining: Vec<u8> = std::iter::from_fn(|| mailbox.dequeue())
            .map(|packet| packet.payload[0])
            .collect();
        assert_eq!(remaining, vec![2, 4]);
    }

    #[test]
    fn test_clear_inbound_resets_signal() {
        let mailbox = RoutedMailbox::new(4);
        mailbox.enqueue_inbound(1, vec![1]);
        mailbox.clear_inbound();
        assert_eq!(mailbox.inbound_len(), 0);
        assert!(!mailbox.wait_for_routed_packet(Duration::from_millis(1)));
    }

    #[test]
    fn test_outbound_drained_completely() {
        let mailbox = RoutedMailbox::new(16);
        mailbox.route(1, b"x".to_vec());
        mailbox.route(2, b"y".to_vec());

        let drained: Vec<u16> = mailbox.drain_outbound().map(|p| p.peer_id).collect();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(mailbox.drain_outbound().count(), 0);
    }
}
