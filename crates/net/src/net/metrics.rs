#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCategory {
    RoutedMessages,
    Reliables,
    Misc,
}

impl PacketCategory {
    pub const ALL: [PacketCategory; 3] = [
        PacketCategory::RoutedMessages,
        PacketCategory::Reliables,
        PacketCategory::Misc,
    ];

    fn index(self) -> usize {
        match self {
            PacketCategory::RoutedMessages => 0,
            PacketCategory::Reliables => 1,
            PacketCategory::Misc => 2,
        }
    }
}

/// Byte counts per category for one datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketMetrics {
    sizes: [usize; 3],
}

impl PacketMetrics {
    pub fn add_element_size(&mut self, category: PacketCategory, size: usize) {
        self.sizes[category.index()] += size;
    }

    pub fn element_size(&self, category: PacketCategory) -> usize {
        self.sizes[category.index()]
    }

    pub fn total_size(&self) -> usize {
        self.sizes.iter().sum()
    }
}

pub trait MetricSink: Send {
    fn on_ping_result(&mut self, _rtt_ms: i32) {}

    fn on_incoming_packet(&mut self, _metrics: &PacketMetrics) {}

    fn on_outgoing_packet(&mut self, _metrics: &PacketMetrics) {}
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duplicate_reliables: u64,
    pub routed_dropped: u64,
    pub last_rtt_ms: Option<i32>,
}
