use tether::{MetricSink, NetAddress, PacketCategory, PacketMetrics, SessionHooks};

pub struct LoggingHooks;

impl SessionHooks for LoggingHooks {
    fn on_session_created(&mut self, server: &NetAddress) {
        log::info!("Session created for {}", server);
    }

    fn on_init_received(&mut self, server: &NetAddress) {
        log::info!("Handshake with {} complete, downloading", server);
    }

    fn on_connect_ok(&mut self, server: &NetAddress) {
        log::info!("Server {} accepted the connection", server);
    }

    fn on_connection_error(&mut self, message: &str) {
        log::error!("Connection error: {}", message);
    }

    fn on_connection_timed_out(&mut self) {
        log::error!("Connection timed out");
    }

    fn on_finalize_disconnect(&mut self, server: &NetAddress) {
        log::info!("Disconnected from {}", server);
    }

    fn on_attempt_disconnect(&mut self, reason: &str) {
        log::info!("Disconnect requested: {}", reason);
    }
}

#[derive(Default)]
pub struct LoggingMetrics {
    incoming_bytes: usize,
    outgoing_bytes: usize,
    routed_bytes: usize,
}

impl MetricSink for LoggingMetrics {
    fn on_ping_result(&mut self, rtt_ms: i32) {
        log::trace!("RTT {} ms", rtt_ms);
    }

    fn on_incoming_packet(&mut self, metrics: &PacketMetrics) {
        self.incoming_bytes += metrics.total_size();
        self.routed_bytes += metrics.element_size(PacketCategory::RoutedMessages);
    }

    fn on_outgoing_packet(&mut self, metrics: &PacketMetrics) {
        self.outgoing_bytes += metrics.total_size();
        log::trace!(
            "Sent {} bytes ({} total, {} in, {} routed in)",
            metrics.total_size(),
            self.outgoing_bytes,
            self.incoming_bytes,
            self.routed_bytes
        );
    }
}
