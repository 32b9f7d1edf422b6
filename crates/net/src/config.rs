use std::time::Duration;

pub const DEFAULT_PORT: u16 = 30120;

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub connect_retry_interval: Duration,
    pub max_connect_attempts: u32,
    pub idle_timeout: Duration,
    pub send_interval: Duration,
    pub max_reliable_commands: u32,
    pub reliable_receive_window: u32,
    pub protocol_version: u32,
    pub bootstrap_path: String,
    pub max_datagram_size: usize,
    /// Inbound routed packets held for the consumer before new ones are dropped.
    pub max_routed_backlog: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_retry_interval: Duration::from_millis(5000),
            max_connect_attempts: 3,
            idle_timeout: Duration::from_millis(15000),
            send_interval: Duration::from_millis(1000 / 60),
            max_reliable_commands: 64,
            reliable_receive_window: 64,
            protocol_version: 3,
            bootstrap_path: "/client".to_string(),
            max_datagram_size: 2048,
            max_routed_backlog: 1024,
        }
    }
}
