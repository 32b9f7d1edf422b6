use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    pub protocol: u32,
    /// Session token clients must present. Any token is accepted when unset.
    pub token: Option<String>,
    pub host_base: u32,
    pub client_timeout: Duration,
    pub reliable_window: u32,
    pub max_reliable_commands: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_clients: 32,
            protocol: 3,
            token: None,
            host_base: 1000,
            client_timeout: Duration::from_secs(15),
            reliable_window: 64,
            max_reliable_commands: 64,
        }
    }
}
