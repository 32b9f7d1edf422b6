mod config;
mod events;
mod server;
mod sessions;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use events::ServerEvent;
use server::DevServer;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Headless development server for the tether transport")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 3, help = "Protocol version spoken with clients")]
    protocol: u32,

    #[arg(long, help = "Only accept clients presenting this session token")]
    token: Option<String>,

    #[arg(long, default_value_t = 1000)]
    host_base: u32,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<u64>,

    #[arg(long, default_value_t = 10, help = "Seconds between status lines")]
    status_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        protocol: args.protocol,
        token: args.token,
        host_base: args.host_base,
        ..Default::default()
    };

    let mut server = DevServer::new(&bind_addr, config)?;
    log::info!("Server started on {}", server.local_addr());

    let running = server.running();
    let started = Instant::now();
    let deadline = args.duration.map(|secs| started + Duration::from_secs(secs));
    let status_interval = Duration::from_secs(args.status_interval.max(1));
    let mut last_status = started;

    while running.load(Ordering::SeqCst) {
        server.tick_once();

        for event in server.drain_events() {
            log_event(event);
        }

        let now = Instant::now();
        if now.duration_since(last_status) >= status_interval {
            last_status = now;
            log_status(&server);
        }

        if deadline.is_some_and(|deadline| now >= deadline) {
            server.stop();
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    log::info!("Server shutting down");
    server.shutdown_connections();
    for event in server.drain_events() {
        log_event(event);
    }

    Ok(())
}

fn log_event(event: ServerEvent) {
    match event {
        ServerEvent::ClientConnecting { addr } => {
            log::debug!("Connection request from {}", addr);
        }
        ServerEvent::ClientConnected { net_id, addr, guid } => {
            log::info!("Client {} connected from {} (guid {})", net_id, addr, guid);
        }
        ServerEvent::ClientDisconnected { net_id, reason } => {
            log::info!("Client {} disconnected: {}", net_id, reason.as_str());
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("Connection denied to {}: {}", addr, reason);
        }
        ServerEvent::NetEvent {
            source,
            name,
            target,
        } => match target {
            Some(target) => log::info!("Event {} from {} to {}", name, source, target),
            None => log::info!("Server event {} from {}", name, source),
        },
        ServerEvent::Error { message } => {
            log::error!("{}", message);
        }
    }
}

fn log_status(server: &DevServer) {
    let stats = server.stats();
    log::info!(
        "Frame {}: {}/{} clients, {} datagrams in, {} out, {} dropped",
        stats.frame,
        stats.client_count,
        stats.max_clients,
        stats.network_stats.packets_received,
        stats.network_stats.packets_sent,
        stats.network_stats.packets_dropped
    );

    for client in server.client_infos() {
        log::info!(
            "  client {} at {} (guid {}): frame echo {}, rtt {:?} ms, {} unacknowledged",
            client.net_id,
            client.addr,
            client.guid,
            client.frame_echo,
            client.rtt_ms,
            client.unacknowledged
        );
    }
}
