mod bootstrap;
mod hooks;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use clap::Parser;

use bootstrap::PresetBootstrap;
use hooks::{LoggingHooks, LoggingMetrics};
use tether::{ConnectionState, EventTarget, NetClient, NetConfig, NetError, StaticIdentity};

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Headless client for the tether transport")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1", help = "Server host name or address")]
    server: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value = "dev", help = "Session token presented to the server")]
    token: String,

    #[arg(long, default_value_t = 3)]
    protocol: u32,

    #[arg(short, long, default_value = "player")]
    name: String,

    #[arg(long, default_value_t = 1)]
    guid: u64,

    #[arg(long, default_value_t = 0, help = "Peer id routed payloads are addressed to")]
    peer: u16,

    #[arg(short, long, default_value = "hello")]
    message: String,

    #[arg(long, help = "Also send the message as a broadcast net event")]
    event: Option<String>,

    #[arg(short, long, default_value_t = 10, help = "Seconds to stay connected")]
    duration: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = NetConfig {
        protocol_version: args.protocol,
        ..Default::default()
    };
    let identity = Arc::new(StaticIdentity::new(args.guid, args.name.clone()));
    let client = Arc::new(NetClient::bind_udp(
        config,
        Box::new(PresetBootstrap::new(args.token.clone(), args.protocol)),
        identity,
    )?);

    client.set_hooks(Box::new(LoggingHooks));
    client.set_metric_sink(Box::new(LoggingMetrics::default()));
    client.add_reliable_handler(tether::net::MSG_NET_EVENT, |payload| {
        log::info!("Net event received ({} bytes)", payload.len());
    });

    client.connect_to_server(&args.server, args.port)?;

    let running = Arc::new(AtomicBool::new(true));
    let pump = spawn_pump(Arc::clone(&client), Arc::clone(&running));
    let consumer = spawn_consumer(Arc::clone(&client), Arc::clone(&running));

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut sequence = 0u32;

    while Instant::now() < deadline && running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));

        if client.state() != ConnectionState::Active {
            continue;
        }

        sequence += 1;
        let payload = format!("{} #{}", args.message, sequence).into_bytes();
        client.route_packet(args.peer, payload)?;

        if let Some(event) = &args.event {
            let data = serde_json::to_vec(&[&args.message])?;
            client.send_net_event(event, &data, EventTarget::Broadcast)?;
        }

        let stats = client.stats();
        log::info!(
            "{} datagrams in, {} out, rtt {:?} ms",
            stats.packets_received,
            stats.packets_sent,
            stats.last_rtt_ms
        );
    }

    client.disconnect("Quit.");
    running.store(false, Ordering::SeqCst);

    let result = pump.join().map_err(|_| anyhow!("pump thread panicked"))?;
    consumer
        .join()
        .map_err(|_| anyhow!("consumer thread panicked"))?;

    client.finalize_disconnect();
    result?;

    Ok(())
}

fn spawn_pump(
    client: Arc<NetClient>,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<Result<(), NetError>> {
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            if let Err(e) = client.run_frame() {
                running.store(false, Ordering::SeqCst);
                return Err(e);
            }

            // Nothing to fetch between handshake and connect.
            if client.state() == ConnectionState::Downloading {
                client.downloads_complete();
            }

            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    })
}

fn spawn_consumer(client: Arc<NetClient>, running: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            if !client.wait_for_routed_packet(Duration::from_millis(100)) {
                continue;
            }

            while let Some(packet) = client.dequeue_routed_packet() {
                log::info!(
                    "Routed from {}: {:?} ({:?} in mailbox)",
                    packet.peer_id,
                    String::from_utf8_lossy(&packet.payload),
                    packet.age()
                );
            }
        }
    })
}
