//! Tether node
//!
//! Runs a tether host over real UDP, either as an echo server or as a
//! client that sends a burst of messages and waits for them to come back.
//!
//! - `serve`: accept connections and echo every packet on its channel
//! - `connect`: connect, send `--count` messages, verify the echoes, disconnect

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tether_transport::{Event, Host, HostConfig, Packet, PacketFlags};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tether-node", about = "Reliable UDP echo node")]
struct Cli {
    /// Host configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Install a CRC-32 checksum on every datagram.
    #[arg(long, global = true, default_value_t = false)]
    checksum: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Echo every received packet back to its sender.
    Serve {
        #[arg(long, default_value = "0.0.0.0:7777")]
        bind: SocketAddr,
    },
    /// Send messages to a server and wait for the echoes.
    Connect {
        server: SocketAddr,

        #[arg(long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        #[arg(long, default_value_t = 2)]
        channels: usize,

        #[arg(long, default_value_t = 100)]
        count: usize,

        /// Payload size in bytes; large values exercise fragmentation.
        #[arg(long, default_value_t = 64)]
        size: usize,

        /// Send unreliable instead of reliable packets.
        #[arg(long, default_value_t = false)]
        unreliable: bool,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 30)]
        deadline: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve { bind } => serve(bind, config, cli.checksum),
        Command::Connect {
            server,
            bind,
            channels,
            count,
            size,
            unreliable,
            deadline,
        } => {
            let options = ClientOptions {
                channels,
                count,
                size,
                unreliable,
                deadline: Duration::from_secs(deadline),
            };
            connect(server, bind, config, cli.checksum, options)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<HostConfig> {
    let Some(path) = path else {
        return Ok(HostConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    HostConfig::from_toml_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn open_host(bind: SocketAddr, config: HostConfig, checksum: bool) -> anyhow::Result<Host> {
    let mut host = Host::bind(bind, config).with_context(|| format!("binding {bind}"))?;
    if checksum {
        host.set_checksum(Some(tether_transport::crc32));
    }
    Ok(host)
}

// ─── Server ─────────────────────────────────────────────────────────────────

fn serve(bind: SocketAddr, config: HostConfig, checksum: bool) -> anyhow::Result<()> {
    let mut host = open_host(bind, config, checksum)?;
    tracing::info!(addr = %host.local_addr(), "echo server listening");

    loop {
        let Some(event) = host.service(Duration::from_millis(100))? else {
            continue;
        };
        match event {
            Event::Connect { peer, data } => {
                tracing::info!(%peer, data, addr = ?host.peer_address(peer), "peer connected");
            }
            Event::Receive {
                peer,
                channel_id,
                packet,
            } => {
                tracing::debug!(%peer, channel_id, len = packet.len(), "echo");
                let reply = Packet::from_bytes(packet.data().clone(), packet.flags());
                if let Err(e) = host.send(peer, channel_id, reply) {
                    tracing::warn!(%peer, error = %e, "echo failed");
                }
            }
            Event::Disconnect { peer, data } => {
                tracing::info!(%peer, data, "peer disconnected");
            }
            Event::DisconnectTimeout { peer, .. } => {
                tracing::warn!(%peer, "peer timed out");
            }
        }
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

struct ClientOptions {
    channels: usize,
    count: usize,
    size: usize,
    unreliable: bool,
    deadline: Duration,
}

fn message(index: usize, size: usize) -> Vec<u8> {
    let mut body = format!("msg-{index:06}-").into_bytes();
    body.resize(size.max(body.len()), b'.');
    body
}

fn connect(
    server: SocketAddr,
    bind: SocketAddr,
    config: HostConfig,
    checksum: bool,
    options: ClientOptions,
) -> anyhow::Result<()> {
    let mut host = open_host(bind, config, checksum)?;
    let peer = host.connect(server, options.channels, 0)?;
    let flags = if options.unreliable {
        PacketFlags::empty()
    } else {
        PacketFlags::RELIABLE
    };

    let started = Instant::now();
    let mut echoed = 0usize;
    let mut disconnecting = false;

    while started.elapsed() < options.deadline {
        let Some(event) = host.service(Duration::from_millis(50))? else {
            continue;
        };
        match event {
            Event::Connect { .. } => {
                tracing::info!(%server, "connected, sending {} messages", options.count);
                for index in 0..options.count {
                    let channel = (index % options.channels) as u8;
                    host.send(peer, channel, Packet::new(&message(index, options.size), flags))?;
                }
            }
            Event::Receive { packet, .. } => {
                echoed += 1;
                tracing::debug!(len = packet.len(), echoed, "echo received");
                if echoed == options.count && !disconnecting {
                    if let Some(stats) = host.peer_stats(peer) {
                        println!("{}", serde_json::to_string_pretty(&stats)?);
                    }
                    host.disconnect(peer, 0)?;
                    disconnecting = true;
                }
            }
            Event::Disconnect { .. } => {
                tracing::info!(echoed, elapsed = ?started.elapsed(), "disconnected");
                println!("{}", serde_json::to_string_pretty(&host.stats())?);
                return Ok(());
            }
            Event::DisconnectTimeout { .. } => bail!("connection to {server} timed out"),
        }
    }

    bail!(
        "deadline expired with {echoed}/{} echoes received",
        options.count
    )
}
