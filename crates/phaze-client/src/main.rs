use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use phaze_client::{ClientConfig, ClientError, Connection};
use phaze_common::tunnel::TunnelPort;
use phaze_core::ClientMode;
use tracing::{info, warn};
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "phaze-client")]
#[command(about = "PhazeVPN client - authenticated, encrypted UDP tunnel")]
#[command(version)]
struct Args {
    /// Server UDP address
    #[arg(long, env = "PHAZE_SERVER")]
    server: SocketAddr,

    /// Client name as provisioned on the server
    #[arg(long, env = "PHAZE_CLIENT_NAME")]
    name: String,

    /// Client password
    #[arg(long, env = "PHAZE_PASSWORD", hide_env_values = true)]
    password: String,

    /// Privacy mode: standard, semi_ghost or full_ghost
    #[arg(long, env = "PHAZE_MODE", default_value = "standard")]
    mode: ClientMode,

    /// Pre-shared obfuscation secret (ghost modes)
    #[arg(long, env = "PHAZE_OBFS_SECRET", hide_env_values = true)]
    obfs_secret: Option<String>,

    /// Handshake attempts before giving up
    #[arg(long, default_value_t = 5)]
    attempts: u32,

    /// Keepalive interval in seconds
    #[arg(long, default_value_t = 25)]
    keepalive: u64,

    /// Seconds of server silence before the session is abandoned
    #[arg(long, default_value_t = 90)]
    peer_timeout: u64,

    /// TUN interface name
    #[arg(long, default_value = "phazevpn0")]
    tun_name: String,

    /// TUN interface address
    #[arg(long, default_value = "10.9.0.2")]
    tun_address: Ipv4Addr,

    /// TUN interface netmask
    #[arg(long, default_value = "255.255.255.0")]
    tun_netmask: Ipv4Addr,

    /// TUN interface MTU
    #[arg(long, default_value_t = 1400)]
    tun_mtu: u16,

    /// Connect without a TUN device (received packets are discarded)
    #[arg(long, default_value_t = false)]
    no_tun: bool,

    /// Log level
    #[arg(long, env = "PHAZE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let mut config =
            ClientConfig::new(self.server, self.name.clone(), self.password.as_bytes());
        config.mode = self.mode;
        config.obfuscation_secret = self
            .obfs_secret
            .as_ref()
            .map(|secret| Zeroizing::new(secret.as_bytes().to_vec()));
        config.handshake_attempts = self.attempts.max(1);
        config.keepalive_interval = Duration::from_secs(self.keepalive.max(1));
        config.peer_timeout = Duration::from_secs(self.peer_timeout);
        config
    }

    fn open_tunnel(&self) -> Result<TunnelPort> {
        if self.no_tun {
            return Ok(phaze_common::tunnel::detached(
                phaze_common::tunnel::DEFAULT_TUNNEL_QUEUE,
            ));
        }

        #[cfg(feature = "tun-device")]
        {
            let config = phaze_common::tunnel::TunnelConfig {
                name: self.tun_name.clone(),
                address: self.tun_address,
                netmask: self.tun_netmask,
                mtu: self.tun_mtu,
            };
            Ok(phaze_common::tunnel::open_device(&config)?)
        }

        #[cfg(not(feature = "tun-device"))]
        {
            warn!(
                "built without tun-device support; {} ({}/{}, mtu {}) not created",
                self.tun_name, self.tun_address, self.tun_netmask, self.tun_mtu
            );
            Ok(phaze_common::tunnel::detached(
                phaze_common::tunnel::DEFAULT_TUNNEL_QUEUE,
            ))
        }
    }
}

async fn pump(mut connection: Connection, tunnel: TunnelPort) -> Result<()> {
    let TunnelPort {
        to_device,
        mut from_device,
    } = tunnel;
    let mut keepalive = tokio::time::interval(connection.keepalive_interval());
    keepalive.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let stats = connection.close().await?;
                info!(
                    "Disconnected: {} bytes in, {} bytes out, {} rekeys",
                    stats.bytes_in, stats.bytes_out, stats.rekeys
                );
                return Ok(());
            }
            received = connection.recv() => {
                match received {
                    Ok(packet) => {
                        if to_device.send(packet).await.is_err() {
                            warn!("Tunnel device closed");
                            return Ok(());
                        }
                    }
                    Err(ClientError::Closed) => {
                        info!("Server closed the session");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(packet) = from_device.recv() => {
                match connection.send(packet).await {
                    Err(e) if e.is_per_packet() => warn!("Dropping tunnel packet: {}", e),
                    Err(ClientError::Closed) => {
                        info!("Session closed");
                        return Ok(());
                    }
                    sent => sent?,
                }
            }
            _ = keepalive.tick() => {
                connection.keepalive().await?;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    phaze_common::init_tracing_with_default(&args.log_level);
    info!("Starting phaze-client v{}", env!("CARGO_PKG_VERSION"));

    let connection = Connection::connect(args.client_config())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    let tunnel = args.open_tunnel()?;
    pump(connection, tunnel).await
}
