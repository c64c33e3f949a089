use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use phaze_common::helpers::env_bool;
use phaze_common::tunnel::TunnelPort;
use phaze_core::ClientMode;
use phaze_crypto::{ChannelConfig, RekeyPolicy};
use phaze_server::admin::{self, AdminState, MIN_ADMIN_TOKEN_LEN};
use phaze_server::{AddressPolicy, ClientRegistry, PhazeServer, ServerConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "phaze-server")]
#[command(about = "PhazeVPN server - authenticated, encrypted UDP tunnels")]
#[command(version)]
struct Cli {
    /// Client registry file
    #[arg(long, env = "PHAZE_REGISTRY", default_value = "clients.json", global = true)]
    registry: PathBuf,

    /// Log level
    #[arg(long, env = "PHAZE_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default)
    Serve(ServeArgs),
    /// Manage provisioned clients
    #[command(subcommand)]
    Client(ClientCommand),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// UDP listen address
    #[arg(long, env = "PHAZE_LISTEN", default_value = "0.0.0.0:51820")]
    listen: SocketAddr,

    /// Admin API listen address
    #[arg(long, env = "PHAZE_ADMIN_LISTEN", default_value = "127.0.0.1:51821")]
    admin_listen: SocketAddr,

    /// Admin API token (at least 32 characters; the API is off without one)
    #[arg(long, env = "PHAZE_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Pre-shared obfuscation secret for ghost-mode clients
    #[arg(long, env = "PHAZE_OBFS_SECRET", hide_env_values = true)]
    obfs_secret: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long, default_value_t = 4096)]
    max_sessions: usize,

    /// Maximum half-open handshakes per source IP
    #[arg(long, default_value_t = 4)]
    max_half_open_per_ip: usize,

    /// Maximum half-open handshakes overall
    #[arg(long, default_value_t = 256)]
    max_half_open: usize,

    /// Maximum established sessions per source IP
    #[arg(long, default_value_t = 3)]
    max_sessions_per_ip: usize,

    /// Per-IP traffic ceiling in bytes per second; twice this bans the IP
    #[arg(long, default_value_t = 25 * 1024 * 1024)]
    max_bytes_per_sec: u64,

    /// Handshake timeout in seconds
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,

    /// Keepalive probe interval in seconds
    #[arg(long, default_value_t = 120)]
    keepalive_interval: u64,

    /// Session idle timeout in seconds
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,

    /// Rekey after this many frames
    #[arg(long, default_value_t = 1 << 24)]
    rekey_frames: u64,

    /// Rekey after this many bytes
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    rekey_bytes: u64,

    /// Rekey after this many seconds
    #[arg(long, default_value_t = 300)]
    rekey_interval: u64,

    /// Replay window size (1..=1024)
    #[arg(long, default_value_t = 1024)]
    replay_window: u64,

    /// Session address policy: rebind or pin
    #[arg(long, default_value = "rebind")]
    address_policy: AddressPolicy,

    /// Datagrams processed concurrently
    #[arg(long, default_value_t = 64)]
    workers: usize,

    /// TUN interface name
    #[arg(long, default_value = "phazevpn0")]
    tun_name: String,

    /// TUN interface address
    #[arg(long, default_value = "10.9.0.1")]
    tun_address: std::net::Ipv4Addr,

    /// TUN interface netmask
    #[arg(long, default_value = "255.255.255.0")]
    tun_netmask: std::net::Ipv4Addr,

    /// TUN interface MTU
    #[arg(long, default_value_t = 1400)]
    tun_mtu: u16,

    /// Run without a TUN device (decrypted packets are discarded)
    #[arg(long, default_value_t = false)]
    no_tun: bool,
}

#[derive(Subcommand, Debug)]
enum ClientCommand {
    /// Provision a client
    Add {
        name: String,
        /// Password (falls back to PHAZE_PASSWORD)
        #[arg(long, env = "PHAZE_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = "standard")]
        mode: ClientMode,
        /// Tunnel address assigned to the client
        #[arg(long)]
        tunnel_address: Option<IpAddr>,
    },
    /// Revoke a client
    Revoke { name: String },
    /// Replace a client's password
    Rotate {
        name: String,
        #[arg(long, env = "PHAZE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Change a client's privacy mode
    Mode { name: String, mode: ClientMode },
    /// List provisioned clients
    List,
}

impl ServeArgs {
    fn server_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig {
            listen: self.listen,
            max_sessions: self.max_sessions,
            max_half_open_per_ip: self.max_half_open_per_ip,
            max_half_open: self.max_half_open,
            max_sessions_per_ip: self.max_sessions_per_ip,
            max_bytes_per_sec: self.max_bytes_per_sec,
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            channel: ChannelConfig {
                rekey: RekeyPolicy {
                    max_frames: self.rekey_frames,
                    max_bytes: self.rekey_bytes,
                    max_age: Duration::from_secs(self.rekey_interval),
                },
                window_size: self.replay_window,
                ..ChannelConfig::default()
            },
            address_policy: self.address_policy,
            workers: self.workers,
            obfuscation_secret: self.obfs_secret.as_ref().map(|s| s.as_bytes().to_vec()),
            ..ServerConfig::default()
        };
        config.validate().context("invalid server settings")?;
        Ok(config)
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

fn check_public_bind_allowed(addr: SocketAddr) -> Result<()> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    if env_bool("PHAZE_ADMIN_ALLOW_PUBLIC_BIND", false) {
        return Ok(());
    }
    Err(anyhow!(
        "refusing non-loopback admin bind without PHAZE_ADMIN_ALLOW_PUBLIC_BIND=1"
    ))
}

async fn serve(registry_path: PathBuf, args: ServeArgs) -> Result<()> {
    info!("Starting phaze-server v{}", env!("CARGO_PKG_VERSION"));

    let config = args.server_config()?;
    let registry = Arc::new(
        ClientRegistry::open_default(&registry_path)
            .with_context(|| format!("failed to open registry {}", registry_path.display()))?,
    );
    if registry.is_empty() {
        warn!("No clients provisioned; use `phaze-server client add`");
    }

    let server = PhazeServer::bind(config, registry).await?;
    let tunnel = args.open_tunnel()?;

    let admin_token = args
        .admin_token
        .filter(|token| token.len() >= MIN_ADMIN_TOKEN_LEN);
    if let Some(token) = admin_token {
        check_public_bind_allowed(args.admin_listen)?;
        let state = AdminState {
            dispatcher: server.dispatcher(),
            token: Some(Arc::from(token)),
            outbound: Some(server.outbound()),
        };
        let listener = tokio::net::TcpListener::bind(args.admin_listen)
            .await
            .with_context(|| format!("failed to bind admin API on {}", args.admin_listen))?;
        info!("Admin API listening on {}", args.admin_listen);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, admin::router(state)).await {
                warn!("Admin API stopped: {}", e);
            }
        });
    } else {
        info!("Admin API disabled (set PHAZE_ADMIN_TOKEN to at least 32 characters)");
    }

    server
        .run(tunnel, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    info!("Server stopped");
    Ok(())
}

/// Registry writes take the file lock shared with a running server, which
/// reloads the file on its next sweep.
fn manage(registry_path: PathBuf, command: ClientCommand) -> Result<()> {
    let registry = ClientRegistry::open_default(&registry_path)
        .with_context(|| format!("failed to open registry {}", registry_path.display()))?;

    match command {
        ClientCommand::Add {
            name,
            password,
            mode,
            tunnel_address,
        } => {
            registry.register(&name, password.as_bytes(), mode)?;
            if tunnel_address.is_some() {
                registry.set_tunnel_address(&name, tunnel_address)?;
            }
            println!("added {} ({})", name, mode);
        }
        ClientCommand::Revoke { name } => {
            if registry.revoke(&name)? {
                println!("revoked {}", name);
            } else {
                println!("{} was already revoked", name);
            }
        }
        ClientCommand::Rotate { name, password } => {
            registry.rotate_password(&name, password.as_bytes())?;
            println!("rotated password for {}", name);
        }
        ClientCommand::Mode { name, mode } => {
            registry.set_mode(&name, mode)?;
            println!("{} is now {}", name, mode);
        }
        ClientCommand::List => {
            for client in registry.list() {
                let address = client
                    .tunnel_address
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let status = if client.revoked { "revoked" } else { "active" };
                println!(
                    "{:<24} {:<11} {:<16} {:<8} {}",
                    client.name,
                    client.mode,
                    address,
                    status,
                    client.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    phaze_common::init_tracing_with_default(&cli.log_level);

    match cli.command {
        Some(Command::Client(command)) => {
            let registry = cli.registry;
            tokio::task::spawn_blocking(move || manage(registry, command)).await?
        }
        Some(Command::Serve(args)) => serve(cli.registry, args).await,
        None => serve(cli.registry, cli.serve).await,
    }
}
