//! Bridge between the protocol core and a local tunnel network device.
//!
//! The core never touches the device directly. It exchanges raw IP packets
//! over a pair of bounded channels ([`TunnelPort`]); the device side
//! ([`DeviceSide`]) is either a real TUN interface (feature `tun-device`),
//! a test harness, or [`detached`] which drops everything.

use tokio::sync::mpsc;
use tracing::debug;

/// Default channel depth between the core and the device pumps.
pub const DEFAULT_TUNNEL_QUEUE: usize = 1024;

/// Core-facing half: write decrypted packets to the device, read packets
/// that should be encrypted and sent to a peer.
#[derive(Debug)]
pub struct TunnelPort {
    pub to_device: mpsc::Sender<Vec<u8>>,
    pub from_device: mpsc::Receiver<Vec<u8>>,
}

/// Device-facing half of a [`TunnelPort`].
#[derive(Debug)]
pub struct DeviceSide {
    pub from_core: mpsc::Receiver<Vec<u8>>,
    pub to_core: mpsc::Sender<Vec<u8>>,
}

/// Create a connected port/device pair.
pub fn tunnel_pair(capacity: usize) -> (TunnelPort, DeviceSide) {
    let (to_device, from_core) = mpsc::channel(capacity);
    let (to_core, from_device) = mpsc::channel(capacity);
    (
        TunnelPort {
            to_device,
            from_device,
        },
        DeviceSide { from_core, to_core },
    )
}

/// A port with no device attached.
///
/// Packets written to it are counted and discarded; nothing is ever read
/// from it. Must be called from within a tokio runtime.
pub fn detached(capacity: usize) -> TunnelPort {
    let (port, mut device) = tunnel_pair(capacity);
    tokio::spawn(async move {
        let mut dropped: u64 = 0;
        // Keep `to_core` alive so the core never sees a closed device.
        let _to_core = device.to_core;
        while let Some(packet) = device.from_core.recv().await {
            dropped += 1;
            debug!(
                "no tunnel device attached, dropping {} byte packet ({} total)",
                packet.len(),
                dropped
            );
        }
    });
    port
}

/// TUN interface parameters.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Interface name (e.g. `phazevpn0`).
    pub name: String,
    /// Local address of the interface.
    pub address: std::net::Ipv4Addr,
    /// Netmask of the tunnel network.
    pub netmask: std::net::Ipv4Addr,
    /// Interface MTU.
    pub mtu: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: "phazevpn0".to_string(),
            address: std::net::Ipv4Addr::new(10, 9, 0, 1),
            netmask: std::net::Ipv4Addr::new(255, 255, 255, 0),
            mtu: 1400,
        }
    }
}

/// Open a TUN interface and spawn the read/write pumps bridging it to a port.
#[cfg(feature = "tun-device")]
pub fn open_device(config: &TunnelConfig) -> crate::Result<TunnelPort> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing::{info, warn};

    let mut tun_config = tun::Configuration::default();
    tun_config
        .name(&config.name)
        .address(config.address)
        .netmask(config.netmask)
        .mtu(config.mtu as i32)
        .up();

    #[cfg(target_os = "linux")]
    tun_config.platform(|platform| {
        platform.packet_information(false);
    });

    let device = tun::create_as_async(&tun_config).map_err(|e| {
        crate::Error::config(format!("failed to create TUN device {}: {}", config.name, e))
    })?;
    info!(
        "TUN device {} up with address {}/{}",
        config.name, config.address, config.netmask
    );

    let (port, device_side) = tunnel_pair(DEFAULT_TUNNEL_QUEUE);
    let DeviceSide {
        mut from_core,
        to_core,
    } = device_side;
    let (mut reader, mut writer) = tokio::io::split(device);
    let mtu = config.mtu as usize;

    tokio::spawn(async move {
        let mut buf = vec![0u8; mtu + 64];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if to_core.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("TUN read failed: {}", e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(packet) = from_core.recv().await {
            if let Err(e) = writer.write_all(&packet).await {
                warn!("TUN write failed: {}", e);
            }
        }
    });

    Ok(port)
}
