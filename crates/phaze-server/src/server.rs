//! UDP server loop.
//!
//! One task receives datagrams and fans them out to worker tasks bounded by
//! a semaphore; the same loop pumps outbound tunnel packets, admin-initiated
//! frames and the periodic sweep. All protocol decisions live in the
//! [`Dispatcher`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use phaze_common::tunnel::TunnelPort;
use phaze_common::{Error, Result};
use phaze_core::RECV_BUFFER_SIZE;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, Reply};
use crate::registry::ClientRegistry;

const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;
const OUTBOUND_QUEUE: usize = 256;

pub struct PhazeServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    outbound_tx: mpsc::Sender<Reply>,
    outbound_rx: mpsc::Receiver<Reply>,
}

impl PhazeServer {
    pub async fn bind(config: ServerConfig, registry: Arc<ClientRegistry>) -> Result<Self> {
        let listen = config.listen;
        let dispatcher = Dispatcher::new(config, registry).map_err(Error::config)?;

        let socket = UdpSocket::bind(listen).await?;
        let sock = SockRef::from(&socket);
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("failed to set receive buffer size: {}", e);
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("failed to set send buffer size: {}", e);
        }
        info!("PhazeVPN server listening on {}", socket.local_addr()?);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        Ok(Self {
            socket: Arc::new(socket),
            dispatcher: Arc::new(dispatcher),
            outbound_tx,
            outbound_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Queue for frames produced outside the loop (admin disconnects).
    pub fn outbound(&self) -> mpsc::Sender<Reply> {
        self.outbound_tx.clone()
    }

    /// Serve until `shutdown` resolves, then tear down every session.
    pub async fn run(self, tunnel: TunnelPort, shutdown: impl Future<Output = ()>) -> Result<()> {
        let PhazeServer {
            socket,
            dispatcher,
            outbound_tx: _outbound_tx,
            mut outbound_rx,
        } = self;
        let TunnelPort {
            to_device,
            mut from_device,
        } = tunnel;

        let workers = Arc::new(Semaphore::new(dispatcher.config().workers.max(1)));
        let mut sweep_interval = tokio::time::interval(dispatcher.config().sweep_interval);
        // One extra byte so oversized datagrams are seen as such, not truncated.
        let mut buf = vec![0u8; RECV_BUFFER_SIZE + 1];
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("UDP receive failed: {}", e);
                            continue;
                        }
                    };
                    let Ok(permit) = workers.clone().acquire_owned().await else {
                        break;
                    };
                    let datagram = buf[..len].to_vec();
                    let dispatcher = dispatcher.clone();
                    let socket = socket.clone();
                    let to_device = to_device.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        match dispatcher.handle_datagram(&datagram, src).await {
                            Ok(outcome) => {
                                send_replies(&socket, outcome.replies).await;
                                for delivery in outcome.deliveries {
                                    if to_device.send(delivery.packet).await.is_err() {
                                        debug!("Tunnel device closed, dropping packet");
                                        break;
                                    }
                                }
                            }
                            Err(e) => debug!("Datagram from {} dropped: {}", src, e),
                        }
                    });
                }
                Some(packet) = from_device.recv() => {
                    match dispatcher.route_outbound(&packet).await {
                        Ok(replies) => send_replies(&socket, replies).await,
                        Err(e) => debug!("Tunnel packet dropped: {}", e),
                    }
                }
                Some(reply) = outbound_rx.recv() => {
                    send_replies(&socket, vec![reply]).await;
                }
                _ = sweep_interval.tick() => {
                    let replies = dispatcher.sweep().await;
                    send_replies(&socket, replies).await;
                }
            }
        }

        info!("Shutting down, closing all sessions");
        for reply in dispatcher.shutdown().await {
            if let Err(e) = socket.send_to(&reply.bytes, reply.addr).await {
                debug!("Teardown to {} failed: {}", reply.addr, e);
            }
        }
        Ok(())
    }
}

/// Send replies, deferring the ones that carry send jitter.
async fn send_replies(socket: &Arc<UdpSocket>, replies: Vec<Reply>) {
    for reply in replies {
        if reply.delay.is_zero() {
            if let Err(e) = socket.send_to(&reply.bytes, reply.addr).await {
                debug!("Send to {} failed: {}", reply.addr, e);
            }
            continue;
        }

        let socket = socket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(reply.delay).await;
            if let Err(e) = socket.send_to(&reply.bytes, reply.addr).await {
                debug!("Send to {} failed: {}", reply.addr, e);
            }
        });
    }
}
