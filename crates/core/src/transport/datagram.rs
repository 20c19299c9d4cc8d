//! Connectionless transport over UDP.
//!
//! One request per datagram, no acknowledgement, no retransmission. Whatever
//! the kernel drops or reorders stays dropped or reordered, which is the point
//! of this variant.

use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::watch};

use super::{
    shutdown_channel, shutdown_requested, wire, Dispatch, Listener, TransportError, Underlay,
    UnderlayContext,
};
use crate::{config::GlobalExecutor, message::Request};

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

struct Bound {
    listener: Listener,
    /// Outbound traffic leaves from its own ephemeral socket so the listening
    /// socket is owned by the receive loop alone.
    outbound: Arc<UdpSocket>,
}

pub struct DatagramUnderlay {
    cx: UnderlayContext,
    bound: Mutex<Option<Bound>>,
}

impl DatagramUnderlay {
    pub fn new(cx: UnderlayContext) -> Self {
        Self {
            cx,
            bound: Mutex::new(None),
        }
    }
}

async fn receive_loop(
    socket: UdpSocket,
    dispatcher: Arc<dyn Dispatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_addr = socket.local_addr().ok();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    let packet = buf[..len].to_vec();
                    let dispatcher = dispatcher.clone();
                    GlobalExecutor::spawn(async move {
                        match wire::decode::<Request>(&packet) {
                            Ok(request) => dispatcher.dispatch_request(request),
                            Err(err) => tracing::warn!(%from, %err, "dropping malformed datagram"),
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(?local_addr, %err, "datagram receive failed");
                }
            },
        }
    }
    tracing::debug!(?local_addr, "datagram listener closed");
}

impl Underlay for DatagramUnderlay {
    async fn initialize(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        if let Some(current) = self.local_addr() {
            return Err(TransportError::AlreadyInitialized(current));
        }
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|err| TransportError::bind(addr, err))?;
        let local_addr = socket.local_addr()?;
        let outbound = UdpSocket::bind(SocketAddr::new(addr.ip(), 0)).await?;

        let (tx, rx) = shutdown_channel();
        let task = GlobalExecutor::spawn(receive_loop(socket, self.cx.dispatcher.clone(), rx));
        let listener = Listener::new(local_addr, tx, task);

        let lost_race = {
            let mut slot = self.bound.lock();
            match slot.as_ref().map(|b| b.listener.local_addr()) {
                Some(current) => Some((current, listener)),
                None => {
                    *slot = Some(Bound {
                        listener,
                        outbound: Arc::new(outbound),
                    });
                    None
                }
            }
        };
        if let Some((current, listener)) = lost_race {
            // a concurrent initialize won
            listener.stop().await;
            return Err(TransportError::AlreadyInitialized(current));
        }
        tracing::debug!(addr = %local_addr, "datagram endpoint listening");
        Ok(local_addr)
    }

    async fn send_message(
        &self,
        target: SocketAddr,
        request: &Request,
    ) -> Result<(), TransportError> {
        let outbound = self
            .bound
            .lock()
            .as_ref()
            .map(|b| b.outbound.clone())
            .ok_or(TransportError::NotInitialized)?;
        let packet = wire::encode(request)?;
        if packet.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::MessageTooBig {
                size: packet.len(),
                max_size: MAX_DATAGRAM_SIZE,
            });
        }
        outbound.send_to(&packet, target).await?;
        Ok(())
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        let bound = self.bound.lock().take();
        if let Some(Bound { listener, .. }) = bound {
            let addr = listener.local_addr();
            listener.stop().await;
            tracing::debug!(%addr, "datagram endpoint released");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().as_ref().map(|b| b.listener.local_addr())
    }
}
