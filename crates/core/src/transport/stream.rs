//! Reliable stream transport over TCP.
//!
//! The accept loop spawns one short lived handler per inbound connection. A
//! handler reads request frames until the peer closes the connection and
//! dispatches each one; without connection reuse that is exactly one request.
//! Outbound sends open a connection per request, or keep one per destination
//! when `stream.reuse_connections` is set.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{watch, Mutex as AsyncMutex},
};

use super::{
    shutdown_channel, shutdown_requested, wire, Dispatch, Listener, TransportError, Underlay,
    UnderlayContext,
};
use crate::{config::GlobalExecutor, message::Request};

const LISTEN_BACKLOG: u32 = 1024;

pub struct StreamUnderlay {
    cx: UnderlayContext,
    listener: Mutex<Option<Listener>>,
    connections: DashMap<SocketAddr, Arc<AsyncMutex<TcpStream>>>,
}

impl StreamUnderlay {
    pub fn new(cx: UnderlayContext) -> Self {
        Self {
            cx,
            listener: Mutex::new(None),
            connections: DashMap::new(),
        }
    }

    fn connect_timeout(&self) -> Duration {
        self.cx.config.stream.connect_timeout()
    }

    async fn connect(&self, target: SocketAddr) -> Result<TcpStream, TransportError> {
        match tokio::time::timeout(self.connect_timeout(), TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(TransportError::Connect {
                address: target,
                source,
            }),
            Err(_) => Err(TransportError::Timeout(target)),
        }
    }

    async fn send_cached(
        &self,
        target: SocketAddr,
        request: &Request,
    ) -> Result<(), TransportError> {
        let conn = match self.connections.get(&target).map(|c| c.clone()) {
            Some(conn) => conn,
            None => {
                let stream = self.connect(target).await?;
                self.connections
                    .entry(target)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(stream)))
                    .clone()
            }
        };
        let res = {
            let mut stream = conn.lock().await;
            wire::write_frame(&mut *stream, request).await
        };
        if res.is_err() {
            // stale connection, the next send reconnects
            self.connections
                .remove_if(&target, |_, cached| Arc::ptr_eq(cached, &conn));
        }
        res
    }
}

pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .map_err(|err| TransportError::bind(addr, err))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|err| TransportError::bind(addr, err))
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<dyn Dispatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_addr = listener.local_addr().ok();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let dispatcher = dispatcher.clone();
                    let shutdown = shutdown.clone();
                    GlobalExecutor::spawn(handle_connection(stream, peer, dispatcher, shutdown));
                }
                Err(err) => {
                    tracing::warn!(?local_addr, %err, "failed to accept connection");
                }
            },
        }
    }
    tracing::debug!(?local_addr, "stream listener closed");
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<dyn Dispatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return,
            frame = wire::read_frame::<_, Request>(&mut stream) => frame,
        };
        match frame {
            Ok(Some(request)) => dispatcher.dispatch_request(request),
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%peer, %err, "dropping malformed stream connection");
                return;
            }
        }
    }
}

impl Underlay for StreamUnderlay {
    async fn initialize(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let mut slot = self.listener.lock();
        if let Some(current) = slot.as_ref() {
            return Err(TransportError::AlreadyInitialized(current.local_addr()));
        }
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = shutdown_channel();
        let task = GlobalExecutor::spawn(accept_loop(listener, self.cx.dispatcher.clone(), rx));
        *slot = Some(Listener::new(local_addr, tx, task));
        tracing::debug!(addr = %local_addr, "stream endpoint listening");
        Ok(local_addr)
    }

    async fn send_message(
        &self,
        target: SocketAddr,
        request: &Request,
    ) -> Result<(), TransportError> {
        if self.cx.config.stream.reuse_connections {
            return self.send_cached(target, request).await;
        }
        let mut stream = self.connect(target).await?;
        wire::write_frame(&mut stream, request).await
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        self.connections.clear();
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let addr = listener.local_addr();
            listener.stop().await;
            tracing::debug!(%addr, "stream endpoint released");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(Listener::local_addr)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::SimulatorConfig,
        simulation::Registry,
        transport::test_support::{context, loopback, request, ChannelDispatch},
    };

    async fn recv(inbox: &mut tokio::sync::mpsc::UnboundedReceiver<Request>) -> Request {
        tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("request delivered in time")
            .expect("dispatcher alive")
    }

    #[tokio::test]
    async fn delivers_one_request_per_connection() {
        let registry = Arc::new(Registry::new());
        let (dispatch, mut inbox) = ChannelDispatch::new();
        let receiver = StreamUnderlay::new(context(&registry, dispatch.clone()));
        let sender = StreamUnderlay::new(context(&registry, dispatch));

        let addr = receiver.initialize(loopback()).await.unwrap();
        assert_ne!(addr.port(), 0);
        for i in 0..3u8 {
            sender
                .send_message(addr, &request(1, 2, &[i]))
                .await
                .unwrap();
        }
        let mut payloads: Vec<_> = Vec::new();
        for _ in 0..3 {
            payloads.push(recv(&mut inbox).await.payload().to_vec());
        }
        payloads.sort();
        assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);
        receiver.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn cached_connections_carry_many_requests() {
        let registry = Arc::new(Registry::new());
        let (dispatch, mut inbox) = ChannelDispatch::new();
        let mut config = SimulatorConfig::default();
        config.stream.reuse_connections = true;
        let mut cx = context(&registry, dispatch);
        cx.config = Arc::new(config);
        let receiver = StreamUnderlay::new(cx.clone());
        let sender = StreamUnderlay::new(cx);

        let addr = receiver.initialize(loopback()).await.unwrap();
        for i in 0..5u8 {
            sender
                .send_message(addr, &request(1, 2, &[i]))
                .await
                .unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(recv(&mut inbox).await.payload(), &[i]);
        }
        assert_eq!(sender.connections.len(), 1);
        sender.terminate().await.unwrap();
        assert!(sender.connections.is_empty());
    }

    #[tokio::test]
    async fn send_to_closed_endpoint_fails_without_retry() {
        let registry = Arc::new(Registry::new());
        let (dispatch, _inbox) = ChannelDispatch::new();
        let receiver = StreamUnderlay::new(context(&registry, dispatch.clone()));
        let sender = StreamUnderlay::new(context(&registry, dispatch));

        let addr = receiver.initialize(loopback()).await.unwrap();
        receiver.terminate().await.unwrap();
        let res = sender.send_message(addr, &request(1, 2, b"late")).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn address_is_reusable_after_terminate() {
        let registry = Arc::new(Registry::new());
        let (dispatch, mut inbox) = ChannelDispatch::new();
        let first = StreamUnderlay::new(context(&registry, dispatch.clone()));
        let addr = first.initialize(loopback()).await.unwrap();

        let squatter = StreamUnderlay::new(context(&registry, dispatch.clone()));
        assert!(matches!(
            squatter.initialize(addr).await,
            Err(TransportError::AddressInUse(_))
        ));

        first.terminate().await.unwrap();
        first.terminate().await.unwrap();

        let second = StreamUnderlay::new(context(&registry, dispatch.clone()));
        assert_eq!(second.initialize(addr).await.unwrap(), addr);
        squatter
            .send_message(addr, &request(3, 4, b"again"))
            .await
            .unwrap();
        assert_eq!(recv(&mut inbox).await.payload(), b"again");
        second.terminate().await.unwrap();
    }
}
