//! Remote invocation transport.
//!
//! Each endpoint registers a callable handler on a TCP port. `send_message` is
//! a synchronous remote call: the caller writes a [`RpcFrame::Call`] and waits
//! for the remote side to run `dispatch_request` and answer with a
//! [`RpcFrame::Reply`].
//!
//! Unlike the other transports, a port conflict on `initialize` is not fatal:
//! the endpoint moves on to `(port + 1) % 60000` until it finds a free port or
//! runs out of attempts.

use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use super::{
    shutdown_channel, shutdown_requested, stream::bind_listener, wire, Dispatch, Listener,
    RpcFrame, TransportError, Underlay, UnderlayContext,
};
use crate::{config::GlobalExecutor, message::Request};

const PORT_WRAP: u32 = 60_000;

pub struct RpcUnderlay {
    cx: UnderlayContext,
    listener: Mutex<Option<Listener>>,
}

fn next_port(port: u16) -> u16 {
    ((port as u32 + 1) % PORT_WRAP) as u16
}

impl RpcUnderlay {
    pub fn new(cx: UnderlayContext) -> Self {
        Self {
            cx,
            listener: Mutex::new(None),
        }
    }

    fn register(&self, addr: SocketAddr) -> Result<TcpListener, TransportError> {
        let attempts = self.cx.config.rpc.bind_attempts.max(1);
        let mut candidate = addr;
        let mut last_err = None;
        for _ in 0..attempts {
            match bind_listener(candidate) {
                Ok(listener) => return Ok(listener),
                Err(TransportError::AddressInUse(taken)) => {
                    let next = SocketAddr::new(taken.ip(), next_port(taken.port()));
                    tracing::warn!(%taken, %next, "rpc port in use, trying the next one");
                    last_err = Some(TransportError::AddressInUse(taken));
                    candidate = next;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(TransportError::AddressInUse(addr)))
    }

    async fn call(&self, target: SocketAddr, request: &Request) -> Result<(), TransportError> {
        let mut stream = TcpStream::connect(target)
            .await
            .map_err(|source| TransportError::Connect {
                address: target,
                source,
            })?;
        let _ = stream.set_nodelay(true);
        wire::write_frame(&mut stream, &RpcFrame::Call(request.clone())).await?;
        match wire::read_frame::<_, RpcFrame>(&mut stream).await? {
            Some(RpcFrame::Reply { accepted: true }) => Ok(()),
            Some(RpcFrame::Reply { accepted: false }) => Err(TransportError::Rejected {
                address: target,
                cause: "request refused by the remote handler".into(),
            }),
            Some(RpcFrame::Call(_)) => Err(TransportError::Rejected {
                address: target,
                cause: "unexpected call frame in reply".into(),
            }),
            None => Err(TransportError::Rejected {
                address: target,
                cause: "connection closed before reply".into(),
            }),
        }
    }
}

async fn serve(
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
                    GlobalExecutor::spawn(handle_calls(stream, peer, dispatcher, shutdown));
                }
                Err(err) => {
                    tracing::warn!(?local_addr, %err, "failed to accept rpc connection");
                }
            },
        }
    }
    tracing::debug!(?local_addr, "rpc endpoint closed");
}

async fn handle_calls(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<dyn Dispatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return,
            frame = wire::read_frame::<_, RpcFrame>(&mut stream) => frame,
        };
        let accepted = match frame {
            Ok(Some(RpcFrame::Call(request))) => {
                dispatcher.dispatch_request(request);
                true
            }
            Ok(Some(RpcFrame::Reply { .. })) => false,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%peer, %err, "dropping malformed rpc connection");
                return;
            }
        };
        if let Err(err) = wire::write_frame(&mut stream, &RpcFrame::Reply { accepted }).await {
            tracing::debug!(%peer, %err, "failed to answer rpc call");
            return;
        }
    }
}

impl Underlay for RpcUnderlay {
    async fn initialize(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let mut slot = self.listener.lock();
        if let Some(current) = slot.as_ref() {
            return Err(TransportError::AlreadyInitialized(current.local_addr()));
        }
        let listener = self.register(addr)?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = shutdown_channel();
        let task = GlobalExecutor::spawn(serve(listener, self.cx.dispatcher.clone(), rx));
        *slot = Some(Listener::new(local_addr, tx, task));
        tracing::debug!(addr = %local_addr, "rpc endpoint registered");
        Ok(local_addr)
    }

    async fn send_message(
        &self,
        target: SocketAddr,
        request: &Request,
    ) -> Result<(), TransportError> {
        let timeout = self.cx.config.rpc.call_timeout();
        match tokio::time::timeout(timeout, self.call(target, request)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout(target)),
        }
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let addr = listener.local_addr();
            listener.stop().await;
            tracing::debug!(%addr, "rpc endpoint unregistered");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(Listener::local_addr)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        simulation::Registry,
        transport::test_support::{context, loopback, request, ChannelDispatch},
    };

    #[test]
    fn port_wraps_at_sixty_thousand() {
        assert_eq!(next_port(4000), 4001);
        assert_eq!(next_port(59_999), 0);
    }

    #[tokio::test]
    async fn call_returns_after_remote_dispatch() {
        let registry = Arc::new(Registry::new());
        let (dispatch, mut inbox) = ChannelDispatch::new();
        let server = RpcUnderlay::new(context(&registry, dispatch.clone()));
        let client = RpcUnderlay::new(context(&registry, dispatch));

        let addr = server.initialize(loopback()).await.unwrap();
        let sent = request(1, 2, b"invoke");
        client.send_message(addr, &sent).await.unwrap();
        // dispatch ran before the reply was written
        assert_eq!(inbox.try_recv().unwrap(), sent);
        server.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn port_conflict_moves_to_next_port() {
        let registry = Arc::new(Registry::new());
        let (dispatch, _inbox) = ChannelDispatch::new();
        let first = RpcUnderlay::new(context(&registry, dispatch.clone()));
        let taken = first.initialize(loopback()).await.unwrap();

        let second = RpcUnderlay::new(context(&registry, dispatch));
        let moved = second.initialize(taken).await.unwrap();
        assert_ne!(moved, taken);
        assert_eq!(moved.ip(), taken.ip());

        first.terminate().await.unwrap();
        second.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn call_to_unregistered_endpoint_fails() {
        let registry = Arc::new(Registry::new());
        let (dispatch, _inbox) = ChannelDispatch::new();
        let server = RpcUnderlay::new(context(&registry, dispatch.clone()));
        let addr = server.initialize(loopback()).await.unwrap();
        server.terminate().await.unwrap();
        server.terminate().await.unwrap();

        let client = RpcUnderlay::new(context(&registry, dispatch));
        let res = tokio::time::timeout(
            Duration::from_secs(10),
            client.send_message(addr, &request(1, 2, b"x")),
        )
        .await
        .unwrap();
        assert!(res.is_err());
    }
}
