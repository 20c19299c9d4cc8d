//! In-process transport backed by the run's routing table.
//!
//! No I/O happens: `send_message` looks the target address up in the
//! [`Registry`](crate::simulation::Registry) and dispatches on a fresh task.
//! Sends to an address nobody is bound at, or to a node that has not called
//! `ready()` yet, fail.

use std::net::SocketAddr;

use parking_lot::Mutex;

use super::{Dispatch, TransportError, Underlay, UnderlayContext};
use crate::{config::GlobalExecutor, message::Request};

pub struct LocalUnderlay {
    cx: UnderlayContext,
    bound: Mutex<Option<SocketAddr>>,
}

impl LocalUnderlay {
    pub fn new(cx: UnderlayContext) -> Self {
        Self {
            cx,
            bound: Mutex::new(None),
        }
    }
}

impl Underlay for LocalUnderlay {
    async fn initialize(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let mut bound = self.bound.lock();
        if let Some(current) = *bound {
            return Err(TransportError::AlreadyInitialized(current));
        }
        self.cx.registry.bind_route(addr, self.cx.dispatcher.clone())?;
        *bound = Some(addr);
        tracing::debug!(%addr, "local endpoint bound");
        Ok(addr)
    }

    async fn send_message(
        &self,
        target: SocketAddr,
        request: &Request,
    ) -> Result<(), TransportError> {
        let dispatcher = self
            .cx
            .registry
            .route(&target)
            .ok_or(TransportError::Unreachable(target))?;
        if !self.cx.registry.is_ready(&request.destination()) {
            return Err(TransportError::NotReady(request.destination()));
        }
        let request = request.clone();
        GlobalExecutor::spawn(async move { dispatcher.dispatch_request(request) });
        Ok(())
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        if let Some(addr) = self.bound.lock().take() {
            self.cx.registry.unbind_route(&addr);
            tracing::debug!(%addr, "local endpoint released");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }
}
