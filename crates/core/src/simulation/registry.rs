//! Run-scoped routing, membership and readiness state.
//!
//! One [`Registry`] is created per simulator run and handed to every network
//! and transport built for that run, so concurrent runs in the same process
//! never observe each other's nodes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::watch;

use crate::{
    message::Identifier,
    transport::{Dispatch, TransportError},
};

pub struct Registry {
    /// Identifier -> readiness flag. Entries are created by `ready()` and
    /// removed on teardown.
    readiness: DashMap<Identifier, bool>,
    /// Identifier -> address of its live transport.
    addresses: DashMap<Identifier, SocketAddr>,
    /// In-process routes used by the local transport.
    routes: DashMap<SocketAddr, Arc<dyn Dispatch>>,
    /// Bumped on every readiness change so barriers can wait without polling.
    readiness_changes: watch::Sender<u64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            readiness: DashMap::new(),
            addresses: DashMap::new(),
            routes: DashMap::new(),
            readiness_changes: watch::Sender::new(0),
        }
    }

    /// Marks `id` as ready. Idempotent; waiters are only woken on the first call.
    pub fn mark_ready(&self, id: Identifier) {
        let previous = self.readiness.insert(id, true);
        if previous != Some(true) {
            tracing::debug!(%id, "node ready");
            self.readiness_changes.send_modify(|v| *v = v.wrapping_add(1));
        }
    }

    pub fn is_ready(&self, id: &Identifier) -> bool {
        self.readiness.get(id).map(|r| *r).unwrap_or(false)
    }

    /// Drops every trace of `id`: readiness and published address.
    pub fn forget(&self, id: &Identifier) {
        self.readiness.remove(id);
        self.addresses.remove(id);
        self.readiness_changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn publish_address(&self, id: Identifier, addr: SocketAddr) {
        self.addresses.insert(id, addr);
    }

    pub fn address_of(&self, id: &Identifier) -> Option<SocketAddr> {
        self.addresses.get(id).map(|a| *a)
    }

    /// Identifiers in `ids` that are not ready yet.
    pub fn not_ready(&self, ids: &[Identifier]) -> Vec<Identifier> {
        ids.iter().filter(|id| !self.is_ready(id)).copied().collect()
    }

    /// Blocks until every identifier in `ids` is ready or `timeout` elapses.
    ///
    /// On timeout returns the identifiers that never became ready.
    pub async fn wait_ready(
        &self,
        ids: &[Identifier],
        timeout: Duration,
    ) -> Result<(), Vec<Identifier>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.readiness_changes.subscribe();
        loop {
            // mark before checking so a change racing with the check is not lost
            changes.borrow_and_update();
            let missing = self.not_ready(ids);
            if missing.is_empty() {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                // the sender lives in `self`, it cannot be closed while we borrow it
                Ok(Err(_)) | Err(_) => return Err(self.not_ready(ids)),
            }
        }
    }

    pub(crate) fn bind_route(
        &self,
        addr: SocketAddr,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Result<(), TransportError> {
        match self.routes.entry(addr) {
            Entry::Occupied(_) => Err(TransportError::AddressInUse(addr)),
            Entry::Vacant(slot) => {
                slot.insert(dispatcher);
                Ok(())
            }
        }
    }

    pub(crate) fn unbind_route(&self, addr: &SocketAddr) {
        self.routes.remove(addr);
    }

    pub(crate) fn route(&self, addr: &SocketAddr) -> Option<Arc<dyn Dispatch>> {
        self.routes.get(addr).map(|d| d.clone())
    }
}
