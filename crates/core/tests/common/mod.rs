#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use netbed::{Identifier, Network, Node};
use parking_lot::Mutex;

/// Decides whom a node greets once it starts: `(self, members) -> targets`.
pub type Plan = Arc<dyn Fn(Identifier, &[Identifier]) -> Vec<Identifier> + Send + Sync>;

/// Everything observed by the probes of one run.
#[derive(Default)]
pub struct Journal {
    /// `(receiver, origin, event)` for every delivered message.
    pub deliveries: Mutex<Vec<(Identifier, Identifier, String)>>,
    /// Address each instance found its network bound to, per identifier.
    pub bound_at: Mutex<HashMap<Identifier, Vec<Option<SocketAddr>>>>,
    pub send_failures: Mutex<Vec<(Identifier, Identifier)>>,
    pub stops: Mutex<Vec<Identifier>>,
}

impl Journal {
    pub fn delivered(&self) -> usize {
        self.deliveries.lock().len()
    }

    /// Origins that reached `receiver`, in delivery order.
    pub fn received_by(&self, receiver: Identifier) -> Vec<Identifier> {
        self.deliveries
            .lock()
            .iter()
            .filter(|(to, _, _)| *to == receiver)
            .map(|(_, from, _)| *from)
            .collect()
    }

    pub fn instances(&self, id: &Identifier) -> usize {
        self.bound_at.lock().get(id).map_or(0, Vec::len)
    }

    pub fn distinct_addresses(&self, id: &Identifier) -> HashSet<Option<SocketAddr>> {
        self.bound_at
            .lock()
            .get(id)
            .map(|addrs| addrs.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Test node: reports ready in `on_create` unless muted, sends one message to
/// every target of its plan in `on_start` and journals everything it sees.
pub struct Probe {
    id: Identifier,
    network: Network<Probe>,
    journal: Arc<Journal>,
    plan: Plan,
    muted: bool,
}

impl Node for Probe {
    type Event = String;

    async fn on_create(&self, _members: &[Identifier]) -> anyhow::Result<()> {
        if !self.muted {
            self.network.ready();
        }
        Ok(())
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        let targets = (self.plan)(self.id, self.network.members());
        let sends = targets.into_iter().map(|target| {
            let event = format!("hello from {}", self.id);
            async move {
                if self.network.send(target, &event).await.is_err() {
                    self.journal.send_failures.lock().push((self.id, target));
                }
            }
        });
        futures::future::join_all(sends).await;
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        self.journal.stops.lock().push(self.id);
        Ok(())
    }

    async fn on_new_message(&self, origin: Identifier, event: String) -> anyhow::Result<()> {
        self.journal
            .deliveries
            .lock()
            .push((self.id, origin, event));
        Ok(())
    }
}

/// Factory building probes that share `journal`. Identifiers in `muted` never
/// report ready.
pub fn probes(
    journal: Arc<Journal>,
    plan: Plan,
    muted: Vec<Identifier>,
) -> impl Fn(Identifier, Network<Probe>) -> Probe + Send + Sync + 'static {
    move |id: Identifier, network: Network<Probe>| {
        journal
            .bound_at
            .lock()
            .entry(id)
            .or_default()
            .push(network.address());
        Probe {
            id,
            network,
            journal: journal.clone(),
            plan: plan.clone(),
            muted: muted.contains(&id),
        }
    }
}

pub fn greet_everyone() -> Plan {
    Arc::new(|me, members| members.iter().copied().filter(|id| *id != me).collect())
}

/// Each node greets the next one in identifier order.
pub fn greet_successor() -> Plan {
    Arc::new(|me, members| {
        let mut sorted = members.to_vec();
        sorted.sort();
        let at = sorted.iter().position(|id| *id == me).unwrap();
        vec![sorted[(at + 1) % sorted.len()]]
    })
}

pub fn greet_nobody() -> Plan {
    Arc::new(|_, _| Vec::new())
}

/// Polls `done` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}
