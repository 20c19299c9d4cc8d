//! Simulator configuration and the shared task executor.
//!
//! A run is fully described by a [`SimulatorConfig`], read from a TOML file
//! and/or assembled from command line flags through [`ConfigArgs`]. Every field
//! has a default, so an empty file is a valid configuration.

use std::{
    fmt::Display,
    future::Future,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

/// Seed used when none is configured.
pub const DEFAULT_SEED: u64 = 0xdeadbeef;
pub const DEFAULT_NODE_COUNT: usize = 5;
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 10_000;
/// Mean and standard deviation of observed inter node delay, in milliseconds.
pub const DEFAULT_LATENCY_MEAN_MS: f64 = 159.0;
pub const DEFAULT_LATENCY_STD_DEV_MS: f64 = 96.0;

static ASYNC_RT: LazyLock<Option<Runtime>> = LazyLock::new(GlobalExecutor::initialize_async_rt);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// In-process routing table, no I/O.
    #[default]
    Local,
    /// One TCP connection per request, or cached per destination.
    Stream,
    /// UDP, one request per datagram.
    Datagram,
    /// Synchronous remote calls over TCP.
    Rpc,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Stream => "stream",
            Self::Datagram => "datagram",
            Self::Rpc => "rpc",
        };
        f.write_str(name)
    }
}

/// Which transports get synthetic latency on top of their own delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyMode {
    /// Only the in-process transport, which has no delay of its own.
    #[default]
    LocalOnly,
    /// Every transport.
    Always,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub mean_ms: f64,
    pub std_dev_ms: f64,
    pub mode: LatencyMode,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            mean_ms: DEFAULT_LATENCY_MEAN_MS,
            std_dev_ms: DEFAULT_LATENCY_STD_DEV_MS,
            mode: LatencyMode::default(),
        }
    }
}

impl LatencyConfig {
    /// Whether sends over `kind` sleep for the sampled latency.
    pub fn applies_to(&self, kind: TransportKind) -> bool {
        match self.mode {
            LatencyMode::LocalOnly => kind == TransportKind::Local,
            LatencyMode::Always => true,
            LatencyMode::Off => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Keep one outbound connection per destination instead of one per request.
    pub reuse_connections: bool,
    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reuse_connections: false,
            connect_timeout_ms: 2_000,
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub call_timeout_ms: u64,
    /// How many consecutive ports `initialize` tries before giving up.
    pub bind_attempts: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            bind_attempts: 64,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub node_count: usize,
    pub transport: TransportKind,
    pub host: IpAddr,
    /// First port of the population, node `i` binds `base_port + i`. When unset
    /// socket transports let the OS pick and the local transport counts from 20000.
    pub base_port: Option<u16>,
    pub readiness_timeout_ms: u64,
    pub seed: u64,
    pub latency: LatencyConfig,
    pub stream: StreamConfig,
    pub rpc: RpcConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            node_count: DEFAULT_NODE_COUNT,
            transport: TransportKind::default(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: None,
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
            seed: DEFAULT_SEED,
            latency: LatencyConfig::default(),
            stream: StreamConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Reads a TOML file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("failed to read {}: {err}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|err| anyhow::anyhow!("invalid configuration in {}: {err}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_count == 0 {
            anyhow::bail!("node_count must be at least 1");
        }
        if self.readiness_timeout_ms == 0 {
            anyhow::bail!("readiness_timeout_ms must be positive");
        }
        let LatencyConfig {
            mean_ms,
            std_dev_ms,
            ..
        } = self.latency;
        if !mean_ms.is_finite() || mean_ms < 0.0 {
            anyhow::bail!("latency.mean_ms must be a non-negative number, got {mean_ms}");
        }
        if !std_dev_ms.is_finite() || std_dev_ms < 0.0 {
            anyhow::bail!("latency.std_dev_ms must be a non-negative number, got {std_dev_ms}");
        }
        if let Some(base) = self.base_port {
            let last = base as usize + self.node_count - 1;
            if base == 0 || last > u16::MAX as usize {
                anyhow::bail!("base_port {base} cannot fit {} nodes", self.node_count);
            }
        }
        Ok(())
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

/// Command line and environment overrides on top of an optional config file.
#[derive(clap::Parser, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// TOML file to start from.
    #[arg(long, env = "NETBED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of nodes in the population.
    #[arg(long, short = 'n', env = "NETBED_NODES")]
    pub nodes: Option<usize>,

    #[arg(long, value_enum, env = "NETBED_TRANSPORT")]
    pub transport: Option<TransportKind>,

    #[arg(long, env = "NETBED_HOST")]
    pub host: Option<IpAddr>,

    #[arg(long, env = "NETBED_BASE_PORT")]
    pub base_port: Option<u16>,

    #[arg(long, env = "NETBED_READINESS_TIMEOUT_MS")]
    pub readiness_timeout_ms: Option<u64>,

    /// Seed for identifiers and latency samples.
    #[arg(long, env = "NETBED_SEED")]
    pub seed: Option<u64>,

    #[arg(long, value_enum, env = "NETBED_LATENCY_MODE")]
    pub latency_mode: Option<LatencyMode>,

    #[arg(long, env = "NETBED_LATENCY_MEAN_MS")]
    pub latency_mean_ms: Option<f64>,

    #[arg(long, env = "NETBED_LATENCY_STD_DEV_MS")]
    pub latency_std_dev_ms: Option<f64>,

    /// Keep one stream connection per destination.
    #[arg(long, env = "NETBED_REUSE_CONNECTIONS")]
    pub reuse_connections: bool,
}

impl ConfigArgs {
    pub fn build(self) -> anyhow::Result<SimulatorConfig> {
        let mut config = match &self.config {
            Some(path) => SimulatorConfig::load(path)?,
            None => SimulatorConfig::default(),
        };
        if let Some(nodes) = self.nodes {
            config.node_count = nodes;
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if self.base_port.is_some() {
            config.base_port = self.base_port;
        }
        if let Some(timeout) = self.readiness_timeout_ms {
            config.readiness_timeout_ms = timeout;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(mode) = self.latency_mode {
            config.latency.mode = mode;
        }
        if let Some(mean) = self.latency_mean_ms {
            config.latency.mean_ms = mean;
        }
        if let Some(std_dev) = self.latency_std_dev_ms {
            config.latency.std_dev_ms = std_dev;
        }
        if self.reuse_connections {
            config.stream.reuse_connections = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Spawns tasks on the ambient tokio runtime, falling back to a lazily built
/// one when called from outside any runtime.
///
/// ```rust,no_run
/// use netbed::config::GlobalExecutor;
/// GlobalExecutor::spawn(async { /* task */ });
/// ```
pub struct GlobalExecutor;

impl GlobalExecutor {
    /// Returns the fallback runtime, or none if a runtime is already running.
    pub(crate) fn initialize_async_rt() -> Option<Runtime> {
        if tokio::runtime::Handle::try_current().is_ok() {
            None
        } else {
            tracing::debug!("GlobalExecutor: creating fallback runtime");
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder.enable_all().thread_name("netbed-node");
            match builder.build() {
                Ok(rt) => Some(rt),
                Err(err) => {
                    tracing::error!(%err, "failed to build fallback runtime");
                    None
                }
            }
        }
    }

    #[inline]
    pub fn spawn<R: Send + 'static>(
        f: impl Future<Output = R> + Send + 'static,
    ) -> tokio::task::JoinHandle<R> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(f)
        } else if let Some(rt) = &*ASYNC_RT {
            rt.spawn(f)
        } else {
            panic!("no tokio runtime available to spawn on")
        }
    }
}
