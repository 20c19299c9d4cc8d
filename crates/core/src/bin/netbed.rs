use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::{Parser, Subcommand, ValueEnum};
use netbed::{
    codec::{BincodeCodec, Codec, JsonCodec},
    config::ConfigArgs,
    metrics::{InMemoryMetrics, MetricsSink},
    simulation::{
        ExponentialInterval, FixedInterval, IntervalGenerator, RunReport, SimulationRng,
        Simulator, UniformInterval,
    },
    Identifier, Network, Node,
};
use tracing::level_filters::LevelFilter;

/// Runs a population of greeting nodes over the selected transport.
#[derive(Parser, Debug)]
#[command(name = "netbed", version, about)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<LevelFilter>,

    /// Encode events as JSON instead of bincode.
    #[arg(long)]
    json: bool,

    /// Greetings each node sends after starting.
    #[arg(long, default_value_t = 1)]
    greetings: u32,

    /// Pause between two greetings of the same node.
    #[arg(long, default_value_t = 100)]
    greeting_interval_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the population untouched for the whole run.
    Steady {
        #[arg(long, default_value_t = 5_000)]
        duration_ms: u64,
    },
    /// Keep stopping and restarting nodes.
    Churn {
        #[arg(long, default_value_t = 10_000)]
        duration_ms: u64,
        #[arg(long, value_enum, default_value_t = Distribution::Exponential)]
        distribution: Distribution,
        /// Mean time a node stays up.
        #[arg(long, default_value_t = 2_000)]
        up_ms: u64,
        /// Mean time a node stays down.
        #[arg(long, default_value_t = 500)]
        down_ms: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Distribution {
    Fixed,
    /// Uniform between zero and twice the mean.
    Uniform,
    Exponential,
}

struct Greeter {
    id: Identifier,
    network: Network<Greeter>,
    rng: SimulationRng,
    greetings: u32,
    interval: Duration,
    received: AtomicU64,
}

impl Greeter {
    fn pick_peer(&self) -> Option<Identifier> {
        let peers: Vec<_> = self
            .network
            .members()
            .iter()
            .copied()
            .filter(|id| *id != self.id)
            .collect();
        self.rng.choose(&peers).copied()
    }
}

impl Node for Greeter {
    type Event = String;

    async fn on_create(&self, members: &[Identifier]) -> anyhow::Result<()> {
        tracing::debug!(id = %self.id, members = members.len(), "created");
        self.network.ready();
        Ok(())
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        for round in 0..self.greetings {
            if round > 0 {
                tokio::time::sleep(self.interval).await;
            }
            let Some(peer) = self.pick_peer() else {
                return Ok(());
            };
            let greeting = format!("hello from {}", self.id);
            if let Err(err) = self.network.send(peer, &greeting).await {
                tracing::info!(id = %self.id, %peer, %err, "greeting lost");
            }
        }
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        tracing::debug!(
            id = %self.id,
            received = self.received.load(Ordering::Relaxed),
            "stopped"
        );
        Ok(())
    }

    async fn on_new_message(&self, origin: Identifier, event: String) -> anyhow::Result<()> {
        self.received.fetch_add(1, Ordering::Relaxed);
        tracing::info!(id = %self.id, %origin, %event, "greeted");
        Ok(())
    }
}

fn interval_generator(
    distribution: Distribution,
    mean: Duration,
    rng: SimulationRng,
) -> anyhow::Result<Box<dyn IntervalGenerator>> {
    Ok(match distribution {
        Distribution::Fixed => Box::new(FixedInterval(mean)),
        Distribution::Uniform => Box::new(UniformInterval::new(Duration::ZERO, mean * 2, rng)),
        Distribution::Exponential => Box::new(ExponentialInterval::new(mean, rng)?),
    })
}

fn print_report(report: &RunReport) {
    println!(
        "{} nodes over {} for {:.1}s",
        report.nodes,
        report.transport,
        report.elapsed.as_secs_f64()
    );
    if report.restarts > 0 || report.failed_restarts > 0 {
        println!(
            "restarts: {} ok, {} failed",
            report.restarts, report.failed_restarts
        );
    }
    if let Some(metrics) = report.metrics {
        println!(
            "messages: {} sent, {} received, {} bytes",
            metrics.sent, metrics.received, metrics.bytes_sent
        );
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.build()?;
    let rng = SimulationRng::new(config.seed);
    let node_rng = rng.child_with_index(u64::from(u32::MAX));
    let greetings = cli.greetings;
    let interval = Duration::from_millis(cli.greeting_interval_ms);
    let factory = move |id: Identifier, network: Network<Greeter>| Greeter {
        id,
        network,
        rng: node_rng.clone(),
        greetings,
        interval,
        received: AtomicU64::new(0),
    };

    let codec: Arc<dyn Codec<String>> = if cli.json {
        Arc::new(JsonCodec::new())
    } else {
        Arc::new(BincodeCodec::new())
    };
    let metrics: Arc<dyn MetricsSink> = Arc::new(InMemoryMetrics::new());
    let simulator = Simulator::with_parts(factory, config, codec, metrics)?;

    let report = match cli.command {
        Command::Steady { duration_ms } => {
            simulator
                .run_steady(Duration::from_millis(duration_ms))
                .await?
        }
        Command::Churn {
            duration_ms,
            distribution,
            up_ms,
            down_ms,
        } => {
            let up = interval_generator(
                distribution,
                Duration::from_millis(up_ms),
                rng.child_with_index(u64::from(u32::MAX) + 1),
            )?;
            let down = interval_generator(
                distribution,
                Duration::from_millis(down_ms),
                rng.child_with_index(u64::from(u32::MAX) + 2),
            )?;
            simulator
                .run_churn(
                    Duration::from_millis(duration_ms),
                    move || up.next_interval(),
                    move || down.next_interval(),
                )
                .await?
        }
    };
    print_report(&report);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    netbed::tracing::init_tracer(cli.log_level)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("netbed-node")
        .build()?;
    rt.block_on(run(cli))
}
