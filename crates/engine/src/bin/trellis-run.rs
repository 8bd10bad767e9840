//! trellis-run: run a bundled vertex program on an in-process cluster.
//!
//! Builds a graph (edge list file or a generated ring, star or grid),
//! partitions it over `--machines` machines, runs the chosen algorithm to
//! completion and prints a JSON summary of the run on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, ValueEnum};
use futures::future::join_all;
use serde_json::json;
use tracing::info;

use trellis_core::{load_dotenv, EngineOptions, VertexId};
use trellis_engine::algorithms::{Distance, MinDistance, NeighbourCount, PageRank, ShortestPath};
use trellis_engine::{AsyncEngine, SignalOrder, TerminationReason, VertexProgram};
use trellis_graph::{generators, GraphBuilder, PartitionStrategy};
use trellis_rpc::{LocalCluster, RpcConfig};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Algorithm {
    Pagerank,
    Sssp,
    Degree,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Placement {
    Hashed,
    BySource,
}

/// Run a vertex program on a partitioned graph.
#[derive(Parser, Debug)]
#[command(name = "trellis-run", version, about)]
struct Cli {
    /// Algorithm to run.
    #[arg(long, env = "TRELLIS_ALGORITHM", value_enum, default_value_t = Algorithm::Pagerank)]
    algorithm: Algorithm,

    /// Number of in-process machines.
    #[arg(long, env = "TRELLIS_MACHINES", default_value_t = 2)]
    machines: usize,

    /// Whitespace-separated edge list file.
    #[arg(long, conflicts_with_all = ["ring", "star", "grid"])]
    edges: Option<PathBuf>,

    /// Generate a directed ring of this many vertices.
    #[arg(long)]
    ring: Option<usize>,

    /// Generate a star of this many vertices, leaves pointing at vertex 0.
    #[arg(long)]
    star: Option<usize>,

    /// Generate a grid, given as ROWSxCOLS.
    #[arg(long)]
    grid: Option<String>,

    /// How edges are placed on machines.
    #[arg(long, value_enum, default_value_t = Placement::Hashed)]
    placement: Placement,

    /// Source vertex for sssp.
    #[arg(long, default_value_t = 0)]
    source: VertexId,

    /// Engine options TOML file. Without it options come from TRELLIS_* variables.
    #[arg(long, env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,

    /// Remote call layer TOML file.
    #[arg(long, env = "TRELLIS_RPC_CONFIG")]
    rpc_config: Option<PathBuf>,

    /// Extra engine option, as key=value. May be repeated.
    #[arg(long = "option", short = 'o')]
    options: Vec<String>,
}

impl Cli {
    fn engine_options(&self) -> anyhow::Result<EngineOptions> {
        let mut options = match &self.config {
            Some(path) => EngineOptions::from_file(path)
                .with_context(|| format!("reading engine options from {}", path.display()))?,
            None => EngineOptions::from_env()?,
        };
        for pair in &self.options {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("engine option '{pair}' is not key=value");
            };
            options.set_option(key.trim(), value)?;
        }
        options.validate()?;
        Ok(options)
    }

    fn rpc_options(&self) -> anyhow::Result<RpcConfig> {
        match &self.rpc_config {
            Some(path) => Ok(RpcConfig::from_file(path)?),
            None => Ok(RpcConfig::local()),
        }
    }

    fn graph<V: Default, E: Default>(&self) -> anyhow::Result<GraphBuilder<V, E>> {
        if let Some(path) = &self.edges {
            let mut builder = GraphBuilder::new();
            let accepted = builder
                .load_edge_list(path)
                .with_context(|| format!("loading edge list {}", path.display()))?;
            info!(path = %path.display(), edges = accepted, "edge list loaded");
            return Ok(builder);
        }
        if let Some(n) = self.ring {
            return Ok(generators::ring(n));
        }
        if let Some(n) = self.star {
            return Ok(generators::star(n));
        }
        if let Some(shape) = &self.grid {
            let Some((rows, cols)) = shape.split_once('x') else {
                bail!("grid '{shape}' is not ROWSxCOLS");
            };
            return Ok(generators::grid(rows.trim().parse()?, cols.trim().parse()?));
        }
        bail!("no graph given: pass --edges, --ring, --star or --grid")
    }

    fn placement(&self) -> PartitionStrategy {
        match self.placement {
            Placement::Hashed => PartitionStrategy::Hashed,
            Placement::BySource => PartitionStrategy::BySource,
        }
    }
}

// ── Running ─────────────────────────────────────────────────────────

/// How a run is seeded.
enum Seed<M> {
    Everyone(M),
    One(VertexId, M),
}

struct Outcome<P: VertexProgram> {
    engines: Vec<AsyncEngine<P>>,
    reason: TerminationReason,
}

async fn run<P: VertexProgram>(
    machines: usize,
    builder: GraphBuilder<P::VertexData, P::EdgeData>,
    strategy: PartitionStrategy,
    options: EngineOptions,
    rpc_config: RpcConfig,
    seed: Seed<P::Message>,
) -> anyhow::Result<Outcome<P>> {
    let rpcs = LocalCluster::spawn(machines, rpc_config);
    let graphs = builder.partition(machines, strategy);
    for graph in &graphs {
        info!(stats = ?graph.stats(), "partition ready");
    }

    let engines = join_all(
        rpcs.into_iter()
            .zip(graphs)
            .map(|(rpc, graph)| AsyncEngine::<P>::new(rpc, Arc::new(graph), options.clone())),
    )
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()?;

    let seeded = join_all(engines.iter().enumerate().map(|(m, engine)| {
        let seed = match &seed {
            Seed::Everyone(message) => Seed::Everyone(message.clone()),
            // Every machine joins the collective signal; only machine 0
            // brings a real message.
            Seed::One(gvid, message) if m == 0 => Seed::One(*gvid, message.clone()),
            Seed::One(gvid, _) => Seed::One(*gvid, P::Message::default()),
        };
        async move {
            match seed {
                Seed::Everyone(message) => engine.signal_all(message, SignalOrder::Shuffle).await,
                Seed::One(gvid, message) => engine.signal(gvid, message).await,
            }
        }
    }))
    .await;
    for result in seeded {
        result?;
    }

    let reasons = join_all(engines.iter().map(|e| e.start())).await;
    let mut reason = TerminationReason::TaskDepletion;
    for result in reasons {
        reason = reason.max(result?);
    }
    Ok(Outcome { engines, reason })
}

/// Every master replica's data, by global id.
fn masters<P: VertexProgram>(engines: &[AsyncEngine<P>]) -> Vec<(VertexId, P::VertexData)> {
    let mut all: Vec<(VertexId, P::VertexData)> = engines
        .iter()
        .flat_map(|engine| {
            let graph = engine.graph();
            graph
                .owned_vertices()
                .map(|lvid| (graph.record(lvid).gvid, graph.vertex_data(lvid).clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    all.sort_by_key(|(gvid, _)| *gvid);
    all
}

fn summary<P: VertexProgram>(outcome: &Outcome<P>, result: serde_json::Value) -> serde_json::Value {
    let first = &outcome.engines[0];
    json!({
        "reason": outcome.reason,
        "updates": first.num_updates(),
        "options": first.options().summary(),
        "metrics": first.metrics(),
        "result": result,
    })
}

async fn execute(cli: Cli, options: EngineOptions) -> anyhow::Result<serde_json::Value> {
    let rpc_config = cli.rpc_options()?;
    let strategy = cli.placement();
    let report = match cli.algorithm {
        Algorithm::Pagerank => {
            let outcome = run::<PageRank>(
                cli.machines,
                cli.graph()?,
                strategy,
                options,
                rpc_config,
                Seed::Everyone(()),
            )
            .await?;
            let mut ranks = masters(&outcome.engines);
            ranks.sort_by(|a, b| b.1.total_cmp(&a.1));
            ranks.truncate(10);
            summary(&outcome, json!({ "top": ranks }))
        }
        Algorithm::Sssp => {
            let outcome = run::<ShortestPath>(
                cli.machines,
                cli.graph()?,
                strategy,
                options,
                rpc_config,
                Seed::One(cli.source, MinDistance(0.0)),
            )
            .await?;
            let distances = masters(&outcome.engines);
            let reached: Vec<f64> = distances
                .iter()
                .map(|(_, Distance(d))| *d)
                .filter(|d| d.is_finite())
                .collect();
            let farthest = reached.iter().copied().fold(0.0, f64::max);
            summary(
                &outcome,
                json!({ "source": cli.source, "reached": reached.len(), "farthest": farthest }),
            )
        }
        Algorithm::Degree => {
            let outcome = run::<NeighbourCount>(
                cli.machines,
                cli.graph()?,
                strategy,
                options,
                rpc_config,
                Seed::Everyone(()),
            )
            .await?;
            let degrees = masters(&outcome.engines);
            let busiest = degrees.iter().max_by_key(|(_, d)| d.total()).map(|(gvid, d)| json!({ "vertex": gvid, "degrees": d }));
            let edges: usize = degrees.iter().map(|(_, d)| d.inbound).sum();
            summary(&outcome, json!({ "busiest": busiest, "edges": edges }))
        }
    };
    Ok(report)
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.machines == 0 {
        bail!("--machines must be at least 1");
    }
    let options = cli.engine_options()?;
    options.log_summary();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(options.stacksize)
        .build()
        .context("building the tokio runtime")?;

    let report = runtime.block_on(execute(cli, options))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
