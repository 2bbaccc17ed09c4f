//! Halyard daemon: entry point for running a gossip node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use halyard_node::{init_logging, LogFormat, Node, NodeConfig, ShutdownController};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "halyard-daemon", about = "Halyard transaction gossip node")]
struct Cli {
    /// Path to a TOML configuration file. If provided, file settings are
    /// used as the base; CLI flags and env vars override them.
    #[arg(long, global = true, env = "HALYARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the node until SIGINT or SIGTERM.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Address to accept peer connections on.
    #[arg(long, env = "HALYARD_LISTEN")]
    listen: Option<String>,

    /// Peers to keep connected (comma-separated: "1.2.3.4:26656,5.6.7.8:26656").
    #[arg(long, env = "HALYARD_PERSISTENT_PEERS", value_delimiter = ',')]
    persistent_peers: Vec<String>,

    /// Maximum number of peer connections.
    #[arg(long, env = "HALYARD_MAX_PEERS")]
    max_peers: Option<usize>,

    /// Log level filter, e.g. "info" or "debug,halyard_mempool=trace".
    #[arg(long, env = "HALYARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, env = "HALYARD_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Keep Prometheus metrics and print them on exit.
    #[arg(long)]
    metrics: bool,

    /// Read hex-encoded transactions from stdin, one per line.
    #[arg(long)]
    stdin_txs: bool,
}

impl RunArgs {
    fn apply(self, mut config: NodeConfig) -> NodeConfig {
        if let Some(listen) = self.listen {
            config.p2p.listen_addr = listen;
        }
        if !self.persistent_peers.is_empty() {
            config.p2p.persistent_peers = self.persistent_peers;
        }
        if let Some(max_peers) = self.max_peers {
            config.p2p.max_peers = max_peers;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config.metrics |= self.metrics;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let base = match &cli.config {
        Some(path) => NodeConfig::from_toml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => NodeConfig::default(),
    };

    match cli.command {
        Command::Run(args) => {
            let stdin_txs = args.stdin_txs;
            let config = args.apply(base);
            init_logging(config.log_format, &config.log_level)?;
            if let Some(path) = &cli.config {
                tracing::info!(path = %path.display(), "loaded config");
            }
            run(config, stdin_txs).await
        }
    }
}

async fn run(config: NodeConfig, stdin_txs: bool) -> anyhow::Result<()> {
    let node = Arc::new(Node::new(config).context("building node")?);
    let addr = node.start().await.context("starting node")?;
    tracing::info!(
        addr = %addr,
        peers = %node.config().p2p.persistent_peers.join(","),
        "halyard node running"
    );

    let shutdown = Arc::new(ShutdownController::new());
    let reader = stdin_txs.then(|| tokio::spawn(read_txs(node.clone(), shutdown.clone())));

    shutdown.wait_for_signal().await;
    if let Some(reader) = reader {
        reader.abort();
    }

    tracing::info!("shutdown signal received, stopping node");
    node.stop().await;
    if let Some(text) = node.metrics_text()? {
        print!("{text}");
    }
    tracing::info!(
        pool_size = node.pool().size(),
        admitted = node.pool().stats().admitted,
        "halyard daemon exited cleanly"
    );
    Ok(())
}

/// Submit every hex line on stdin as a local transaction.
async fn read_txs(node: Arc<Node>, shutdown: Arc<ShutdownController>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stop = shutdown.subscribe();
    loop {
        let line = tokio::select! {
            _ = stop.recv() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("stdin closed");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read stdin");
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tx = match hex::decode(line) {
            Ok(tx) => Bytes::from(tx),
            Err(e) => {
                tracing::warn!(error = %e, "skipping line that is not hex");
                continue;
            }
        };
        match node.submit_local_tx(tx) {
            Ok(key) => tracing::info!(tx = %key, "submitted tx"),
            Err(e) => tracing::warn!(error = %e, "tx not admitted"),
        }
    }
}
