//! tree-replica - replica and reconciliation engine for on-chain hash-linked trees

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tree_replica::backfill::BackfillSweep;
use tree_replica::telemetry;
use tree_replica::types::{ChainTransaction, TreeId, TreeMetadata};
use tree_replica::{
    ArchiveFetcher, BackfillNotifier, BackfillRunner, IngestHandle, IngestStream, Ingester,
    ProjectionPolicy, ReplicaConfig, ReplicaReader, SqliteStore, TreeMaterializer,
};

#[derive(Parser, Debug)]
#[command(name = "tree-replica")]
#[command(about = "Replica and reconciliation engine for on-chain hash-linked trees")]
struct Args {
    /// Path to SQLite database
    #[arg(long, env = "REPLICA_DATABASE_PATH", default_value = "./replica.db")]
    database: String,

    /// Log level / filter directive
    #[arg(long, env = "REPLICA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Projection policy for revisions above a gap: deferred | optimistic
    #[arg(long, env = "REPLICA_PROJECTION_POLICY")]
    policy: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a JSON-lines feed and run the backfill workers
    Run {
        /// Feed file, or "-" for stdin
        #[arg(long, default_value = "-")]
        events: String,

        /// Directory of per-tree history archives used for backfill
        #[arg(long, env = "REPLICA_ARCHIVE_DIR")]
        archive: Option<PathBuf>,

        /// Stop when the feed ends instead of waiting for Ctrl-C
        #[arg(long)]
        exit_on_eof: bool,
    },
    /// Print per-tree consistency status as JSON
    Status,
    /// Queue a forced consistency check for a tree (hex id)
    Audit { tree: String },
    /// Clear a halted tree (hex id)
    Reset { tree: String },
}

/// One line of the ingest feed
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedRecord {
    Tree(TreeMetadata),
    Transaction(ChainTransaction),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ReplicaConfig::from_env();
    config.database_path = args.database.clone();
    if let Some(policy) = &args.policy {
        config.projection_policy = ProjectionPolicy::parse(policy)
            .with_context(|| format!("unknown projection policy '{}'", policy))?;
    }

    tracing::info!(
        database = %config.database_path,
        policy = %config.projection_policy,
        "Starting tree-replica v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = SqliteStore::with_config(config.sqlite()).context("failed to open database")?;
    store.initialize().context("failed to initialize schema")?;
    let store = Arc::new(store);

    let notifier = BackfillNotifier::new();
    let ingester = Arc::new(Ingester::new(
        Arc::clone(&store),
        TreeMaterializer::default(),
        config.projection_policy,
        notifier.clone(),
    ));

    match args.command {
        Command::Run {
            events,
            archive,
            exit_on_eof,
        } => run(config, ingester, events, archive, exit_on_eof).await,
        Command::Status => {
            let statuses = ReplicaReader::new(store).tree_statuses()?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            Ok(())
        }
        Command::Audit { tree } => {
            let tree = parse_tree(&tree)?;
            let sweep = BackfillSweep::new(store, None, notifier, config.backfill);
            if !sweep.request_audit(tree).await? {
                tracing::info!("Audit already queued");
            }
            Ok(())
        }
        Command::Reset { tree } => {
            ingester.reset_tree(&parse_tree(&tree)?)?;
            Ok(())
        }
    }
}

async fn run(
    config: ReplicaConfig,
    ingester: Arc<Ingester>,
    events: String,
    archive: Option<PathBuf>,
    exit_on_eof: bool,
) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics_addr {
        telemetry::install_prometheus(addr)
            .with_context(|| format!("failed to start metrics exporter on {}", addr))?;
        tracing::info!(%addr, "Prometheus metrics exporter listening");
    }

    let (stream, handle) = IngestStream::new(Arc::clone(&ingester), config.ingest.clone());
    let stream_task = tokio::spawn(stream.run());

    let runner = archive.map(|dir| {
        BackfillRunner::new(
            Arc::clone(&ingester),
            Arc::new(ArchiveFetcher::new(dir)),
            config.backfill.clone(),
        )
    });
    let worker_handles = match &runner {
        Some(runner) => runner.start(),
        None => {
            tracing::warn!("No archive configured, backfill workers not started");
            vec![]
        }
    };

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if events == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(&events)
            .await
            .with_context(|| format!("failed to open feed {}", events))?;
        Box::new(BufReader::new(file))
    };

    tokio::select! {
        result = feed(reader, &ingester, &handle) => {
            result?;
            tracing::info!("Feed ended");
            if !exit_on_eof {
                tokio::signal::ctrl_c().await?;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    drop(handle);
    if let Err(e) = stream_task.await {
        tracing::error!(error = %e, "Ingest stream task failed");
    }
    if let Some(runner) = &runner {
        runner.shutdown();
    }
    futures::future::join_all(worker_handles).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Forward feed lines: tree registrations directly, transactions through
/// the ingest stream
async fn feed(
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    ingester: &Arc<Ingester>,
    handle: &IngestHandle,
) -> anyhow::Result<()> {
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: FeedRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping malformed feed line");
                continue;
            }
        };

        match record {
            FeedRecord::Tree(meta) => {
                let ingester = Arc::clone(ingester);
                if let Err(e) = tokio::task::spawn_blocking(move || ingester.register_tree(&meta)).await? {
                    tracing::warn!(line = line_no, error = %e, "Tree registration rejected");
                }
            }
            FeedRecord::Transaction(txn) => {
                let signature = txn.signature.clone();
                match handle.submit(txn).await {
                    Ok(outcome) if !outcome.gaps.is_empty() => tracing::info!(
                        line = line_no,
                        signature = %signature,
                        gaps = outcome.gaps.len(),
                        "Gap queued for backfill"
                    ),
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => tracing::error!(
                        line = line_no,
                        signature = %signature,
                        code = e.error_code(),
                        error = %e,
                        "Transaction refused"
                    ),
                    Err(e) => tracing::warn!(
                        line = line_no,
                        signature = %signature,
                        error = %e,
                        "Transaction rejected"
                    ),
                }
            }
        }
    }
    Ok(())
}

fn parse_tree(s: &str) -> anyhow::Result<TreeId> {
    let bytes = hex::decode(s).context("tree id must be hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("tree id must be 32 bytes"))
}
