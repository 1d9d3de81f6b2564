//! shape-stream: tail a shape and print every change as a JSON line

mod config;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use shape_stream_core::{HttpTransport, ShapeStream, SnapshotOptions, StreamState};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(version, about = "Tail a shape stream and print changes as JSON lines")]
struct Args {
    /// Shape endpoint, e.g. http://localhost:3000/v1/shape
    #[arg(long)]
    url: Url,

    /// Table to subscribe to
    #[arg(long)]
    table: String,

    /// Row filter
    #[arg(long = "where")]
    where_clause: Option<String>,

    /// Columns to include (repeatable)
    #[arg(long = "column")]
    columns: Vec<String>,

    /// Config file (defaults to <config dir>/shape-stream/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fetch a snapshot of this many rows once the stream is running
    #[arg(long)]
    snapshot_limit: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shape_stream=info,shape_stream_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = config::load(args.config.as_deref())?;

    let mut builder = ShapeStream::builder()
        .param("table", &args.table)
        .config(config)
        .transport(HttpTransport::new(args.url.clone()));
    if let Some(where_clause) = &args.where_clause {
        builder = builder.param("where", where_clause);
    }
    if !args.columns.is_empty() {
        builder = builder.param("columns", args.columns.join(","));
    }
    let stream = builder.build().context("building shape stream")?;

    info!(url = %args.url, table = %args.table, stream_id = %stream.id(), "shape-stream: subscribing");
    let _subscription = stream.subscribe(|event| {
        let mut stdout = std::io::stdout().lock();
        for line in output::render(event) {
            if writeln!(stdout, "{line}").is_err() {
                return;
            }
        }
    });

    if let Some(limit) = args.snapshot_limit {
        match stream
            .request_snapshot(SnapshotOptions::with_limit(limit))
            .await
        {
            Ok(snapshot) => info!(rows = snapshot.data.len(), "shape-stream: snapshot fetched"),
            Err(e) => warn!(error = %e, "shape-stream: snapshot failed"),
        }
    }

    let mut states = stream.state_changes();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            info!("shape-stream: interrupted, shutting down");
        }
        _ = states.wait_for(|state| *state == StreamState::Stopped) => {
            warn!("shape-stream: stream stopped");
        }
    }

    stream.unsubscribe_all();
    Ok(())
}
