//! Synthetic upstream source. Generates claim updates cycling over a fixed set of claim keys and
//! pushes them through a [claimflow_core::ClaimSink], resuming after the checkpoint the store holds.

use std::error::Error;
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use bytes::Bytes;
use claimflow_core::{
    ClaimSinkBuilder, ClaimStore, ClaimUpdate, LogStore, MemoryStore, SinkConfig, encode_metrics,
};
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{error, info};

/// Upper bound on how long a partially filled chunk of updates waits before it is written.
const CHUNK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum StoreKind {
    Memory,
    Log,
}

#[derive(Debug, Clone)]
pub(crate) struct GeneratorArgs {
    pub(crate) count: u64,
    pub(crate) keys: u64,
    pub(crate) store: StoreKind,
    pub(crate) version: String,
}

/// Builds the update with `sequence_number`. Every tenth update has an empty payload, which the
/// builtin memory store rejects.
fn claim_update(sequence_number: i64, keys: u64) -> ClaimUpdate {
    let key = format!("claim-{}", sequence_number.unsigned_abs() % keys);
    let payload = if sequence_number % 10 == 0 {
        Bytes::new()
    } else {
        Bytes::from(format!("update {sequence_number} of {key}"))
    };
    ClaimUpdate::new(key, sequence_number, payload)
}

/// Every store handed out shares the state of `store`.
fn memory_factory(store: MemoryStore) -> impl FnMut() -> claimflow_core::Result<MemoryStore> {
    move || Ok(store.clone())
}

pub(crate) async fn run(args: GeneratorArgs, config: SinkConfig) -> Result<(), Box<dyn Error>> {
    match args.store {
        StoreKind::Memory => {
            let store = MemoryStore::new();
            let factory = memory_factory(store.clone());
            generate(&args, config, factory, shutdown_signal()).await?;
            info!(claims = store.claim_count(), "Claims held by the memory store");
        }
        StoreKind::Log => {
            generate(&args, config, || Ok(LogStore::default()), shutdown_signal()).await?;
        }
    }
    Ok(())
}

/// Writes `args.count` updates in chunks of the configured batch size until done or until
/// `shutdown` resolves, then shuts the sink down.
async fn generate<S, F>(
    args: &GeneratorArgs,
    config: SinkConfig,
    factory: F,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Box<dyn Error>>
where
    S: ClaimStore<Message = ClaimUpdate> + Send + 'static,
    F: FnMut() -> claimflow_core::Result<S>,
{
    let chunk_size = config.batch_size;
    let mut sink = ClaimSinkBuilder::new(config, factory).build().await?;

    let start = sink.safe_resume_point() + 1;
    let end = start.saturating_add(i64::try_from(args.count)?);
    info!(start, count = args.count, keys = args.keys, "Generating claim updates");

    let keys = args.keys;
    let updates = tokio_stream::iter(start..end).map(move |seq| claim_update(seq, keys));
    let mut chunks = pin!(updates.chunks_timeout(chunk_size, CHUNK_TIMEOUT));
    let mut shutdown = pin!(shutdown);

    let mut written = 0;
    let produced = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping generator");
                break Ok(());
            }
            chunk = chunks.next() => match chunk {
                Some(chunk) => match sink.write_messages(&args.version, chunk).await {
                    Ok(processed) => written += processed,
                    Err(e) => break Err(e),
                },
                None => break Ok(()),
            },
        }
    };
    if let Err(e) = &produced {
        error!(?e, "Failed to write claim updates");
    }

    // shut down even when producing failed, so buffered claims still get written
    let closed = sink.close().await;
    written += sink.processed_count().unwrap_or(0);
    info!(written, checkpoint = sink.safe_resume_point(), "Generator finished");
    info!("Metrics:\n{}", encode_metrics()?);

    produced?;
    closed?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
