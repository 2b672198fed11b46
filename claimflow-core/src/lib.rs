//! Claimflow ingests an ordered stream of claim updates and writes them to a claims store.
//!
//! Updates are partitioned by claim key so every key is applied in arrival order by a single
//! writer, batched per partition, and checkpointed with a watermark that only advances past
//! sequence numbers that are durable. A restart resumes after the last checkpoint without losing
//! or skipping unwritten updates. The producer is backpressured once too many updates are in
//! flight.
//!
//! ```text
//! let mut sink = ClaimSinkBuilder::new(SinkConfig::default(), || Ok(MemoryStore::new()))
//!     .build()
//!     .await?;
//! sink.write_messages("v1", updates).await?;
//! sink.close().await?;
//! ```

/// Custom Error handling.
mod error;
pub use error::{Error, Result};

/// Sink configuration.
mod config;
pub use config::SinkConfig;

/// Claims store trait and builtin stores.
mod store;
pub use store::{Claim, ClaimStore, ClaimUpdate, LocalClaimStore, LogStore, MemoryStore};

/// Control messages flowing from admission to the partitions.
mod message;
pub use message::{FLUSH_SEQUENCE_NUMBER, IDLE_SEQUENCE_NUMBER};

/// Prometheus metrics.
mod metrics;
pub use metrics::encode_metrics;

mod admission;
mod checkpoint;
mod partitioner;
mod watermark;
mod writer;

/// The sink orchestrating partitions, admission and checkpoints.
mod sink;
pub use sink::{ClaimSink, ClaimSinkBuilder};
