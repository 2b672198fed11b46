//! The claims store is where transformed claims and the resume checkpoint are persisted. The sink
//! never talks to a database directly, every persistence concern goes through [ClaimStore].
//!
//! A sink asks its store factory for several instances: one root instance used for key and
//! sequence number extraction and for reading the checkpoint at startup, one instance per
//! partition, and one for the checkpoint writer. Instances are never shared between partitions.

use bytes::Bytes;

use crate::error::Result;

/// In-memory store, every instance created from the same handle shares state.
#[path = "store/memory.rs"]
mod memory;
pub use memory::MemoryStore;

/// Store which logs the claims.
#[path = "store/log.rs"]
mod log;
pub use log::LogStore;

#[cfg(test)]
#[path = "store/test_utils.rs"]
pub(crate) mod test_utils;

/// Set of operations a claims store has to implement.
#[trait_variant::make(ClaimStore: Send)]
pub trait LocalClaimStore {
    /// Raw upstream message.
    type Message: Send + Sync + 'static;
    /// Record persisted by [LocalClaimStore::write_claims].
    type Claim: Send + 'static;

    /// Routing key of the message. All messages with the same key are written by the same
    /// partition in arrival order.
    fn claim_key(&self, message: &Self::Message) -> String;

    /// Upstream sequence number of the message, used for the resume checkpoint.
    fn sequence_number(&self, message: &Self::Message) -> i64;

    /// Validates and transforms a message. `Ok(None)` rejects the message without failing the
    /// batch, an error is treated as a systemic failure.
    async fn transform(
        &mut self,
        version: &str,
        message: &Self::Message,
    ) -> Result<Option<Self::Claim>>;

    /// Persists a batch of claims with unique keys, returns the number of claims written.
    async fn write_claims(&mut self, claims: Vec<Self::Claim>) -> Result<usize>;

    /// Durably records the highest sequence number it is safe to resume after.
    async fn persist_checkpoint(&mut self, sequence_number: i64) -> Result<()>;

    /// Last persisted checkpoint, if any.
    async fn read_checkpoint(&mut self) -> Result<Option<i64>>;

    /// Fails once the store has seen more errors than it tolerates.
    fn check_error_count(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()>;
}

/// Claim update as delivered by the upstream source, understood by the builtin stores.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimUpdate {
    pub key: String,
    pub sequence_number: i64,
    pub payload: Bytes,
}

impl ClaimUpdate {
    pub fn new(key: impl Into<String>, sequence_number: i64, payload: impl Into<Bytes>) -> Self {
        ClaimUpdate {
            key: key.into(),
            sequence_number,
            payload: payload.into(),
        }
    }

    pub(crate) fn to_claim(&self, version: &str) -> Claim {
        Claim {
            key: self.key.clone(),
            sequence_number: self.sequence_number,
            version: version.to_string(),
            payload: self.payload.clone(),
        }
    }
}

/// Claim record written by the builtin stores.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub key: String,
    /// Sequence number of the update this claim was built from.
    pub sequence_number: i64,
    pub version: String,
    pub payload: Bytes,
}
