use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::store::{Claim, ClaimStore, ClaimUpdate};

#[derive(Debug, Default)]
struct State {
    claims: HashMap<String, Claim>,
    batches: Vec<Vec<Claim>>,
    transformed: Vec<(String, i64)>,
    checkpoints: Vec<i64>,
    closed: usize,
}

/// Keeps claims in memory. Clones share the same state, so a single handle can serve as the store
/// factory of a sink and be inspected afterwards. Updates with an empty payload are rejected.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store which already holds a checkpoint, as after a restart.
    pub fn with_checkpoint(sequence_number: i64) -> Self {
        let store = Self::default();
        store.state.lock().checkpoints.push(sequence_number);
        store
    }

    pub fn claim(&self, key: &str) -> Option<Claim> {
        self.state.lock().claims.get(key).cloned()
    }

    /// Number of distinct claims written.
    pub fn claim_count(&self) -> usize {
        self.state.lock().claims.len()
    }

    /// Every batch passed to `write_claims`, in write order.
    pub fn batches(&self) -> Vec<Vec<Claim>> {
        self.state.lock().batches.clone()
    }

    /// Key and sequence number of every transformed update, in transform order.
    pub fn transformed(&self) -> Vec<(String, i64)> {
        self.state.lock().transformed.clone()
    }

    pub fn checkpoint(&self) -> Option<i64> {
        self.state.lock().checkpoints.last().copied()
    }

    /// Every checkpoint persisted so far, oldest first.
    pub fn checkpoints(&self) -> Vec<i64> {
        self.state.lock().checkpoints.clone()
    }

    /// Number of closed instances.
    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }
}

impl ClaimStore for MemoryStore {
    type Message = ClaimUpdate;
    type Claim = Claim;

    fn claim_key(&self, message: &ClaimUpdate) -> String {
        message.key.clone()
    }

    fn sequence_number(&self, message: &ClaimUpdate) -> i64 {
        message.sequence_number
    }

    async fn transform(&mut self, version: &str, message: &ClaimUpdate) -> Result<Option<Claim>> {
        self.state
            .lock()
            .transformed
            .push((message.key.clone(), message.sequence_number));
        if message.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(message.to_claim(version)))
    }

    async fn write_claims(&mut self, claims: Vec<Claim>) -> Result<usize> {
        let mut state = self.state.lock();
        let written = claims.len();
        state.batches.push(claims.clone());
        for claim in claims {
            state.claims.insert(claim.key.clone(), claim);
        }
        Ok(written)
    }

    async fn persist_checkpoint(&mut self, sequence_number: i64) -> Result<()> {
        self.state.lock().checkpoints.push(sequence_number);
        Ok(())
    }

    async fn read_checkpoint(&mut self) -> Result<Option<i64>> {
        Ok(self.checkpoint())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let handle = MemoryStore::new();
        let mut store = handle.clone();

        let rejected = ClaimUpdate::new("A", 1, "");
        assert_eq!(store.transform("v1", &rejected).await.unwrap(), None);

        let first = store
            .transform("v1", &ClaimUpdate::new("A", 2, "first"))
            .await
            .unwrap()
            .unwrap();
        let second = store
            .transform("v1", &ClaimUpdate::new("A", 3, "second"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.version, "v1");

        assert_eq!(store.write_claims(vec![first]).await.unwrap(), 1);
        assert_eq!(store.write_claims(vec![second]).await.unwrap(), 1);

        // upserts by key
        assert_eq!(handle.claim_count(), 1);
        assert_eq!(handle.claim("A").unwrap().payload, Bytes::from("second"));
        assert_eq!(handle.batches().len(), 2);
        assert_eq!(
            handle.transformed(),
            vec![("A".to_string(), 1), ("A".to_string(), 2), ("A".to_string(), 3)]
        );

        assert_eq!(store.read_checkpoint().await.unwrap(), None);
        store.persist_checkpoint(3).await.unwrap();
        assert_eq!(handle.checkpoint(), Some(3));

        store.close().await.unwrap();
        assert_eq!(handle.closed(), 1);
    }

    #[tokio::test]
    async fn test_with_checkpoint() {
        let mut store = MemoryStore::with_checkpoint(42);
        assert_eq!(store.read_checkpoint().await.unwrap(), Some(42));
        assert!(store.check_error_count().is_ok());
    }
}
