//! Store which records which instance saw what, with failure injection.

use std::future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::store::{Claim, ClaimStore, ClaimUpdate};

#[derive(Debug, Default)]
pub(crate) struct Recorded {
    next_instance: usize,
    /// (instance, key, sequence number) of every transform call.
    pub(crate) transforms: Vec<(usize, String, i64)>,
    /// (instance, batch) of every successful write.
    pub(crate) batches: Vec<(usize, Vec<Claim>)>,
    pub(crate) checkpoints: Vec<i64>,
    pub(crate) closed: Vec<usize>,
    pub(crate) initial_checkpoint: Option<i64>,
    pub(crate) fail_writes: bool,
    /// Writes never complete.
    pub(crate) hang_writes: bool,
    pub(crate) fail_transform_key: Option<String>,
    pub(crate) fail_checkpoints: bool,
    pub(crate) fail_close: bool,
}

#[derive(Debug)]
pub(crate) struct RecordingStore {
    pub(crate) instance: usize,
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingStore {
    /// Returns the shared recording and a factory handing out numbered instances, starting at 0.
    pub(crate) fn factory() -> (
        Arc<Mutex<Recorded>>,
        impl FnMut() -> Result<RecordingStore> + Send + 'static,
    ) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let factory = {
            let recorded = Arc::clone(&recorded);
            move || {
                let instance = {
                    let mut state = recorded.lock();
                    let instance = state.next_instance;
                    state.next_instance += 1;
                    instance
                };
                Ok(RecordingStore {
                    instance,
                    recorded: Arc::clone(&recorded),
                })
            }
        };
        (recorded, factory)
    }
}

impl ClaimStore for RecordingStore {
    type Message = ClaimUpdate;
    type Claim = Claim;

    fn claim_key(&self, message: &ClaimUpdate) -> String {
        message.key.clone()
    }

    fn sequence_number(&self, message: &ClaimUpdate) -> i64 {
        message.sequence_number
    }

    async fn transform(&mut self, version: &str, message: &ClaimUpdate) -> Result<Option<Claim>> {
        let mut recorded = self.recorded.lock();
        recorded
            .transforms
            .push((self.instance, message.key.clone(), message.sequence_number));
        if recorded.fail_transform_key.as_deref() == Some(message.key.as_str()) {
            return Err(Error::Store(format!("cannot transform {}", message.key)));
        }
        if message.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(message.to_claim(version)))
    }

    async fn write_claims(&mut self, claims: Vec<Claim>) -> Result<usize> {
        let hang = self.recorded.lock().hang_writes;
        if hang {
            future::pending::<()>().await;
        }
        let mut recorded = self.recorded.lock();
        if recorded.fail_writes {
            return Err(Error::Store("write failed".to_string()));
        }
        let written = claims.len();
        recorded.batches.push((self.instance, claims));
        Ok(written)
    }

    async fn persist_checkpoint(&mut self, sequence_number: i64) -> Result<()> {
        let mut recorded = self.recorded.lock();
        if recorded.fail_checkpoints {
            return Err(Error::Store("checkpoint failed".to_string()));
        }
        recorded.checkpoints.push(sequence_number);
        Ok(())
    }

    async fn read_checkpoint(&mut self) -> Result<Option<i64>> {
        Ok(self.recorded.lock().initial_checkpoint)
    }

    async fn close(&mut self) -> Result<()> {
        let mut recorded = self.recorded.lock();
        recorded.closed.push(self.instance);
        if recorded.fail_close {
            return Err(Error::Store(format!("close of instance {} failed", self.instance)));
        }
        Ok(())
    }
}
