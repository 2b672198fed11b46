use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::{sink_labels, sink_metrics};
use crate::store::ClaimStore;
use crate::watermark::WatermarkTracker;

/// Persists the safe resume point of the [WatermarkTracker] whenever it advances. The persisted
/// value never goes backwards.
pub(crate) struct CheckpointWriter<S> {
    store: S,
    tracker: Arc<WatermarkTracker>,
    last_persisted: i64,
}

impl<S: ClaimStore> CheckpointWriter<S> {
    /// `last_persisted` is the checkpoint the store already holds.
    pub(crate) fn new(store: S, tracker: Arc<WatermarkTracker>, last_persisted: i64) -> Self {
        CheckpointWriter {
            store,
            tracker,
            last_persisted,
        }
    }

    /// Persists the watermark if it moved past the last persisted value. On failure the
    /// remembered value is kept, so the next call retries the same write.
    pub(crate) async fn update(&mut self) -> Result<()> {
        let watermark = self.tracker.safe_resume_point();
        if watermark <= self.last_persisted {
            return Ok(());
        }
        self.persist(watermark).await
    }

    async fn persist(&mut self, watermark: i64) -> Result<()> {
        self.store
            .persist_checkpoint(watermark)
            .await
            .map_err(|e| Error::Checkpoint(format!("persisting {watermark}: {e}")))?;
        debug!(watermark, "Persisted checkpoint");
        self.last_persisted = watermark;
        sink_metrics()
            .checkpoint
            .get_or_create(sink_labels())
            .set(watermark);
        Ok(())
    }

    pub(crate) fn last_persisted(&self) -> i64 {
        self.last_persisted
    }

    /// Persists the final watermark even if it did not change, then closes the store. Both steps
    /// run, their errors are reported together.
    pub(crate) async fn close(mut self) -> Result<()> {
        let mut errors = vec![];
        let watermark = self.tracker.safe_resume_point().max(self.last_persisted);
        if let Err(e) = self.persist(watermark).await {
            errors.push(e);
        }
        info!(watermark = self.last_persisted, "Final checkpoint");
        if let Err(e) = self.store.close().await {
            errors.push(e);
        }
        Error::from_many(errors)
    }
}

/// Runs [CheckpointWriter::update] every `interval` until `cancel` fires or an update fails. The
/// failure is handed to `on_error`. Cancelling also interrupts an update in progress, the final
/// persist in [CheckpointWriter::close] covers it.
pub(crate) async fn run_checkpoint<S, F>(
    mut writer: CheckpointWriter<S>,
    interval: Duration,
    cancel: CancellationToken,
    on_error: F,
) -> CheckpointWriter<S>
where
    S: ClaimStore,
    F: FnOnce(Error),
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Checkpoint pipeline cancelled");
                break;
            }
            _ = ticker.tick() => {}
        }
        let updated = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = writer.update() => Some(result),
        };
        match updated {
            None => {
                debug!("Checkpoint pipeline cancelled during an update");
                break;
            }
            Some(Err(e)) => {
                error!(?e, "Failed to persist checkpoint, stopping checkpoints");
                on_error(e);
                break;
            }
            Some(Ok(())) => {}
        }
    }
    let active = writer.tracker.active_count();
    if active > 0 {
        warn!(
            active,
            last_persisted = writer.last_persisted(),
            "Checkpoint pipeline stopped with messages in flight"
        );
    }
    writer
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::store::MemoryStore;
    use crate::store::test_utils::RecordingStore;

    #[tokio::test]
    async fn test_update_only_when_advanced() {
        let store = MemoryStore::new();
        let tracker = Arc::new(WatermarkTracker::new(0));
        let mut writer = CheckpointWriter::new(store.clone(), Arc::clone(&tracker), 0);

        writer.update().await.unwrap();
        assert!(store.checkpoints().is_empty());

        tracker.add_active(1);
        tracker.add_active(2);
        writer.update().await.unwrap();
        assert!(store.checkpoints().is_empty());

        tracker.remove_written(2);
        writer.update().await.unwrap();
        assert!(store.checkpoints().is_empty());

        tracker.remove_written(1);
        writer.update().await.unwrap();
        writer.update().await.unwrap();
        assert_eq!(store.checkpoints(), vec![2]);
        assert_eq!(writer.last_persisted(), 2);
    }

    #[tokio::test]
    async fn test_never_goes_backwards() {
        let store = MemoryStore::new();
        let tracker = Arc::new(WatermarkTracker::new(10));
        let mut writer = CheckpointWriter::new(store.clone(), Arc::clone(&tracker), 10);

        // replaying below the restored checkpoint
        tracker.add_active(5);
        writer.update().await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(store.checkpoints(), vec![10]);
        assert_eq!(store.closed(), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_persisted() {
        let (recorded, mut factory) = RecordingStore::factory();
        let tracker = Arc::new(WatermarkTracker::new(0));
        let mut writer = CheckpointWriter::new(factory().unwrap(), Arc::clone(&tracker), 0);

        tracker.add_active(1);
        tracker.remove_written(1);
        recorded.lock().fail_checkpoints = true;
        assert!(matches!(writer.update().await, Err(Error::Checkpoint(_))));
        assert_eq!(writer.last_persisted(), 0);

        // the final flush retries the same value
        recorded.lock().fail_checkpoints = false;
        writer.close().await.unwrap();
        assert_eq!(recorded.lock().checkpoints, vec![1]);
        assert_eq!(recorded.lock().closed, vec![0]);
    }

    #[tokio::test]
    async fn test_close_reports_all_errors() {
        let (recorded, mut factory) = RecordingStore::factory();
        let tracker = Arc::new(WatermarkTracker::new(3));
        let writer = CheckpointWriter::new(factory().unwrap(), tracker, 3);
        {
            let mut recorded = recorded.lock();
            recorded.fail_checkpoints = true;
            recorded.fail_close = true;
        }

        let Err(Error::Multiple(errors)) = writer.close().await else {
            panic!("expected both errors");
        };
        assert!(matches!(errors[0], Error::Checkpoint(_)));
        assert!(matches!(errors[1], Error::Store(_)));
        assert_eq!(recorded.lock().closed, vec![0]);
    }

    #[tokio::test]
    async fn test_run_checkpoint() {
        let store = MemoryStore::new();
        let tracker = Arc::new(WatermarkTracker::new(0));
        let writer = CheckpointWriter::new(store.clone(), Arc::clone(&tracker), 0);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_checkpoint(
            writer,
            Duration::from_millis(10),
            cancel.clone(),
            |e| panic!("unexpected checkpoint error {e}"),
        ));

        tracker.add_active(1);
        tracker.add_active(2);
        tracker.remove_written(1);
        time::timeout(Duration::from_secs(2), async {
            while store.checkpoint() != Some(1) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("checkpoint should advance to 1");

        cancel.cancel();
        let writer = handle.await.unwrap();
        assert_eq!(writer.last_persisted(), 1);
    }

    #[tokio::test]
    async fn test_run_checkpoint_stops_on_error() {
        let (recorded, mut factory) = RecordingStore::factory();
        recorded.lock().fail_checkpoints = true;
        let tracker = Arc::new(WatermarkTracker::new(0));
        tracker.add_active(4);
        tracker.remove_written(4);

        let reported = Arc::new(Mutex::new(None::<Error>));
        let writer = CheckpointWriter::new(factory().unwrap(), tracker, 0);
        let on_error = {
            let reported = Arc::clone(&reported);
            move |e: Error| *reported.lock() = Some(e)
        };

        let writer = time::timeout(
            Duration::from_secs(2),
            run_checkpoint(writer, Duration::from_millis(10), CancellationToken::new(), on_error),
        )
        .await
        .expect("checkpoint pipeline should stop on error");
        assert_eq!(writer.last_persisted(), 0);
        assert!(matches!(*reported.lock(), Some(Error::Checkpoint(_))));
    }
}
