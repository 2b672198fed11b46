//! A partition writer owns the buffer of one partition. It is driven by a single task, so the
//! buffer is never shared and needs no lock.
//!
//! Two triggers flush the buffer:
//! - size: the number of unique claim keys reaches the batch size.
//! - quiescence: two consecutive idle ticks arrive with no data in between. The first tick arms
//!   the writer, the second one flushes.
//!
//! A flush returns a [BatchResult] which carries every data message of the batch, including the
//! ones the store rejected, so their sequence numbers can be retired from the watermark.

use std::mem;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::message::{BatchResult, ClaimMessage, ControlMessage};
use crate::metrics::{partition_labels, sink_metrics};
use crate::store::ClaimStore;

pub(crate) struct PartitionWriter<S: ClaimStore> {
    partition: usize,
    store: S,
    batch_size: usize,
    /// Latest claim per key, in first-seen order.
    claims: IndexMap<String, S::Claim>,
    /// Data messages contributing to the current batch, in arrival order.
    messages: Vec<ClaimMessage<S::Message>>,
    idle_armed: bool,
    /// Set once a write failed, every later message is discarded.
    failed: bool,
}

impl<S: ClaimStore> PartitionWriter<S> {
    pub(crate) fn new(partition: usize, store: S, batch_size: usize) -> Self {
        PartitionWriter {
            partition,
            store,
            batch_size,
            claims: IndexMap::with_capacity(batch_size),
            messages: Vec::with_capacity(batch_size),
            idle_armed: false,
            failed: false,
        }
    }

    /// Applies one control message to the buffer, returns the outcome if it caused a flush.
    pub(crate) async fn process_message(
        &mut self,
        message: ControlMessage<S::Message>,
    ) -> Option<BatchResult<S::Message>> {
        trace!(
            partition = self.partition,
            sequence_number = message.sequence_number(),
            "Processing message"
        );
        match message {
            ControlMessage::Data(message) => self.process_data(message).await,
            ControlMessage::Flush => {
                self.idle_armed = false;
                if self.messages.is_empty() {
                    return None;
                }
                Some(self.flush().await)
            }
            ControlMessage::Idle => {
                if self.idle_armed && !self.messages.is_empty() {
                    debug!(partition = self.partition, "Partition is idle, flushing");
                    return Some(self.flush().await);
                }
                self.idle_armed = true;
                None
            }
        }
    }

    async fn process_data(
        &mut self,
        message: ClaimMessage<S::Message>,
    ) -> Option<BatchResult<S::Message>> {
        if self.failed {
            warn!(
                partition = self.partition,
                sequence_number = message.sequence_number,
                "Partition has failed, discarding message"
            );
            return None;
        }

        match self.store.transform(&message.version, &message.payload).await {
            Ok(Some(claim)) => {
                self.claims.insert(message.claim_key.clone(), claim);
            }
            Ok(None) => {
                debug!(
                    partition = self.partition,
                    sequence_number = message.sequence_number,
                    "Message rejected by transform"
                );
                sink_metrics()
                    .rejected_total
                    .get_or_create(&partition_labels(self.partition))
                    .inc();
            }
            Err(e) => {
                error!(
                    partition = self.partition,
                    sequence_number = message.sequence_number,
                    ?e,
                    "Failed to transform message"
                );
                let mut messages = self.take_buffer().1;
                messages.push(message);
                return Some(self.fail(messages, e));
            }
        }

        // rejected messages stay in the batch so they are retired with it
        self.messages.push(message);
        self.idle_armed = false;

        if self.claims.len() >= self.batch_size {
            return Some(self.flush().await);
        }
        None
    }

    /// Writes the unique claims and clears the buffer.
    async fn flush(&mut self) -> BatchResult<S::Message> {
        let (claims, messages) = self.take_buffer();
        if claims.is_empty() {
            // every message was rejected, nothing to write
            return BatchResult::written(self.partition, 0, messages);
        }

        let labels = partition_labels(self.partition);
        let batch_size = claims.len();
        let start = Instant::now();
        match self.store.write_claims(claims).await {
            Ok(processed) => {
                debug!(
                    partition = self.partition,
                    batch_size,
                    messages = messages.len(),
                    processed,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Wrote batch"
                );
                let metrics = sink_metrics();
                metrics
                    .write_time
                    .get_or_create(&labels)
                    .observe(start.elapsed().as_micros() as f64);
                metrics
                    .claims_written_total
                    .get_or_create(&labels)
                    .inc_by(processed as u64);
                BatchResult::written(self.partition, processed, messages)
            }
            Err(e) => {
                error!(partition = self.partition, batch_size, ?e, "Failed to write batch");
                self.fail(messages, e)
            }
        }
    }

    fn take_buffer(&mut self) -> (Vec<S::Claim>, Vec<ClaimMessage<S::Message>>) {
        let claims = mem::take(&mut self.claims).into_values().collect();
        let messages = mem::take(&mut self.messages);
        (claims, messages)
    }

    fn fail(
        &mut self,
        messages: Vec<ClaimMessage<S::Message>>,
        error: Error,
    ) -> BatchResult<S::Message> {
        self.failed = true;
        BatchResult::failed(self.partition, messages, error)
    }

    /// Number of buffered data messages.
    pub(crate) fn pending(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn partition(&self) -> usize {
        self.partition
    }

    /// Closes the underlying store.
    pub(crate) async fn close(mut self) -> Result<()> {
        if self.pending() > 0 {
            warn!(
                partition = self.partition,
                pending = self.pending(),
                "Closing partition with buffered messages"
            );
        }
        self.store.close().await
    }
}

/// Drives a partition writer until its input ends, merging idle ticks into the input. Every
/// batch result is handed to `on_batch`. The input ends with a final flush, after which the
/// writer is returned so it can be closed.
///
/// Cancelling `stop` returns the writer right away, abandoning a write in progress and whatever
/// is still buffered. Their sequence numbers stay active.
pub(crate) async fn run_partition<S, F>(
    mut writer: PartitionWriter<S>,
    mut input: mpsc::UnboundedReceiver<ControlMessage<S::Message>>,
    idle_check_interval: Duration,
    stop: CancellationToken,
    mut on_batch: F,
) -> PartitionWriter<S>
where
    S: ClaimStore,
    F: FnMut(BatchResult<S::Message>),
{
    let mut idle_ticker =
        time::interval_at(Instant::now() + idle_check_interval, idle_check_interval);
    idle_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => return stopped(writer),
            message = input.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = idle_ticker.tick() => ControlMessage::Idle,
        };
        let processed = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            result = writer.process_message(message) => Some(result),
        };
        match processed {
            None => return stopped(writer),
            Some(Some(result)) => on_batch(result),
            Some(None) => {}
        }
    }

    let flushed = tokio::select! {
        biased;
        _ = stop.cancelled() => None,
        result = writer.process_message(ControlMessage::Flush) => Some(result),
    };
    match flushed {
        None => return stopped(writer),
        Some(Some(result)) => on_batch(result),
        Some(None) => {}
    }
    info!(partition = writer.partition, "Partition input ended");
    writer
}

fn stopped<S: ClaimStore>(writer: PartitionWriter<S>) -> PartitionWriter<S> {
    warn!(
        partition = writer.partition,
        pending = writer.pending(),
        "Partition stopped before its input was written"
    );
    writer
}
