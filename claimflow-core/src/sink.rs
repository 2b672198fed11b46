//! [ClaimSink] accepts upstream messages from a producer and writes them to the claims store
//! through a set of partition writers.
//!
//! ```text
//!  write_messages ──► admission ──► router ──► partition 0 ──┐
//!                        ▲            │    └─► partition 1 ──┤ batch results
//!                        │            └──────► partition N ──┤
//!                        └──── capacity released ◄───────────┘
//!                                                            │ retire sequence numbers
//!                                                            ▼
//!                               checkpoint task ◄──── watermark tracker
//! ```
//!
//! The claim pipeline (router and partitions) and the checkpoint pipeline run as separate tokio
//! tasks. [ClaimSink::shutdown] completes admission, waits for both pipelines to drain and then
//! closes every store, collecting errors along the way.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::checkpoint::{CheckpointWriter, run_checkpoint};
use crate::config::SinkConfig;
use crate::error::{Error, Result};
use crate::message::{BatchResult, ClaimMessage, ControlMessage};
use crate::metrics::{partition_labels, sink_labels, sink_metrics};
use crate::partitioner::KeyPartitioner;
use crate::store::ClaimStore;
use crate::watermark::WatermarkTracker;
use crate::writer::{PartitionWriter, run_partition};

type PartitionSender<M> = mpsc::UnboundedSender<ControlMessage<M>>;

/// How long a pipeline task gets to hand back its store once it was told to stop.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
enum SinkState {
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Default)]
struct Status {
    /// Claims written since the producer last asked.
    processed: usize,
    /// Terminal errors not yet handed to the producer.
    error: Option<Error>,
    failed: bool,
}

impl Status {
    /// Hands out a pending terminal error once, afterwards keeps failing with
    /// [Error::Admission].
    fn check_failed(&mut self) -> Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        if self.failed {
            return Err(Error::Admission("claim sink has failed".to_string()));
        }
        Ok(())
    }
}

/// State shared between the producer and the pipeline tasks.
struct Shared<M> {
    status: Mutex<Status>,
    tracker: Arc<WatermarkTracker>,
    admission: AdmissionController<ControlMessage<M>>,
}

impl<M> Shared<M> {
    /// Accounts for one completed batch. Sequence numbers are only retired when the batch was
    /// written, capacity is released either way.
    fn report_batch(&self, result: BatchResult<M>) {
        let labels = partition_labels(result.partition);
        let metrics = sink_metrics();
        match result.error {
            None => {
                for message in &result.messages {
                    self.tracker.remove_written(message.sequence_number);
                }
                metrics.batches_total.get_or_create(&labels).inc();
            }
            Some(e) => {
                metrics.failed_batches_total.get_or_create(&labels).inc();
                self.fail(e);
            }
        }

        self.status.lock().processed += result.processed;
        self.admission.allow(result.messages.len());
        metrics
            .outstanding
            .get_or_create(sink_labels())
            .set(self.admission.outstanding() as i64);
    }

    /// Records a terminal error and stops admitting messages.
    fn fail(&self, error: Error) {
        {
            let mut status = self.status.lock();
            status.failed = true;
            status.error = Some(match status.error.take() {
                Some(previous) => previous.chain(error),
                None => error,
            });
        }
        self.admission.close();
    }

    fn take_error(&self) -> Option<Error> {
        self.status.lock().error.take()
    }

    fn take_processed(&self) -> Result<usize> {
        let mut status = self.status.lock();
        status.check_failed()?;
        Ok(mem::take(&mut status.processed))
    }
}

struct Pipelines<S: ClaimStore> {
    router: JoinHandle<()>,
    partitions: Vec<JoinHandle<PartitionWriter<S>>>,
    checkpoint: JoinHandle<CheckpointWriter<S>>,
}

/// Builds a [ClaimSink]. The factory is called once for the root store, once per partition and
/// once for the checkpoint writer.
pub struct ClaimSinkBuilder<F> {
    config: SinkConfig,
    factory: F,
}

impl<F> ClaimSinkBuilder<F> {
    pub fn new<S>(config: SinkConfig, factory: F) -> Self
    where
        F: FnMut() -> Result<S>,
    {
        ClaimSinkBuilder { config, factory }
    }

    /// Reads the checkpoint from the root store and starts the pipelines.
    pub async fn build<S>(mut self) -> Result<ClaimSink<S>>
    where
        F: FnMut() -> Result<S>,
        S: ClaimStore + Send + 'static,
    {
        self.config.validate()?;
        let config = self.config;

        let mut root = (self.factory)()?;
        let partition_stores = (0..config.partitions)
            .map(|_| (self.factory)())
            .collect::<Result<Vec<_>>>()?;
        let checkpoint_store = (self.factory)()?;

        let initial_checkpoint = root.read_checkpoint().await?.unwrap_or(0);
        info!(
            initial_checkpoint,
            partitions = config.partitions,
            batch_size = config.batch_size,
            capacity = config.admission_capacity(),
            "Starting claim sink"
        );

        let tracker = Arc::new(WatermarkTracker::new(initial_checkpoint));
        let (admission, admitted) = AdmissionController::new(config.admission_capacity());
        let shared = Arc::new(Shared {
            status: Mutex::new(Status::default()),
            tracker: Arc::clone(&tracker),
            admission,
        });

        // stops the claim pipeline when draining it times out
        let stop = CancellationToken::new();
        let mut senders = Vec::with_capacity(config.partitions);
        let mut partitions = Vec::with_capacity(config.partitions);
        for (partition, store) in partition_stores.into_iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            let writer = PartitionWriter::new(partition, store, config.batch_size);
            let shared = Arc::clone(&shared);
            partitions.push(tokio::spawn(run_partition(
                writer,
                rx,
                config.idle_check_interval,
                stop.clone(),
                move |result| shared.report_batch(result),
            )));
            senders.push(tx);
        }
        let router = tokio::spawn(route(
            admitted,
            KeyPartitioner::new(senders)?,
            stop.clone(),
        ));

        let cancel = CancellationToken::new();
        let checkpoint = tokio::spawn(run_checkpoint(
            CheckpointWriter::new(checkpoint_store, Arc::clone(&tracker), initial_checkpoint),
            config.checkpoint_interval,
            cancel.clone(),
            {
                let shared = Arc::clone(&shared);
                move |e| shared.fail(e)
            },
        ));

        Ok(ClaimSink {
            config,
            root,
            shared,
            pipelines: Some(Pipelines {
                router,
                partitions,
                checkpoint,
            }),
            stop,
            cancel,
            state: SinkState::Running,
        })
    }
}

/// Routes admitted data messages to the partition owning their key and broadcasts control
/// messages. Ends once admission is completed or `stop` fires, which ends every partition input
/// in turn.
async fn route<M>(
    mut admitted: mpsc::UnboundedReceiver<ControlMessage<M>>,
    partitioner: KeyPartitioner<PartitionSender<M>>,
    stop: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                warn!("Routing stopped before admission completed");
                return;
            }
            message = admitted.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            ControlMessage::Data(message) => {
                let partition = partitioner.partition_index(&message.claim_key);
                let sequence_number = message.sequence_number;
                if partitioner
                    .partition_for(&message.claim_key)
                    .send(ControlMessage::Data(message))
                    .is_err()
                {
                    warn!(partition, sequence_number, "Partition has stopped, dropping message");
                }
            }
            ControlMessage::Flush => broadcast(&partitioner, || ControlMessage::Flush),
            ControlMessage::Idle => broadcast(&partitioner, || ControlMessage::Idle),
        }
    }
    info!("Admission completed, stopped routing");
}

fn broadcast<M>(
    partitioner: &KeyPartitioner<PartitionSender<M>>,
    message: impl Fn() -> ControlMessage<M>,
) {
    for (partition, sender) in partitioner.partitions().iter().enumerate() {
        if sender.send(message()).is_err() {
            warn!(partition, "Partition has stopped, dropping control message");
        }
    }
}

/// Waits for a pipeline task until `deadline`. On expiry `stop` is cancelled and the task gets
/// [STOP_GRACE_PERIOD] to return, after which it is aborted.
async fn join_or_stop<T>(
    deadline: Instant,
    mut handle: JoinHandle<T>,
    stop: &CancellationToken,
    task: &str,
    errors: &mut Vec<Error>,
) -> Option<T> {
    let joined = match time::timeout_at(deadline, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(task, "Timed out waiting for pipeline task, stopping it");
            stop.cancel();
            match time::timeout(STOP_GRACE_PERIOD, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    error!(task, "Pipeline task did not stop, aborting it");
                    handle.abort();
                    errors.push(Error::Shutdown(format!("{task} task did not stop")));
                    return None;
                }
            }
        }
    };
    match joined {
        Ok(value) => Some(value),
        Err(e) => {
            error!(task, ?e, "Pipeline task failed");
            errors.push(Error::Shutdown(format!("{task} task failed: {e}")));
            None
        }
    }
}

/// Partitioned batching sink with watermark based checkpointing.
///
/// Messages with the same claim key are written by the same partition in the order they were
/// passed to [ClaimSink::write_messages]. The checkpoint persisted to the store is the highest
/// sequence number at or below which every admitted message has been written, so a restart
/// resuming after the checkpoint never skips an unwritten message.
pub struct ClaimSink<S: ClaimStore> {
    config: SinkConfig,
    root: S,
    shared: Arc<Shared<S::Message>>,
    /// `None` once shut down.
    pipelines: Option<Pipelines<S>>,
    /// Stops the claim pipeline.
    stop: CancellationToken,
    /// Stops the checkpoint pipeline.
    cancel: CancellationToken,
    state: SinkState,
}

impl<S: ClaimStore> ClaimSink<S> {
    /// Admits `messages`, waiting for capacity when too many messages are in flight. Returns the
    /// number of claims written since the previous call.
    ///
    /// A terminal error of the pipelines is returned by the first call after it happened, every
    /// later call fails with [Error::Admission]. Cancelling the call while it waits for capacity
    /// keeps the messages admitted so far.
    pub async fn write_messages(&self, version: &str, messages: Vec<S::Message>) -> Result<usize> {
        self.ensure_running()?;
        let version: Arc<str> = Arc::from(version);
        let metrics = sink_metrics();

        for message in messages {
            let claim_key = self.root.claim_key(&message);
            let sequence_number = self.root.sequence_number(&message);
            if sequence_number < 0 {
                return Err(Error::InvalidMessage(format!(
                    "negative sequence number {sequence_number} for claim {claim_key}"
                )));
            }

            let reservation = match self.shared.admission.reserve().await {
                Ok(reservation) => reservation,
                Err(e) => return Err(self.shared.take_error().unwrap_or(e)),
            };
            self.shared.tracker.add_active(sequence_number);
            let data = ControlMessage::Data(ClaimMessage {
                claim_key,
                sequence_number,
                version: Arc::clone(&version),
                payload: message,
            });
            // on failure the sequence number stays active, the watermark must not pass it
            if let Err(e) = reservation.send(data) {
                return Err(self.shared.take_error().unwrap_or(e));
            }

            metrics.admitted_total.get_or_create(sink_labels()).inc();
        }
        metrics
            .outstanding
            .get_or_create(sink_labels())
            .set(self.shared.admission.outstanding() as i64);

        self.shared.take_processed()
    }

    /// Number of claims written since the previous call, without admitting anything.
    pub fn processed_count(&self) -> Result<usize> {
        self.shared.take_processed()
    }

    /// Asks every partition to write its buffer now. Does not take admission capacity.
    pub fn request_flush(&self) -> Result<()> {
        self.ensure_running()?;
        debug!("Flush requested");
        self.shared.admission.send_control(ControlMessage::Flush)
    }

    /// Checkpoints are only written from the watermark, writing one directly could mark
    /// unwritten messages as durable.
    pub fn update_last_sequence_number(&self, _sequence_number: i64) -> Result<()> {
        Err(Error::Unsupported("the checkpoint is maintained by the sink".to_string()))
    }

    /// Highest sequence number at or below which every admitted message has been written.
    pub fn safe_resume_point(&self) -> i64 {
        self.shared.tracker.safe_resume_point()
    }

    /// Admitted messages not yet written.
    pub fn outstanding(&self) -> usize {
        self.shared.admission.outstanding()
    }

    pub async fn read_checkpoint(&mut self) -> Result<Option<i64>> {
        self.root.read_checkpoint().await
    }

    pub fn check_error_count(&self) -> Result<()> {
        self.root.check_error_count()
    }

    pub fn claim_key(&self, message: &S::Message) -> String {
        self.root.claim_key(message)
    }

    pub fn sequence_number(&self, message: &S::Message) -> i64 {
        self.root.sequence_number(message)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state != SinkState::Running {
            return Err(Error::Admission(format!("claim sink is {:?}", self.state)));
        }
        self.shared.status.lock().check_failed()
    }

    /// Shuts down with the configured shutdown timeout.
    pub async fn close(&mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        self.shutdown(timeout).await
    }

    /// Stops admitting messages, waits up to `timeout` for the pipelines to write what was
    /// admitted and closes every store. When the timeout expires the pipelines are stopped,
    /// abandoning unwritten messages, and the stores are still closed. Close errors and any
    /// terminal error not yet returned to the producer are returned together. Calling it again
    /// is a no-op.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let Some(pipelines) = self.pipelines.take() else {
            return Ok(());
        };
        info!(?timeout, "Shutting down claim sink");
        self.state = SinkState::Draining;

        let deadline = Instant::now() + timeout;
        let mut errors = vec![];

        // the router ends once it has drained admission, the partitions once the router is gone
        self.shared.admission.complete();
        join_or_stop(deadline, pipelines.router, &self.stop, "router", &mut errors).await;
        let mut writers = Vec::with_capacity(pipelines.partitions.len());
        for (partition, handle) in pipelines.partitions.into_iter().enumerate() {
            let task = format!("partition {partition}");
            if let Some(writer) =
                join_or_stop(deadline, handle, &self.stop, &task, &mut errors).await
            {
                writers.push(writer);
            }
        }

        // the drain deadline may be spent already, the checkpoint task still gets to return its
        // writer for the final persist
        self.cancel.cancel();
        let checkpoint_deadline = deadline.max(Instant::now() + STOP_GRACE_PERIOD);
        let checkpoint_writer = join_or_stop(
            checkpoint_deadline,
            pipelines.checkpoint,
            &self.cancel,
            "checkpoint",
            &mut errors,
        )
        .await;

        self.state = SinkState::Closed;
        let active = self.shared.tracker.active_count();
        if active > 0 {
            warn!(active, "Messages were not written before shutdown");
        }

        for writer in writers {
            let partition = writer.partition();
            if let Err(e) = writer.close().await {
                error!(partition, ?e, "Failed to close partition store");
                errors.push(e);
            }
        }
        if let Some(checkpoint_writer) = checkpoint_writer {
            if let Err(e) = checkpoint_writer.close().await {
                error!(?e, "Failed to close checkpoint writer");
                errors.push(e);
            }
        }
        if let Err(e) = self.root.close().await {
            error!(?e, "Failed to close root store");
            errors.push(e);
        }

        if let Some(e) = self.shared.take_error() {
            errors.insert(0, e);
        }
        let result = Error::from_many(errors);
        info!(
            checkpoint = self.shared.tracker.safe_resume_point(),
            success = result.is_ok(),
            "Claim sink shut down"
        );
        result
    }
}

impl<S: ClaimStore> Drop for ClaimSink<S> {
    fn drop(&mut self) {
        if self.pipelines.is_some() {
            warn!("Claim sink dropped without shutdown, stores are not closed");
            self.shared.admission.complete();
            self.stop.cancel();
            self.cancel.cancel();
        }
    }
}
