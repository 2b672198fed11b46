//! Prometheus metrics of the sink, kept in a process wide registry.

use std::iter;
use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

const PARTITION_LABEL: &str = "partition";

const ADMITTED_TOTAL: &str = "claimflow_admitted";
const REJECTED_TOTAL: &str = "claimflow_rejected";
const CLAIMS_WRITTEN_TOTAL: &str = "claimflow_claims_written";
const BATCHES_TOTAL: &str = "claimflow_batches";
const FAILED_BATCHES_TOTAL: &str = "claimflow_failed_batches";
const OUTSTANDING: &str = "claimflow_outstanding";
const CHECKPOINT: &str = "claimflow_checkpoint";
const WRITE_TIME: &str = "claimflow_write_time";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTER: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTER.get_or_init(GlobalRegistry::default)
}

// Every metric is a family so partitions can be told apart by their labels. Metrics that are
// not per partition use an empty label set.
pub(crate) struct SinkMetrics {
    // counters
    pub(crate) admitted_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) rejected_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) claims_written_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) batches_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) failed_batches_total: Family<Vec<(String, String)>, Counter>,

    // gauges
    pub(crate) outstanding: Family<Vec<(String, String)>, Gauge>,
    pub(crate) checkpoint: Family<Vec<(String, String)>, Gauge>,

    // timers
    pub(crate) write_time: Family<Vec<(String, String)>, Histogram>,
}

/// Exponential bucket distribution with range.
/// Creates `length` buckets, the lowest bucket is `min` and the highest bucket is `max`.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (length as f64 - 1.0));
    iter::successors(Some(min), move |bucket| Some(bucket * growth_factor)).take(length.into())
}

impl SinkMetrics {
    fn new() -> Self {
        let metrics = SinkMetrics {
            admitted_total: Family::default(),
            rejected_total: Family::default(),
            claims_written_total: Family::default(),
            batches_total: Family::default(),
            failed_batches_total: Family::default(),
            outstanding: Family::default(),
            checkpoint: Family::default(),
            // 100 microseconds to 1 minute
            write_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(100.0, 60_000_000.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            ADMITTED_TOTAL,
            "A Counter to keep track of the total number of messages admitted into the sink",
            metrics.admitted_total.clone(),
        );
        registry.register(
            REJECTED_TOTAL,
            "A Counter to keep track of the total number of messages rejected by the transform",
            metrics.rejected_total.clone(),
        );
        registry.register(
            CLAIMS_WRITTEN_TOTAL,
            "A Counter to keep track of the total number of claims written to the store",
            metrics.claims_written_total.clone(),
        );
        registry.register(
            BATCHES_TOTAL,
            "A Counter to keep track of the total number of batches completed per partition",
            metrics.batches_total.clone(),
        );
        registry.register(
            FAILED_BATCHES_TOTAL,
            "A Counter to keep track of the total number of batches that failed to be written",
            metrics.failed_batches_total.clone(),
        );
        registry.register(
            OUTSTANDING,
            "A Gauge to keep track of the messages admitted but not yet written",
            metrics.outstanding.clone(),
        );
        registry.register(
            CHECKPOINT,
            "A Gauge to keep track of the last persisted checkpoint",
            metrics.checkpoint.clone(),
        );
        registry.register(
            WRITE_TIME,
            "A Histogram to keep track of the time taken to write a batch of claims, in microseconds",
            metrics.write_time.clone(),
        );
        metrics
    }
}

static SINK_METRICS: OnceLock<SinkMetrics> = OnceLock::new();

pub(crate) fn sink_metrics() -> &'static SinkMetrics {
    SINK_METRICS.get_or_init(SinkMetrics::new)
}

/// Labels of metrics which are not per partition.
pub(crate) fn sink_labels() -> &'static Vec<(String, String)> {
    static SINK_LABELS: OnceLock<Vec<(String, String)>> = OnceLock::new();
    SINK_LABELS.get_or_init(Vec::new)
}

pub(crate) fn partition_labels(partition: usize) -> Vec<(String, String)> {
    vec![(PARTITION_LABEL.to_string(), partition.to_string())]
}

/// Renders a snapshot of every sink metric in the text exposition format.
pub fn encode_metrics() -> Result<String, std::fmt::Error> {
    // make sure the metrics are registered even if no sink was built yet
    sink_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry)?;
    Ok(buffer)
}
