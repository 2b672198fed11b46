use std::sync::Arc;

use crate::error::Error;

/// Sequence number carried by [ControlMessage::Flush]. Real sequence numbers are never negative.
pub const FLUSH_SEQUENCE_NUMBER: i64 = i64::MIN;

/// Sequence number carried by [ControlMessage::Idle].
pub const IDLE_SEQUENCE_NUMBER: i64 = i64::MIN + 1;

/// An admitted upstream message along with the routing information extracted from it.
#[derive(Debug, Clone)]
pub(crate) struct ClaimMessage<M> {
    pub(crate) claim_key: String,
    pub(crate) sequence_number: i64,
    /// Upstream format version, shared by every message of one `write_messages` call.
    pub(crate) version: Arc<str>,
    pub(crate) payload: M,
}

/// Input of a partition writer.
#[derive(Debug)]
pub(crate) enum ControlMessage<M> {
    Data(ClaimMessage<M>),
    /// Write whatever is buffered now.
    Flush,
    /// No data has arrived for a while.
    Idle,
}

impl<M> ControlMessage<M> {
    pub(crate) fn sequence_number(&self) -> i64 {
        match self {
            ControlMessage::Data(message) => message.sequence_number,
            ControlMessage::Flush => FLUSH_SEQUENCE_NUMBER,
            ControlMessage::Idle => IDLE_SEQUENCE_NUMBER,
        }
    }
}

/// Outcome of one partition flush, consumed exactly once to update counters, the watermark and
/// admission capacity.
#[derive(Debug)]
pub(crate) struct BatchResult<M> {
    pub(crate) partition: usize,
    /// Claims the store reports as written, after dedup.
    pub(crate) processed: usize,
    /// Every data message that went into the batch, including rejected ones.
    pub(crate) messages: Vec<ClaimMessage<M>>,
    pub(crate) error: Option<Error>,
}

impl<M> BatchResult<M> {
    pub(crate) fn written(partition: usize, processed: usize, messages: Vec<ClaimMessage<M>>) -> Self {
        BatchResult {
            partition,
            processed,
            messages,
            error: None,
        }
    }

    pub(crate) fn failed(partition: usize, messages: Vec<ClaimMessage<M>>, error: Error) -> Self {
        BatchResult {
            partition,
            processed: 0,
            messages,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_disjoint() {
        assert_ne!(FLUSH_SEQUENCE_NUMBER, IDLE_SEQUENCE_NUMBER);
        assert!(FLUSH_SEQUENCE_NUMBER < 0);
        assert!(IDLE_SEQUENCE_NUMBER < 0);

        let data = ControlMessage::Data(ClaimMessage {
            claim_key: "A".to_string(),
            sequence_number: 0,
            version: Arc::from("v1"),
            payload: (),
        });
        assert_eq!(data.sequence_number(), 0);
        assert_eq!(ControlMessage::<()>::Flush.sequence_number(), FLUSH_SEQUENCE_NUMBER);
        assert_eq!(ControlMessage::<()>::Idle.sequence_number(), IDLE_SEQUENCE_NUMBER);
    }
}
