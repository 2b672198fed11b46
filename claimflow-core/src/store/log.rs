use tracing::info;

use crate::error::Result;
use crate::store::{Claim, ClaimStore, ClaimUpdate};

/// Logs every written claim and keeps the checkpoint of this instance in memory.
#[derive(Debug, Default)]
pub struct LogStore {
    checkpoint: Option<i64>,
}

impl ClaimStore for LogStore {
    type Message = ClaimUpdate;
    type Claim = Claim;

    fn claim_key(&self, message: &ClaimUpdate) -> String {
        message.key.clone()
    }

    fn sequence_number(&self, message: &ClaimUpdate) -> i64 {
        message.sequence_number
    }

    async fn transform(&mut self, version: &str, message: &ClaimUpdate) -> Result<Option<Claim>> {
        Ok(Some(message.to_claim(version)))
    }

    async fn write_claims(&mut self, claims: Vec<Claim>) -> Result<usize> {
        for claim in &claims {
            let log_line = format!(
                "Claim - {} SequenceNumber - {} Version - {} Payload - {}",
                claim.key,
                claim.sequence_number,
                claim.version,
                String::from_utf8_lossy(&claim.payload),
            );
            info!("{}", log_line);
        }
        Ok(claims.len())
    }

    async fn persist_checkpoint(&mut self, sequence_number: i64) -> Result<()> {
        info!(sequence_number, "Checkpoint");
        self.checkpoint = Some(sequence_number);
        Ok(())
    }

    async fn read_checkpoint(&mut self) -> Result<Option<i64>> {
        Ok(self.checkpoint)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
