// Live program-log subscription with reconnect and backoff.

use crate::chain::ChainClient;
use crate::log_parser::LogBundle;
use crate::pipeline::EventPipeline;
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const INITIAL_BACKOFF_MS: u64 = 1_000;
pub const MAX_BACKOFF_MS: u64 = 30_000;
const CHANNEL_CAPACITY: usize = 1024;

pub fn next_backoff(current_ms: u64) -> u64 {
    (current_ms * 2).min(MAX_BACKOFF_MS)
}

pub struct LiveLogListener {
    chain: Arc<dyn ChainClient>,
    pipeline: EventPipeline,
    last_slot: Arc<AtomicU64>,
}

impl LiveLogListener {
    pub fn new(chain: Arc<dyn ChainClient>, pipeline: EventPipeline) -> Self {
        Self {
            chain,
            pipeline,
            last_slot: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Highest slot handed to the pipeline so far, 0 before the first bundle.
    pub fn last_slot(&self) -> u64 {
        self.last_slot.load(Ordering::Relaxed)
    }

    /// Runs until the consumer side stops. Bundles are applied in arrival
    /// order by a single consumer task.
    pub async fn run(&self) -> Result<()> {
        let (bundle_tx, mut bundle_rx) = mpsc::channel::<LogBundle>(CHANNEL_CAPACITY);

        let pipeline = self.pipeline.clone();
        let last_slot = self.last_slot.clone();
        let consumer = tokio::spawn(async move {
            while let Some(bundle) = bundle_rx.recv().await {
                last_slot.fetch_max(bundle.slot, Ordering::Relaxed);
                pipeline.handle_bundle(&bundle).await;
            }
        });

        let mut backoff_ms = INITIAL_BACKOFF_MS;
        loop {
            match self.chain.stream_logs(bundle_tx.clone()).await {
                Ok(()) => {
                    backoff_ms = INITIAL_BACKOFF_MS;
                    info!(last_slot = self.last_slot(), "log subscription ended, resubscribing");
                    tokio::time::sleep(Duration::from_millis(INITIAL_BACKOFF_MS)).await;
                }
                Err(err) => {
                    error!("log subscription error: {err:?}");
                    warn!(backoff_ms, last_slot = self.last_slot(), "resubscribing after backoff");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = next_backoff(backoff_ms);
                }
            }
            if consumer.is_finished() {
                bail!("log consumer stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff);
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }
}
