use crate::context::PipelineContext;
use crate::pipeline::EventPipeline;
use crate::queue::RateLimitedQueue;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub from_slot: u64,
    pub to_slot: u64,
    pub blocks_fetched: u64,
    pub bundles: u64,
    pub events: u64,
}

/// Replays blocks missed while the process was down through the same
/// parse/project path as the live listener. Blocks are processed one at a
/// time on a serial queue. A block that still cannot be fetched after its
/// retries stops the scan instead of being skipped.
pub struct GapRecoveryScanner {
    ctx: PipelineContext,
    pipeline: EventPipeline,
    queue: RateLimitedQueue,
    block_policy: RetryPolicy,
}

impl GapRecoveryScanner {
    pub fn new(ctx: PipelineContext, pipeline: EventPipeline) -> Self {
        let block_policy = RetryPolicy::fixed(
            "backfill-block",
            ctx.backfill.block_attempts,
            ctx.backfill.block_retry_delay(),
        );
        Self {
            ctx,
            pipeline,
            queue: RateLimitedQueue::serial("backfill"),
            block_policy,
        }
    }

    /// Slot of the last event we are confident was processed: the finalized
    /// slot minus the wall-clock time since the newest token update,
    /// converted to slots.
    pub async fn estimate_last_slot(&self) -> Result<u64> {
        let cfg = &self.ctx.backfill;
        let finalized = self.ctx.chain.finalized_slot().await?;
        let offset = match self.ctx.store.latest_update().await? {
            Some(last) => {
                let elapsed_ms = (Utc::now() - last).num_milliseconds().max(0) as u64;
                elapsed_ms / cfg.slot_duration_ms.max(1)
            }
            None => cfg.fallback_slot_offset,
        };
        Ok(finalized.saturating_sub(offset))
    }

    pub async fn run(&self) -> Result<BackfillReport> {
        let current = self.ctx.chain.confirmed_slot().await?;
        let last = match self.estimate_last_slot().await {
            Ok(slot) => slot,
            Err(err) => {
                warn!("could not estimate last processed slot, skipping backfill: {err:#}");
                current
            }
        };
        self.scan(last, current).await
    }

    /// Runs the scan on its own task so live events, refresh, and shutdown
    /// are not held up behind it.
    pub fn spawn(self) -> JoinHandle<Result<BackfillReport>> {
        tokio::spawn(async move {
            let result = self.run().await;
            match &result {
                Ok(report) => info!(
                    from = report.from_slot,
                    to = report.to_slot,
                    events = report.events,
                    "backfill finished"
                ),
                Err(err) => error!("backfill failed: {err:?}"),
            }
            result
        })
    }

    /// Processes every slot in `(last, current]`.
    pub async fn scan(&self, last: u64, current: u64) -> Result<BackfillReport> {
        let mut report = BackfillReport {
            from_slot: last,
            to_slot: current,
            ..Default::default()
        };
        if last >= current {
            info!(last, current, "no gap to recover");
            return Ok(report);
        }
        info!(from = last + 1, to = current, slots = current - last, "backfill started");
        let pause = Duration::from_millis(self.ctx.backfill.inter_block_delay_ms);

        for slot in last + 1..=current {
            let chain = self.ctx.chain.clone();
            let pipeline = self.pipeline.clone();
            let policy = self.block_policy.clone();
            let handle = self.queue.add(async move {
                let bundles = policy
                    .run(|attempt| {
                        debug!(slot, attempt, "fetching block");
                        chain.block_bundles(slot)
                    })
                    .await?;
                let mut events = 0;
                for bundle in &bundles {
                    events += pipeline.handle_bundle(bundle).await;
                }
                if !bundles.is_empty() {
                    tokio::time::sleep(pause).await;
                }
                Ok((bundles.len() as u64, events as u64))
            });
            let (bundles, events) = handle.await.with_context(|| {
                format!(
                    "backfill stopped at slot {slot} after {} blocks",
                    report.blocks_fetched
                )
            })?;
            report.blocks_fetched += 1;
            report.bundles += bundles;
            report.events += events;
            if slot % 1_000 == 0 {
                info!(slot, to = current, events = report.events, "backfill progress");
            }
        }

        self.queue.on_idle().await;
        self.pipeline.on_idle().await;
        info!(
            blocks = report.blocks_fetched,
            bundles = report.bundles,
            events = report.events,
            "backfill complete"
        );
        Ok(report)
    }
}
