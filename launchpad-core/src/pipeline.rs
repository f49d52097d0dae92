use crate::context::PipelineContext;
use crate::log_parser::{is_placeholder_signature, parse_bundle, LogBundle, ParsedEvent};
use crate::projector::{Applied, TokenStateProjector};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Parse-then-project path shared by the live listener and the backfill
/// scanner.
#[derive(Clone)]
pub struct EventPipeline {
    ctx: PipelineContext,
    projector: Arc<TokenStateProjector>,
}

impl EventPipeline {
    pub fn new(ctx: PipelineContext, projector: Arc<TokenStateProjector>) -> Self {
        Self { ctx, projector }
    }

    pub fn projector(&self) -> &TokenStateProjector {
        &self.projector
    }

    async fn event_time(&self, slot: u64) -> DateTime<Utc> {
        match self.ctx.chain.block_time(slot).await {
            Ok(Some(t)) => t,
            Ok(None) => Utc::now(),
            Err(err) => {
                debug!(slot, "block time unavailable, using wall clock: {err:#}");
                Utc::now()
            }
        }
    }

    /// Applies every event in `bundle`. A failing event is logged and does
    /// not stop the others. Curve completions are handed to the pipeline
    /// queue since confirming them can take several seconds.
    ///
    /// Returns the number of events parsed from the bundle.
    pub async fn handle_bundle(&self, bundle: &LogBundle) -> usize {
        if is_placeholder_signature(&bundle.signature) {
            debug!(slot = bundle.slot, "skipping placeholder signature");
            return 0;
        }
        let events = parse_bundle(bundle);
        if events.is_empty() {
            return 0;
        }
        let at = self.event_time(bundle.slot).await;

        for event in &events {
            if let ParsedEvent::CurveCompleted(ev) = event {
                let projector = self.projector.clone();
                let ev = ev.clone();
                let signature = bundle.signature.clone();
                let _ = self.ctx.queue.add(async move {
                    match projector.apply_curve_completed(&ev).await {
                        Ok(applied) => log_applied(&applied, &ev.mint, &signature),
                        Err(err) => error!(mint = %ev.mint, %signature, "curve completion failed: {err:?}"),
                    }
                    Ok(())
                });
                continue;
            }
            match self.projector.apply(event, &bundle.signature, at).await {
                Ok(applied) => log_applied(&applied, event.mint(), &bundle.signature),
                Err(err) => error!(
                    mint = event.mint(),
                    signature = %bundle.signature,
                    kind = event.kind(),
                    "failed to apply event: {err:?}"
                ),
            }
        }
        events.len()
    }

    /// Waits for queued completion checks, then for any sagas they started.
    pub async fn on_idle(&self) {
        self.ctx.queue.on_idle().await;
        self.projector.saga().on_idle().await;
    }
}

fn log_applied(applied: &Applied, mint: &str, signature: &str) {
    match applied {
        Applied::Token(_) => debug!(mint, signature, "event applied"),
        Applied::Duplicate => debug!(mint, signature, "duplicate event ignored"),
        Applied::MigrationScheduled(_) => info!(mint, signature, "migration scheduled"),
        Applied::Ignored => debug!(mint, signature, "event ignored"),
    }
}
