//! Replay of normalized messages through the live ingestion path
//!
//! Messages are handed to the inbound handler one at a time, in order: a
//! later message may quote an earlier one, which must already be persisted.
//! A failing message is logged and skipped so one poison message cannot stall
//! a batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::collaborators::InboundHandler;
use crate::types::{GatewayHandle, RawInboundMessage};

/// Upper bound on how fast messages are handed to the gateway-backed ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRate {
    /// Minimum spacing between two messages; zero disables pacing
    pub interval: Duration,
}

impl ReplayRate {
    pub fn every(interval: Duration) -> Self {
        Self { interval }
    }

    #[cfg(test)]
    pub fn unlimited() -> Self {
        Self {
            interval: Duration::ZERO,
        }
    }
}

/// Async iterator yielding items no faster than a `ReplayRate`
pub struct Paced<I> {
    items: I,
    ticker: Option<Interval>,
}

impl<I: Iterator> Paced<I> {
    pub fn new(items: I, rate: ReplayRate) -> Self {
        let ticker = (!rate.interval.is_zero()).then(|| {
            let mut interval = tokio::time::interval(rate.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { items, ticker }
    }

    /// Next item, after waiting for the pacing interval. The first item is
    /// released immediately.
    pub async fn next(&mut self) -> Option<I::Item> {
        let item = self.items.next()?;
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.tick().await;
        }
        Some(item)
    }
}

/// Counts for one replayed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Feeds messages to the inbound handler flagged as imported
pub struct ReplayEngine {
    inbound: Arc<dyn InboundHandler>,
    rate: ReplayRate,
}

impl ReplayEngine {
    pub fn new(inbound: Arc<dyn InboundHandler>, rate: ReplayRate) -> Self {
        Self { inbound, rate }
    }

    /// Replay `messages` sequentially. `on_progress` is called after each
    /// message with the running report.
    pub async fn replay<F>(
        &self,
        messages: &[RawInboundMessage],
        handle: &GatewayHandle,
        company_id: Uuid,
        mut on_progress: F,
    ) -> ReplayReport
    where
        F: FnMut(&ReplayReport),
    {
        let mut report = ReplayReport::default();
        let mut paced = Paced::new(messages.iter(), self.rate);

        while let Some(message) = paced.next().await {
            let result = self
                .inbound
                .handle(
                    message,
                    handle,
                    company_id,
                    true,
                    message.routing_key_override(),
                )
                .await;

            report.processed += 1;
            match result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        connection_id = %handle.connection_id,
                        external_id = %message.external_id,
                        "Skipping message that failed to import: {:#}",
                        e
                    );
                }
            }

            on_progress(&report);
        }

        debug!(
            connection_id = %handle.connection_id,
            "Replayed {} messages ({} failed)",
            report.processed, report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::collaborators::testing::RecordingInbound;
    use chrono::{DateTime, Utc};

    fn msg(id: &str, ts: i64) -> RawInboundMessage {
        RawInboundMessage {
            external_id: id.to_string(),
            routing_key: "r@chat".to_string(),
            alt_routing_key: Some(format!("alt-{}", id)),
            timestamp: DateTime::<Utc>::from_timestamp(ts, 0).unwrap(),
            from_me: false,
            is_group: false,
            push_name: None,
            payload: serde_json::Value::Null,
        }
    }

    fn handle() -> GatewayHandle {
        GatewayHandle {
            connection_id: Uuid::new_v4(),
            session: "s".to_string(),
        }
    }

    #[tokio::test]
    async fn test_replay_preserves_order_and_flags_import() {
        let inbound = Arc::new(RecordingInbound::default());
        let engine = ReplayEngine::new(inbound.clone(), ReplayRate::unlimited());
        let messages = vec![msg("a", 1), msg("b", 2), msg("c", 3)];

        let report = engine.replay(&messages, &handle(), Uuid::new_v4(), |_| {}).await;

        assert_eq!(report, ReplayReport { processed: 3, succeeded: 3, failed: 0 });
        assert_eq!(inbound.handled_ids(), vec!["a", "b", "c"]);
        assert!(inbound.import_flags.lock().iter().all(|f| *f));
    }

    #[tokio::test]
    async fn test_replay_skips_poison_messages() {
        let inbound = Arc::new(RecordingInbound::default());
        inbound.poison.lock().insert("b".to_string());
        let engine = ReplayEngine::new(inbound.clone(), ReplayRate::unlimited());
        let messages = vec![msg("a", 1), msg("b", 2), msg("c", 3)];

        let report = engine.replay(&messages, &handle(), Uuid::new_v4(), |_| {}).await;

        assert_eq!(report.processed, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(inbound.handled_ids(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_replay_passes_routing_key_override() {
        let inbound = Arc::new(RecordingInbound::default());
        let engine = ReplayEngine::new(inbound.clone(), ReplayRate::unlimited());
        let mut group = msg("g", 2);
        group.is_group = true;

        engine.replay(&[msg("a", 1), group], &handle(), Uuid::new_v4(), |_| {}).await;

        let handled = inbound.handled.lock();
        assert_eq!(handled[0].2.as_deref(), Some("alt-a"));
        assert_eq!(handled[1].2, None);
    }

    #[tokio::test]
    async fn test_replay_reports_progress_after_each_message() {
        let inbound = Arc::new(RecordingInbound::default());
        let engine = ReplayEngine::new(inbound, ReplayRate::unlimited());
        let messages = vec![msg("a", 1), msg("b", 2)];
        let mut seen = Vec::new();

        engine
            .replay(&messages, &handle(), Uuid::new_v4(), |r| seen.push(r.processed))
            .await;

        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_paced_spaces_out_messages() {
        let inbound = Arc::new(RecordingInbound::default());
        let engine = ReplayEngine::new(inbound.clone(), ReplayRate::every(Duration::from_millis(20)));
        let messages = vec![msg("a", 1), msg("b", 2), msg("c", 3)];

        engine.replay(&messages, &handle(), Uuid::new_v4(), |_| {}).await;

        let handled = inbound.handled.lock();
        let spread = handled[2].1.duration_since(handled[0].1);
        assert!(spread >= Duration::from_millis(35), "spread was {:?}", spread);
    }

    #[tokio::test]
    async fn test_paced_yields_all_items() {
        let mut paced = Paced::new(vec![1, 2, 3].into_iter(), ReplayRate::every(Duration::from_millis(1)));
        let mut out = Vec::new();
        while let Some(i) = paced.next().await {
            out.push(i);
        }
        assert_eq!(out, vec![1, 2, 3]);
    }
}
