//! Server-sent summary snapshots.
//!
//! One task per subscriber, ticking on wall-clock second boundaries. The
//! sender is bounded; the first failed send means the client went away and
//! the task (and its timer) are dropped.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::summary::build_summary;

use super::AppContext;

const CHANNEL_CAPACITY: usize = 8;

pub fn start_event_stream(ctx: AppContext) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        loop {
            // Align the next tick to the upcoming wall-clock second.
            let now_ms = Utc::now().timestamp_millis();
            let wait_ms = 1000 - now_ms.rem_euclid(1000);
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;

            let snapshot = match build_summary(&ctx.store, &ctx.validator, &ctx.stats).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::debug!("summary snapshot failed: {}", e);
                    continue;
                }
            };
            let payload = match serde_json::to_string(&snapshot) {
                Ok(json) => json,
                Err(e) => {
                    tracing::debug!("summary serialization failed: {}", e);
                    continue;
                }
            };
            let frame = Bytes::from(format!("data: {payload}\n\n"));
            if tx.send(frame).await.is_err() {
                // Subscriber disconnected; free the timer.
                break;
            }
        }
    });
    rx
}
