//! The two event sources that drive the publisher: a periodic tick (sweep +
//! publish-pending) and a subscription to the worker result stream, debounced
//! per campaign so a burst of results doesn't spawn overlapping publisher runs
//! for the same campaign.

use crate::worker_protocol::WorkerResult;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Runs `check_existing` then, if `auto_publish`, `publish_pending`, once per
/// `interval`. Runs forever; callers spawn this as a background task.
pub async fn scheduled_loop<F, Fut>(
    interval: chrono::Duration,
    auto_publish: bool,
    mut tick: F,
) where
    F: FnMut(bool) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let period = interval
        .to_std()
        .unwrap_or_else(|_| std::time::Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        tick(auto_publish).await;
    }
}

/// Tracks which campaigns currently have an in-flight publisher task, so the
/// event-driven path can drop a trigger for a campaign that's already being
/// handled rather than queuing redundant work -- the next scheduled tick will
/// pick up anything the drop missed (§5: "Publisher is single-writer per
/// campaign").
#[derive(Default)]
pub struct CampaignDebouncer {
    in_flight: Mutex<HashSet<String>>,
}

impl CampaignDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to claim `campaign` for an in-flight task. Returns `false` if
    /// another task already holds the claim.
    pub async fn try_claim(&self, campaign: &str) -> bool {
        self.in_flight.lock().await.insert(campaign.to_string())
    }

    pub async fn release(&self, campaign: &str) {
        self.in_flight.lock().await.remove(campaign);
    }
}

/// Subscribe to the `result` channel and invoke `on_result` for every
/// successful worker result, skipping (not queueing) results for a campaign
/// that's already being processed.
pub async fn listen_for_results<F, Fut>(
    redis_client: redis::Client,
    debouncer: Arc<CampaignDebouncer>,
    mut shutdown: mpsc::Receiver<()>,
    mut on_result: F,
) -> Result<(), redis::RedisError>
where
    F: FnMut(WorkerResult) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    use futures::StreamExt;

    let mut pubsub = redis_client.get_async_pubsub().await?;
    pubsub.subscribe("result").await?;
    let mut stream = pubsub.into_on_message();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("stopping result-stream listener");
                break;
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    log::warn!("result-stream ended");
                    break;
                };
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("malformed result-stream payload: {}", e);
                        continue;
                    }
                };
                let result: WorkerResult = match serde_json::from_str(&payload) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("undecodable result message: {}", e);
                        continue;
                    }
                };
                if !result.is_success() {
                    continue;
                }
                if !debouncer.try_claim(&result.campaign).await {
                    log::debug!("campaign {} already has an in-flight publisher task, dropping trigger", result.campaign);
                    continue;
                }
                let campaign = result.campaign.clone();
                let debouncer = debouncer.clone();
                on_result(result).await;
                debouncer.release(&campaign).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn debouncer_rejects_second_claim_until_released() {
        let debouncer = CampaignDebouncer::new();
        assert!(debouncer.try_claim("lintian-fixes").await);
        assert!(!debouncer.try_claim("lintian-fixes").await);
        debouncer.release("lintian-fixes").await;
        assert!(debouncer.try_claim("lintian-fixes").await);
    }

    #[tokio::test]
    async fn debouncer_tracks_campaigns_independently() {
        let debouncer = CampaignDebouncer::new();
        assert!(debouncer.try_claim("lintian-fixes").await);
        assert!(debouncer.try_claim("scrub-obsolete").await);
    }
}
