//! Prometheus counters exported by the publisher, plus the push-gateway client
//! used for one-shot (`--once`) runs that exit before a scrape could happen.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use reqwest::Client;
use std::collections::HashMap;
use url::Url;

/// Counters the Publisher increments at its decision points. Registered into
/// their own [`Registry`] rather than the process-wide default so tests can
/// construct an isolated instance without colliding with other tests in the
/// same binary.
pub struct PublishMetrics {
    pub registry: Registry,
    pub proposals_opened: IntCounter,
    pub proposals_closed_no_changes: IntCounter,
    pub proposals_rescheduled_conflicted: IntCounter,
    pub rate_limited: IntCounterVec,
}

impl PublishMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let proposals_opened =
            IntCounter::new("fleetbot_proposals_opened_total", "Merge proposals opened").unwrap();
        let proposals_closed_no_changes = IntCounter::new(
            "fleetbot_proposals_closed_no_changes_total",
            "Proposals closed because a later run produced no changes",
        )
        .unwrap();
        let proposals_rescheduled_conflicted = IntCounter::new(
            "fleetbot_proposals_rescheduled_conflicted_total",
            "Proposals rescheduled because the forge reported a merge conflict",
        )
        .unwrap();
        let rate_limited = IntCounterVec::new(
            Opts::new(
                "fleetbot_publish_rate_limited_total",
                "Publishes downgraded by the per-maintainer rate limit, by campaign",
            ),
            &["campaign"],
        )
        .unwrap();

        registry.register(Box::new(proposals_opened.clone())).unwrap();
        registry
            .register(Box::new(proposals_closed_no_changes.clone()))
            .unwrap();
        registry
            .register(Box::new(proposals_rescheduled_conflicted.clone()))
            .unwrap();
        registry.register(Box::new(rate_limited.clone())).unwrap();

        Self {
            registry,
            proposals_opened,
            proposals_closed_no_changes,
            proposals_rescheduled_conflicted,
            rate_limited,
        }
    }

    /// Render the current state of every registered metric in the text
    /// exposition format, for the `/metrics` scrape endpoint.
    pub fn encode(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&families, &mut buffer).unwrap();
        buffer
    }
}

impl Default for PublishMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Push the current state of `registry` to a Prometheus push gateway. Used by
/// `--once` runs, which exit before a puller would ever scrape `/metrics`.
pub async fn push_to_gateway(
    gateway: &Url,
    job: &str,
    grouping_key: HashMap<&str, &str>,
    registry: &Registry,
) -> Result<(), Box<dyn std::error::Error>> {
    let encoder = prometheus::TextEncoder::new();
    let families = registry.gather();
    let mut buffer = String::new();
    encoder.encode_utf8(&families, &mut buffer)?;

    let mut url = gateway.join("/metrics/job/")?.join(job)?;
    for (k, v) in grouping_key {
        url.query_pairs_mut().append_pair(k, v);
    }

    let response = Client::new()
        .post(url)
        .header("Content-Type", "text/plain")
        .body(buffer)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(format!("unexpected status code from push gateway: {}", response.status()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metrics_encode_without_panicking() {
        let metrics = PublishMetrics::new();
        metrics.proposals_opened.inc();
        metrics.rate_limited.with_label_values(&["lintian-fixes"]).inc();
        let encoded = metrics.encode();
        assert!(encoded.contains("fleetbot_proposals_opened_total 1"));
        assert!(encoded.contains("fleetbot_publish_rate_limited_total"));
    }

    #[tokio::test]
    async fn push_to_gateway_surfaces_connection_errors() {
        let registry = Registry::new();
        let gateway = Url::parse("http://127.0.0.1:1").unwrap();
        let result = push_to_gateway(&gateway, "fleetbot.publish", HashMap::new(), &registry).await;
        assert!(result.is_err());
    }
}
