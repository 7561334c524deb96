//! Read-only estimates over the `run` history: expected duration and probability
//! of success, both consulted by the Scheduler (and, for re-scheduling on
//! transient failure, by the Publisher/Ingress).

use async_trait::async_trait;
use chrono::Duration;
use sqlx::postgres::types::PgInterval;
use sqlx::PgPool;

/// Default estimated duration when there is no history at all for a campaign or
/// codebase, in seconds.
pub const DEFAULT_ESTIMATED_DURATION: i64 = 15;

/// How long a `worker-failure` result is excluded from the estimator's ignore-set
/// before it resumes counting against success probability. Kept as a single
/// process-wide constant rather than per-campaign (see DESIGN.md).
pub const WORKER_FAILURE_MAX_AGE_DAYS: i64 = 1;

/// Checks whether a named build dependency is satisfiable right now.
///
/// Abstracted behind a trait rather than hard-wired to one packaging ecosystem's
/// relation syntax: the estimator only needs a yes/no answer per dependency name,
/// the concrete package index lookup belongs to whichever build-target
/// implementation (`DebianTarget`, `GenericTarget`, ...) owns that ecosystem.
#[async_trait]
pub trait DependencyChecker: Send + Sync {
    async fn is_available(&self, dependency: &str) -> bool;
}

/// Conservative default: nothing is ever satisfiable. Safe because it only ever
/// causes the estimator to *undercount* successes, never to overcount them.
pub struct NeverAvailable;

#[async_trait]
impl DependencyChecker for NeverAvailable {
    async fn is_available(&self, _dependency: &str) -> bool {
        false
    }
}

async fn deps_satisfied(checker: &dyn DependencyChecker, relations: &[String]) -> bool {
    for dep in relations {
        if !checker.is_available(dep).await {
            return false;
        }
    }
    true
}

fn ignore_worker_failure(result_code: &str, start_time: chrono::DateTime<chrono::Utc>) -> bool {
    result_code == "worker-failure"
        && (chrono::Utc::now() - start_time).num_days() >= WORKER_FAILURE_MAX_AGE_DAYS
}

async fn estimate_duration_for(
    conn: &PgPool,
    codebase: Option<&str>,
    campaign: Option<&str>,
) -> Result<Option<Duration>, sqlx::Error> {
    let mut query = sqlx::QueryBuilder::new(
        "SELECT AVG(finish_time - start_time) FROM run WHERE failure_transient IS NOT TRUE",
    );
    if let Some(codebase) = codebase {
        query.push(" AND codebase = ");
        query.push_bind(codebase);
    }
    if let Some(campaign) = campaign {
        query.push(" AND campaign = ");
        query.push_bind(campaign);
    }
    let interval: Option<PgInterval> = query
        .build_query_scalar::<PgInterval>()
        .fetch_optional(conn)
        .await?;
    Ok(interval.map(|d| Duration::microseconds(d.microseconds)))
}

/// Expected duration of a `(codebase, campaign)` build: average over history for
/// that exact pair, falling back to per-codebase, then per-campaign, then a fixed
/// default. The fallback chain guarantees a defined, positive duration always.
pub async fn estimate_duration(
    conn: &PgPool,
    codebase: &str,
    campaign: &str,
) -> Result<Duration, sqlx::Error> {
    if let Some(d) = estimate_duration_for(conn, Some(codebase), Some(campaign)).await? {
        return Ok(d);
    }
    if let Some(d) = estimate_duration_for(conn, Some(codebase), None).await? {
        return Ok(d);
    }
    if let Some(d) = estimate_duration_for(conn, None, Some(campaign)).await? {
        return Ok(d);
    }
    Ok(Duration::seconds(DEFAULT_ESTIMATED_DURATION))
}

#[derive(sqlx::FromRow)]
struct HistoricalRun {
    result_code: String,
    instigated_context: Option<String>,
    context: Option<String>,
    failure_details: Option<serde_json::Value>,
    duration: PgInterval,
    start_time: chrono::DateTime<chrono::Utc>,
}

/// Probability of success for a prospective run of `(codebase, campaign)` under
/// `context`, plus the expected duration and the number of historical runs it was
/// derived from.
///
/// The probability is smoothed as `(successes*10 + 1) / (total*10 + 1)` so that a
/// handful of runs doesn't collapse to exactly 0 or 1, then scaled by a context
/// similarity factor (full weight if the context matches, a tenth if it's known to
/// differ, full weight again if there's no history to compare against at all).
pub async fn success_probability_and_duration(
    conn: &PgPool,
    codebase: &str,
    campaign: &str,
    context: Option<&str>,
    dep_checker: &dyn DependencyChecker,
) -> Result<(f64, Duration, usize), sqlx::Error> {
    let mut total = 0usize;
    let mut success = 0usize;
    let mut same_context_multiplier = if context.is_none() { 0.5 } else { 1.0 };
    let mut durations = Vec::new();

    let runs: Vec<HistoricalRun> = sqlx::query_as(
        r#"
        SELECT result_code, instigated_context, context, failure_details,
               finish_time - start_time AS duration, start_time
        FROM run
        WHERE codebase = $1 AND campaign = $2 AND failure_transient IS NOT TRUE
        ORDER BY start_time DESC
        "#,
    )
    .bind(codebase)
    .bind(campaign)
    .fetch_all(conn)
    .await?;

    for run in &runs {
        if ignore_worker_failure(&run.result_code, run.start_time) {
            continue;
        }

        durations.push(run.duration.microseconds / (1_000 * 1_000));
        total += 1;
        if run.result_code == "success" {
            success += 1;
        }

        let mut same_context = context.is_some_and(|c| !c.is_empty())
            && [run.instigated_context.as_deref(), run.context.as_deref()].contains(&context);

        if run.result_code == "install-deps-unsatisfied-dependencies" {
            if let Some(relations) = run
                .failure_details
                .as_ref()
                .and_then(|d| d.get("relations"))
                .and_then(|r| r.as_array())
            {
                let names: Vec<String> = relations
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if !names.is_empty() && deps_satisfied(dep_checker, &names).await {
                    success += 1;
                    same_context = false;
                }
            }
        }

        if same_context {
            same_context_multiplier = 0.1;
        }
    }

    let estimated_duration = if total == 0 {
        same_context_multiplier = 1.0;
        estimate_duration(conn, codebase, campaign).await?
    } else {
        Duration::seconds(durations.iter().sum::<i64>() / durations.len() as i64)
    };

    let probability = ((success * 10 + 1) as f64 / (total * 10 + 1) as f64) * same_context_multiplier;

    Ok((probability, estimated_duration, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothing_formula_monotonicity() {
        // Holding total fixed, more successes must strictly increase probability.
        let p = |success: usize, total: usize| (success * 10 + 1) as f64 / (total * 10 + 1) as f64;
        assert!(p(3, 10) > p(2, 10));
        assert!(p(2, 10) > p(1, 10));
        // Holding successes fixed, more (failing) total runs must strictly decrease
        // probability.
        assert!(p(2, 10) > p(2, 11));
        assert!(p(2, 11) > p(2, 12));
    }

    #[test]
    fn smoothing_never_hits_extremes() {
        let p = |success: usize, total: usize| (success * 10 + 1) as f64 / (total * 10 + 1) as f64;
        assert!(p(0, 1) > 0.0);
        assert!(p(1, 1) < 1.0);
    }

    #[test]
    fn worker_failure_ignored_only_after_aging_out() {
        let now = chrono::Utc::now();
        assert!(!ignore_worker_failure("worker-failure", now));
        assert!(ignore_worker_failure(
            "worker-failure",
            now - chrono::Duration::days(2)
        ));
        assert!(!ignore_worker_failure("success", now - chrono::Duration::days(2)));
    }

    #[tokio::test]
    async fn never_available_checker_rejects_everything() {
        let checker = NeverAvailable;
        assert!(!deps_satisfied(&checker, &["libfoo-dev".to_string()]).await);
        assert!(deps_satisfied(&checker, &[]).await);
    }
}
