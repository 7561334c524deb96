//! Turns candidates into queue entries with a priority offset derived from
//! expected cost, expected value, and probability of success.

use crate::estimator::{self, DependencyChecker};
use crate::models::Candidate;
use crate::policy::NamedPolicy;
use crate::queue::Queue;
use chrono::Duration;
use sqlx::PgPool;
use std::collections::HashMap;

/// Bonus subtracted from the offset the first time a `(codebase, campaign)` pair
/// is ever scheduled, so new candidates aren't buried behind an established
/// backlog while their actual cost/value is still unknown.
pub const FIRST_RUN_BONUS: f64 = 100.0;

/// Fixed per-run overhead added to every cost estimate, in arbitrary cost units,
/// representing the fixed overhead of worker startup/checkout regardless of how
/// short the actual build turns out to be.
pub const MINIMUM_COST: f64 = 20_000.0;

/// Floor applied to a codebase's normalized value so that a codebase with a
/// configured value of exactly zero isn't scheduled with infinite offset.
pub const MINIMUM_NORMALIZED_CODEBASE_VALUE: f64 = 0.1;

/// Normalized codebase value used when a codebase has no `value` configured.
pub const DEFAULT_NORMALIZED_CODEBASE_VALUE: f64 = 0.5;

/// Offset applied to control runs (housekeeping, not campaign work), ahead of
/// ordinary candidates in the same bucket.
pub const DEFAULT_SCHEDULE_OFFSET: f64 = -1.0;

/// A fully-resolved request to add one item to the queue.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    pub context: Option<String>,
    pub change_set: Option<String>,
    pub offset: f64,
    pub bucket: String,
    pub estimated_duration: Duration,
    pub refresh: bool,
    pub requester: Option<String>,
}

/// `offset = default_offset + estimated_cost / estimated_value`, where cost
/// bakes in fixed per-run overhead and duration, and value combines the
/// codebase's normalized influence weight, probability of success, and the
/// candidate's own value. A first-ever run for the pair gets `FIRST_RUN_BONUS`
/// subtracted so it isn't buried behind an established backlog.
pub fn calculate_offset(
    default_offset: f64,
    estimated_duration: Duration,
    normalized_codebase_value: f64,
    success_chance: f64,
    candidate_value: f64,
    is_first_run: bool,
) -> f64 {
    let normalized_codebase_value = normalized_codebase_value.max(MINIMUM_NORMALIZED_CODEBASE_VALUE);
    let whole_seconds = estimated_duration.num_seconds();
    let micros_remainder = estimated_duration.num_microseconds().unwrap_or(0) - whole_seconds * 1_000_000;
    let estimated_cost = MINIMUM_COST + (whole_seconds as f64) * 1000.0 + (micros_remainder as f64);
    let estimated_value = normalized_codebase_value * success_chance * candidate_value;

    let mut offset = default_offset + estimated_cost / estimated_value;
    if is_first_run {
        offset -= FIRST_RUN_BONUS;
    }
    offset
}

/// Normalize a raw codebase value against the configured value of "an average
/// codebase" (1.0 if unset), floored so no codebase is ever weighted at zero.
pub fn normalize_codebase_value(value: Option<f64>) -> f64 {
    value.unwrap_or(DEFAULT_NORMALIZED_CODEBASE_VALUE).max(MINIMUM_NORMALIZED_CODEBASE_VALUE)
}

/// Resolve one candidate into a fully-formed `ScheduleRequest`, consulting the
/// estimator for duration/success-chance unless the candidate already supplies
/// a success chance (from a caller that precomputed it).
pub async fn do_schedule_regular(
    conn: &PgPool,
    candidate: &Candidate,
    bucket: &str,
    dep_checker: &dyn DependencyChecker,
    codebase_value: Option<f64>,
) -> Result<ScheduleRequest, sqlx::Error> {
    let (success_chance, estimated_duration, history_len) = match candidate.success_chance {
        Some(chance) => {
            let duration = estimator::estimate_duration(conn, &candidate.codebase, &candidate.campaign).await?;
            (chance, duration, 1)
        }
        None => {
            estimator::success_probability_and_duration(
                conn,
                &candidate.codebase,
                &candidate.campaign,
                candidate.context.as_deref(),
                dep_checker,
            )
            .await?
        }
    };

    let normalized_value = normalize_codebase_value(codebase_value);
    let offset = calculate_offset(
        DEFAULT_SCHEDULE_OFFSET,
        estimated_duration,
        normalized_value,
        success_chance,
        candidate.value,
        history_len == 0,
    );

    Ok(ScheduleRequest {
        codebase: candidate.codebase.clone(),
        campaign: candidate.campaign.clone(),
        command: candidate.command.clone(),
        context: candidate.context.clone(),
        change_set: candidate.change_set.clone(),
        offset,
        bucket: bucket.to_string(),
        estimated_duration,
        refresh: false,
        requester: None,
    })
}

/// A control run: housekeeping work against a codebase (e.g. refreshing VCS
/// metadata) rather than campaign-driven candidate work. Always scheduled into
/// the `control` bucket ahead of ordinary candidates.
pub async fn do_schedule_control(
    conn: &PgPool,
    codebase: &str,
    command: &str,
) -> Result<ScheduleRequest, sqlx::Error> {
    let estimated_duration = estimator::estimate_duration(conn, codebase, "control").await?;
    Ok(ScheduleRequest {
        codebase: codebase.to_string(),
        campaign: "control".to_string(),
        command: command.to_string(),
        context: None,
        change_set: None,
        offset: DEFAULT_SCHEDULE_OFFSET,
        bucket: "control".to_string(),
        estimated_duration,
        refresh: true,
        requester: None,
    })
}

/// Resolve a batch of candidates into schedule requests, folding in each
/// campaign's per-role publish-mode value bonus (a candidate whose resolved
/// policy would actually publish something is worth more than one that would
/// only ever build) and skipping (logging, not aborting) candidates whose
/// dependency requirements can't currently be satisfied.
pub async fn bulk_add_to_queue(
    conn: &PgPool,
    candidates: &[Candidate],
    policies: &HashMap<String, NamedPolicy>,
    codebase_values: &HashMap<String, f64>,
    dep_checker: &dyn DependencyChecker,
    bucket: &str,
) -> Result<Vec<ScheduleRequest>, crate::error::Error> {
    let mut requests = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if matches!(candidate.command.as_str(), "") {
            log::warn!(
                "skipping candidate with empty command: codebase={} campaign={}",
                candidate.codebase,
                candidate.campaign
            );
            continue;
        }

        let value_bonus = candidate
            .publish_policy
            .as_ref()
            .and_then(|name| policies.get(name))
            .map(|policy| publish_mode_value_bonus(policy))
            .unwrap_or(0.0);

        let mut candidate = candidate.clone();
        candidate.value += value_bonus;

        match do_schedule_regular(
            conn,
            &candidate,
            bucket,
            dep_checker,
            codebase_values.get(&candidate.codebase).copied(),
        )
        .await
        {
            Ok(request) => requests.push(request),
            Err(e) => {
                log::warn!(
                    "skipping candidate codebase={} campaign={}: {}",
                    candidate.codebase,
                    candidate.campaign,
                    e
                );
            }
        }
    }
    Ok(requests)
}

/// A candidate whose policy would actually publish something (anything other
/// than skip/build-only) is worth scheduling sooner than one that never will.
fn publish_mode_value_bonus(policy: &NamedPolicy) -> f64 {
    use crate::policy::Mode;
    if policy
        .per_role_mode
        .values()
        .any(|m| !matches!(m, Mode::Skip | Mode::BuildOnly))
    {
        10.0
    } else {
        0.0
    }
}

/// Write a resolved `ScheduleRequest` into the queue, returning the assigned
/// queue id and the bucket it actually landed in (which may differ from the
/// requested bucket if an existing, higher-priority row already occupies the
/// slot -- see `Queue::add`).
pub async fn do_schedule(queue: &Queue<'_>, request: &ScheduleRequest) -> Result<(i32, String), sqlx::Error> {
    queue
        .add(
            &request.codebase,
            &request.command,
            &request.campaign,
            request.change_set.as_deref(),
            request.offset,
            &request.bucket,
            request.context.as_deref(),
            Some(request.estimated_duration),
            request.refresh,
            request.requester.as_deref(),
        )
        .await
}

/// Resolve every candidate in `candidates` into a schedule request, in order.
/// Candidates that the estimator can't resolve (e.g. a transient DB error) are
/// logged and dropped rather than aborting the whole batch.
pub async fn iter_schedule_requests_from_candidates(
    conn: &PgPool,
    candidates: &[Candidate],
    bucket: &str,
    dep_checker: &dyn DependencyChecker,
    codebase_values: &HashMap<String, f64>,
) -> Vec<ScheduleRequest> {
    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match do_schedule_regular(
            conn,
            candidate,
            bucket,
            dep_checker,
            codebase_values.get(&candidate.codebase).copied(),
        )
        .await
        {
            Ok(request) => out.push(request),
            Err(e) => log::warn!(
                "dropping candidate codebase={} campaign={}: {}",
                candidate.codebase,
                candidate.campaign,
                e
            ),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_bonus_lowers_offset() {
        // S1: identical inputs except is_first_run must yield a strictly lower
        // offset (i.e. scheduled sooner) for the first-ever run.
        let with_bonus = calculate_offset(DEFAULT_SCHEDULE_OFFSET, Duration::seconds(60), 1.0, 0.5, 1.0, true);
        let without_bonus = calculate_offset(DEFAULT_SCHEDULE_OFFSET, Duration::seconds(60), 1.0, 0.5, 1.0, false);
        assert!(with_bonus < without_bonus);
        assert_eq!(without_bonus - with_bonus, FIRST_RUN_BONUS);
    }

    #[test]
    fn offset_grows_with_duration() {
        let short = calculate_offset(DEFAULT_SCHEDULE_OFFSET, Duration::seconds(10), 1.0, 0.5, 1.0, false);
        let long = calculate_offset(DEFAULT_SCHEDULE_OFFSET, Duration::seconds(600), 1.0, 0.5, 1.0, false);
        assert!(long > short);
    }

    #[test]
    fn normalized_value_is_floored_not_zero() {
        // Invariant 2: offset must stay finite and well-defined even for a
        // codebase configured with value=0.
        assert_eq!(normalize_codebase_value(Some(0.0)), MINIMUM_NORMALIZED_CODEBASE_VALUE);
        let offset = calculate_offset(
            DEFAULT_SCHEDULE_OFFSET,
            Duration::seconds(60),
            normalize_codebase_value(Some(0.0)),
            0.5,
            1.0,
            false,
        );
        assert!(offset.is_finite());
    }

    #[test]
    fn higher_success_chance_yields_lower_offset() {
        let confident = calculate_offset(DEFAULT_SCHEDULE_OFFSET, Duration::seconds(60), 1.0, 0.9, 1.0, false);
        let unsure = calculate_offset(DEFAULT_SCHEDULE_OFFSET, Duration::seconds(60), 1.0, 0.1, 1.0, false);
        assert!(confident < unsure);
    }

    #[test]
    fn publish_mode_bonus_only_for_non_skip_roles() {
        use crate::policy::Mode;
        let mut skip_only = NamedPolicy::default();
        skip_only.per_role_mode.insert("main".to_string(), Mode::Skip);
        assert_eq!(publish_mode_value_bonus(&skip_only), 0.0);

        let mut proposes = NamedPolicy::default();
        proposes.per_role_mode.insert("main".to_string(), Mode::Propose);
        assert!(publish_mode_value_bonus(&proposes) > 0.0);
    }
}
