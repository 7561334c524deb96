//! Publisher: turns a finished, successful run into a push or merge proposal,
//! subject to policy, the per-maintainer rate limit, and the sensitive-host
//! downgrade rule. The reconciliation sweep (`reconcile`) and the JSON
//! subprocess contract (`subprocess`) live alongside this module.

pub mod reconcile;
pub mod subprocess;

use crate::error::{Error, Result};
use crate::hoster::is_sensitive_namespace;
use crate::metrics::PublishMetrics;
use crate::models::{Codebase, PublishRecord, Run};
use crate::policy::{Mode, NamedPolicy};
use crate::rate_limiter::RateLimiter;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use subprocess::{run_publish_one, PublishOneRequest, PublishOneResult};

/// Exponential backoff for retrying a failed publish attempt, capped at one
/// week: `2^attempt_count` hours, doubling each time.
pub fn calculate_next_try_time(finish_time: DateTime<Utc>, attempt_count: usize) -> DateTime<Utc> {
    if attempt_count == 0 {
        finish_time
    } else {
        let hours = 2u64.saturating_pow(attempt_count as u32).min(7 * 24);
        finish_time + chrono::Duration::hours(hours as i64)
    }
}

/// Apply the rate-limit downgrade and sensitive-namespace downgrade rules to a
/// policy-resolved mode, in that order: a maintainer over their open-proposal
/// cap gets `propose`/`attempt-push` downgraded first, then any surviving
/// `attempt-push` targeting a sensitive namespace is downgraded to `propose`.
/// Returns the final mode plus whether it was downgraded for rate-limit
/// reasons (the caller uses this to decide whether to bump a rate-limit
/// metric) and whether a proposal publish is still possible at all.
pub fn resolve_effective_mode(
    resolved_mode: Mode,
    maintainer_email: Option<&str>,
    rate_limiter: &dyn RateLimiter,
    target_branch_url: &str,
    sensitive_host_substrings: &[String],
) -> (Mode, bool) {
    let mut mode = resolved_mode;
    let mut rate_limited = false;

    if matches!(mode, Mode::Propose | Mode::AttemptPush) {
        let allowed = maintainer_email
            .map(|email| rate_limiter.allowed(email))
            .unwrap_or(true);
        if !allowed {
            rate_limited = true;
            mode = match mode {
                Mode::Propose => Mode::BuildOnly,
                Mode::AttemptPush => Mode::Push,
                other => other,
            };
        }
    }

    if mode == Mode::AttemptPush && is_sensitive_namespace(target_branch_url, sensitive_host_substrings) {
        mode = Mode::Propose;
    }

    (mode, rate_limited)
}

/// Everything needed to decide and carry out a publish for one finished run.
pub struct PublishContext<'a> {
    pub pool: &'a PgPool,
    pub rate_limiter: &'a dyn RateLimiter,
    pub policies: &'a std::collections::HashMap<String, NamedPolicy>,
    pub sensitive_host_substrings: &'a [String],
    pub publish_one_binary: &'a str,
    pub external_url: Option<&'a url::Url>,
    pub metrics: &'a PublishMetrics,
    pub dry_run: bool,
}

/// Attempt to publish the `role` branch of `run` for `codebase`, recording the
/// outcome either way. Returns `Ok(None)` if policy resolved to skip/build-only
/// (nothing to publish, not an error).
pub async fn publish_run(
    ctx: &PublishContext<'_>,
    codebase: &Codebase,
    run: &Run,
    role: &str,
    policy_name: &str,
) -> Result<Option<PublishOneResult>> {
    let policy = ctx
        .policies
        .get(policy_name)
        .ok_or_else(|| Error::Config(format!("no such publish policy: {}", policy_name)))?;
    let resolved = policy.resolve(codebase);
    let requested_mode = policy.mode_for_role(codebase, role);

    let branch = run
        .result_branch(role)
        .ok_or_else(|| Error::Validation(format!("run {} has no {} branch", run.id, role)))?;

    let target_branch_url = branch.name.clone();

    if already_published(
        ctx.pool,
        &codebase.name,
        &run.campaign,
        &branch.name,
        branch.head_revision.as_deref(),
        requested_mode,
    )
    .await?
    {
        return Ok(None);
    }

    let (mode, rate_limited) = resolve_effective_mode(
        requested_mode,
        codebase.maintainer_address().as_deref(),
        ctx.rate_limiter,
        &target_branch_url,
        ctx.sensitive_host_substrings,
    );

    if rate_limited {
        log::warn!(
            "not proposing for {}: maximum open proposals reached for maintainer {:?}",
            codebase.name,
            codebase.maintainer_address()
        );
        ctx.metrics.rate_limited.with_label_values(&[run.campaign.as_str()]).inc();
    }

    if matches!(mode, Mode::Skip | Mode::BuildOnly) {
        return Ok(None);
    }

    let request = PublishOneRequest {
        codebase: codebase.name.clone(),
        campaign: run.campaign.clone(),
        command: run.command.clone(),
        mode,
        role: role.to_string(),
        main_branch_url: target_branch_url,
        source_branch_name: branch.base_revision.clone(),
        resume_branch_name: None,
        maintainer_email: codebase.maintainer_address(),
        changelog: resolved.changelog,
        committer: resolved.committer.clone(),
        run_id: run.id.clone(),
        external_url: ctx.external_url.cloned(),
        existing_proposal_url: None,
        dry_run: ctx.dry_run,
    };

    let outcome = run_publish_one(ctx.publish_one_binary, &request).await;
    let record_result = match &outcome {
        Ok(result) => PublishRecord {
            codebase: codebase.name.clone(),
            campaign: run.campaign.clone(),
            run_id: run.id.clone(),
            mode: mode.to_string(),
            result_code: "success".to_string(),
            description: result.description.clone(),
            branch_name: Some(result.branch_name.clone()),
            base_revision: result.base_revision.clone(),
            revision: result.revision.clone(),
            proposal_url: result.proposal_url.clone(),
            attempted_at: Utc::now(),
        },
        Err(e) => PublishRecord {
            codebase: codebase.name.clone(),
            campaign: run.campaign.clone(),
            run_id: run.id.clone(),
            mode: mode.to_string(),
            result_code: e.code().to_string(),
            description: e.to_string(),
            branch_name: None,
            base_revision: None,
            revision: None,
            proposal_url: None,
            attempted_at: Utc::now(),
        },
    };
    store_publish(ctx.pool, &record_result).await?;

    match outcome {
        Ok(result) => {
            if result.is_new && result.proposal_url.is_some() {
                if let Some(email) = codebase.maintainer_address() {
                    ctx.rate_limiter.inc(&email);
                }
                ctx.metrics.proposals_opened.inc();
            }
            Ok(Some(result))
        }
        Err(e) => Err(e),
    }
}

/// Tally of one `publish_pending` pass, surfaced as metrics by the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublishPendingSummary {
    pub published: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(sqlx::FromRow)]
struct PublishReadyRow {
    id: String,
    codebase: String,
    campaign: String,
    command: String,
    start_time: DateTime<Utc>,
    finish_time: DateTime<Utc>,
    result_code: String,
    failure_details: Option<serde_json::Value>,
    failure_transient: Option<bool>,
    instigated_context: Option<String>,
    context: Option<String>,
    main_branch_revision: Option<String>,
    #[sqlx(default)]
    result_branches: sqlx::types::Json<Vec<crate::models::ResultBranch>>,
    change_set: Option<String>,
    publish_policy: Option<String>,
    branch_url: Option<String>,
    vcs_type: Option<String>,
    subpath: Option<String>,
    value: Option<f64>,
    maintainer_email: Option<String>,
    #[sqlx(default)]
    uploader_emails: Vec<String>,
    removed: bool,
}

impl PublishReadyRow {
    fn into_run_and_codebase(self) -> (Run, Codebase, String) {
        let run = Run {
            id: self.id,
            codebase: self.codebase.clone(),
            campaign: self.campaign,
            command: self.command,
            start_time: self.start_time,
            finish_time: self.finish_time,
            result_code: self.result_code,
            failure_details: self.failure_details,
            failure_transient: self.failure_transient,
            instigated_context: self.instigated_context,
            context: self.context,
            main_branch_revision: self.main_branch_revision,
            result_branches: self.result_branches,
            change_set: self.change_set,
        };
        let codebase = Codebase {
            name: self.codebase,
            branch_url: self.branch_url,
            vcs_type: self.vcs_type,
            subpath: self.subpath,
            value: self.value,
            maintainer_email: self.maintainer_email,
            uploader_emails: self.uploader_emails,
            removed: self.removed,
        };
        let policy_name = self.publish_policy.unwrap_or_else(|| "default".to_string());
        (run, codebase, policy_name)
    }
}

/// Every `(codebase, campaign)` pair whose most recent run succeeded: the raw
/// material for a publish attempt. Mirrors the original `iter_publish_ready`
/// query -- only the latest run per pair is a candidate, since an older
/// success has already either been published or superseded.
async fn fetch_publish_ready(pool: &PgPool) -> std::result::Result<Vec<PublishReadyRow>, sqlx::Error> {
    sqlx::query_as::<_, PublishReadyRow>(
        "SELECT run.id, run.codebase, run.campaign, run.command, run.start_time,
                run.finish_time, run.result_code, run.failure_details, run.failure_transient,
                run.instigated_context, run.context, run.main_branch_revision,
                run.result_branches, run.change_set,
                candidate.publish_policy,
                cb.branch_url, cb.vcs_type, cb.subpath, cb.value, cb.maintainer_email,
                cb.uploader_emails, cb.removed
         FROM run
         JOIN codebase cb ON cb.name = run.codebase
         LEFT JOIN candidate ON candidate.codebase = run.codebase AND candidate.campaign = run.campaign
         WHERE run.result_code = 'success'
           AND run.finish_time = (
               SELECT MAX(r2.finish_time) FROM run r2
               WHERE r2.codebase = run.codebase AND r2.campaign = run.campaign
           )",
    )
    .fetch_all(pool)
    .await
}

/// Publish every role of every run `fetch_publish_ready` surfaces. A failure
/// publishing one run (a bad policy name, a forge error) is logged and
/// counted, not propagated -- one broken codebase must not stop the rest of
/// the fleet from publishing.
pub async fn publish_pending(ctx: &PublishContext<'_>) -> Result<PublishPendingSummary> {
    let rows = fetch_publish_ready(ctx.pool).await?;
    let mut summary = PublishPendingSummary::default();

    for row in rows {
        let (run, codebase, policy_name) = row.into_run_and_codebase();
        let roles: Vec<String> = run.result_branches.0.iter().map(|b| b.role.clone()).collect();
        for role in roles {
            match publish_run(ctx, &codebase, &run, &role, &policy_name).await {
                Ok(Some(_)) => summary.published += 1,
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    log::warn!(
                        "publish failed for {} / {} ({}): {}",
                        codebase.name,
                        run.campaign,
                        role,
                        e
                    );
                    summary.failed += 1;
                }
            }
        }
    }

    Ok(summary)
}

/// Invariant 5: a `(codebase, campaign, branch, revision, mode)` combination
/// that already has a successful publish record needs nothing further -- the
/// next tick would otherwise re-run the same publish subprocess call for a
/// run whose result hasn't changed since the last pass.
async fn already_published(
    pool: &PgPool,
    codebase: &str,
    campaign: &str,
    branch_name: &str,
    revision: Option<&str>,
    mode: Mode,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM publish
         WHERE codebase = $1 AND campaign = $2 AND branch_name = $3
           AND revision IS NOT DISTINCT FROM $4 AND mode = $5 AND result_code = 'success'",
    )
    .bind(codebase)
    .bind(campaign)
    .bind(branch_name)
    .bind(revision)
    .bind(mode.to_string())
    .fetch_one(pool)
    .await
    .map_err(Error::Database)?;
    Ok(count > 0)
}

async fn store_publish(pool: &PgPool, record: &PublishRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO publish (codebase, campaign, run_id, mode, result_code, description,
                              branch_name, base_revision, revision, proposal_url, attempted_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(&record.codebase)
    .bind(&record.campaign)
    .bind(&record.run_id)
    .bind(&record.mode)
    .bind(&record.result_code)
    .bind(&record.description)
    .bind(&record.branch_name)
    .bind(&record.base_revision)
    .bind(&record.revision)
    .bind(&record.proposal_url)
    .bind(record.attempted_at)
    .execute(pool)
    .await
    .map_err(Error::Database)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::{MaintainerCapRateLimiter, NoRateLimiter};

    #[test]
    fn rate_limit_downgrades_propose_to_build_only() {
        // Invariant 6: a maintainer at their cap must never get a new proposal,
        // even when policy resolved to `propose`.
        let limiter = MaintainerCapRateLimiter::new(1);
        limiter.inc("alice@example.org");
        let (mode, rate_limited) = resolve_effective_mode(
            Mode::Propose,
            Some("alice@example.org"),
            &limiter,
            "https://forge.example.org/alice/foo",
            &[],
        );
        assert_eq!(mode, Mode::BuildOnly);
        assert!(rate_limited);
    }

    #[test]
    fn rate_limit_downgrades_attempt_push_to_push() {
        let limiter = MaintainerCapRateLimiter::new(1);
        limiter.inc("alice@example.org");
        let (mode, rate_limited) = resolve_effective_mode(
            Mode::AttemptPush,
            Some("alice@example.org"),
            &limiter,
            "https://forge.example.org/alice/foo",
            &[],
        );
        assert_eq!(mode, Mode::Push);
        assert!(rate_limited);
    }

    #[test]
    fn sensitive_namespace_downgrades_attempt_push_to_propose() {
        let limiter = NoRateLimiter;
        let substrings = vec!["salsa.debian.org/debian/".to_string()];
        let (mode, rate_limited) = resolve_effective_mode(
            Mode::AttemptPush,
            Some("alice@example.org"),
            &limiter,
            "https://salsa.debian.org/debian/apt",
            &substrings,
        );
        assert_eq!(mode, Mode::Propose);
        assert!(!rate_limited);
    }

    #[test]
    fn unthrottled_propose_is_unaffected() {
        let limiter = NoRateLimiter;
        let (mode, rate_limited) = resolve_effective_mode(
            Mode::Propose,
            Some("alice@example.org"),
            &limiter,
            "https://forge.example.org/alice/foo",
            &[],
        );
        assert_eq!(mode, Mode::Propose);
        assert!(!rate_limited);
    }

    #[test]
    fn skip_and_build_only_are_untouched_by_downgrades() {
        let limiter = NoRateLimiter;
        for mode in [Mode::Skip, Mode::BuildOnly, Mode::Push, Mode::PushDerived] {
            let (resolved, rate_limited) =
                resolve_effective_mode(mode, Some("alice@example.org"), &limiter, "https://forge.example.org/x", &[]);
            assert_eq!(resolved, mode);
            assert!(!rate_limited);
        }
    }

    #[test]
    fn backoff_grows_and_caps_at_one_week() {
        let start = Utc::now();
        assert_eq!(calculate_next_try_time(start, 0), start);
        assert!(calculate_next_try_time(start, 1) > start);
        let capped = calculate_next_try_time(start, 10);
        assert_eq!(capped, start + chrono::Duration::hours(7 * 24));
    }
}
