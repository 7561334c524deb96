//! Cross-module scenario tests exercising the public APIs of the scheduling and
//! publishing engines together, the way `fleetbot-scheduler` and
//! `fleetbot-publisher` actually call them. These avoid a live Postgres
//! connection -- the pure decision functions (`calculate_offset`,
//! `resolve_effective_mode`, policy resolution, rate limiting) are what's
//! worth pinning at this level; the SQL-backed halves are exercised by the
//! unit tests colocated with their modules.

use fleetbot::models::Codebase;
use fleetbot::policy::{ChangelogStance, Match, Mode, NamedPolicy, PolicyRule};
use fleetbot::publish::resolve_effective_mode;
use fleetbot::rate_limiter::{MaintainerCapRateLimiter, RateLimiter};
use fleetbot::schedule::calculate_offset;
use std::collections::HashMap;

fn codebase(name: &str, maintainer: &str) -> Codebase {
    Codebase {
        name: name.to_string(),
        branch_url: Some(format!("https://forge.example.org/{}", name)),
        vcs_type: Some("git".to_string()),
        subpath: None,
        value: Some(1.0),
        maintainer_email: Some(maintainer.to_string()),
        uploader_emails: vec![],
        removed: false,
    }
}

/// A codebase whose history has only ever failed with
/// `install-deps-unsatisfied-dependencies`. Once the missing dependency
/// becomes available, the estimator (tested in isolation in
/// `estimator.rs`) would count that run as a success, raising the success
/// chance passed to the Scheduler. This test pins the Scheduler side of
/// that chain: a higher success chance for the same candidate must produce
/// a strictly lower (sooner) offset.
#[test]
fn dependency_becoming_available_lowers_schedule_offset() {
    let estimated_duration = chrono::Duration::seconds(30);

    let offset_before = calculate_offset(
        fleetbot::schedule::DEFAULT_SCHEDULE_OFFSET,
        estimated_duration,
        1.0,
        0.1, // success chance before the dependency is satisfiable
        1.0,
        false,
    );
    let offset_after = calculate_offset(
        fleetbot::schedule::DEFAULT_SCHEDULE_OFFSET,
        estimated_duration,
        1.0,
        0.6, // success chance after the dependency resolves (estimator now counts it)
        1.0,
        false,
    );

    assert!(
        offset_after < offset_before,
        "offset should drop once the dependency is satisfiable: before={}, after={}",
        offset_before,
        offset_after
    );
}

/// A policy resolves `propose` for a maintainer who is already at their
/// open-proposal cap. `resolve_effective_mode` must downgrade the same way
/// on every call -- it has no side effect of its own, so invoking it twice
/// (e.g. once to decide, once more on a retried publish attempt before the
/// rate limiter's counter was incremented) must not itself create a second
/// proposal's worth of state. Only `RateLimiter::inc`, called once per
/// actually-opened proposal, may change the counter.
#[test]
fn effective_mode_resolution_is_idempotent_until_a_proposal_is_actually_recorded() {
    let limiter = MaintainerCapRateLimiter::new(1);
    limiter.inc("alice@example.org");
    assert!(!limiter.allowed("alice@example.org"));

    let (mode_first, rate_limited_first) = resolve_effective_mode(
        Mode::Propose,
        Some("alice@example.org"),
        &limiter,
        "https://forge.example.org/alice/repo",
        &[],
    );
    let (mode_second, rate_limited_second) = resolve_effective_mode(
        Mode::Propose,
        Some("alice@example.org"),
        &limiter,
        "https://forge.example.org/alice/repo",
        &[],
    );

    assert_eq!(mode_first, Mode::BuildOnly);
    assert_eq!(mode_first, mode_second);
    assert_eq!(rate_limited_first, rate_limited_second);

    // A single real proposal would call `inc` exactly once; the repeated,
    // purely-decisional call above must not have moved the counter.
    assert!(!limiter.allowed("alice@example.org"));
    limiter.set_open_mps_per_maintainer(HashMap::from([("alice@example.org".to_string(), 1)]));
    assert!(!limiter.allowed("alice@example.org"));
}

/// A policy resolved to `propose` for a maintainer under their cap, targeting a
/// sensitive namespace, should only be downgraded by the namespace rule if the
/// resolved mode was `attempt-push` -- a plain `propose` is unaffected by the
/// sensitive-namespace rule, which only exists to pull back an unreviewed push.
#[test]
fn sensitive_namespace_rule_does_not_touch_propose() {
    let limiter = MaintainerCapRateLimiter::new(10);
    let (mode, rate_limited) = resolve_effective_mode(
        Mode::Propose,
        Some("alice@example.org"),
        &limiter,
        "https://forge.example.org/debian/sensitive-package",
        &["debian".to_string()],
    );
    assert_eq!(mode, Mode::Propose);
    assert!(!rate_limited);
}

/// End-to-end policy resolution feeding into the downgrade pipeline: a rule
/// list picks `attempt-push` for a maintainer, and the target happens to sit
/// under a configured sensitive substring, so the final mode handed to the
/// publish subprocess is `propose`, not `attempt-push`.
#[test]
fn policy_resolution_feeds_into_effective_mode_downgrade() {
    let policy = NamedPolicy {
        rules: vec![PolicyRule {
            r#match: vec![Match {
                maintainer: vec!["releng@example.org".to_string()],
                ..Default::default()
            }],
            mode: Some(Mode::AttemptPush),
            changelog: Some(ChangelogStance::Update),
            committer: None,
        }],
        per_role_mode: HashMap::new(),
    };

    let cb = codebase("sensitive-infra", "releng@example.org");
    let resolved = policy.resolve(&cb);
    assert_eq!(resolved.mode, Mode::AttemptPush);
    assert_eq!(resolved.changelog, ChangelogStance::Update);

    let limiter = MaintainerCapRateLimiter::new(100);
    let (mode, rate_limited) = resolve_effective_mode(
        resolved.mode,
        cb.maintainer_email.as_deref(),
        &limiter,
        cb.branch_url.as_deref().unwrap(),
        &["sensitive-infra".to_string()],
    );

    assert_eq!(mode, Mode::Propose);
    assert!(!rate_limited);
}

/// Invariant 2: for any positive candidate value and non-negative duration,
/// the computed offset is strictly positive -- the cost floor guarantees the
/// numerator never reaches zero, and a positive candidate value keeps the
/// denominator positive too.
#[test]
fn offset_is_always_positive_for_positive_inputs() {
    let cases = [
        (0.0, chrono::Duration::seconds(0), 0.1, 0.01, 0.1, false),
        (-1.0, chrono::Duration::seconds(3600), 1.0, 1.0, 1.0, false),
        (-1.0, chrono::Duration::seconds(10), 0.1, 1.0, 100.0, true),
        (5.0, chrono::Duration::seconds(0), 1.0, 0.001, 0.001, false),
    ];
    for (default_offset, duration, codebase_value, success_chance, candidate_value, first_run) in cases {
        let offset = calculate_offset(
            default_offset,
            duration,
            codebase_value,
            success_chance,
            candidate_value,
            first_run,
        );
        assert!(offset > 0.0, "expected positive offset, got {}", offset);
    }
}

/// S4: a maintainer at their open-proposal cap has one campaign resolved to
/// `propose` and another resolved to `attempt-push`. After the downgrade
/// pass, no new proposal-producing mode remains for either: `propose` falls
/// back to `build-only` (skip) and `attempt-push` falls back to a plain
/// `push` (no proposal, no review).
#[test]
fn rate_limited_maintainer_downgrades_both_campaign_modes() {
    let limiter = MaintainerCapRateLimiter::new(5);
    for _ in 0..5 {
        limiter.inc("maintainer@example.org");
    }

    let (propose_campaign_mode, propose_rate_limited) = resolve_effective_mode(
        Mode::Propose,
        Some("maintainer@example.org"),
        &limiter,
        "https://forge.example.org/maintainer/repo-a",
        &[],
    );
    let (attempt_push_campaign_mode, attempt_push_rate_limited) = resolve_effective_mode(
        Mode::AttemptPush,
        Some("maintainer@example.org"),
        &limiter,
        "https://forge.example.org/maintainer/repo-b",
        &[],
    );

    assert_eq!(propose_campaign_mode, Mode::BuildOnly);
    assert!(propose_rate_limited);
    assert_eq!(attempt_push_campaign_mode, Mode::Push);
    assert!(attempt_push_rate_limited);
}

/// First-run bonus and cost-floor interact: a brand-new codebase/campaign pair
/// with the minimum normalized value still gets scheduled sooner than a
/// non-first run with the same inputs, but never produces a negative
/// effective cost -- `calculate_offset` has no floor on the offset itself
/// (it is a relative priority, not a cost), only on the codebase value that
/// feeds the denominator.
#[test]
fn first_run_bonus_composes_with_value_floor() {
    let duration = chrono::Duration::seconds(10);
    let offset_with_floor_value = calculate_offset(-1.0, duration, 0.0, 0.5, 1.0, true);
    let offset_with_floor_value_no_bonus = calculate_offset(-1.0, duration, 0.0, 0.5, 1.0, false);

    assert!(offset_with_floor_value < offset_with_floor_value_no_bonus);
    assert_eq!(
        offset_with_floor_value_no_bonus - offset_with_floor_value,
        fleetbot::schedule::FIRST_RUN_BONUS
    );
}
