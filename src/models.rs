//! Concrete record types for every entity the store persists.
//!
//! Every row the engine touches gets its own struct here instead of being read back
//! as a dynamically-typed row/dict; JSON/JSONB columns (`failure_details`, `context`)
//! keep their own typed sub-structures where the engine actually interprets them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single software repository under fleet management.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Codebase {
    pub name: String,
    pub branch_url: Option<String>,
    pub vcs_type: Option<String>,
    pub subpath: Option<String>,
    /// Non-negative influence weight; higher means scheduled sooner, all else equal.
    pub value: Option<f64>,
    pub maintainer_email: Option<String>,
    #[sqlx(default)]
    pub uploader_emails: Vec<String>,
    pub removed: bool,
}

impl Codebase {
    /// Address-only maintainer email (display name, if any, stripped).
    pub fn maintainer_address(&self) -> Option<String> {
        self.maintainer_email.as_deref().map(address_only)
    }

    /// Address-only uploader emails.
    pub fn uploader_addresses(&self) -> Vec<String> {
        self.uploader_emails.iter().map(|s| address_only(s)).collect()
    }
}

/// Strip an RFC 5322 display name, leaving just the bare address.
///
/// `"Alice Example <alice@example.org>"` -> `"alice@example.org"`.
pub fn address_only(raw: &str) -> String {
    if let Some(start) = raw.find('<') {
        if let Some(end) = raw[start..].find('>') {
            return raw[start + 1..start + end].trim().to_string();
        }
    }
    raw.trim().to_string()
}

/// A `(codebase, campaign)` intention to run, with the estimator inputs the
/// Scheduler needs if the caller doesn't supply them directly.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Candidate {
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    pub context: Option<String>,
    pub value: f64,
    pub success_chance: Option<f64>,
    pub publish_policy: Option<String>,
    pub change_set: Option<String>,
}

/// One branch produced by a run (e.g. the `main` role, or a `debian/patches` role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBranch {
    pub role: String,
    pub name: String,
    pub base_revision: Option<String>,
    pub head_revision: Option<String>,
}

/// The immutable outcome of a worker executing a queue item.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub result_code: String,
    pub failure_details: Option<serde_json::Value>,
    pub failure_transient: Option<bool>,
    pub instigated_context: Option<String>,
    pub context: Option<String>,
    pub main_branch_revision: Option<String>,
    #[sqlx(default)]
    pub result_branches: sqlx::types::Json<Vec<ResultBranch>>,
    pub change_set: Option<String>,
}

impl Run {
    pub fn duration(&self) -> chrono::Duration {
        self.finish_time - self.start_time
    }

    pub fn result_branch(&self, role: &str) -> Option<&ResultBranch> {
        self.result_branches.0.iter().find(|b| b.role == role)
    }

    /// Whether this result counts as "no-op" for reconciliation purposes: nothing
    /// changed, so an open proposal doesn't need updating, just closing if it's the
    /// only thing that has happened since the proposal's source run.
    pub fn is_no_op(&self) -> bool {
        matches!(self.result_code.as_str(), "nothing-to-do" | "nothing-new-to-do")
    }

    pub fn is_success(&self) -> bool {
        self.result_code == "success"
    }
}

/// Status of a merge proposal as last observed from the hoster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStatus {
    Open,
    Merged,
    Closed,
    Applied,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
            Self::Applied => "applied",
        };
        write!(f, "{}", s)
    }
}

/// A merge proposal this engine opened (or is tracking) on an external forge.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct MergeProposal {
    pub url: String,
    pub codebase: String,
    pub campaign: String,
    pub status: String,
    pub last_source_revision: Option<String>,
    pub source_run_id: Option<String>,
}

/// An append-only record of one publish attempt (success or failure).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct PublishRecord {
    pub codebase: String,
    pub campaign: String,
    pub run_id: String,
    pub mode: String,
    pub result_code: String,
    pub description: String,
    pub branch_name: Option<String>,
    pub base_revision: Option<String>,
    pub revision: Option<String>,
    pub proposal_url: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_only_strips_display_name() {
        assert_eq!(
            address_only("Alice Example <alice@example.org>"),
            "alice@example.org"
        );
        assert_eq!(address_only("bob@example.org"), "bob@example.org");
    }

    #[test]
    fn run_is_no_op_classification() {
        let mut run = sample_run("nothing-to-do");
        assert!(run.is_no_op());
        run.result_code = "nothing-new-to-do".to_string();
        assert!(run.is_no_op());
        run.result_code = "success".to_string();
        assert!(!run.is_no_op());
        assert!(run.is_success());
    }

    fn sample_run(result_code: &str) -> Run {
        Run {
            id: "1".to_string(),
            codebase: "foo".to_string(),
            campaign: "lintian-fixes".to_string(),
            command: "lintian-brush".to_string(),
            start_time: Utc::now(),
            finish_time: Utc::now(),
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
}
