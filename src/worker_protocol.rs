//! The shape of a worker result message as consumed from the result stream
//! (§6). This is the Ingress-facing subset of the full worker metadata: the
//! engine only needs enough to persist a `Run` and decide whether to wake the
//! Publisher, not the worker's own internal bookkeeping.

use crate::models::ResultBranch;
use serde::{Deserialize, Serialize};

/// Build-target details reported alongside a result, e.g. which distribution a
/// Debian build targeted. Opaque beyond the few fields every target reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetDetails {
    pub name: String,
    #[serde(flatten)]
    pub details: serde_json::Value,
}

/// A worker's report of one completed queue item, as published on the
/// result stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub log_id: String,
    pub queue_id: i32,
    pub codebase: String,
    pub campaign: String,
    pub code: String,
    pub description: Option<String>,
    pub target: Option<TargetDetails>,
    pub main_branch_revision: Option<String>,
    pub revision: Option<String>,
    #[serde(default)]
    pub result_branches: Vec<ResultBranch>,
    pub failure_details: Option<serde_json::Value>,
    pub failure_transient: Option<bool>,
    pub instigated_context: Option<String>,
    pub context: Option<String>,
    pub change_set: Option<String>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub finish_time: chrono::DateTime<chrono::Utc>,
}

impl WorkerResult {
    /// Whether the worker reports unqualified success.
    pub fn is_success(&self) -> bool {
        self.code == "success"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkerResult {
        WorkerResult {
            log_id: "1".to_string(),
            queue_id: 42,
            codebase: "foo".to_string(),
            campaign: "lintian-fixes".to_string(),
            code: "success".to_string(),
            description: Some("ok".to_string()),
            target: None,
            main_branch_revision: Some("rev1".to_string()),
            revision: Some("rev2".to_string()),
            result_branches: vec![],
            failure_details: None,
            failure_transient: None,
            instigated_context: None,
            context: None,
            change_set: None,
            start_time: chrono::Utc::now(),
            finish_time: chrono::Utc::now(),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let result = sample();
        let encoded = serde_json::to_vec(&result).unwrap();
        let decoded: WorkerResult = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.log_id, result.log_id);
        assert!(decoded.is_success());
    }

    #[test]
    fn non_success_code_is_not_success() {
        let mut result = sample();
        result.code = "install-deps-unsatisfied-dependencies".to_string();
        assert!(!result.is_success());
    }
}
