//! The `publish-one` JSON subprocess wire contract: heavy VCS operations
//! (opening branches, pushing, talking to a forge) run in a dedicated
//! subprocess so a single wedged VCS call can't stall the whole publish loop.
//! Contract: request as JSON on stdin, exit 0 with a success JSON document on
//! stdout, exit 1 with a failure JSON document on stdout, any other exit code
//! (crash, panic, signal) is `publisher-invalid-response`.

use crate::error::{Error, Result};
use crate::policy::{ChangelogStance, Mode};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Everything `publish-one` needs to push or propose a single branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOneRequest {
    pub codebase: String,
    pub campaign: String,
    pub command: String,
    pub mode: Mode,
    pub role: String,
    pub main_branch_url: String,
    pub source_branch_name: Option<String>,
    pub resume_branch_name: Option<String>,
    pub maintainer_email: Option<String>,
    pub changelog: ChangelogStance,
    pub committer: Option<String>,
    pub run_id: String,
    pub external_url: Option<url::Url>,
    pub existing_proposal_url: Option<String>,
    pub dry_run: bool,
}

/// Successful outcome: either a push landed directly, or a proposal was
/// opened/updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOneResult {
    pub mode: Mode,
    pub branch_name: String,
    pub proposal_url: Option<String>,
    pub is_new: bool,
    pub base_revision: Option<String>,
    pub revision: Option<String>,
    pub description: String,
}

/// Failure outcome: a known, named failure (e.g. `branch-missing`), reported
/// with exit code 1 so the caller can distinguish it from a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOneFailure {
    pub code: String,
    pub description: String,
}

/// Invoke the `publish-one` binary for a single request and interpret its exit
/// code + stdout per the wire contract above.
pub async fn run_publish_one(binary_path: &str, request: &PublishOneRequest) -> Result<PublishOneResult> {
    let mut child = Command::new(binary_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let payload = serde_json::to_vec(request)?;
    {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("publish-one child has no stdin".to_string()))?;
        let mut stdin = stdin;
        stdin.write_all(&payload).await?;
    }

    let output = child.wait_with_output().await?;
    match output.status.code() {
        Some(0) => serde_json::from_slice::<PublishOneResult>(&output.stdout)
            .map_err(|e| Error::PublisherInvalidResponse(format!("malformed success response: {}", e))),
        Some(1) => {
            let failure: PublishOneFailure = serde_json::from_slice(&output.stdout).map_err(|e| {
                Error::PublisherInvalidResponse(format!("malformed failure response: {}", e))
            })?;
            Err(Error::PublisherInvalidResponse(format!(
                "{}: {}",
                failure.code, failure.description
            )))
        }
        other => Err(Error::PublisherInvalidResponse(format!(
            "publish-one exited with unexpected status {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_response_round_trips() {
        let result = PublishOneResult {
            mode: Mode::Propose,
            branch_name: "fleetbot/lintian-fixes".to_string(),
            proposal_url: Some("https://forge.example.org/mp/1".to_string()),
            is_new: true,
            base_revision: Some("rev1".to_string()),
            revision: Some("rev2".to_string()),
            description: "Successfully proposed".to_string(),
        };
        let encoded = serde_json::to_vec(&result).unwrap();
        let decoded: PublishOneResult = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.proposal_url, result.proposal_url);
        assert_eq!(decoded.mode, Mode::Propose);
    }

    #[test]
    fn failure_response_round_trips() {
        let failure = PublishOneFailure {
            code: "branch-missing".to_string(),
            description: "source branch not found".to_string(),
        };
        let encoded = serde_json::to_vec(&failure).unwrap();
        let decoded: PublishOneFailure = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.code, "branch-missing");
    }
}
