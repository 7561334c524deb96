//! Abstract forge ("hoster") capability. The engine never assumes a concrete
//! forge protocol (GitHub/GitLab/Launchpad-equivalent); it only depends on this
//! trait, so a new forge backend is a new `Hoster` impl with no changes to the
//! Publisher.

use crate::models::ProposalStatus;
use async_trait::async_trait;
use url::Url;

/// A single merge/pull request as observed from a forge.
#[async_trait]
pub trait Proposal: Send + Sync {
    fn url(&self) -> &Url;
    fn source_branch_url(&self) -> &Url;
    fn target_branch_url(&self) -> &Url;
    fn status(&self) -> ProposalStatus;

    /// Whether the forge reports this proposal as cleanly mergeable. `None` means
    /// the forge hasn't finished computing mergeability yet.
    async fn can_be_merged(&self) -> Option<bool>;

    /// Close the proposal without merging, e.g. because a later run found nothing
    /// new to publish.
    async fn close(&self, comment: &str) -> Result<(), HosterError>;
}

/// Errors a hoster implementation can surface. Distinguishes transient forge
/// trouble (retry later) from hard failures (credentials, permissions).
#[derive(Debug)]
pub enum HosterError {
    TooManyRequests,
    Unauthorized,
    BadGateway,
    NotFound(String),
    Other(String),
}

impl std::fmt::Display for HosterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooManyRequests => write!(f, "too-many-requests"),
            Self::Unauthorized => write!(f, "401-unauthorized"),
            Self::BadGateway => write!(f, "502-bad-gateway"),
            Self::NotFound(s) => write!(f, "not found: {}", s),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

impl HosterError {
    /// The stable result-code string this maps to in the failure taxonomy (§7).
    pub fn code(&self) -> &'static str {
        match self {
            Self::TooManyRequests => "too-many-requests",
            Self::Unauthorized => "401-unauthorized",
            Self::BadGateway => "502-bad-gateway",
            Self::NotFound(_) => "branch-missing",
            Self::Other(_) => "internal-error",
        }
    }

    /// Transient forge errors are worth retrying on the next sweep.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TooManyRequests | Self::BadGateway)
    }
}

/// Abstract forge capability: list proposals this engine owns, and open a new one.
#[async_trait]
pub trait Hoster: Send + Sync {
    /// List open (or, if `status` is given, proposals in that specific state)
    /// merge proposals owned by this engine's bot account.
    async fn iter_my_proposals(
        &self,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<Box<dyn Proposal>>, HosterError>;

    /// The hostname this hoster talks to, used for per-host back-off bookkeeping
    /// and the sensitive-namespace downgrade check.
    fn host(&self) -> &str;
}

/// Whether `target_branch_url` falls under one of the configured sensitive
/// namespaces, in which case `attempt-push` must be downgraded to `propose`.
pub fn is_sensitive_namespace(target_branch_url: &str, sensitive_substrings: &[String]) -> bool {
    sensitive_substrings
        .iter()
        .any(|needle| target_branch_url.contains(needle.as_str()))
}
