//! Policy view: resolves the publish mode, changelog stance, and committer
//! identity for a `(codebase, campaign)` pair from an ordered list of declarative
//! rules, without any hidden state -- the result depends only on the rule list and
//! the codebase attributes passed in.

use crate::models::{address_only, Codebase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-branch-role publish mode. `Skip`/`BuildOnly` never produce a proposal or a
/// push; the others are handled by the Publisher's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Skip,
    BuildOnly,
    Push,
    PushDerived,
    Propose,
    AttemptPush,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Skip
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Mode::Skip),
            "build-only" => Ok(Mode::BuildOnly),
            "push" => Ok(Mode::Push),
            "push-derived" => Ok(Mode::PushDerived),
            "propose" => Ok(Mode::Propose),
            "attempt-push" => Ok(Mode::AttemptPush),
            other => Err(format!("unknown publish mode: {}", other)),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Skip => "skip",
            Mode::BuildOnly => "build-only",
            Mode::Push => "push",
            Mode::PushDerived => "push-derived",
            Mode::Propose => "propose",
            Mode::AttemptPush => "attempt-push",
        };
        write!(f, "{}", s)
    }
}

/// Changelog-update stance for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangelogStance {
    #[default]
    Auto,
    Update,
    Leave,
}

/// Optional match predicate for a policy rule block. Conjunctive across fields;
/// within a field, any listed alternative matching is enough. An empty list for a
/// field does not constrain on that field; a block with no non-empty lists at all
/// matches every codebase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Match {
    #[serde(default)]
    pub maintainer: Vec<String>,
    #[serde(default)]
    pub uploader: Vec<String>,
    #[serde(default)]
    pub source_package: Vec<String>,
}

impl Match {
    fn matches(&self, codebase: &Codebase) -> bool {
        if !self.maintainer.is_empty() {
            let maintainer = codebase.maintainer_address();
            if !self
                .maintainer
                .iter()
                .any(|m| Some(address_only(m)) == maintainer)
            {
                return false;
            }
        }
        if !self.uploader.is_empty() {
            let uploaders = codebase.uploader_addresses();
            if !self
                .uploader
                .iter()
                .any(|u| uploaders.contains(&address_only(u)))
            {
                return false;
            }
        }
        if !self.source_package.is_empty() && !self.source_package.iter().any(|n| n == &codebase.name) {
            return false;
        }
        true
    }
}

/// One rule block: an optional match predicate plus the fields it overrides when
/// it matches. `None` fields leave the running resolution unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub r#match: Vec<Match>,
    pub mode: Option<Mode>,
    pub changelog: Option<ChangelogStance>,
    pub committer: Option<String>,
}

/// A named publish policy: an ordered rule list plus a per-role mode vector for
/// campaigns that produce more than one result branch (e.g. a `debian/patches`
/// branch alongside `main`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedPolicy {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub per_role_mode: HashMap<String, Mode>,
}

/// The resolved outcome of applying a policy to a codebase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub mode: Mode,
    pub changelog: ChangelogStance,
    pub committer: Option<String>,
}

impl NamedPolicy {
    /// Resolve `(mode, changelog, committer)` for `codebase` by folding the rule
    /// list in order; later matching rules override earlier ones field by field.
    pub fn resolve(&self, codebase: &Codebase) -> ResolvedPolicy {
        let mut resolved = ResolvedPolicy {
            mode: Mode::Skip,
            changelog: ChangelogStance::Auto,
            committer: None,
        };
        for rule in &self.rules {
            if !rule.r#match.is_empty() && !rule.r#match.iter().any(|m| m.matches(codebase)) {
                continue;
            }
            if let Some(mode) = rule.mode {
                resolved.mode = mode;
            }
            if let Some(changelog) = rule.changelog {
                resolved.changelog = changelog;
            }
            if let Some(committer) = rule.committer.as_ref() {
                resolved.committer = Some(committer.clone());
            }
        }
        resolved
    }

    /// Mode for a specific branch role, falling back to the resolved default mode
    /// when no per-role override is declared.
    pub fn mode_for_role(&self, codebase: &Codebase, role: &str) -> Mode {
        self.per_role_mode
            .get(role)
            .copied()
            .unwrap_or_else(|| self.resolve(codebase).mode)
    }
}
