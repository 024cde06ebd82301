//! Repository events and the trigger predicates matched against them

use glob_match::glob_match;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of repository event, as seen by triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PushBranch,
    PushTag,
    PullRequest,
}

/// A pushed git reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum GitRef {
    Branch(String),
    Tag(String),
}

impl GitRef {
    /// Parse `refs/heads/<b>`, `refs/tags/<t>` or a bare branch name
    pub fn parse(raw: &str) -> Self {
        if let Some(tag) = raw.strip_prefix("refs/tags/") {
            GitRef::Tag(tag.to_string())
        } else if let Some(branch) = raw.strip_prefix("refs/heads/") {
            GitRef::Branch(branch.to_string())
        } else {
            GitRef::Branch(raw.to_string())
        }
    }

    /// Short name (branch or tag)
    pub fn name(&self) -> &str {
        match self {
            GitRef::Branch(name) | GitRef::Tag(name) => name,
        }
    }
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitRef::Branch(name) => write!(f, "refs/heads/{}", name),
            GitRef::Tag(name) => write!(f, "refs/tags/{}", name),
        }
    }
}

/// External stimulus that may create runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RepositoryEvent {
    /// A branch or tag was pushed
    Push { git_ref: GitRef },

    /// A pull request was opened or updated
    PullRequest {
        number: u64,
        /// Branch the pull request targets
        base: String,
        /// Branch the pull request comes from
        head: String,
    },
}

impl RepositoryEvent {
    pub fn push(raw_ref: &str) -> Self {
        RepositoryEvent::Push {
            git_ref: GitRef::parse(raw_ref),
        }
    }

    pub fn pull_request(number: u64, base: &str, head: &str) -> Self {
        RepositoryEvent::PullRequest {
            number,
            base: GitRef::parse(base).name().to_string(),
            head: GitRef::parse(head).name().to_string(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            RepositoryEvent::Push {
                git_ref: GitRef::Branch(_),
            } => EventKind::PushBranch,
            RepositoryEvent::Push {
                git_ref: GitRef::Tag(_),
            } => EventKind::PushTag,
            RepositoryEvent::PullRequest { .. } => EventKind::PullRequest,
        }
    }

    /// Name the trigger patterns are matched against
    ///
    /// Pull requests match on their base branch.
    pub fn match_ref(&self) -> &str {
        match self {
            RepositoryEvent::Push { git_ref } => git_ref.name(),
            RepositoryEvent::PullRequest { base, .. } => base,
        }
    }

    /// Fully qualified ref of the event
    pub fn git_ref(&self) -> String {
        match self {
            RepositoryEvent::Push { git_ref } => git_ref.to_string(),
            RepositoryEvent::PullRequest { number, .. } => format!("refs/pull/{}/merge", number),
        }
    }

    /// Source branch of a pull request; absent for pushes
    pub fn head_ref(&self) -> Option<&str> {
        match self {
            RepositoryEvent::Push { .. } => None,
            RepositoryEvent::PullRequest { head, .. } => Some(head),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            RepositoryEvent::Push { .. } => "push",
            RepositoryEvent::PullRequest { .. } => "pull_request",
        }
    }
}

impl fmt::Display for RepositoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryEvent::Push { git_ref } => write!(f, "push {}", git_ref),
            RepositoryEvent::PullRequest { number, base, head } => {
                write!(f, "pull_request #{} ({} -> {})", number, head, base)
            }
        }
    }
}

/// Glob pattern over branch or tag names
///
/// A pattern without wildcards is an exact match; `release/*` style patterns
/// give prefix matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefPattern(String);

impl RefPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, name: &str) -> bool {
        glob_match(&self.0, name)
    }
}

/// An (event kind, ref patterns) predicate
///
/// An empty pattern list matches every ref of that kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: EventKind,
    pub patterns: Vec<RefPattern>,
}

impl Trigger {
    pub fn new(kind: EventKind, patterns: &[String]) -> Self {
        Self {
            kind,
            patterns: patterns.iter().map(RefPattern::new).collect(),
        }
    }

    pub fn matches(&self, event: &RepositoryEvent) -> bool {
        if self.kind != event.kind() {
            return false;
        }
        let name = event.match_ref();
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(name))
    }
}
