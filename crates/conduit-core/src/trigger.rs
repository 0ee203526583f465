//! Repository event descriptors delivered by the VCS collaborator.

use crate::workflow::EventKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An incoming repository event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RepoEvent {
    pub kind: EventKind,
    /// Fully-qualified ref, e.g. `refs/heads/main` or `refs/tags/v1.0.0`.
    pub git_ref: String,
    /// Target ref for pull requests.
    #[serde(default)]
    pub base_ref: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    /// Event action, e.g. `opened` or `published`.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub paths_changed: Vec<String>,
    /// Inputs of a manual dispatch.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

impl RepoEvent {
    pub fn new(kind: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: qualify_ref(git_ref.into()),
            base_ref: None,
            sha: None,
            actor: None,
            action: None,
            paths_changed: Vec::new(),
            inputs: BTreeMap::new(),
        }
    }

    pub fn push(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::Push, git_ref)
    }

    pub fn pull_request(head_ref: impl Into<String>, base_ref: impl Into<String>) -> Self {
        Self {
            base_ref: Some(qualify_ref(base_ref.into())),
            action: Some("opened".to_string()),
            ..Self::new(EventKind::PullRequest, head_ref)
        }
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths_changed = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    /// Branch name when the ref points at a branch.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    /// Tag name when the ref points at a tag.
    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/tags/")
    }

    /// Branch name of the pull request target.
    pub fn base_branch(&self) -> Option<&str> {
        self.base_ref
            .as_deref()
            .map(|r| r.strip_prefix("refs/heads/").unwrap_or(r))
    }

    /// Short name of the ref: the branch or tag without its prefix.
    pub fn ref_name(&self) -> &str {
        self.branch().or_else(|| self.tag()).unwrap_or(&self.git_ref)
    }

    /// Field lookup for `event.<name>` expressions.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "kind" | "event_name" | "name" => Some(self.kind.as_str().to_string()),
            "ref" => Some(self.git_ref.clone()),
            "ref_name" => Some(self.ref_name().to_string()),
            "base_ref" => self.base_ref.clone(),
            "sha" => self.sha.clone(),
            "actor" => self.actor.clone(),
            "action" => self.action.clone(),
            _ => None,
        }
    }
}

/// Short branch names are promoted to `refs/heads/<name>`.
fn qualify_ref(git_ref: String) -> String {
    if git_ref.starts_with("refs/") {
        git_ref
    } else {
        format!("refs/heads/{}", git_ref)
    }
}
