//! VCS push events and commit metadata.

use crate::parameter::ParameterBag;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static SKIP_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*\[ci skip\].*|.*\[cd skip\].*").expect("skip marker pattern is valid")
});

/// Whether a commit message asks for no build. Case-sensitive.
pub fn is_skip_commit(message: &str) -> bool {
    SKIP_MARKER.is_match(message)
}

/// A push received from a VCS server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VcsPush {
    /// `owner/repo`.
    pub repository: String,
    pub branch: String,
    pub hash: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
}

/// Commit metadata recorded on a build.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct VcsInfo {
    pub branch: String,
    pub hash: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub message: String,
    /// Full name of the repository when it differs from the application's
    /// own (a fork).
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
}

impl VcsInfo {
    pub fn new(branch: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            hash: hash.into(),
            ..Default::default()
        }
    }

    /// Metadata for a push on an application linked to `application_repository`.
    pub fn from_push(push: &VcsPush, application_repository: Option<&str>) -> Self {
        let remote = match application_repository {
            Some(own) if own == push.repository => None,
            _ => Some(push.repository.clone()),
        };
        Self {
            branch: push.branch.clone(),
            hash: push.hash.clone(),
            author: push.author.clone(),
            message: push.message.clone(),
            remote,
            repository: Some(push.repository.clone()),
        }
    }

    /// The remote, with the empty string treated as absent.
    pub fn normalized_remote(&self) -> Option<&str> {
        self.remote.as_deref().filter(|r| !r.is_empty())
    }

    pub fn is_skip_commit(&self) -> bool {
        is_skip_commit(&self.message)
    }

    /// Publish the metadata as `git.*` parameters.
    pub fn apply_to(&self, bag: &mut ParameterBag) {
        let branch = if self.branch.is_empty() {
            "master"
        } else {
            self.branch.as_str()
        };
        bag.set("git.branch", branch);
        bag.set("git.hash", &self.hash);
        bag.set("git.author", &self.author);
        bag.set("git.message", &self.message);
        if let Some(repo) = &self.repository {
            bag.set("git.repository", repo);
        }
    }
}
