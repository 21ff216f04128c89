use branchforge_common::BranchHash;
use serde::Deserialize;

use crate::error::ControllerError;

/// Header carrying the provider's event name on generic webhook deliveries.
pub const EVENT_HEADER: &str = "x-github-event";

#[derive(Debug, Deserialize)]
pub struct PushPayload {
    pub repository: Option<PayloadRepository>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PayloadRepository {
    pub clone_url: Option<String>,
}

/// A validated push: the two fields the controller consumes, plus the
/// derived branch identity.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub repo_url: String,
    pub branch_name: String,
    pub branch_hash: BranchHash,
}

impl PushEvent {
    pub fn new(repo_url: String, branch_name: String) -> Result<Self, ControllerError> {
        if repo_url.is_empty() {
            return Err(ControllerError::Validation("repo_url is empty".to_string()));
        }
        if branch_name.is_empty() {
            return Err(ControllerError::Validation(
                "branch_name is empty".to_string(),
            ));
        }
        let branch_hash = BranchHash::derive(&repo_url, &branch_name);
        Ok(PushEvent {
            repo_url,
            branch_name,
            branch_hash,
        })
    }

    pub fn from_payload(payload: &PushPayload) -> Result<Self, ControllerError> {
        let repo_url = payload
            .repository
            .as_ref()
            .and_then(|repo| repo.clone_url.clone())
            .ok_or_else(|| {
                ControllerError::Validation("payload has no repository.clone_url".to_string())
            })?;
        let git_ref = payload
            .git_ref
            .as_deref()
            .ok_or_else(|| ControllerError::Validation("payload has no ref".to_string()))?;
        Self::new(repo_url, branch_from_ref(git_ref).to_string())
    }
}

/// The branch is the last `/`-separated segment of the ref. Provider refs
/// look like `refs/heads/main`; a branch named `feature/x` therefore
/// collapses to `x` — identity follows the final segment.
pub fn branch_from_ref(git_ref: &str) -> &str {
    git_ref.rsplit('/').next().unwrap_or(git_ref)
}
