//! Branch-keyed git working directories.
//!
//! Every tracked branch owns `{root}/{hex(branch_hash)}/`, a git working
//! tree kept in sync with its remote. The tree is never authoritative:
//! `sync` hard-resets local changes before pulling. Callers serialize
//! operations per branch; operations on distinct branches are independent.

use std::path::PathBuf;
use std::process::Stdio;

use branchforge_common::{BranchHash, WorkerRuntime};
use tokio::process::Command;
use tracing::{debug, info};

/// The pipeline step that failed, carried in [`WorkspaceError`] so status
/// rows and logs can say where materialization stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Clone,
    Reset,
    Fetch,
    Checkout,
    Pull,
    Install,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Clone => "clone",
            Step::Reset => "reset",
            Step::Fetch => "fetch",
            Step::Checkout => "checkout",
            Step::Pull => "pull",
            Step::Install => "install",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("{step} failed: {message}")]
    Command { step: Step, message: String },
    #[error("could not run {step}: {source}")]
    Io {
        step: Step,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub fn step(&self) -> Step {
        match self {
            WorkspaceError::Command { step, .. } | WorkspaceError::Io { step, .. } => *step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workspaces {
    root: PathBuf,
    runtime: WorkerRuntime,
}

impl Workspaces {
    pub fn new(root: PathBuf, runtime: WorkerRuntime) -> Self {
        Self { root, runtime }
    }

    /// `{root}/{hex(branch_hash)}`
    pub fn dir(&self, branch_hash: &BranchHash) -> PathBuf {
        self.root.join(branch_hash.to_hex())
    }

    pub fn entrypoint_path(&self, branch_hash: &BranchHash) -> PathBuf {
        self.dir(branch_hash).join(&self.runtime.entrypoint)
    }

    pub fn has_entrypoint(&self, branch_hash: &BranchHash) -> bool {
        self.entrypoint_path(branch_hash).is_file()
    }

    pub fn exists(&self, branch_hash: &BranchHash) -> bool {
        self.dir(branch_hash).join(".git").is_dir()
    }

    /// Clones the branch if its tree is absent, otherwise syncs it. Either
    /// way the tree ends on the remote tip with dependencies installed.
    pub async fn materialize(
        &self,
        branch_hash: &BranchHash,
        repo_url: &str,
        branch_name: &str,
    ) -> Result<(), WorkspaceError> {
        if self.exists(branch_hash) {
            self.sync(branch_hash, branch_name).await
        } else {
            self.ensure_clone(branch_hash, repo_url, branch_name).await
        }
    }

    pub async fn ensure_clone(
        &self,
        branch_hash: &BranchHash,
        repo_url: &str,
        branch_name: &str,
    ) -> Result<(), WorkspaceError> {
        let target = self.dir(branch_hash);
        if target.join(".git").is_dir() {
            return self.install(branch_hash).await;
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::Io {
                step: Step::Clone,
                source,
            })?;

        info!(branch = %branch_hash, repo = repo_url, "cloning working tree");
        run(
            Step::Clone,
            Command::new("git")
                .arg("clone")
                .arg(repo_url)
                .arg(&target)
                .arg("--branch")
                .arg(branch_name),
        )
        .await?;
        self.install(branch_hash).await
    }

    /// Forces the tree onto the remote tip. Ordering is load-bearing:
    /// reset → fetch → checkout → pull → install.
    pub async fn sync(
        &self,
        branch_hash: &BranchHash,
        branch_name: &str,
    ) -> Result<(), WorkspaceError> {
        let dir = self.dir(branch_hash);
        info!(branch = %branch_hash, "syncing working tree");

        run(
            Step::Reset,
            Command::new("git")
                .arg("reset")
                .arg("--hard")
                .current_dir(&dir),
        )
        .await?;
        run(
            Step::Fetch,
            Command::new("git")
                .arg("fetch")
                .arg("origin")
                .current_dir(&dir),
        )
        .await?;
        run(
            Step::Checkout,
            Command::new("git")
                .arg("checkout")
                .arg(branch_name)
                .current_dir(&dir),
        )
        .await?;
        run(
            Step::Pull,
            Command::new("git")
                .arg("pull")
                .arg("--ff-only")
                .arg("origin")
                .arg(branch_name)
                .current_dir(&dir),
        )
        .await?;
        self.install(branch_hash).await
    }

    /// Runs the dependency installer when the runtime's manifest is present.
    async fn install(&self, branch_hash: &BranchHash) -> Result<(), WorkspaceError> {
        let dir = self.dir(branch_hash);
        if !dir.join(&self.runtime.manifest).is_file() {
            debug!(branch = %branch_hash, manifest = %self.runtime.manifest, "no manifest, skipping install");
            return Ok(());
        }
        let (program, args) = self
            .runtime
            .installer
            .split_first()
            .ok_or_else(|| WorkspaceError::Command {
                step: Step::Install,
                message: "installer command is empty".to_string(),
            })?;
        run(
            Step::Install,
            Command::new(program).args(args).current_dir(&dir),
        )
        .await
    }
}

async fn run(step: Step, command: &mut Command) -> Result<(), WorkspaceError> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| WorkspaceError::Io { step, source })?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    // stderr tails are enough to diagnose; full output stays out of the
    // error so status rows keep a readable message.
    let tail: String = stderr
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ");
    Err(WorkspaceError::Command {
        step,
        message: format!("exit {:?}: {tail}", output.status.code()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_workspaces(runtime: WorkerRuntime) -> (Workspaces, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "branchforge-ws-test-{}-{}",
            std::process::id(),
            rand_suffix()
        ));
        (Workspaces::new(root.clone(), runtime), root)
    }

    fn rand_suffix() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }

    #[test]
    fn directory_is_full_branch_hash_hex() {
        let (ws, root) = scratch_workspaces(WorkerRuntime::default());
        let hash = BranchHash::derive("r", "main");
        assert_eq!(ws.dir(&hash), root.join(hash.to_hex()));
    }

    #[test]
    fn step_labels() {
        assert_eq!(Step::Clone.as_str(), "clone");
        assert_eq!(Step::Install.as_str(), "install");
        let err = WorkspaceError::Command {
            step: Step::Fetch,
            message: "boom".to_string(),
        };
        assert_eq!(err.step(), Step::Fetch);
        assert!(err.to_string().contains("fetch"));
    }

    #[tokio::test]
    async fn entrypoint_detection() {
        let (ws, root) = scratch_workspaces(WorkerRuntime::default());
        let hash = BranchHash::derive("r", "main");
        assert!(!ws.has_entrypoint(&hash));

        tokio::fs::create_dir_all(ws.dir(&hash)).await.unwrap();
        tokio::fs::write(ws.dir(&hash).join("agent.js"), "// worker")
            .await
            .unwrap();
        assert!(ws.has_entrypoint(&hash));

        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn install_skips_without_manifest() {
        let mut runtime = WorkerRuntime::default();
        // a command that must not run; absence of the manifest short-circuits
        runtime.installer = vec!["definitely-not-a-real-binary".to_string()];
        let (ws, root) = scratch_workspaces(runtime);
        let hash = BranchHash::derive("r", "main");
        tokio::fs::create_dir_all(ws.dir(&hash)).await.unwrap();

        ws.install(&hash).await.unwrap();

        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn install_failure_carries_the_step() {
        let mut runtime = WorkerRuntime::default();
        runtime.installer = vec!["definitely-not-a-real-binary".to_string()];
        let (ws, root) = scratch_workspaces(runtime);
        let hash = BranchHash::derive("r", "main");
        tokio::fs::create_dir_all(ws.dir(&hash)).await.unwrap();
        tokio::fs::write(ws.dir(&hash).join("package.json"), "{}")
            .await
            .unwrap();

        let err = ws.install(&hash).await.unwrap_err();
        assert_eq!(err.step(), Step::Install);

        tokio::fs::remove_dir_all(root).await.unwrap();
    }
}
