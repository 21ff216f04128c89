//! Named worker-process lifecycle management.
//!
//! Processes are keyed by the supervisor name (the first 16 hex chars of a
//! branch hash). The registry lives behind one async mutex; every public
//! call is bounded by a timeout, and every failure is an error value —
//! nothing in this crate panics across its API, so a broken child or a
//! wedged spawn can never take the controller down with it.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor call timed out after {CALL_TIMEOUT:?}")]
    Timeout,
    #[error("no supervised process named {0:?}")]
    NotFound(String),
    #[error("failed to spawn {name:?}: {message}")]
    Spawn { name: String, message: String },
    #[error("io failure on {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything needed to (re)start a worker.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub interpreter: String,
    pub entrypoint: PathBuf,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Online,
    Stopped,
    Errored,
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
}

struct Managed {
    spec: ProcessSpec,
    child: Child,
    pid: Option<u32>,
}

impl Managed {
    /// try_wait keeps the status honest without blocking: a child that
    /// exited since the last look is reported as stopped or errored.
    fn status(&mut self) -> ProcessStatus {
        match self.child.try_wait() {
            Ok(None) => ProcessStatus::Online,
            Ok(Some(exit)) if exit.success() => ProcessStatus::Stopped,
            Ok(Some(_)) => ProcessStatus::Errored,
            Err(_) => ProcessStatus::Errored,
        }
    }

    fn info(&mut self) -> ProcessInfo {
        let status = self.status();
        ProcessInfo {
            name: self.spec.name.clone(),
            status,
            pid: if status == ProcessStatus::Online {
                self.pid
            } else {
                None
            },
        }
    }
}

#[derive(Clone)]
pub struct Supervisor {
    processes: Arc<Mutex<HashMap<String, Managed>>>,
    log_dir: PathBuf,
}

impl Supervisor {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            log_dir,
        }
    }

    /// Where a process's combined stdout/stderr stream lands. Best-effort:
    /// ephemeral hosts lose these, and nothing downstream depends on them.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.log"))
    }

    pub async fn start(&self, spec: ProcessSpec) -> Result<ProcessInfo, SupervisorError> {
        self.call(self.start_inner(spec)).await
    }

    pub async fn reload(
        &self,
        name: &str,
        update_env: Option<HashMap<String, String>>,
    ) -> Result<ProcessInfo, SupervisorError> {
        self.call(self.reload_inner(name, update_env)).await
    }

    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.call(self.stop_inner(name)).await
    }

    /// Stops the process if running and forgets it. Deleting an unknown
    /// name succeeds: the caller wants it gone, and it is.
    pub async fn delete(&self, name: &str) -> Result<(), SupervisorError> {
        self.call(self.delete_inner(name)).await
    }

    pub async fn describe(&self, name: &str) -> Result<Option<ProcessInfo>, SupervisorError> {
        self.call(async {
            let mut processes = self.processes.lock().await;
            Ok(processes.get_mut(name).map(Managed::info))
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
        self.call(async {
            let mut processes = self.processes.lock().await;
            Ok(processes.values_mut().map(Managed::info).collect())
        })
        .await
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, SupervisorError>>,
    ) -> Result<T, SupervisorError> {
        tokio::time::timeout(CALL_TIMEOUT, fut)
            .await
            .map_err(|_| SupervisorError::Timeout)?
    }

    async fn start_inner(&self, spec: ProcessSpec) -> Result<ProcessInfo, SupervisorError> {
        let mut processes = self.processes.lock().await;
        // replace-on-start: a stale entry under this name is killed first
        if let Some(mut old) = processes.remove(&spec.name) {
            let _ = old.child.start_kill();
        }

        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|source| SupervisorError::Io {
                name: spec.name.clone(),
                source,
            })?;
        let log_path = self.log_path(&spec.name);
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| SupervisorError::Io {
                name: spec.name.clone(),
                source,
            })?;
        let log_file_err = log_file
            .try_clone()
            .map_err(|source| SupervisorError::Io {
                name: spec.name.clone(),
                source,
            })?;

        let child = Command::new(&spec.interpreter)
            .arg(&spec.entrypoint)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .spawn()
            .map_err(|err| SupervisorError::Spawn {
                name: spec.name.clone(),
                message: err.to_string(),
            })?;

        let pid = child.id();
        info!(name = %spec.name, pid, "worker started");

        let mut managed = Managed { spec, child, pid };
        let info = managed.info();
        processes.insert(managed.spec.name.clone(), managed);
        Ok(info)
    }

    async fn reload_inner(
        &self,
        name: &str,
        update_env: Option<HashMap<String, String>>,
    ) -> Result<ProcessInfo, SupervisorError> {
        let spec = {
            let mut processes = self.processes.lock().await;
            let managed = processes
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            let _ = managed.child.start_kill();
            let mut spec = managed.spec.clone();
            if let Some(env) = update_env {
                spec.env = env;
            }
            spec
        };
        self.start_inner(spec).await
    }

    async fn stop_inner(&self, name: &str) -> Result<(), SupervisorError> {
        let mut processes = self.processes.lock().await;
        let managed = processes
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        if let Err(err) = managed.child.start_kill() {
            // already exited counts as stopped
            warn!(name, %err, "kill on stop failed");
        }
        Ok(())
    }

    async fn delete_inner(&self, name: &str) -> Result<(), SupervisorError> {
        let mut processes = self.processes.lock().await;
        if let Some(mut managed) = processes.remove(name) {
            let _ = managed.child.start_kill();
            info!(name, "worker deleted");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Supervisor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "branchforge-sup-test-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sleeper_spec(name: &str, cwd: PathBuf) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            interpreter: "sleep".to_string(),
            entrypoint: PathBuf::from("30"),
            cwd,
            env: HashMap::new(),
        }
    }

    async fn wait_for_status(
        supervisor: &Supervisor,
        name: &str,
        wanted: ProcessStatus,
    ) -> ProcessInfo {
        for _ in 0..50 {
            if let Some(info) = supervisor.describe(name).await.unwrap() {
                if info.status == wanted {
                    return info;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("process {name} never reached {wanted:?}");
    }

    #[tokio::test]
    async fn start_describe_delete_lifecycle() {
        let dir = scratch_dir("lifecycle");
        let supervisor = Supervisor::new(dir.join("logs"));

        let info = supervisor
            .start(sleeper_spec("aaaa000011112222", dir.clone()))
            .await
            .unwrap();
        assert_eq!(info.status, ProcessStatus::Online);
        assert!(info.pid.is_some());

        let described = supervisor
            .describe("aaaa000011112222")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(described.status, ProcessStatus::Online);

        supervisor.delete("aaaa000011112222").await.unwrap();
        assert!(supervisor.describe("aaaa000011112222").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent_for_unknown_names() {
        let supervisor = Supervisor::new(scratch_dir("del").join("logs"));
        supervisor.delete("no-such-process").await.unwrap();
    }

    #[tokio::test]
    async fn exited_child_reports_stopped() {
        let dir = scratch_dir("exit");
        let supervisor = Supervisor::new(dir.join("logs"));
        let spec = ProcessSpec {
            name: "bbbb000011112222".to_string(),
            interpreter: "true".to_string(),
            entrypoint: PathBuf::from("ignored"),
            cwd: dir,
            env: HashMap::new(),
        };
        supervisor.start(spec).await.unwrap();
        let info = wait_for_status(&supervisor, "bbbb000011112222", ProcessStatus::Stopped).await;
        assert_eq!(info.pid, None);
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_value() {
        let dir = scratch_dir("spawnfail");
        let supervisor = Supervisor::new(dir.join("logs"));
        let spec = ProcessSpec {
            name: "cccc000011112222".to_string(),
            interpreter: "definitely-not-a-real-binary".to_string(),
            entrypoint: PathBuf::from("x"),
            cwd: dir,
            env: HashMap::new(),
        };
        let err = supervisor.start(spec).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(supervisor.describe("cccc000011112222").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_replaces_existing_process_without_leaking() {
        let dir = scratch_dir("replace");
        let supervisor = Supervisor::new(dir.join("logs"));
        let first = supervisor
            .start(sleeper_spec("dddd000011112222", dir.clone()))
            .await
            .unwrap();
        let second = supervisor
            .start(sleeper_spec("dddd000011112222", dir.clone()))
            .await
            .unwrap();
        assert_ne!(first.pid, second.pid);

        let all = supervisor.list().await.unwrap();
        assert_eq!(
            all.iter().filter(|p| p.name == "dddd000011112222").count(),
            1
        );
        supervisor.delete("dddd000011112222").await.unwrap();
    }

    #[tokio::test]
    async fn reload_applies_new_env_and_keeps_name() {
        let dir = scratch_dir("reload");
        let supervisor = Supervisor::new(dir.join("logs"));
        supervisor
            .start(sleeper_spec("eeee000011112222", dir.clone()))
            .await
            .unwrap();

        let mut env = HashMap::new();
        env.insert("NEW_KEY".to_string(), "value".to_string());
        let info = supervisor
            .reload("eeee000011112222", Some(env.clone()))
            .await
            .unwrap();
        assert_eq!(info.name, "eeee000011112222");
        assert_eq!(info.status, ProcessStatus::Online);

        let stored_env = {
            let mut processes = supervisor.processes.lock().await;
            processes.get_mut("eeee000011112222").unwrap().spec.env.clone()
        };
        assert_eq!(stored_env, env);
        supervisor.delete("eeee000011112222").await.unwrap();
    }

    #[tokio::test]
    async fn reload_of_unknown_name_is_not_found() {
        let supervisor = Supervisor::new(scratch_dir("reload404").join("logs"));
        assert!(matches!(
            supervisor.reload("missing", None).await,
            Err(SupervisorError::NotFound(_))
        ));
    }
}
