use std::collections::HashMap;
use std::sync::Arc;

use branchforge_common::BranchHash;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Sharded per-branch critical sections.
///
/// At most one push handler (or start/reload) runs per branch; distinct
/// branches proceed fully in parallel. The outer map lock is held only long
/// enough to fetch or insert the branch's own mutex.
#[derive(Clone, Default)]
pub struct BranchLocks {
    inner: Arc<Mutex<HashMap<BranchHash, Arc<Mutex<()>>>>>,
}

impl BranchLocks {
    pub async fn acquire(&self, branch_hash: BranchHash) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(branch_hash).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_branch_serializes() {
        let locks = BranchLocks::default();
        let hash = BranchHash::derive("r", "main");

        let guard = locks.acquire(hash).await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.acquire(hash)).await;
        assert!(second.is_err(), "second acquire should block");

        drop(guard);
        tokio::time::timeout(Duration::from_millis(50), locks.acquire(hash))
            .await
            .expect("released lock is acquirable");
    }

    #[tokio::test]
    async fn distinct_branches_run_in_parallel() {
        let locks = BranchLocks::default();
        let _main = locks.acquire(BranchHash::derive("r", "main")).await;
        tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire(BranchHash::derive("r", "dev")),
        )
        .await
        .expect("other branch must not block");
    }
}
