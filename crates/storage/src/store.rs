use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use branchforge_common::{Address, Agent, AgentStatus, BranchHash, Metric, MetricStats, OAuthGrant};
use libsql::{
    Builder, Connection, Row, Rows, Value,
    params::{IntoParams, Params},
};
use tokio::sync::Mutex;

use crate::StoreError;

/// Durable local persistence for agents, secrets, metrics and OAuth grants.
///
/// - `read_conn`: used for read only statements
/// - `write_conn`: used for writing, protected by a Mutex to enforce a
///   maximum of 1 writer. Writes through the read connection produce
///   `SQLite failure: database is locked` under concurrency.
#[derive(Clone)]
pub struct Store {
    read_conn: Connection,
    write_conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Store")
    }
}

// Change version if DB_SCHEMA changes
const MIGRATION_VERSION: u64 = 1;
const DB_SCHEMA: [&str; 7] = [
    "CREATE TABLE agents (id INTEGER PRIMARY KEY AUTOINCREMENT, branch_hash BLOB NOT NULL UNIQUE, repo_url TEXT NOT NULL, branch_name TEXT NOT NULL, contract_address BLOB, status TEXT NOT NULL, worker_pid INT, created_at INT NOT NULL)",
    "CREATE TABLE secrets (agent_id INT NOT NULL, branch_hash BLOB NOT NULL, key TEXT NOT NULL, ciphertext BLOB NOT NULL, PRIMARY KEY (agent_id, key))",
    "CREATE INDEX secrets_by_branch ON secrets (branch_hash)",
    "CREATE TABLE metrics (agent_id INT NOT NULL, timestamp INT NOT NULL, decision TEXT NOT NULL, price REAL, trade_executed INT NOT NULL DEFAULT 0, trade_tx_hash TEXT, trade_amount REAL)",
    "CREATE INDEX metrics_by_agent_ts ON metrics (agent_id, timestamp)",
    "CREATE TABLE oauth_grants (user_id TEXT NOT NULL, repo_url TEXT NOT NULL, access_token BLOB NOT NULL, webhook_configured INT NOT NULL DEFAULT 0, PRIMARY KEY (user_id, repo_url))",
    "CREATE TABLE migrations (version INT PRIMARY KEY)",
];

/// A secret row as stored: the owning agent id is carried so callers can
/// detect rows left behind by a prior database generation.
#[derive(Debug, Clone)]
pub struct SecretRow {
    pub agent_id: i64,
    pub key: String,
    pub ciphertext: Vec<u8>,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Store {
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let db = Builder::new_local(path).build().await?;
        let write_conn = db.connect()?;
        // From libsql documentation:
        // Newly created connections currently have a default busy timeout of
        // 5000ms, but this may be subject to change.
        write_conn.busy_timeout(Duration::from_millis(5000))?;
        let store = Store {
            read_conn: db.connect()?,
            write_conn: Arc::new(Mutex::new(write_conn)),
        };

        store.init_db().await?;

        let current_version = store.get_version().await?;
        if current_version != MIGRATION_VERSION {
            return Err(StoreError::VersionMismatch {
                current: current_version,
                expected: MIGRATION_VERSION,
            });
        }
        Ok(store)
    }

    async fn execute<T: IntoParams>(&self, sql: &str, params: T) -> Result<(), StoreError> {
        let conn = self.write_conn.lock().await;
        conn.execute(sql, params).await?;
        Ok(())
    }

    async fn query<T: IntoParams>(&self, sql: &str, params: T) -> Result<Rows, StoreError> {
        Ok(self.read_conn.query(sql, params).await?)
    }

    async fn init_db(&self) -> Result<(), StoreError> {
        // WAL: readers do not block the writer and the writer does not block
        // readers. https://sqlite.org/wal.html#concurrency
        self.query("PRAGMA journal_mode=WAL;", ()).await?;
        let mut rows = self
            .query(
                "SELECT name FROM sqlite_schema WHERE type='table' AND name='agents'",
                (),
            )
            .await?;
        if rows.next().await?.is_none() {
            let empty_param = ().into_params()?;
            let mut queries: Vec<(&str, Params)> = DB_SCHEMA
                .iter()
                .map(|v| (*v, empty_param.clone()))
                .collect();
            queries.push((
                "INSERT INTO migrations VALUES (?1)",
                vec![Value::Integer(MIGRATION_VERSION as i64)].into_params()?,
            ));
            self.execute_in_tx(queries).await?;
        }
        Ok(())
    }

    /// Executes a set of queries inside one SQL transaction.
    async fn execute_in_tx(&self, queries: Vec<(&str, Params)>) -> Result<(), StoreError> {
        let conn = self.write_conn.lock().await;
        let tx = conn.transaction().await?;
        for (query, params) in queries {
            tx.execute(query, params).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_version(&self) -> Result<u64, StoreError> {
        let mut rows = self
            .query("SELECT MAX(version) FROM migrations", ())
            .await?;
        rows.next()
            .await?
            .map(|row| read_from_row_int(&row, 0))
            .ok_or(StoreError::Custom("migration version not found".to_string()))?
    }

    // ------------------------------------------------------------------
    // agents
    // ------------------------------------------------------------------

    /// Creates or refreshes the agent row keyed by `branch_hash` and returns
    /// its id. On conflict the existing row is updated in place so the id is
    /// stable; an absent `contract_address` never clears a stored one.
    pub async fn upsert_agent(
        &self,
        branch_hash: &BranchHash,
        repo_url: &str,
        branch_name: &str,
        contract_address: Option<Address>,
        status: AgentStatus,
    ) -> Result<i64, StoreError> {
        let address_value = match contract_address {
            Some(address) => Value::Blob(address.as_bytes().to_vec()),
            None => Value::Null,
        };
        self.execute(
            "INSERT INTO agents (branch_hash, repo_url, branch_name, contract_address, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(branch_hash) DO UPDATE SET \
               repo_url = excluded.repo_url, \
               branch_name = excluded.branch_name, \
               contract_address = COALESCE(excluded.contract_address, agents.contract_address), \
               status = excluded.status",
            vec![
                Value::Blob(branch_hash.to_fixed_bytes().to_vec()),
                Value::Text(repo_url.to_string()),
                Value::Text(branch_name.to_string()),
                address_value,
                Value::Text(status.as_str().to_string()),
                Value::Integer(unix_now()),
            ],
        )
        .await?;

        let mut rows = self
            .query(
                "SELECT id FROM agents WHERE branch_hash = ?1",
                vec![Value::Blob(branch_hash.to_fixed_bytes().to_vec())],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or(StoreError::Custom("agent row missing after upsert".to_string()))?;
        Ok(read_from_row_int(&row, 0)? as i64)
    }

    pub async fn get_agent_by_branch_hash(
        &self,
        branch_hash: &BranchHash,
    ) -> Result<Option<Agent>, StoreError> {
        let mut rows = self
            .query(
                &format!("{AGENT_SELECT} WHERE branch_hash = ?1"),
                vec![Value::Blob(branch_hash.to_fixed_bytes().to_vec())],
            )
            .await?;
        rows.next().await?.map(|row| read_agent(&row)).transpose()
    }

    pub async fn get_agent(&self, id: i64) -> Result<Option<Agent>, StoreError> {
        let mut rows = self
            .query(
                &format!("{AGENT_SELECT} WHERE id = ?1"),
                vec![Value::Integer(id)],
            )
            .await?;
        rows.next().await?.map(|row| read_agent(&row)).transpose()
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let mut rows = self
            .query(&format!("{AGENT_SELECT} ORDER BY id ASC"), ())
            .await?;
        let mut agents = Vec::new();
        while let Some(row) = rows.next().await? {
            agents.push(read_agent(&row)?);
        }
        Ok(agents)
    }

    pub async fn list_agents_by_repo(&self, repo_url: &str) -> Result<Vec<Agent>, StoreError> {
        let mut rows = self
            .query(
                &format!("{AGENT_SELECT} WHERE repo_url = ?1 ORDER BY id ASC"),
                vec![Value::Text(repo_url.to_string())],
            )
            .await?;
        let mut agents = Vec::new();
        while let Some(row) = rows.next().await? {
            agents.push(read_agent(&row)?);
        }
        Ok(agents)
    }

    pub async fn update_agent_status(
        &self,
        id: i64,
        status: AgentStatus,
        worker_pid: Option<u32>,
    ) -> Result<(), StoreError> {
        let pid_value = match worker_pid {
            Some(pid) => Value::Integer(pid as i64),
            None => Value::Null,
        };
        self.execute(
            "UPDATE agents SET status = ?1, worker_pid = ?2 WHERE id = ?3",
            vec![
                Value::Text(status.as_str().to_string()),
                pid_value,
                Value::Integer(id),
            ],
        )
        .await
    }

    pub async fn update_agent_contract(
        &self,
        id: i64,
        contract_address: Address,
    ) -> Result<(), StoreError> {
        self.execute(
            "UPDATE agents SET contract_address = ?1 WHERE id = ?2",
            vec![
                Value::Blob(contract_address.as_bytes().to_vec()),
                Value::Integer(id),
            ],
        )
        .await
    }

    // ------------------------------------------------------------------
    // secrets
    // ------------------------------------------------------------------

    /// Idempotent upsert keyed on `(agent_id, key)`. The branch hash is
    /// denormalized onto the row so secrets survive their agent row being
    /// recreated under a new id.
    pub async fn put_secret(
        &self,
        agent_id: i64,
        branch_hash: &BranchHash,
        key: &str,
        ciphertext: &[u8],
    ) -> Result<(), StoreError> {
        self.execute(
            "INSERT OR REPLACE INTO secrets (agent_id, branch_hash, key, ciphertext) VALUES (?1, ?2, ?3, ?4)",
            vec![
                Value::Integer(agent_id),
                Value::Blob(branch_hash.to_fixed_bytes().to_vec()),
                Value::Text(key.to_string()),
                Value::Blob(ciphertext.to_vec()),
            ],
        )
        .await
    }

    /// Every secret stored for this branch identity, regardless of which
    /// agent id originally owned it. When two generations stored the same
    /// key, the row owned by the highest (most recent) id wins.
    pub async fn list_secrets_by_branch_hash(
        &self,
        branch_hash: &BranchHash,
    ) -> Result<Vec<SecretRow>, StoreError> {
        let mut rows = self
            .query(
                "SELECT agent_id, key, ciphertext FROM secrets WHERE branch_hash = ?1 ORDER BY agent_id ASC",
                vec![Value::Blob(branch_hash.to_fixed_bytes().to_vec())],
            )
            .await?;
        let mut secrets = Vec::new();
        while let Some(row) = rows.next().await? {
            secrets.push(SecretRow {
                agent_id: read_from_row_int(&row, 0)? as i64,
                key: read_from_row_text(&row, 1)?,
                ciphertext: read_from_row_blob(&row, 2)?,
            });
        }
        Ok(secrets)
    }

    /// Re-homes every secret of `from_agent_id` onto `to_agent_id` as an
    /// idempotent upsert, then drops the stale rows.
    pub async fn migrate_secrets(
        &self,
        from_agent_id: i64,
        to_agent_id: i64,
    ) -> Result<(), StoreError> {
        if from_agent_id == to_agent_id {
            return Ok(());
        }
        self.execute_in_tx(vec![
            (
                "INSERT OR REPLACE INTO secrets (agent_id, branch_hash, key, ciphertext) \
                 SELECT ?2, branch_hash, key, ciphertext FROM secrets WHERE agent_id = ?1",
                vec![Value::Integer(from_agent_id), Value::Integer(to_agent_id)].into_params()?,
            ),
            (
                "DELETE FROM secrets WHERE agent_id = ?1",
                vec![Value::Integer(from_agent_id)].into_params()?,
            ),
        ])
        .await
    }

    // ------------------------------------------------------------------
    // metrics
    // ------------------------------------------------------------------

    pub async fn insert_metric(&self, metric: &Metric) -> Result<(), StoreError> {
        let price = metric.price.map(Value::Real).unwrap_or(Value::Null);
        let tx_hash = metric
            .trade_tx_hash
            .clone()
            .map(Value::Text)
            .unwrap_or(Value::Null);
        let amount = metric.trade_amount.map(Value::Real).unwrap_or(Value::Null);
        self.execute(
            "INSERT INTO metrics (agent_id, timestamp, decision, price, trade_executed, trade_tx_hash, trade_amount) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            vec![
                Value::Integer(metric.agent_id),
                Value::Integer(metric.timestamp),
                Value::Text(metric.decision.clone()),
                price,
                Value::Integer(metric.trade_executed as i64),
                tx_hash,
                amount,
            ],
        )
        .await
    }

    pub async fn recent_metrics(&self, agent_id: i64, limit: u32) -> Result<Vec<Metric>, StoreError> {
        let mut rows = self
            .query(
                &format!("{METRIC_SELECT} WHERE agent_id = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2"),
                vec![Value::Integer(agent_id), Value::Integer(limit as i64)],
            )
            .await?;
        let mut metrics = Vec::new();
        while let Some(row) = rows.next().await? {
            metrics.push(read_metric(&row)?);
        }
        Ok(metrics)
    }

    pub async fn trades(&self, agent_id: i64, limit: u32) -> Result<Vec<Metric>, StoreError> {
        let mut rows = self
            .query(
                &format!(
                    "{METRIC_SELECT} WHERE agent_id = ?1 AND trade_executed = 1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
                ),
                vec![Value::Integer(agent_id), Value::Integer(limit as i64)],
            )
            .await?;
        let mut metrics = Vec::new();
        while let Some(row) = rows.next().await? {
            metrics.push(read_metric(&row)?);
        }
        Ok(metrics)
    }

    /// Whether the agent reported anything at or after `since` (unix secs).
    pub async fn has_metrics_since(&self, agent_id: i64, since: i64) -> Result<bool, StoreError> {
        let mut rows = self
            .query(
                "SELECT 1 FROM metrics WHERE agent_id = ?1 AND timestamp >= ?2 LIMIT 1",
                vec![Value::Integer(agent_id), Value::Integer(since)],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn aggregate_metrics(&self, agent_id: i64) -> Result<MetricStats, StoreError> {
        let mut rows = self
            .query(
                "SELECT COUNT(*), COALESCE(SUM(trade_executed), 0), MIN(timestamp), MAX(timestamp) \
                 FROM metrics WHERE agent_id = ?1",
                vec![Value::Integer(agent_id)],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or(StoreError::Custom("aggregate query returned no row".to_string()))?;

        let mut stats = MetricStats {
            total_cycles: read_from_row_int(&row, 0)?,
            trades_executed: read_from_row_int(&row, 1)?,
            first_seen: read_from_row_opt_int(&row, 2)?,
            last_seen: read_from_row_opt_int(&row, 3)?,
            last_decision: None,
        };

        let mut rows = self
            .query(
                "SELECT decision FROM metrics WHERE agent_id = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT 1",
                vec![Value::Integer(agent_id)],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            stats.last_decision = Some(read_from_row_text(&row, 0)?);
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // oauth grants
    // ------------------------------------------------------------------

    pub async fn put_oauth_grant(&self, grant: &OAuthGrant) -> Result<(), StoreError> {
        self.execute(
            "INSERT OR REPLACE INTO oauth_grants (user_id, repo_url, access_token, webhook_configured) \
             VALUES (?1, ?2, ?3, ?4)",
            vec![
                Value::Text(grant.user_id.clone()),
                Value::Text(grant.repo_url.clone()),
                Value::Blob(grant.access_token_ciphertext.clone()),
                Value::Integer(grant.webhook_configured as i64),
            ],
        )
        .await
    }

    pub async fn get_oauth_grant(
        &self,
        user_id: &str,
        repo_url: &str,
    ) -> Result<Option<OAuthGrant>, StoreError> {
        let mut rows = self
            .query(
                "SELECT user_id, repo_url, access_token, webhook_configured \
                 FROM oauth_grants WHERE user_id = ?1 AND repo_url = ?2",
                vec![
                    Value::Text(user_id.to_string()),
                    Value::Text(repo_url.to_string()),
                ],
            )
            .await?;
        rows.next()
            .await?
            .map(|row| {
                Ok(OAuthGrant {
                    user_id: read_from_row_text(&row, 0)?,
                    repo_url: read_from_row_text(&row, 1)?,
                    access_token_ciphertext: read_from_row_blob(&row, 2)?,
                    webhook_configured: read_from_row_int(&row, 3)? != 0,
                })
            })
            .transpose()
    }
}

const AGENT_SELECT: &str = "SELECT id, repo_url, branch_name, branch_hash, contract_address, status, worker_pid, created_at FROM agents";
const METRIC_SELECT: &str = "SELECT agent_id, timestamp, decision, price, trade_executed, trade_tx_hash, trade_amount FROM metrics";

fn read_agent(row: &Row) -> Result<Agent, StoreError> {
    let branch_hash_bytes = read_from_row_blob(row, 3)?;
    let branch_hash = BranchHash::from_slice(&branch_hash_bytes)
        .map_err(|e| StoreError::Corrupted(e.to_string()))?;
    let contract_address = match read_from_row_opt_blob(row, 4)? {
        Some(bytes) if bytes.len() == 20 => Some(Address::from_slice(&bytes)),
        Some(bytes) => {
            return Err(StoreError::Corrupted(format!(
                "contract address blob has {} bytes",
                bytes.len()
            )));
        }
        None => None,
    };
    let status_text = read_from_row_text(row, 5)?;
    let status = AgentStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Corrupted(format!("unknown agent status {status_text:?}")))?;

    Ok(Agent {
        id: read_from_row_int(row, 0)? as i64,
        repo_url: read_from_row_text(row, 1)?,
        branch_name: read_from_row_text(row, 2)?,
        branch_hash,
        contract_address,
        status,
        worker_pid: read_from_row_opt_int(row, 6)?.map(|pid| pid as u32),
        created_at: read_from_row_int(row, 7)? as i64,
    })
}

fn read_metric(row: &Row) -> Result<Metric, StoreError> {
    Ok(Metric {
        agent_id: read_from_row_int(row, 0)? as i64,
        timestamp: read_from_row_int(row, 1)? as i64,
        decision: read_from_row_text(row, 2)?,
        price: read_from_row_opt_real(row, 3)?,
        trade_executed: read_from_row_int(row, 4)? != 0,
        trade_tx_hash: read_from_row_opt_text(row, 5)?,
        trade_amount: read_from_row_opt_real(row, 6)?,
    })
}

fn read_from_row_int(row: &Row, index: i32) -> Result<u64, StoreError> {
    match row.get_value(index)? {
        Value::Integer(i) => Ok(i as u64),
        _ => Err(StoreError::SQLInvalidTypeError),
    }
}

fn read_from_row_opt_int(row: &Row, index: i32) -> Result<Option<i64>, StoreError> {
    match row.get_value(index)? {
        Value::Integer(i) => Ok(Some(i)),
        Value::Null => Ok(None),
        _ => Err(StoreError::SQLInvalidTypeError),
    }
}

fn read_from_row_text(row: &Row, index: i32) -> Result<String, StoreError> {
    match row.get_value(index)? {
        Value::Text(s) => Ok(s),
        _ => Err(StoreError::SQLInvalidTypeError),
    }
}

fn read_from_row_opt_text(row: &Row, index: i32) -> Result<Option<String>, StoreError> {
    match row.get_value(index)? {
        Value::Text(s) => Ok(Some(s)),
        Value::Null => Ok(None),
        _ => Err(StoreError::SQLInvalidTypeError),
    }
}

fn read_from_row_blob(row: &Row, index: i32) -> Result<Vec<u8>, StoreError> {
    match row.get_value(index)? {
        Value::Blob(vec) => Ok(vec),
        _ => Err(StoreError::SQLInvalidTypeError),
    }
}

fn read_from_row_opt_blob(row: &Row, index: i32) -> Result<Option<Vec<u8>>, StoreError> {
    match row.get_value(index)? {
        Value::Blob(vec) => Ok(Some(vec)),
        Value::Null => Ok(None),
        _ => Err(StoreError::SQLInvalidTypeError),
    }
}

fn read_from_row_opt_real(row: &Row, index: i32) -> Result<Option<f64>, StoreError> {
    match row.get_value(index)? {
        Value::Real(f) => Ok(Some(f)),
        Value::Integer(i) => Ok(Some(i as f64)),
        Value::Null => Ok(None),
        _ => Err(StoreError::SQLInvalidTypeError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::new(":memory:").await.unwrap()
    }

    fn hash(branch: &str) -> BranchHash {
        BranchHash::derive("https://example.com/repo.git", branch)
    }

    #[tokio::test]
    async fn schema_tables_exist() -> Result<(), StoreError> {
        let store = memory_store().await;
        for table in ["agents", "secrets", "metrics", "oauth_grants", "migrations"] {
            let mut rows = store
                .query(
                    "SELECT name FROM sqlite_schema WHERE type='table' AND name=?1",
                    vec![Value::Text(table.to_string())],
                )
                .await?;
            assert!(rows.next().await?.is_some(), "missing table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn upsert_agent_preserves_id_on_conflict() {
        let store = memory_store().await;
        let h = hash("main");
        let first = store
            .upsert_agent(&h, "https://example.com/repo.git", "main", None, AgentStatus::Deploying)
            .await
            .unwrap();
        let second = store
            .upsert_agent(
                &h,
                "https://example.com/repo.git",
                "main",
                Some(Address::repeat_byte(0x11)),
                AgentStatus::Running,
            )
            .await
            .unwrap();
        assert_eq!(first, second);

        let agent = store.get_agent_by_branch_hash(&h).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.contract_address, Some(Address::repeat_byte(0x11)));
    }

    #[tokio::test]
    async fn upsert_without_address_keeps_stored_address() {
        let store = memory_store().await;
        let h = hash("main");
        store
            .upsert_agent(
                &h,
                "r",
                "main",
                Some(Address::repeat_byte(0x22)),
                AgentStatus::Running,
            )
            .await
            .unwrap();
        store
            .upsert_agent(&h, "r", "main", None, AgentStatus::Deploying)
            .await
            .unwrap();
        let agent = store.get_agent_by_branch_hash(&h).await.unwrap().unwrap();
        assert_eq!(agent.contract_address, Some(Address::repeat_byte(0x22)));
        assert_eq!(agent.status, AgentStatus::Deploying);
    }

    #[tokio::test]
    async fn secret_upsert_last_value_wins() {
        let store = memory_store().await;
        let h = hash("main");
        let id = store
            .upsert_agent(&h, "r", "main", None, AgentStatus::Deploying)
            .await
            .unwrap();
        store.put_secret(id, &h, "API_KEY", b"old").await.unwrap();
        store.put_secret(id, &h, "API_KEY", b"new").await.unwrap();

        let secrets = store.list_secrets_by_branch_hash(&h).await.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].ciphertext, b"new");
    }

    #[tokio::test]
    async fn secrets_survive_agent_row_recreation() {
        let store = memory_store().await;
        let h = hash("main");
        let old_id = store
            .upsert_agent(&h, "r", "main", None, AgentStatus::Running)
            .await
            .unwrap();
        store.put_secret(old_id, &h, "K", b"v").await.unwrap();

        // Simulate database damage: the agent row disappears while its
        // secret row dangles.
        store
            .execute("DELETE FROM agents WHERE id = ?1", vec![Value::Integer(old_id)])
            .await
            .unwrap();

        let new_id = store
            .upsert_agent(&h, "r", "main", None, AgentStatus::Deploying)
            .await
            .unwrap();
        assert_ne!(old_id, new_id);

        let secrets = store.list_secrets_by_branch_hash(&h).await.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].agent_id, old_id);

        store.migrate_secrets(old_id, new_id).await.unwrap();
        // Running the migration again is a no-op.
        store.migrate_secrets(old_id, new_id).await.unwrap();

        let secrets = store.list_secrets_by_branch_hash(&h).await.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].agent_id, new_id);
        assert_eq!(secrets[0].ciphertext, b"v");
    }

    #[tokio::test]
    async fn metric_insert_query_and_aggregate() {
        let store = memory_store().await;
        let h = hash("main");
        let id = store
            .upsert_agent(&h, "r", "main", None, AgentStatus::Running)
            .await
            .unwrap();

        for (ts, decision, traded) in [(100, "hold", false), (200, "buy", true), (300, "hold", false)] {
            store
                .insert_metric(&Metric {
                    agent_id: id,
                    timestamp: ts,
                    decision: decision.to_string(),
                    price: Some(1.25),
                    trade_executed: traded,
                    trade_tx_hash: traded.then(|| "0xabc".to_string()),
                    trade_amount: traded.then_some(10.0),
                })
                .await
                .unwrap();
        }

        let recent = store.recent_metrics(id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, 300);

        let trades = store.trades(id, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].decision, "buy");
        assert_eq!(trades[0].trade_tx_hash.as_deref(), Some("0xabc"));

        let stats = store.aggregate_metrics(id).await.unwrap();
        assert_eq!(stats.total_cycles, 3);
        assert_eq!(stats.trades_executed, 1);
        assert_eq!(stats.first_seen, Some(100));
        assert_eq!(stats.last_seen, Some(300));
        assert_eq!(stats.last_decision.as_deref(), Some("hold"));

        assert!(store.has_metrics_since(id, 250).await.unwrap());
        assert!(!store.has_metrics_since(id, 301).await.unwrap());
    }

    #[tokio::test]
    async fn aggregate_on_empty_agent() {
        let store = memory_store().await;
        let stats = store.aggregate_metrics(404).await.unwrap();
        assert_eq!(stats.total_cycles, 0);
        assert_eq!(stats.first_seen, None);
        assert_eq!(stats.last_decision, None);
    }

    #[tokio::test]
    async fn oauth_grant_round_trip() {
        let store = memory_store().await;
        let grant = OAuthGrant {
            user_id: "octocat".to_string(),
            access_token_ciphertext: vec![1, 2, 3],
            repo_url: "https://example.com/repo.git".to_string(),
            webhook_configured: true,
        };
        store.put_oauth_grant(&grant).await.unwrap();
        let loaded = store
            .get_oauth_grant("octocat", "https://example.com/repo.git")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.access_token_ciphertext, vec![1, 2, 3]);
        assert!(loaded.webhook_configured);
        assert!(
            store
                .get_oauth_grant("nobody", "https://example.com/repo.git")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn list_agents_by_repo_filters() {
        let store = memory_store().await;
        store
            .upsert_agent(&hash("main"), "repo-a", "main", None, AgentStatus::Running)
            .await
            .unwrap();
        store
            .upsert_agent(&hash("dev"), "repo-b", "dev", None, AgentStatus::Running)
            .await
            .unwrap();
        let filtered = store.list_agents_by_repo("repo-a").await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].repo_url, "repo-a");
        assert_eq!(store.list_agents().await.unwrap().len(), 2);
    }
}
