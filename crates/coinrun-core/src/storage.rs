use crate::config::StorageConfig;
use crate::error::FundingError;
use crate::state::{Changeset, FundingState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use tracing::info;

#[derive(Debug, Clone)]
enum StorageBackend {
    Memory,
    Postgres(PostgresStateStore),
}

/// Durability layer behind the engine.
///
/// Invariant handling:
/// - A changeset is persisted before it is applied in memory.
/// - One changeset is one SQL transaction; a failed write leaves memory untouched.
/// - On startup, every row is hydrated and both hash chains and all wallets are verified.
#[derive(Debug, Clone)]
pub struct StateStore {
    backend: StorageBackend,
}

impl StateStore {
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
        }
    }

    /// Connect to the configured backend and load the committed state.
    pub async fn bootstrap(config: &StorageConfig) -> Result<(Self, FundingState), FundingError> {
        match config {
            StorageConfig::Memory => Ok((Self::memory(), FundingState::default())),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresStateStore::connect(database_url, *max_connections).await?;
                store.ensure_schema().await?;
                let state = FundingState::from_changeset(store.load().await?);
                let report = state.verify();
                if !report.is_clean() {
                    return Err(FundingError::LedgerInvariantViolation(format!(
                        "persisted state failed verification (ledger chain ok: {}, audit chain ok: {}, violations: {})",
                        report.ledger_chain_ok,
                        report.audit_chain_ok,
                        report.violations.join("; ")
                    )));
                }
                info!(
                    ledger_entries = state.ledger_entries().len(),
                    audit_entries = state.audit_entries().len(),
                    "hydrated funding state from postgres"
                );
                Ok((
                    Self {
                        backend: StorageBackend::Postgres(store),
                    },
                    state,
                ))
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self.backend {
            StorageBackend::Memory => "memory",
            StorageBackend::Postgres(_) => "postgres",
        }
    }

    pub async fn persist(&self, changes: &Changeset) -> Result<(), FundingError> {
        match &self.backend {
            StorageBackend::Memory => Ok(()),
            StorageBackend::Postgres(store) => store.persist(changes).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RowKey<'a> {
    Text(&'a str),
    Int(u64),
}

#[derive(Debug, Clone)]
struct PostgresStateStore {
    pool: PgPool,
}

const ROW_TABLES: [(&str, &str, &str); 6] = [
    ("coinrun_principals", "principal_id", "TEXT"),
    ("coinrun_wallets", "principal_id", "TEXT"),
    ("coinrun_funding_requests", "request_id", "BIGINT"),
    ("coinrun_commitments", "commitment_id", "BIGINT"),
    ("coinrun_allocations", "allocation_id", "BIGINT"),
    ("coinrun_runs", "run_id", "BIGINT"),
];

fn storage_err(action: &str) -> impl Fn(sqlx::Error) -> FundingError + '_ {
    move |e| FundingError::Storage(format!("postgres {action} failed: {e}"))
}

fn to_bigint(value: u64) -> Result<i64, FundingError> {
    i64::try_from(value)
        .map_err(|_| FundingError::Storage(format!("{value} exceeds postgres BIGINT range")))
}

impl PostgresStateStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, FundingError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(storage_err("connect"))?;
        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), FundingError> {
        // Mutable rows: key column plus the full record.
        for (table, key, key_type) in ROW_TABLES {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    {key} {key_type} PRIMARY KEY,
                    record JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )"
            );
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(storage_err("schema create"))?;
        }

        // Append-only logs; the application owns sequence and hash generation.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coinrun_ledger_entries (
                sequence BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                trace_id TEXT NOT NULL,
                principal_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                delta BIGINT NOT NULL,
                record JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err("schema create"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coinrun_audit_entries (
                sequence BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                trace_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                request_id BIGINT NULL,
                run_id BIGINT NULL,
                record JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err("schema create"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_coinrun_ledger_principal ON coinrun_ledger_entries (principal_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err("index create"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_coinrun_audit_request ON coinrun_audit_entries (request_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err("index create"))?;

        Ok(())
    }

    async fn load(&self) -> Result<Changeset, FundingError> {
        Ok(Changeset {
            trace_id: "hydrate".to_string(),
            principals: self
                .load_records("coinrun_principals", "principal_id")
                .await?,
            wallets: self.load_records("coinrun_wallets", "principal_id").await?,
            requests: self
                .load_records("coinrun_funding_requests", "request_id")
                .await?,
            commitments: self
                .load_records("coinrun_commitments", "commitment_id")
                .await?,
            runs: self.load_records("coinrun_runs", "run_id").await?,
            allocations: self
                .load_records("coinrun_allocations", "allocation_id")
                .await?,
            ledger_entries: self
                .load_records("coinrun_ledger_entries", "sequence")
                .await?,
            audit_entries: self
                .load_records("coinrun_audit_entries", "sequence")
                .await?,
        })
    }

    async fn load_records<T: DeserializeOwned>(
        &self,
        table: &str,
        order_by: &str,
    ) -> Result<Vec<T>, FundingError> {
        let sql = format!("SELECT record FROM {table} ORDER BY {order_by} ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err("load"))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record: Value = row.try_get("record").map_err(storage_err("decode record"))?;
            records.push(serde_json::from_value(record)?);
        }
        Ok(records)
    }

    async fn persist(&self, changes: &Changeset) -> Result<(), FundingError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(storage_err("begin"))?;

        for principal in &changes.principals {
            upsert(
                &mut *tx,
                "coinrun_principals",
                "principal_id",
                RowKey::Text(principal.id.as_str()),
                principal,
            )
            .await?;
        }
        for wallet in &changes.wallets {
            upsert(
                &mut *tx,
                "coinrun_wallets",
                "principal_id",
                RowKey::Text(wallet.principal.as_str()),
                wallet,
            )
            .await?;
        }
        for request in &changes.requests {
            upsert(
                &mut *tx,
                "coinrun_funding_requests",
                "request_id",
                RowKey::Int(request.id.0),
                request,
            )
            .await?;
        }
        for commitment in &changes.commitments {
            upsert(
                &mut *tx,
                "coinrun_commitments",
                "commitment_id",
                RowKey::Int(commitment.id.0),
                commitment,
            )
            .await?;
        }
        for run in &changes.runs {
            upsert(
                &mut *tx,
                "coinrun_runs",
                "run_id",
                RowKey::Int(run.id.0),
                run,
            )
            .await?;
        }
        for allocation in &changes.allocations {
            upsert(
                &mut *tx,
                "coinrun_allocations",
                "allocation_id",
                RowKey::Int(allocation.id.0),
                allocation,
            )
            .await?;
        }

        for entry in &changes.ledger_entries {
            sqlx::query(
                r#"
                INSERT INTO coinrun_ledger_entries (
                    sequence, entry_id, trace_id, principal_id, kind, delta,
                    record, previous_hash, entry_hash
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(to_bigint(entry.sequence)?)
            .bind(&entry.entry_id)
            .bind(&entry.trace_id)
            .bind(entry.principal.as_str())
            .bind(entry.kind.as_str())
            .bind(entry.delta)
            .bind(serde_json::to_value(entry)?)
            .bind(&entry.previous_hash)
            .bind(&entry.entry_hash)
            .execute(&mut *tx)
            .await
            .map_err(storage_err("ledger insert"))?;
        }

        for entry in &changes.audit_entries {
            let request = entry.request.map(|id| to_bigint(id.0)).transpose()?;
            let run = entry.run.map(|id| to_bigint(id.0)).transpose()?;
            sqlx::query(
                r#"
                INSERT INTO coinrun_audit_entries (
                    sequence, entry_id, trace_id, actor, action, request_id, run_id,
                    record, previous_hash, entry_hash
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(to_bigint(entry.sequence)?)
            .bind(&entry.entry_id)
            .bind(&entry.trace_id)
            .bind(&entry.actor)
            .bind(&entry.action)
            .bind(request)
            .bind(run)
            .bind(serde_json::to_value(entry)?)
            .bind(&entry.previous_hash)
            .bind(&entry.hash)
            .execute(&mut *tx)
            .await
            .map_err(storage_err("audit insert"))?;
        }

        tx.commit().await.map_err(storage_err("commit"))?;
        Ok(())
    }
}

async fn upsert<T: Serialize>(
    conn: &mut PgConnection,
    table: &str,
    key_column: &str,
    key: RowKey<'_>,
    record: &T,
) -> Result<(), FundingError> {
    let sql = format!(
        "INSERT INTO {table} ({key_column}, record, updated_at) VALUES ($1, $2, NOW())
         ON CONFLICT ({key_column}) DO UPDATE SET record = EXCLUDED.record, updated_at = NOW()"
    );
    let query = sqlx::query(&sql);
    let query = match key {
        RowKey::Text(value) => query.bind(value),
        RowKey::Int(value) => query.bind(to_bigint(value)?),
    };
    query
        .bind(serde_json::to_value(record)?)
        .execute(conn)
        .await
        .map_err(storage_err("upsert"))?;
    Ok(())
}
