// Postgres persistence. One schema per marketplace database, one table per
// logical collection. Every conditional write is a single statement so the
// row-level lock taken by ON CONFLICT / UPDATE decides races.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;

use pageinfra_common::{HistoricEntry, MarketplaceNamespace, Sku, SkuMetadata, Snapshot, WriteOutcome};

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    Backend, ClaimStore, HistoricStore, SearchIndex, SkuStore, SnapshotStore, Stores,
    UrlAccessStore,
};

/// Quoted, schema-qualified table names for one namespace.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
    schema: String,
    sku: String,
    historic: String,
    snapshot: String,
    url: String,
    claim: String,
}

impl Tables {
    /// Names are validated first; only then are they spliced into SQL.
    pub(crate) fn for_namespace(ns: &MarketplaceNamespace) -> StoreResult<Self> {
        ns.validate()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        let qualify = |table: &str| format!("\"{}\".\"{}\"", ns.database, table);
        Ok(Self {
            schema: format!("\"{}\"", ns.database),
            sku: qualify(&ns.sku_collection),
            historic: qualify(&ns.historic_collection),
            snapshot: qualify(&ns.snapshot_collection),
            url: qualify(&ns.url_collection),
            claim: qualify(&ns.claim_collection),
        })
    }

    fn ddl(&self) -> Vec<String> {
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    code       TEXT         PRIMARY KEY,
                    created    TIMESTAMPTZ  NOT NULL,
                    hash       TEXT         NOT NULL,
                    relatives  TEXT[]       NOT NULL DEFAULT '{{}}',
                    core       JSONB        NOT NULL DEFAULT '{{}}'::jsonb,
                    updated    TIMESTAMPTZ  NOT NULL DEFAULT now()
                )
                "#,
                self.sku
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    code      TEXT   PRIMARY KEY,
                    historic  JSONB  NOT NULL DEFAULT '[]'::jsonb
                )
                "#,
                self.historic
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    hash     TEXT         PRIMARY KEY,
                    created  TIMESTAMPTZ  NOT NULL,
                    sku      JSONB        NOT NULL
                )
                "#,
                self.snapshot
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    url       TEXT         PRIMARY KEY,
                    accessed  TIMESTAMPTZ  NOT NULL
                )
                "#,
                self.url
            ),
            format!(
                r#"
                CREATE UNLOGGED TABLE IF NOT EXISTS {} (
                    key         TEXT         PRIMARY KEY,
                    expires_at  TIMESTAMPTZ  NOT NULL
                )
                "#,
                self.claim
            ),
        ]
    }
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// All collections of one namespace, backed by Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    tables: Tables,
}

impl PgStore {
    pub fn new(pool: PgPool, namespace: &MarketplaceNamespace) -> StoreResult<Self> {
        Ok(Self {
            pool,
            tables: Tables::for_namespace(namespace)?,
        })
    }

    /// Create schema and tables. Safe to run on every start.
    pub async fn provision(&self) -> StoreResult<()> {
        for statement in self.tables.ddl() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SkuRow {
    code: String,
    created: DateTime<Utc>,
    hash: String,
    relatives: Vec<String>,
    core: Json<serde_json::Value>,
}

impl From<SkuRow> for Sku {
    fn from(row: SkuRow) -> Self {
        Sku {
            code: row.code,
            metadata: SkuMetadata {
                created: row.created,
                hash: row.hash,
                relatives: row.relatives.into_iter().collect(),
            },
            core: row.core.0,
        }
    }
}

/// Maps `RETURNING (xmax = 0)` of an upsert: no row means the WHERE clause
/// held the existing row back.
fn upsert_outcome(row: Option<(bool,)>) -> WriteOutcome {
    match row {
        Some((true,)) => WriteOutcome::Inserted,
        Some((false,)) => WriteOutcome::Updated,
        None => WriteOutcome::Unchanged,
    }
}

#[async_trait]
impl SkuStore for PgStore {
    async fn stored_hashes(&self, codes: &[String]) -> StoreResult<HashMap<String, String>> {
        if codes.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (String, String)>(&format!(
            "SELECT code, hash FROM {} WHERE code = ANY($1)",
            self.tables.sku
        ))
        .bind(codes)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn upsert_if_changed(&self, sku: &Sku) -> StoreResult<WriteOutcome> {
        let relatives: Vec<String> = sku
            .metadata
            .relatives
            .iter()
            .filter(|r| **r != sku.code)
            .cloned()
            .collect();

        let row = sqlx::query_as::<_, (bool,)>(&format!(
            r#"
            INSERT INTO {table} AS s (code, created, hash, relatives, core, updated)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (code) DO UPDATE
            SET hash      = EXCLUDED.hash,
                core      = EXCLUDED.core,
                relatives = ARRAY(
                    SELECT DISTINCT r FROM unnest(s.relatives || EXCLUDED.relatives) AS r
                    WHERE r <> s.code ORDER BY r
                ),
                updated   = now()
            WHERE s.hash IS DISTINCT FROM EXCLUDED.hash
            RETURNING (xmax = 0) AS inserted
            "#,
            table = self.tables.sku
        ))
        .bind(&sku.code)
        .bind(sku.metadata.created)
        .bind(&sku.metadata.hash)
        .bind(&relatives)
        .bind(Json(&sku.core))
        .fetch_optional(&self.pool)
        .await?;

        Ok(upsert_outcome(row))
    }

    async fn find_by_codes(&self, codes: &[String]) -> StoreResult<Vec<Sku>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, SkuRow>(&format!(
            "SELECT code, created, hash, relatives, core FROM {} WHERE code = ANY($1)",
            self.tables.sku
        ))
        .bind(codes)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Sku::from).collect())
    }

    async fn add_relatives(
        &self,
        code: &str,
        relatives: &BTreeSet<String>,
    ) -> StoreResult<WriteOutcome> {
        let relatives: Vec<String> = relatives
            .iter()
            .filter(|r| r.as_str() != code)
            .cloned()
            .collect();

        // The array union runs inside the UPDATE, so concurrent merges on the
        // same row serialize on its lock and neither loses the other's codes.
        let (found, changed) = sqlx::query_as::<_, (bool, bool)>(&format!(
            r#"
            WITH target AS (
                SELECT code FROM {table} WHERE code = $1
            ),
            changed AS (
                UPDATE {table} AS s
                SET relatives = ARRAY(
                        SELECT DISTINCT r FROM unnest(s.relatives || $2::text[]) AS r
                        ORDER BY r
                    ),
                    updated = now()
                WHERE s.code = $1 AND NOT (s.relatives @> $2::text[])
                RETURNING s.code
            )
            SELECT EXISTS (SELECT 1 FROM target), EXISTS (SELECT 1 FROM changed)
            "#,
            table = self.tables.sku
        ))
        .bind(code)
        .bind(&relatives)
        .fetch_one(&self.pool)
        .await?;

        Ok(match (found, changed) {
            (false, _) => WriteOutcome::Skipped,
            (true, true) => WriteOutcome::Updated,
            (true, false) => WriteOutcome::Unchanged,
        })
    }
}

#[async_trait]
impl HistoricStore for PgStore {
    async fn push_if_new(&self, code: &str, entry: &HistoricEntry) -> StoreResult<WriteOutcome> {
        let row = sqlx::query_as::<_, (bool,)>(&format!(
            r#"
            INSERT INTO {table} AS h (code, historic)
            VALUES ($1, $2)
            ON CONFLICT (code) DO UPDATE
            SET historic = EXCLUDED.historic || h.historic
            WHERE h.historic -> 0 ->> 'hash' IS DISTINCT FROM EXCLUDED.historic -> 0 ->> 'hash'
            RETURNING (xmax = 0) AS inserted
            "#,
            table = self.tables.historic
        ))
        .bind(code)
        .bind(Json(vec![entry]))
        .fetch_optional(&self.pool)
        .await?;

        Ok(upsert_outcome(row))
    }

    async fn historic(&self, code: &str) -> StoreResult<Vec<HistoricEntry>> {
        let row = sqlx::query_as::<_, (Json<Vec<HistoricEntry>>,)>(&format!(
            "SELECT historic FROM {} WHERE code = $1",
            self.tables.historic
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(entries,)| entries.0).unwrap_or_default())
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn insert_if_absent(&self, snapshot: &Snapshot) -> StoreResult<WriteOutcome> {
        let row = sqlx::query_as::<_, (String,)>(&format!(
            r#"
            INSERT INTO {} (hash, created, sku)
            VALUES ($1, $2, $3)
            ON CONFLICT (hash) DO NOTHING
            RETURNING hash
            "#,
            self.tables.snapshot
        ))
        .bind(&snapshot.hash)
        .bind(snapshot.created)
        .bind(Json(&snapshot.sku))
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(_) => WriteOutcome::Inserted,
            None => WriteOutcome::Skipped,
        })
    }

    async fn snapshot(&self, hash: &str) -> StoreResult<Option<Snapshot>> {
        let row = sqlx::query_as::<_, (String, DateTime<Utc>, Json<serde_json::Value>)>(&format!(
            "SELECT hash, created, sku FROM {} WHERE hash = $1",
            self.tables.snapshot
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(hash, created, sku)| Snapshot {
            hash,
            created,
            sku: sku.0,
        }))
    }
}

#[async_trait]
impl UrlAccessStore for PgStore {
    async fn last_accessed(&self, urls: &[String]) -> StoreResult<HashMap<String, DateTime<Utc>>> {
        if urls.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>)>(&format!(
            "SELECT url, accessed FROM {} WHERE url = ANY($1)",
            self.tables.url
        ))
        .bind(urls)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn mark_accessed(&self, urls: &[String], at: DateTime<Utc>) -> StoreResult<u64> {
        // ON CONFLICT cannot touch the same row twice in one statement.
        let unique: Vec<String> = urls
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} AS u (url, accessed)
            SELECT url, $2 FROM unnest($1::text[]) AS url
            ON CONFLICT (url) DO UPDATE
            SET accessed = GREATEST(u.accessed, EXCLUDED.accessed)
            "#,
            table = self.tables.url
        ))
        .bind(&unique)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ClaimStore for PgStore {
    async fn try_claim(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        // An expired row is taken over in place; a live one holds the WHERE back.
        let row = sqlx::query_as::<_, (String,)>(&format!(
            r#"
            INSERT INTO {table} AS c (key, expires_at)
            VALUES ($1, now() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE
            SET expires_at = EXCLUDED.expires_at
            WHERE c.expires_at <= now()
            RETURNING key
            "#,
            table = self.tables.claim
        ))
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}

// ---------------------------------------------------------------------------
// PgBackend
// ---------------------------------------------------------------------------

/// Opens `PgStore`s on a shared pool; search writes go to `index`.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    index: Arc<dyn SearchIndex>,
}

impl PgBackend {
    pub fn new(pool: PgPool, index: Arc<dyn SearchIndex>) -> Self {
        Self { pool, index }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn provision(&self, namespace: &MarketplaceNamespace) -> StoreResult<()> {
        PgStore::new(self.pool.clone(), namespace)?
            .provision()
            .await?;
        info!(
            marketplace = namespace.marketplace.as_str(),
            schema = namespace.database.as_str(),
            "Collections provisioned"
        );
        Ok(())
    }

    fn open(&self, namespace: &MarketplaceNamespace) -> StoreResult<Stores> {
        let store = Arc::new(PgStore::new(self.pool.clone(), namespace)?);
        Ok(Stores {
            skus: store.clone(),
            historic: store.clone(),
            snapshots: store.clone(),
            urls: store.clone(),
            claims: store,
            index: self.index.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_quoted_and_schema_qualified() {
        let ns = MarketplaceNamespace::derived("google_shopping");
        let tables = Tables::for_namespace(&ns).unwrap();
        assert_eq!(tables.schema, "\"google_shopping\"");
        assert_eq!(tables.sku, "\"google_shopping\".\"sku\"");
        assert_eq!(tables.claim, "\"google_shopping\".\"claim\"");
    }

    #[test]
    fn invalid_names_never_reach_sql() {
        let mut ns = MarketplaceNamespace::derived("rihappy");
        ns.url_collection = "url\"; DROP SCHEMA rihappy; --".to_string();
        assert!(Tables::for_namespace(&ns).is_err());
    }

    #[test]
    fn ddl_declares_unique_keys() {
        let ns = MarketplaceNamespace::derived("rihappy");
        let ddl = Tables::for_namespace(&ns).unwrap().ddl().join("\n");
        assert!(ddl.contains("code       TEXT         PRIMARY KEY"));
        assert!(ddl.contains("hash     TEXT         PRIMARY KEY"));
        assert!(ddl.contains("url       TEXT         PRIMARY KEY"));
        assert!(ddl.contains("DEFAULT '{}'"));
    }

    #[test]
    fn upsert_outcome_maps_xmax() {
        assert_eq!(upsert_outcome(Some((true,))), WriteOutcome::Inserted);
        assert_eq!(upsert_outcome(Some((false,))), WriteOutcome::Updated);
        assert_eq!(upsert_outcome(None), WriteOutcome::Unchanged);
    }
}
