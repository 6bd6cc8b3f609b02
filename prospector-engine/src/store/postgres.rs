//! PostgreSQL store backend
//!
//! Runtime-checked sqlx queries against a schema created by [`PgStore::initialize`].
//! Multi-row operations run in transactions; result writes are single-statement
//! upserts keyed on `(campaign_id, domain_name)`, so read-committed isolation
//! suffices for them. Offset reservation rides one atomic `INSERT .. ON
//! CONFLICT` whose row lock serializes concurrent reservations. `last_offset`
//! is stored as text and widened through `numeric`, so the shared counter is
//! not bounded by `bigint`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::Zero;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{DatabaseSettings, QueueSettings};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventEnvelope, OutboxEntry};
use crate::model::{
    AuditRecord, Campaign, CampaignPatch, CounterDelta, DnsResult, GeneratedDomain, HttpResult,
    Job, JobPayload, KeywordSet, Lead, NewCampaign, NewJob, Persona, PersonaKind, Phase,
    PhaseCounters, PhaseStatus, ProbeStatus, Proxy,
};
use crate::queue::{BackoffPolicy, JobQueue, NackOutcome};

use super::{Cursor, EngineStore, OffsetReservation, Page};

/// PostgreSQL-backed [`EngineStore`] and [`JobQueue`]
pub struct PgStore {
    pool: PgPool,
    policy: BackoffPolicy,
    watermark: usize,
    enqueue_wait: Duration,
}

impl PgStore {
    /// Connect with retry and create the schema
    pub async fn connect(
        database: &DatabaseSettings,
        queue: &QueueSettings,
    ) -> Result<Self> {
        let mut attempt = 0;
        let base_delay = Duration::from_secs(database.retry_delay_secs);
        let pool = loop {
            match PgPoolOptions::new()
                .max_connections(database.max_connections)
                .acquire_timeout(Duration::from_secs(database.connection_timeout_secs))
                .connect(&database.url)
                .await
            {
                Ok(pool) => break pool,
                Err(e) => {
                    attempt += 1;
                    if attempt > database.max_retries {
                        tracing::error!(
                            "Failed to connect to database after {} attempts: {}",
                            database.max_retries + 1,
                            e
                        );
                        return Err(e.into());
                    }
                    let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                    tracing::warn!(
                        "Database connection attempt {} failed: {}. Retrying in {:?}...",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        tracing::info!(
            "Database connection pool created: max={}",
            database.max_connections
        );

        let store = Self {
            pool,
            policy: BackoffPolicy::from_settings(queue),
            watermark: queue.watermark,
            enqueue_wait: Duration::from_millis(queue.enqueue_wait_ms),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Create tables and indexes; call once during startup
    pub async fn initialize(&self) -> Result<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id UUID PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                current_phase TEXT NOT NULL,
                phase_status TEXT NOT NULL,
                version BIGINT NOT NULL,
                pattern JSONB NOT NULL,
                fingerprint TEXT NOT NULL,
                requested_count BIGINT NOT NULL,
                results JSONB NOT NULL DEFAULT '{}',
                metadata JSONB NOT NULL DEFAULT '{}',
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_campaigns_owner ON campaigns (owner_id, updated_at DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS phase_counters (
                campaign_id UUID NOT NULL REFERENCES campaigns (id) ON DELETE CASCADE,
                phase TEXT NOT NULL,
                total BIGINT NOT NULL DEFAULT 0,
                processed BIGINT NOT NULL DEFAULT 0,
                succeeded BIGINT NOT NULL DEFAULT 0,
                failed BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (campaign_id, phase)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS generated_domains (
                campaign_id UUID NOT NULL REFERENCES campaigns (id) ON DELETE CASCADE,
                global_offset BIGINT NOT NULL,
                domain_name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (campaign_id, global_offset),
                UNIQUE (campaign_id, domain_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dns_results (
                campaign_id UUID NOT NULL,
                domain_name TEXT NOT NULL,
                persona_id UUID NOT NULL,
                status TEXT NOT NULL,
                resolved_addresses JSONB NOT NULL DEFAULT '[]',
                error_kind TEXT,
                attempts INT NOT NULL DEFAULT 1,
                last_checked_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (campaign_id, domain_name),
                FOREIGN KEY (campaign_id, domain_name)
                    REFERENCES generated_domains (campaign_id, domain_name) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS http_results (
                campaign_id UUID NOT NULL,
                domain_name TEXT NOT NULL,
                persona_id UUID NOT NULL,
                proxy_id UUID,
                status TEXT NOT NULL,
                http_status SMALLINT,
                final_url TEXT,
                matched_keywords JSONB NOT NULL DEFAULT '[]',
                body_truncated BOOLEAN NOT NULL DEFAULT FALSE,
                error_kind TEXT,
                attempts INT NOT NULL DEFAULT 1,
                last_checked_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (campaign_id, domain_name),
                FOREIGN KEY (campaign_id, domain_name)
                    REFERENCES generated_domains (campaign_id, domain_name) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS leads (
                campaign_id UUID NOT NULL REFERENCES campaigns (id) ON DELETE CASCADE,
                domain_name TEXT NOT NULL,
                categories JSONB NOT NULL DEFAULT '[]',
                score INT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (campaign_id, domain_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS offset_state (
                fingerprint TEXT PRIMARY KEY,
                last_offset TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS personas (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                config JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id UUID PRIMARY KEY,
                protocol TEXT NOT NULL,
                address TEXT NOT NULL,
                username TEXT,
                password TEXT,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                healthy BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keyword_sets (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                rules JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                campaign_id UUID NOT NULL,
                phase TEXT NOT NULL,
                payload JSONB NOT NULL,
                priority INT NOT NULL DEFAULT 0,
                visible_at TIMESTAMPTZ NOT NULL,
                claimed_by TEXT,
                claim_expires_at TIMESTAMPTZ,
                attempts INT NOT NULL DEFAULT 0,
                last_error TEXT,
                dead BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs (phase, visible_at, priority) WHERE claimed_by IS NULL AND NOT dead",
            "CREATE INDEX IF NOT EXISTS idx_jobs_claims ON jobs (claimed_by, claim_expires_at)",
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id BIGSERIAL PRIMARY KEY,
                campaign_id UUID NOT NULL,
                seq BIGINT NOT NULL,
                at TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                published BOOLEAN NOT NULL DEFAULT FALSE,
                UNIQUE (campaign_id, seq)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_outbox_unpublished ON outbox (id) WHERE NOT published",
            r#"
            CREATE TABLE IF NOT EXISTS audit_records (
                id UUID PRIMARY KEY,
                actor TEXT,
                action TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                entity_id UUID,
                details JSONB NOT NULL DEFAULT 'null',
                ts TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_records (entity_id, ts DESC)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn phase_str(phase: Phase) -> &'static str {
    phase.as_str()
}

fn parse_phase(s: &str) -> Result<Phase> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| Error::Internal(format!("unknown phase '{s}' in store")))
}

fn parse_status(s: &str) -> Result<PhaseStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| Error::Internal(format!("unknown phase status '{s}' in store")))
}

fn status_str(status: PhaseStatus) -> &'static str {
    status.as_str()
}

fn probe_status_str(status: ProbeStatus) -> &'static str {
    match status {
        ProbeStatus::Ok => "ok",
        ProbeStatus::Failed => "failed",
    }
}

fn parse_probe_status(s: &str) -> Result<ProbeStatus> {
    match s {
        "ok" => Ok(ProbeStatus::Ok),
        "failed" => Ok(ProbeStatus::Failed),
        other => Err(Error::Internal(format!(
            "unknown probe status '{other}' in store"
        ))),
    }
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    owner_id: String,
    name: String,
    current_phase: String,
    phase_status: String,
    version: i64,
    pattern: serde_json::Value,
    fingerprint: String,
    requested_count: i64,
    results: serde_json::Value,
    metadata: serde_json::Value,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CampaignRow {
    fn into_campaign(
        self,
        counters: std::collections::BTreeMap<Phase, PhaseCounters>,
    ) -> Result<Campaign> {
        Ok(Campaign {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            current_phase: parse_phase(&self.current_phase)?,
            phase_status: parse_status(&self.phase_status)?,
            version: self.version,
            pattern: serde_json::from_value(self.pattern)?,
            fingerprint: self.fingerprint,
            requested_count: self.requested_count as u64,
            counters,
            results: serde_json::from_value(self.results)?,
            metadata: match self.metadata {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    phase: String,
    total: i64,
    processed: i64,
    succeeded: i64,
    failed: i64,
}

#[derive(sqlx::FromRow)]
struct GeneratedRow {
    campaign_id: Uuid,
    global_offset: i64,
    domain_name: String,
    created_at: DateTime<Utc>,
}

impl From<GeneratedRow> for GeneratedDomain {
    fn from(row: GeneratedRow) -> Self {
        Self {
            campaign_id: row.campaign_id,
            global_offset: row.global_offset as u64,
            domain_name: row.domain_name,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DnsRow {
    campaign_id: Uuid,
    domain_name: String,
    persona_id: Uuid,
    status: String,
    resolved_addresses: serde_json::Value,
    error_kind: Option<String>,
    attempts: i32,
    last_checked_at: DateTime<Utc>,
}

impl DnsRow {
    fn into_result(self) -> Result<DnsResult> {
        Ok(DnsResult {
            campaign_id: self.campaign_id,
            domain_name: self.domain_name,
            persona_id: self.persona_id,
            status: parse_probe_status(&self.status)?,
            resolved_addresses: serde_json::from_value(self.resolved_addresses)?,
            error_kind: self
                .error_kind
                .map(|k| serde_json::from_value(serde_json::Value::String(k)))
                .transpose()?,
            attempts: self.attempts as u32,
            last_checked_at: self.last_checked_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HttpRow {
    campaign_id: Uuid,
    domain_name: String,
    persona_id: Uuid,
    proxy_id: Option<Uuid>,
    status: String,
    http_status: Option<i16>,
    final_url: Option<String>,
    matched_keywords: serde_json::Value,
    body_truncated: bool,
    error_kind: Option<String>,
    attempts: i32,
    last_checked_at: DateTime<Utc>,
}

impl HttpRow {
    fn into_result(self) -> Result<HttpResult> {
        Ok(HttpResult {
            campaign_id: self.campaign_id,
            domain_name: self.domain_name,
            persona_id: self.persona_id,
            proxy_id: self.proxy_id,
            status: parse_probe_status(&self.status)?,
            http_status: self.http_status.map(|s| s as u16),
            final_url: self.final_url,
            matched_keywords: serde_json::from_value(self.matched_keywords)?,
            body_truncated: self.body_truncated,
            error_kind: self
                .error_kind
                .map(|k| serde_json::from_value(serde_json::Value::String(k)))
                .transpose()?,
            attempts: self.attempts as u32,
            last_checked_at: self.last_checked_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    campaign_id: Uuid,
    phase: String,
    payload: serde_json::Value,
    priority: i32,
    visible_at: DateTime<Utc>,
    claimed_by: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            campaign_id: self.campaign_id,
            phase: parse_phase(&self.phase)?,
            payload: serde_json::from_value::<JobPayload>(self.payload)?,
            priority: self.priority,
            visible_at: self.visible_at,
            claimed_by: self.claimed_by,
            claim_expires_at: self.claim_expires_at,
            attempts: self.attempts as u32,
            last_error: self.last_error,
        })
    }
}

impl PgStore {
    async fn load_counters(
        &self,
        campaign_id: Uuid,
    ) -> Result<std::collections::BTreeMap<Phase, PhaseCounters>> {
        let rows = sqlx::query_as::<_, CounterRow>(
            "SELECT phase, total, processed, succeeded, failed FROM phase_counters WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        let mut counters = std::collections::BTreeMap::new();
        for row in rows {
            counters.insert(
                parse_phase(&row.phase)?,
                PhaseCounters {
                    total: row.total as u64,
                    processed: row.processed as u64,
                    succeeded: row.succeeded as u64,
                    failed: row.failed as u64,
                },
            );
        }
        Ok(counters)
    }
}

#[async_trait]
impl EngineStore for PgStore {
    async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let fingerprint = new.pattern.fingerprint();
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, owner_id, name, current_phase, phase_status, version,
                pattern, fingerprint, requested_count, results, metadata,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8, '{}', '{}', $9, $9)
            "#,
        )
        .bind(id)
        .bind(&new.owner_id)
        .bind(&new.name)
        .bind(phase_str(Phase::Generation))
        .bind(status_str(PhaseStatus::Configured))
        .bind(serde_json::to_value(&new.pattern)?)
        .bind(&fingerprint)
        .bind(new.requested_count as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_campaign(id)
            .await?
            .ok_or_else(|| Error::Internal("campaign vanished after insert".into()))
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>> {
        let row = sqlx::query_as::<_, CampaignRow>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let counters = self.load_counters(id).await?;
                Ok(Some(row.into_campaign(counters)?))
            }
            None => Ok(None),
        }
    }

    async fn list_campaigns(
        &self,
        owner_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Campaign>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query_as::<_, CampaignRow>(
                    "SELECT * FROM campaigns WHERE owner_id = $1 ORDER BY updated_at DESC, id ASC LIMIT $2 OFFSET $3",
                )
                .bind(owner)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CampaignRow>(
                    "SELECT * FROM campaigns ORDER BY updated_at DESC, id ASC LIMIT $1 OFFSET $2",
                )
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        let mut campaigns = Vec::with_capacity(rows.len());
        for row in rows {
            let counters = self.load_counters(row.id).await?;
            campaigns.push(row.into_campaign(counters)?);
        }
        Ok(campaigns)
    }

    async fn update_campaign(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: CampaignPatch,
    ) -> Result<Campaign> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, CampaignRow>(
            "SELECT * FROM campaigns WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found(format_args!("campaign {id}")))?;

        if row.version != expected_version {
            return Err(Error::Conflict(format!(
                "campaign {id} is at version {}, expected {expected_version}",
                row.version
            )));
        }

        let current_phase = patch
            .current_phase
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| row.current_phase.clone());
        let phase_status = patch
            .phase_status
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| row.phase_status.clone());

        let mut metadata = match row.metadata.clone() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in patch.metadata {
            metadata.insert(key, value);
        }
        let last_error = match patch.last_error {
            Some(value) => value,
            None => row.last_error.clone(),
        };
        let results = match patch.results {
            Some(results) => serde_json::to_value(&results)?,
            None => row.results.clone(),
        };

        sqlx::query(
            r#"
            UPDATE campaigns
            SET current_phase = $2, phase_status = $3, metadata = $4,
                last_error = $5, results = $6, version = version + 1,
                updated_at = $7
            WHERE id = $1 AND version = $8
            "#,
        )
        .bind(id)
        .bind(&current_phase)
        .bind(&phase_status)
        .bind(serde_json::Value::Object(metadata))
        .bind(last_error)
        .bind(results)
        .bind(Utc::now())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_campaign(id)
            .await?
            .ok_or_else(|| Error::not_found(format_args!("campaign {id}")))
    }

    async fn delete_campaign(&self, id: Uuid) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(Error::not_found(format_args!("campaign {id}")));
        }
        Ok(())
    }

    async fn set_phase_total(&self, campaign_id: Uuid, phase: Phase, total: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO phase_counters (campaign_id, phase, total, processed, succeeded, failed)
            VALUES ($1, $2, $3, 0, 0, 0)
            ON CONFLICT (campaign_id, phase) DO UPDATE
            SET total = EXCLUDED.total, processed = 0, succeeded = 0, failed = 0
            "#,
        )
        .bind(campaign_id)
        .bind(phase_str(phase))
        .bind(total as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_counters(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        delta: CounterDelta,
    ) -> Result<PhaseCounters> {
        let row = sqlx::query_as::<_, CounterRow>(
            r#"
            INSERT INTO phase_counters (campaign_id, phase, total, processed, succeeded, failed)
            VALUES ($1, $2, 0, $3, $4, $5)
            ON CONFLICT (campaign_id, phase) DO UPDATE
            SET processed = phase_counters.processed + EXCLUDED.processed,
                succeeded = phase_counters.succeeded + EXCLUDED.succeeded,
                failed = phase_counters.failed + EXCLUDED.failed
            RETURNING phase, total, processed, succeeded, failed
            "#,
        )
        .bind(campaign_id)
        .bind(phase_str(phase))
        .bind(delta.processed as i64)
        .bind(delta.succeeded as i64)
        .bind(delta.failed as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(PhaseCounters {
            total: row.total as u64,
            processed: row.processed as u64,
            succeeded: row.succeeded as u64,
            failed: row.failed as u64,
        })
    }

    async fn clear_phase_failures(&self, campaign_id: Uuid, phase: Phase) -> Result<()> {
        sqlx::query(
            "UPDATE phase_counters SET failed = 0 WHERE campaign_id = $1 AND phase = $2",
        )
        .bind(campaign_id)
        .bind(phase_str(phase))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reconcile_counters(&self, campaign_id: Uuid, phase: Phase) -> Result<PhaseCounters> {
        let (table, ok_filter): (&str, &str) = match phase {
            Phase::Generation => ("generated_domains", ""),
            Phase::DnsValidation => ("dns_results", "status = 'ok'"),
            Phase::HttpKeywordValidation => ("http_results", "status = 'ok'"),
            Phase::Analysis => ("leads", ""),
        };

        let (rows, ok_rows): (i64, i64) = if ok_filter.is_empty() {
            let total: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {table} WHERE campaign_id = $1"
            ))
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;
            (total, total)
        } else {
            let total: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {table} WHERE campaign_id = $1"
            ))
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;
            let ok: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {table} WHERE campaign_id = $1 AND {ok_filter}"
            ))
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;
            (total, ok)
        };

        let row = match phase {
            // Result rows witness processed work; generation and analysis
            // track processed through deltas only.
            Phase::DnsValidation | Phase::HttpKeywordValidation => {
                sqlx::query_as::<_, CounterRow>(
                    r#"
                    INSERT INTO phase_counters (campaign_id, phase, total, processed, succeeded, failed)
                    VALUES ($1, $2, 0, $3, $4, $5)
                    ON CONFLICT (campaign_id, phase) DO UPDATE
                    SET processed = GREATEST(phase_counters.processed, EXCLUDED.processed),
                        succeeded = EXCLUDED.succeeded,
                        failed = GREATEST(phase_counters.failed, EXCLUDED.failed)
                    RETURNING phase, total, processed, succeeded, failed
                    "#,
                )
                .bind(campaign_id)
                .bind(phase_str(phase))
                .bind(rows)
                .bind(ok_rows)
                .bind(rows - ok_rows)
                .fetch_one(&self.pool)
                .await?
            }
            Phase::Generation | Phase::Analysis => {
                sqlx::query_as::<_, CounterRow>(
                    r#"
                    INSERT INTO phase_counters (campaign_id, phase, total, processed, succeeded, failed)
                    VALUES ($1, $2, 0, 0, $3, 0)
                    ON CONFLICT (campaign_id, phase) DO UPDATE
                    SET succeeded = EXCLUDED.succeeded
                    RETURNING phase, total, processed, succeeded, failed
                    "#,
                )
                .bind(campaign_id)
                .bind(phase_str(phase))
                .bind(ok_rows)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(PhaseCounters {
            total: row.total as u64,
            processed: row.processed as u64,
            succeeded: row.succeeded as u64,
            failed: row.failed as u64,
        })
    }

    async fn insert_generated(&self, rows: Vec<GeneratedDomain>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO generated_domains (campaign_id, global_offset, domain_name, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(row.campaign_id)
            .bind(row.global_offset as i64)
            .bind(&row.domain_name)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn count_generated(&self, campaign_id: Uuid) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM generated_domains WHERE campaign_id = $1")
                .bind(campaign_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn generated_in_range(
        &self,
        campaign_id: Uuid,
        start: u64,
        end: u64,
    ) -> Result<Vec<GeneratedDomain>> {
        let rows = sqlx::query_as::<_, GeneratedRow>(
            r#"
            SELECT * FROM generated_domains
            WHERE campaign_id = $1 AND global_offset >= $2 AND global_offset < $3
            ORDER BY global_offset ASC
            "#,
        )
        .bind(campaign_id)
        .bind(start as i64)
        .bind(end as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_generated(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<GeneratedDomain>> {
        let after = match cursor {
            Some(encoded) => {
                let cursor = Cursor::decode(encoded)?;
                Some(cursor.sort_key.parse::<i64>().map_err(|_| {
                    Error::validation("malformed pagination cursor")
                })?)
            }
            None => None,
        };
        let rows = sqlx::query_as::<_, GeneratedRow>(
            r#"
            SELECT * FROM generated_domains
            WHERE campaign_id = $1 AND global_offset > $2
            ORDER BY global_offset ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(after.unwrap_or(-1))
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut items: Vec<GeneratedDomain> = rows.into_iter().map(Into::into).collect();
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|row| {
                Cursor::new(row.global_offset.to_string(), row.domain_name.clone()).encode()
            })
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn upsert_dns_result(&self, row: DnsResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dns_results (
                campaign_id, domain_name, persona_id, status,
                resolved_addresses, error_kind, attempts, last_checked_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 1, $7)
            ON CONFLICT (campaign_id, domain_name) DO UPDATE
            SET persona_id = EXCLUDED.persona_id,
                status = EXCLUDED.status,
                resolved_addresses = EXCLUDED.resolved_addresses,
                error_kind = EXCLUDED.error_kind,
                attempts = dns_results.attempts + 1,
                last_checked_at = EXCLUDED.last_checked_at
            "#,
        )
        .bind(row.campaign_id)
        .bind(&row.domain_name)
        .bind(row.persona_id)
        .bind(probe_status_str(row.status))
        .bind(serde_json::to_value(&row.resolved_addresses)?)
        .bind(
            row.error_kind
                .map(|k| serde_json::to_value(k).map(|v| v.as_str().map(str::to_string)))
                .transpose()?
                .flatten(),
        )
        .bind(row.last_checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dns_results(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<DnsResult>> {
        let after = cursor.map(Cursor::decode).transpose()?.map(|c| c.sort_key);
        let rows = sqlx::query_as::<_, DnsRow>(
            r#"
            SELECT * FROM dns_results
            WHERE campaign_id = $1 AND domain_name > $2
            ORDER BY domain_name ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(after.unwrap_or_default())
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(DnsRow::into_result)
            .collect::<Result<Vec<_>>>()?;
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items
                .last()
                .map(|row| Cursor::new(row.domain_name.clone(), row.domain_name.clone()).encode())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn count_dns_results(
        &self,
        campaign_id: Uuid,
        status: Option<ProbeStatus>,
    ) -> Result<u64> {
        let count: i64 = match status {
            Some(status) => sqlx::query_scalar(
                "SELECT COUNT(*) FROM dns_results WHERE campaign_id = $1 AND status = $2",
            )
            .bind(campaign_id)
            .bind(probe_status_str(status))
            .fetch_one(&self.pool)
            .await?,
            None => sqlx::query_scalar("SELECT COUNT(*) FROM dns_results WHERE campaign_id = $1")
                .bind(campaign_id)
                .fetch_one(&self.pool)
                .await?,
        };
        Ok(count as u64)
    }

    async fn dns_resolved_domains(
        &self,
        campaign_id: Uuid,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT domain_name FROM dns_results
            WHERE campaign_id = $1 AND status = 'ok' AND domain_name > $2
            ORDER BY domain_name ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(after.unwrap_or_default())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn upsert_http_result(&self, row: HttpResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO http_results (
                campaign_id, domain_name, persona_id, proxy_id, status,
                http_status, final_url, matched_keywords, body_truncated,
                error_kind, attempts, last_checked_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1, $11)
            ON CONFLICT (campaign_id, domain_name) DO UPDATE
            SET persona_id = EXCLUDED.persona_id,
                proxy_id = EXCLUDED.proxy_id,
                status = EXCLUDED.status,
                http_status = EXCLUDED.http_status,
                final_url = EXCLUDED.final_url,
                matched_keywords = EXCLUDED.matched_keywords,
                body_truncated = EXCLUDED.body_truncated,
                error_kind = EXCLUDED.error_kind,
                attempts = http_results.attempts + 1,
                last_checked_at = EXCLUDED.last_checked_at
            "#,
        )
        .bind(row.campaign_id)
        .bind(&row.domain_name)
        .bind(row.persona_id)
        .bind(row.proxy_id)
        .bind(probe_status_str(row.status))
        .bind(row.http_status.map(|s| s as i16))
        .bind(&row.final_url)
        .bind(serde_json::to_value(&row.matched_keywords)?)
        .bind(row.body_truncated)
        .bind(
            row.error_kind
                .map(|k| serde_json::to_value(k).map(|v| v.as_str().map(str::to_string)))
                .transpose()?
                .flatten(),
        )
        .bind(row.last_checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_http_results(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<HttpResult>> {
        let after = cursor.map(Cursor::decode).transpose()?.map(|c| c.sort_key);
        let rows = sqlx::query_as::<_, HttpRow>(
            r#"
            SELECT * FROM http_results
            WHERE campaign_id = $1 AND domain_name > $2
            ORDER BY domain_name ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(after.unwrap_or_default())
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(HttpRow::into_result)
            .collect::<Result<Vec<_>>>()?;
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items
                .last()
                .map(|row| Cursor::new(row.domain_name.clone(), row.domain_name.clone()).encode())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn count_http_results(
        &self,
        campaign_id: Uuid,
        status: Option<ProbeStatus>,
    ) -> Result<u64> {
        let count: i64 = match status {
            Some(status) => sqlx::query_scalar(
                "SELECT COUNT(*) FROM http_results WHERE campaign_id = $1 AND status = $2",
            )
            .bind(campaign_id)
            .bind(probe_status_str(status))
            .fetch_one(&self.pool)
            .await?,
            None => sqlx::query_scalar("SELECT COUNT(*) FROM http_results WHERE campaign_id = $1")
                .bind(campaign_id)
                .fetch_one(&self.pool)
                .await?,
        };
        Ok(count as u64)
    }

    async fn http_matched_domains(
        &self,
        campaign_id: Uuid,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT domain_name FROM http_results
            WHERE campaign_id = $1
              AND jsonb_array_length(matched_keywords) > 0
              AND domain_name > $2
            ORDER BY domain_name ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(after.unwrap_or_default())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn get_http_results(
        &self,
        campaign_id: Uuid,
        domains: &[String],
    ) -> Result<Vec<HttpResult>> {
        let rows = sqlx::query_as::<_, HttpRow>(
            "SELECT * FROM http_results WHERE campaign_id = $1 AND domain_name = ANY($2)",
        )
        .bind(campaign_id)
        .bind(domains)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HttpRow::into_result).collect()
    }

    async fn unprobed_domains(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let sql = match phase {
            Phase::Generation => {
                return Err(Error::validation(
                    "generation has no probe results to backfill",
                ));
            }
            Phase::DnsValidation => {
                r#"
                SELECT g.domain_name FROM generated_domains g
                LEFT JOIN dns_results d
                    ON d.campaign_id = g.campaign_id AND d.domain_name = g.domain_name
                WHERE g.campaign_id = $1 AND d.domain_name IS NULL AND g.domain_name > $2
                ORDER BY g.domain_name ASC
                LIMIT $3
                "#
            }
            Phase::HttpKeywordValidation => {
                r#"
                SELECT d.domain_name FROM dns_results d
                LEFT JOIN http_results h
                    ON h.campaign_id = d.campaign_id AND h.domain_name = d.domain_name
                WHERE d.campaign_id = $1 AND d.status = 'ok'
                  AND h.domain_name IS NULL AND d.domain_name > $2
                ORDER BY d.domain_name ASC
                LIMIT $3
                "#
            }
            Phase::Analysis => {
                r#"
                SELECT h.domain_name FROM http_results h
                LEFT JOIN leads l
                    ON l.campaign_id = h.campaign_id AND l.domain_name = h.domain_name
                WHERE h.campaign_id = $1 AND jsonb_array_length(h.matched_keywords) > 0
                  AND l.domain_name IS NULL AND h.domain_name > $2
                ORDER BY h.domain_name ASC
                LIMIT $3
                "#
            }
        };
        let names: Vec<String> = sqlx::query_scalar(sql)
            .bind(campaign_id)
            .bind(after.unwrap_or_default())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn insert_leads(&self, rows: Vec<Lead>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO leads (campaign_id, domain_name, categories, score, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(row.campaign_id)
            .bind(&row.domain_name)
            .bind(serde_json::to_value(&row.categories)?)
            .bind(row.score as i32)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_leads(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Lead>> {
        #[derive(sqlx::FromRow)]
        struct LeadRow {
            campaign_id: Uuid,
            domain_name: String,
            categories: serde_json::Value,
            score: i32,
            created_at: DateTime<Utc>,
        }

        let after = cursor.map(Cursor::decode).transpose()?.map(|c| c.sort_key);
        let rows = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT * FROM leads
            WHERE campaign_id = $1 AND domain_name > $2
            ORDER BY domain_name ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(after.unwrap_or_default())
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(|row| {
                Ok(Lead {
                    campaign_id: row.campaign_id,
                    domain_name: row.domain_name,
                    categories: serde_json::from_value(row.categories)?,
                    score: row.score as u32,
                    created_at: row.created_at,
                })
            })
            .collect::<Result<Vec<Lead>>>()?;
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items
                .last()
                .map(|row| Cursor::new(row.domain_name.clone(), row.domain_name.clone()).encode())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn reserve_offsets(&self, fingerprint: &str, count: u64) -> Result<OffsetReservation> {
        // One statement: the conflict-target row lock serializes concurrent
        // reservations, and the numeric cast keeps arbitrary precision.
        let end_text: String = sqlx::query_scalar(
            r#"
            INSERT INTO offset_state (fingerprint, last_offset)
            VALUES ($1, $2)
            ON CONFLICT (fingerprint) DO UPDATE
            SET last_offset = ((offset_state.last_offset)::numeric + ($2)::numeric)::text
            RETURNING last_offset
            "#,
        )
        .bind(fingerprint)
        .bind(count.to_string())
        .fetch_one(&self.pool)
        .await?;

        let end: BigUint = end_text
            .parse()
            .map_err(|_| Error::Internal(format!("malformed offset state '{end_text}'")))?;
        let start = &end - BigUint::from(count);
        Ok(OffsetReservation { start, end })
    }

    async fn peek_offset(&self, fingerprint: &str) -> Result<BigUint> {
        let text: Option<String> =
            sqlx::query_scalar("SELECT last_offset FROM offset_state WHERE fingerprint = $1")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        match text {
            Some(text) => text
                .parse()
                .map_err(|_| Error::Internal(format!("malformed offset state '{text}'"))),
            None => Ok(BigUint::zero()),
        }
    }

    async fn upsert_persona(&self, persona: Persona) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO personas (id, name, config, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, config = EXCLUDED.config
            "#,
        )
        .bind(persona.id)
        .bind(&persona.name)
        .bind(serde_json::to_value(&persona.config)?)
        .bind(persona.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_persona(&self, id: Uuid) -> Result<Option<Persona>> {
        #[derive(sqlx::FromRow)]
        struct PersonaRow {
            id: Uuid,
            name: String,
            config: serde_json::Value,
            created_at: DateTime<Utc>,
        }
        let row = sqlx::query_as::<_, PersonaRow>("SELECT * FROM personas WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Persona {
                id: row.id,
                name: row.name,
                config: serde_json::from_value(row.config)?,
                created_at: row.created_at,
            })
        })
        .transpose()
    }

    async fn list_personas(&self, kind: Option<PersonaKind>) -> Result<Vec<Persona>> {
        #[derive(sqlx::FromRow)]
        struct PersonaRow {
            id: Uuid,
            name: String,
            config: serde_json::Value,
            created_at: DateTime<Utc>,
        }
        let rows =
            sqlx::query_as::<_, PersonaRow>("SELECT * FROM personas ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?;
        let mut personas = Vec::with_capacity(rows.len());
        for row in rows {
            let persona = Persona {
                id: row.id,
                name: row.name,
                config: serde_json::from_value(row.config)?,
                created_at: row.created_at,
            };
            if kind.is_none_or(|k| persona.kind() == k) {
                personas.push(persona);
            }
        }
        Ok(personas)
    }

    async fn upsert_proxy(&self, proxy: Proxy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proxies (id, protocol, address, username, password, enabled, healthy)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET protocol = EXCLUDED.protocol, address = EXCLUDED.address,
                username = EXCLUDED.username, password = EXCLUDED.password,
                enabled = EXCLUDED.enabled, healthy = EXCLUDED.healthy
            "#,
        )
        .bind(proxy.id)
        .bind(proxy.protocol.scheme())
        .bind(&proxy.address)
        .bind(proxy.credentials.as_ref().map(|c| c.username.clone()))
        .bind(proxy.credentials.as_ref().map(|c| c.password.clone()))
        .bind(proxy.enabled)
        .bind(proxy.healthy)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        #[derive(sqlx::FromRow)]
        struct ProxyRow {
            id: Uuid,
            protocol: String,
            address: String,
            username: Option<String>,
            password: Option<String>,
            enabled: bool,
            healthy: bool,
        }
        let rows = sqlx::query_as::<_, ProxyRow>("SELECT * FROM proxies ORDER BY address ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let protocol = match row.protocol.as_str() {
                    "http" => crate::model::ProxyProtocol::Http,
                    "https" => crate::model::ProxyProtocol::Https,
                    "socks4" => crate::model::ProxyProtocol::Socks4,
                    "socks5" => crate::model::ProxyProtocol::Socks5,
                    other => {
                        return Err(Error::Internal(format!(
                            "unknown proxy protocol '{other}' in store"
                        )))
                    }
                };
                Ok(Proxy {
                    id: row.id,
                    protocol,
                    address: row.address,
                    credentials: row.username.zip(row.password).map(|(username, password)| {
                        crate::model::ProxyCredentials { username, password }
                    }),
                    enabled: row.enabled,
                    healthy: row.healthy,
                })
            })
            .collect()
    }

    async fn set_proxy_health(&self, id: Uuid, healthy: bool) -> Result<()> {
        let updated = sqlx::query("UPDATE proxies SET healthy = $2 WHERE id = $1")
            .bind(id)
            .bind(healthy)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::not_found(format_args!("proxy {id}")));
        }
        Ok(())
    }

    async fn upsert_keyword_set(&self, set: KeywordSet) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO keyword_sets (id, name, rules, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, rules = EXCLUDED.rules
            "#,
        )
        .bind(set.id)
        .bind(&set.name)
        .bind(serde_json::to_value(&set.rules)?)
        .bind(set.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_keyword_set(&self, id: Uuid) -> Result<Option<KeywordSet>> {
        #[derive(sqlx::FromRow)]
        struct KeywordSetRow {
            id: Uuid,
            name: String,
            rules: serde_json::Value,
            created_at: DateTime<Utc>,
        }
        let row = sqlx::query_as::<_, KeywordSetRow>("SELECT * FROM keyword_sets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(KeywordSet {
                id: row.id,
                name: row.name,
                rules: serde_json::from_value(row.rules)?,
                created_at: row.created_at,
            })
        })
        .transpose()
    }

    async fn outbox_append(&self, campaign_id: Uuid, event: EngineEvent) -> Result<u64> {
        // Concurrent appenders can race the per-campaign serial; the unique
        // constraint rejects the loser, which simply recomputes.
        for _ in 0..5 {
            let result: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
                r#"
                INSERT INTO outbox (campaign_id, seq, at, payload)
                VALUES (
                    $1,
                    COALESCE((SELECT MAX(seq) FROM outbox WHERE campaign_id = $1), 0) + 1,
                    $2,
                    $3
                )
                RETURNING seq
                "#,
            )
            .bind(campaign_id)
            .bind(Utc::now())
            .bind(serde_json::to_value(&event)?)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(seq) => return Ok(seq as u64),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::TransientStore(
            "outbox sequence contention persisted across retries".into(),
        ))
    }

    async fn outbox_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        #[derive(sqlx::FromRow)]
        struct OutboxRow {
            id: i64,
            campaign_id: Uuid,
            seq: i64,
            at: DateTime<Utc>,
            payload: serde_json::Value,
        }
        let rows = sqlx::query_as::<_, OutboxRow>(
            "SELECT id, campaign_id, seq, at, payload FROM outbox WHERE NOT published ORDER BY id ASC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(OutboxEntry {
                    id: row.id,
                    envelope: EventEnvelope {
                        campaign_id: row.campaign_id,
                        seq: row.seq as u64,
                        at: row.at,
                        event: serde_json::from_value(row.payload)?,
                    },
                })
            })
            .collect()
    }

    async fn outbox_mark_published(&self, ids: &[i64]) -> Result<()> {
        sqlx::query("UPDATE outbox SET published = TRUE WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_records (id, actor, action, entity_kind, entity_id, details, ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(&record.actor)
        .bind(&record.action)
        .bind(&record.entity_kind)
        .bind(record.entity_id)
        .bind(&record.details)
        .bind(record.ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, entity_id: Option<Uuid>, limit: usize) -> Result<Vec<AuditRecord>> {
        #[derive(sqlx::FromRow)]
        struct AuditRow {
            id: Uuid,
            actor: Option<String>,
            action: String,
            entity_kind: String,
            entity_id: Option<Uuid>,
            details: serde_json::Value,
            ts: DateTime<Utc>,
        }
        let rows = match entity_id {
            Some(entity) => sqlx::query_as::<_, AuditRow>(
                "SELECT * FROM audit_records WHERE entity_id = $1 ORDER BY ts DESC LIMIT $2",
            )
            .bind(entity)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?,
            None => sqlx::query_as::<_, AuditRow>(
                "SELECT * FROM audit_records ORDER BY ts DESC LIMIT $1",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?,
        };
        Ok(rows
            .into_iter()
            .map(|row| AuditRecord {
                id: row.id,
                actor: row.actor,
                action: row.action,
                entity_kind: row.entity_kind,
                entity_id: row.entity_id,
                details: row.details,
                ts: row.ts,
            })
            .collect())
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(&self, jobs: Vec<NewJob>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.enqueue_wait;
        loop {
            let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE NOT dead")
                .fetch_one(&self.pool)
                .await?;
            if live as usize + jobs.len() <= self.watermark {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Overloaded(format!(
                    "queue above watermark of {} items",
                    self.watermark
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs (id, campaign_id, phase, payload, priority, visible_at, attempts)
                VALUES ($1, $2, $3, $4, $5, $6, 0)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(job.campaign_id)
            .bind(phase_str(job.phase))
            .bind(serde_json::to_value(&job.payload)?)
            .bind(job.priority)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim(&self, worker_id: &str, phase: Phase, lease: Duration) -> Result<Option<Job>> {
        let expires = Utc::now()
            + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET claimed_by = $1, claim_expires_at = $2, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE phase = $3 AND NOT dead AND claimed_by IS NULL AND visible_at <= now()
                ORDER BY priority DESC, visible_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, campaign_id, phase, payload, priority, visible_at,
                      claimed_by, claim_expires_at, attempts, last_error
            "#,
        )
        .bind(worker_id)
        .bind(expires)
        .bind(phase_str(phase))
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, job_id: Uuid, error: &str) -> Result<NackOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, JobRow>("SELECT id, campaign_id, phase, payload, priority, visible_at, claimed_by, claim_expires_at, attempts, last_error FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found(format_args!("job {job_id}")))?;

        if row.attempts as u32 >= self.policy.max_attempts {
            sqlx::query(
                "UPDATE jobs SET dead = TRUE, claimed_by = NULL, claim_expires_at = NULL, last_error = $2 WHERE id = $1",
            )
            .bind(job_id)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            tracing::warn!(job_id = %job_id, attempts = row.attempts, "Job dead-lettered");
            return Ok(NackOutcome::DeadLettered);
        }

        let visible_at = Utc::now()
            + chrono::Duration::from_std(self.policy.delay(row.attempts as u32))
                .unwrap_or(chrono::Duration::seconds(2));
        sqlx::query(
            "UPDATE jobs SET claimed_by = NULL, claim_expires_at = NULL, visible_at = $2, last_error = $3 WHERE id = $1",
        )
        .bind(job_id)
        .bind(visible_at)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(NackOutcome::Requeued { visible_at })
    }

    async fn release(&self, job_id: Uuid, delay: Duration) -> Result<()> {
        let visible_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET claimed_by = NULL, claim_expires_at = NULL,
                attempts = GREATEST(attempts - 1, 0), visible_at = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(visible_at)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::not_found(format_args!("job {job_id}")));
        }
        Ok(())
    }

    async fn reap_expired(&self) -> Result<u64> {
        let reaped = sqlx::query(
            r#"
            UPDATE jobs SET claimed_by = NULL, claim_expires_at = NULL
            WHERE claimed_by IS NOT NULL AND claim_expires_at < now() AND NOT dead
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(reaped.rows_affected())
    }

    async fn pending_for_campaign(&self, campaign_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE campaign_id = $1 AND NOT dead",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn dead_letter_count(&self, campaign_id: Uuid) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE campaign_id = $1 AND dead")
                .bind(campaign_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn purge_campaign(&self, campaign_id: Uuid) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM jobs WHERE campaign_id = $1")
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        Ok(purged.rows_affected())
    }
}
