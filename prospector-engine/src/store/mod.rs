//! Typed persistent storage
//!
//! The store is the single source of truth; every cross-component mutation
//! goes through it. Each trait method is atomic in its backend: the durable
//! backend brackets multi-row methods in transactions, the in-memory backend
//! applies them under one lock with idempotent upsert keys, so either way a
//! re-delivered batch converges rather than duplicating.

use async_trait::async_trait;
use base64::Engine as _;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EngineEvent, OutboxEntry};
use crate::model::{
    AuditRecord, Campaign, CampaignPatch, CounterDelta, DnsResult, GeneratedDomain, HttpResult,
    KeywordSet, Lead, NewCampaign, Persona, PersonaKind, Phase, PhaseCounters, ProbeStatus, Proxy,
};

pub mod memory;

#[cfg(feature = "database")]
pub mod postgres;

/// One page of a cursor-paginated read
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` once exhausted
    pub next_cursor: Option<String>,
}

/// Decoded pagination cursor: the last `(sort_key, id)` pair emitted
///
/// Opaque to callers; rows strictly after it form the next page, so the
/// cursor stays stable under concurrent inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub sort_key: String,
    pub id: String,
}

impl Cursor {
    const SEPARATOR: char = '\u{1f}';

    pub fn new(sort_key: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            sort_key: sort_key.into(),
            id: id.into(),
        }
    }

    /// Encode to the opaque wire form
    pub fn encode(&self) -> String {
        let raw = format!("{}{}{}", self.sort_key, Self::SEPARATOR, self.id);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a wire cursor; malformed input is a `Validation` error
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| Error::validation("malformed pagination cursor"))?;
        let raw = String::from_utf8(raw)
            .map_err(|_| Error::validation("malformed pagination cursor"))?;
        let (sort_key, id) = raw
            .split_once(Self::SEPARATOR)
            .ok_or_else(|| Error::validation("malformed pagination cursor"))?;
        Ok(Self::new(sort_key, id))
    }
}

/// A reserved half-open offset range `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetReservation {
    pub start: BigUint,
    pub end: BigUint,
}

impl OffsetReservation {
    /// Number of offsets reserved
    pub fn len(&self) -> BigUint {
        &self.end - &self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Start as `u64`; generated rows index their offsets at machine width
    pub fn start_u64(&self) -> Result<u64> {
        self.start
            .to_u64()
            .ok_or_else(|| Error::validation("reserved offset range exceeds 64-bit row offsets"))
    }

    /// End as `u64`
    pub fn end_u64(&self) -> Result<u64> {
        self.end
            .to_u64()
            .ok_or_else(|| Error::validation("reserved offset range exceeds 64-bit row offsets"))
    }
}

/// Typed storage for campaigns, results, offsets, personas, and audit records
#[async_trait]
pub trait EngineStore: Send + Sync {
    // ------------------------------------------------------------------
    // Campaigns
    // ------------------------------------------------------------------

    /// Create a campaign; the caller has already validated the pattern
    async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>>;

    /// Campaigns for an owner, most recently updated first
    async fn list_campaigns(
        &self,
        owner_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Campaign>>;

    /// Apply a patch under an optimistic version check
    ///
    /// Version mismatch fails with `Conflict` and leaves the row untouched.
    async fn update_campaign(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: CampaignPatch,
    ) -> Result<Campaign>;

    /// Delete a campaign and cascade to all child rows
    async fn delete_campaign(&self, id: Uuid) -> Result<()>;

    // ------------------------------------------------------------------
    // Phase counters
    // ------------------------------------------------------------------

    /// Reset a phase's counters to `{total, 0, 0, 0}`
    async fn set_phase_total(&self, campaign_id: Uuid, phase: Phase, total: u64) -> Result<()>;

    /// Atomically add a delta, returning the updated counters
    async fn bump_counters(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        delta: CounterDelta,
    ) -> Result<PhaseCounters>;

    /// Zero the failure counter, preserving the rest
    async fn clear_phase_failures(&self, campaign_id: Uuid, phase: Phase) -> Result<()>;

    /// Recompute counters from the phase's result rows and store them
    ///
    /// Called at batch boundaries so counters equal the cardinalities they
    /// describe at quiescence.
    async fn reconcile_counters(&self, campaign_id: Uuid, phase: Phase) -> Result<PhaseCounters>;

    // ------------------------------------------------------------------
    // Generated domains
    // ------------------------------------------------------------------

    /// Insert generated rows, skipping duplicates
    ///
    /// A unique violation means a concurrent reservation already produced the
    /// row; it is expected and not an error. Returns the number inserted.
    async fn insert_generated(&self, rows: Vec<GeneratedDomain>) -> Result<usize>;

    async fn count_generated(&self, campaign_id: Uuid) -> Result<u64>;

    /// Rows with offsets in `[start, end)`, ascending
    async fn generated_in_range(
        &self,
        campaign_id: Uuid,
        start: u64,
        end: u64,
    ) -> Result<Vec<GeneratedDomain>>;

    async fn list_generated(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<GeneratedDomain>>;

    // ------------------------------------------------------------------
    // DNS results
    // ------------------------------------------------------------------

    /// Idempotent upsert keyed on `(campaign_id, domain_name)`
    ///
    /// The most recent record wins; the stored attempt counter accumulates.
    async fn upsert_dns_result(&self, row: DnsResult) -> Result<()>;

    async fn list_dns_results(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<DnsResult>>;

    async fn count_dns_results(
        &self,
        campaign_id: Uuid,
        status: Option<ProbeStatus>,
    ) -> Result<u64>;

    /// Page of successfully resolved domain names after `after`, ascending
    async fn dns_resolved_domains(
        &self,
        campaign_id: Uuid,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;

    // ------------------------------------------------------------------
    // HTTP results
    // ------------------------------------------------------------------

    /// Idempotent upsert keyed on `(campaign_id, domain_name)`
    async fn upsert_http_result(&self, row: HttpResult) -> Result<()>;

    async fn list_http_results(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<HttpResult>>;

    async fn count_http_results(
        &self,
        campaign_id: Uuid,
        status: Option<ProbeStatus>,
    ) -> Result<u64>;

    /// Page of domains with at least one keyword match after `after`, ascending
    async fn http_matched_domains(
        &self,
        campaign_id: Uuid,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// HTTP results for an explicit set of domains
    async fn get_http_results(
        &self,
        campaign_id: Uuid,
        domains: &[String],
    ) -> Result<Vec<HttpResult>>;

    /// Page of domains eligible for `phase` that have no recorded result yet
    ///
    /// Used by `retry` to re-enqueue only unprocessed work: generated rows
    /// without a DNS result, resolved rows without an HTTP result, matched
    /// rows without a lead. `Validation` for the generation phase.
    async fn unprobed_domains(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;

    // ------------------------------------------------------------------
    // Leads
    // ------------------------------------------------------------------

    /// Idempotent insert keyed on `(campaign_id, domain_name)`
    async fn insert_leads(&self, rows: Vec<Lead>) -> Result<usize>;

    async fn list_leads(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Lead>>;

    // ------------------------------------------------------------------
    // Offset state
    // ------------------------------------------------------------------

    /// Atomically advance the fingerprint's offset by `count`
    ///
    /// Concurrent reservations serialize: ranges are disjoint with no gaps.
    async fn reserve_offsets(&self, fingerprint: &str, count: u64) -> Result<OffsetReservation>;

    /// Current offset for a fingerprint; zero if never reserved
    async fn peek_offset(&self, fingerprint: &str) -> Result<BigUint>;

    // ------------------------------------------------------------------
    // Personas, proxies, keyword sets
    // ------------------------------------------------------------------

    async fn upsert_persona(&self, persona: Persona) -> Result<()>;
    async fn get_persona(&self, id: Uuid) -> Result<Option<Persona>>;
    async fn list_personas(&self, kind: Option<PersonaKind>) -> Result<Vec<Persona>>;

    async fn upsert_proxy(&self, proxy: Proxy) -> Result<()>;
    async fn list_proxies(&self) -> Result<Vec<Proxy>>;

    /// Health is owned by the external checker; the engine only records it
    async fn set_proxy_health(&self, id: Uuid, healthy: bool) -> Result<()>;

    async fn upsert_keyword_set(&self, set: KeywordSet) -> Result<()>;
    async fn get_keyword_set(&self, id: Uuid) -> Result<Option<KeywordSet>>;

    // ------------------------------------------------------------------
    // Event outbox
    // ------------------------------------------------------------------

    /// Append an event, assigning the campaign's next serial; returns it
    async fn outbox_append(&self, campaign_id: Uuid, event: EngineEvent) -> Result<u64>;

    /// Unpublished entries in append order
    async fn outbox_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    async fn outbox_mark_published(&self, ids: &[i64]) -> Result<()>;

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Append-only; records are never updated or deleted
    async fn append_audit(&self, record: AuditRecord) -> Result<()>;

    /// Most recent records, optionally scoped to one entity
    async fn list_audit(&self, entity_id: Option<Uuid>, limit: usize) -> Result<Vec<AuditRecord>>;
}

/// Offset reservation front-end with transient-fault retry
///
/// Store conflicts under concurrent reservations surface as transient errors;
/// this wrapper retries with exponential backoff and jitter up to a fixed
/// bound before giving up with `TransientStore`.
pub struct OffsetRegistry {
    store: std::sync::Arc<dyn EngineStore>,
    max_retries: u32,
    base_delay: std::time::Duration,
}

impl OffsetRegistry {
    pub fn new(store: std::sync::Arc<dyn EngineStore>) -> Self {
        Self {
            store,
            max_retries: 3,
            base_delay: std::time::Duration::from_millis(50),
        }
    }

    /// Reserve `count` offsets for a pattern fingerprint
    pub async fn reserve(&self, fingerprint: &str, count: u64) -> Result<OffsetReservation> {
        let mut attempt = 0;
        loop {
            match self.store.reserve_offsets(fingerprint, count).await {
                Ok(reservation) => return Ok(reservation),
                Err(e) if e.is_retriable() && attempt < self.max_retries => {
                    attempt += 1;
                    let exp = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    let jitter = {
                        use rand::Rng;
                        rand::rng().random_range(0..=exp.as_millis() as u64)
                    };
                    tracing::warn!(
                        fingerprint,
                        attempt,
                        error = %e,
                        "Offset reservation conflicted, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the current offset without reserving
    pub async fn peek(&self, fingerprint: &str) -> Result<BigUint> {
        self.store.peek_offset(fingerprint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip() {
        let cursor = Cursor::new("42", "widget.example.com");
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(matches!(Cursor::decode("%%%"), Err(Error::Validation(_))));
        let no_separator = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("no-parts");
        assert!(matches!(
            Cursor::decode(&no_separator),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_reservation_bounds() {
        let reservation = OffsetReservation {
            start: BigUint::from(100u32),
            end: BigUint::from(250u32),
        };
        assert_eq!(reservation.len(), BigUint::from(150u32));
        assert_eq!(reservation.start_u64().unwrap(), 100);
        assert_eq!(reservation.end_u64().unwrap(), 250);
        assert!(!reservation.is_empty());
    }

    #[test]
    fn test_oversized_reservation_rejected_at_row_width() {
        let reservation = OffsetReservation {
            start: BigUint::from(u64::MAX) + 1u32,
            end: BigUint::from(u64::MAX) + 2u32,
        };
        assert!(reservation.start_u64().is_err());
    }
}
