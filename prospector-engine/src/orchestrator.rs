//! Campaign orchestration command surface
//!
//! Top-level coordinator: validates commands, drives the lifecycle state
//! machine under optimistic version checks, schedules phase work onto the
//! queue, and emits audit records and outbox events. Probe execution lives in
//! the worker pools; this module never performs network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use num_bigint::BigUint;
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::config::EngineConfig;
use crate::control::ControlRegistry;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::keywords::compile_rules;
use crate::lifecycle::{self, Command};
use crate::model::{
    AnalysisPhaseConfig, AuditRecord, Campaign, CampaignPatch, DnsPhaseConfig, DnsResult,
    GeneratedDomain, GenerationConfig, HttpPhaseConfig, HttpResult, JobPayload, KeywordSet, Lead,
    NewCampaign, NewJob, Persona, PersonaConfig, Phase, PhaseStatus, ProbeStatus, Proxy,
};
use crate::pattern::PatternSpec;
use crate::queue::JobQueue;
use crate::store::{EngineStore, OffsetRegistry, Page};

/// Campaigns returned per fan-out round in bulk reads
const BULK_BATCH: usize = 50;

/// Concurrent campaign fetches within one bulk round
const BULK_CONCURRENCY: usize = 8;

/// Page size used when walking eligible domains during phase start
const ELIGIBLE_PAGE: usize = 10_000;

/// Phase-specific configuration supplied by the operator
#[derive(Debug, Clone)]
pub enum PhaseConfig {
    Generation(GenerationConfig),
    DnsValidation(DnsPhaseConfig),
    HttpKeywordValidation(HttpPhaseConfig),
    Analysis(AnalysisPhaseConfig),
}

impl PhaseConfig {
    /// Phase this configuration belongs to
    pub fn phase(&self) -> Phase {
        match self {
            Self::Generation(_) => Phase::Generation,
            Self::DnsValidation(_) => Phase::DnsValidation,
            Self::HttpKeywordValidation(_) => Phase::HttpKeywordValidation,
            Self::Analysis(_) => Phase::Analysis,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Generation(cfg) => serde_json::to_value(cfg)?,
            Self::DnsValidation(cfg) => serde_json::to_value(cfg)?,
            Self::HttpKeywordValidation(cfg) => serde_json::to_value(cfg)?,
            Self::Analysis(cfg) => serde_json::to_value(cfg)?,
        };
        Ok(value)
    }
}

/// Answer to a pattern offset query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternOffsets {
    pub current_offset: BigUint,
    pub total_combinations: BigUint,
}

/// Compact campaign bundle returned by bulk reads
#[derive(Debug, Clone)]
pub struct EnrichedCampaign {
    pub campaign: Campaign,
    pub domains: Vec<GeneratedDomain>,
}

/// Top-level coordinator over store, queue, and controls
pub struct Orchestrator {
    store: Arc<dyn EngineStore>,
    queue: Arc<dyn JobQueue>,
    controls: Arc<ControlRegistry>,
    offsets: OffsetRegistry,
    audit: AuditTrail,
    config: Arc<EngineConfig>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EngineStore>,
        queue: Arc<dyn JobQueue>,
        controls: Arc<ControlRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            offsets: OffsetRegistry::new(store.clone()),
            audit: AuditTrail::new(store.clone()),
            store,
            queue,
            controls,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Campaign commands
    // ------------------------------------------------------------------

    /// Create a campaign in `(generation, configured)`
    ///
    /// Computes the pattern fingerprint but reserves no offsets; reservation
    /// happens when generation starts.
    pub async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        if new.name.trim().is_empty() {
            return Err(Error::validation("campaign name must not be empty"));
        }
        if new.owner_id.trim().is_empty() {
            return Err(Error::validation("campaign owner must not be empty"));
        }
        if new.requested_count == 0 {
            return Err(Error::validation("requested_count must be at least 1"));
        }
        new.pattern.validate()?;
        if BigUint::from(new.requested_count) > new.pattern.total_combinations() {
            return Err(Error::Validation(format!(
                "requested_count {} exceeds the pattern space of {} combinations",
                new.requested_count,
                new.pattern.total_combinations()
            )));
        }

        let campaign = self.store.create_campaign(new).await?;
        tracing::info!(
            campaign_id = %campaign.id,
            owner = %campaign.owner_id,
            "Campaign created"
        );
        self.store
            .outbox_append(
                campaign.id,
                EngineEvent::CampaignCreated {
                    name: campaign.name.clone(),
                    owner_id: campaign.owner_id.clone(),
                },
            )
            .await?;
        self.audit
            .record(
                Some(&campaign.owner_id),
                "campaign.create",
                "campaign",
                Some(campaign.id),
                serde_json::json!({
                    "name": campaign.name,
                    "requested_count": campaign.requested_count,
                    "fingerprint": campaign.fingerprint,
                }),
            )
            .await;
        Ok(campaign)
    }

    /// Fetch a campaign the actor owns
    pub async fn get_campaign(&self, actor: &str, id: Uuid) -> Result<Campaign> {
        self.load_owned(actor, id).await
    }

    /// Campaigns owned by the actor, most recently updated first
    pub async fn list_campaigns(
        &self,
        actor: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Campaign>> {
        self.store
            .list_campaigns(Some(actor), limit.clamp(1, 500), offset)
            .await
    }

    /// Store phase configuration and move to `(phase, configured)`
    pub async fn configure_phase(
        &self,
        actor: &str,
        id: Uuid,
        config: PhaseConfig,
    ) -> Result<Campaign> {
        self.validate_phase_config(&config).await?;
        let campaign = self.load_owned(actor, id).await?;
        let phase = config.phase();
        let (next_phase, next_status) = lifecycle::transition(
            campaign.current_phase,
            campaign.phase_status,
            Command::Configure(phase),
        )?;

        let patch = CampaignPatch {
            current_phase: Some(next_phase),
            phase_status: Some(next_status),
            metadata: vec![(format!("{phase}_config"), config.to_value()?)],
            ..Default::default()
        };
        let updated = self.store.update_campaign(id, campaign.version, patch).await?;
        self.store
            .outbox_append(id, EngineEvent::PhaseConfigured { phase })
            .await?;
        self.audit
            .record(
                Some(actor),
                "campaign.configure",
                "campaign",
                Some(id),
                serde_json::json!({"phase": phase.as_str()}),
            )
            .await;
        Ok(updated)
    }

    /// Verify prerequisites, enqueue the initial batches, and go `in_progress`
    pub async fn start_phase(&self, actor: &str, id: Uuid, phase: Phase) -> Result<Campaign> {
        let campaign = self.load_owned(actor, id).await?;
        let (_, next_status) = lifecycle::transition(
            campaign.current_phase,
            campaign.phase_status,
            Command::Start(phase),
        )?;
        if next_status == campaign.phase_status {
            // Already running; observe, don't double-enqueue.
            return Ok(campaign);
        }

        // Claim the state first so concurrent starts serialize on the version.
        let mut patch = CampaignPatch {
            phase_status: Some(next_status),
            last_error: Some(None),
            metadata: vec![(
                format!("{phase}_started_at"),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            )],
            ..Default::default()
        };
        let rate = match phase {
            Phase::Generation => {
                let reservation = self.prepare_generation(&campaign).await?;
                patch.metadata.push((
                    "generation_offsets".to_string(),
                    serde_json::json!({
                        "start": reservation.0.to_string(),
                        "end": reservation.1.to_string(),
                    }),
                ));
                campaign
                    .phase_config::<GenerationConfig>(Phase::Generation)?
                    .and_then(|c| c.processing_speed_per_minute)
            }
            Phase::DnsValidation => campaign
                .phase_config::<DnsPhaseConfig>(phase)?
                .and_then(|c| c.processing_speed_per_minute),
            Phase::HttpKeywordValidation => {
                let config = campaign.phase_config::<HttpPhaseConfig>(phase)?;
                if config.as_ref().is_some_and(|c| c.use_proxies) {
                    self.ensure_proxies_available().await?;
                }
                config.and_then(|c| c.processing_speed_per_minute)
            }
            Phase::Analysis => None,
        };

        let updated = self.store.update_campaign(id, campaign.version, patch).await?;

        let control = self.controls.control(id);
        control.set_paused(false);
        control.set_rate(rate);

        let enqueue_outcome = match phase {
            Phase::Generation => self.enqueue_generation(&updated).await,
            _ => self.enqueue_eligible(&updated, phase).await,
        };
        let queued = match enqueue_outcome {
            Ok(queued) => queued,
            Err(e) => {
                // Best effort: hand the state back so the operator can retry.
                let revert = CampaignPatch {
                    phase_status: Some(PhaseStatus::Configured),
                    ..Default::default()
                };
                if let Err(revert_err) = self
                    .store
                    .update_campaign(id, updated.version, revert)
                    .await
                {
                    tracing::error!(
                        campaign_id = %id,
                        error = %revert_err,
                        "Failed to revert phase start after enqueue error"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            campaign_id = %id,
            phase = %phase,
            jobs = queued,
            "Phase started"
        );
        self.store
            .outbox_append(id, EngineEvent::PhaseStarted { phase })
            .await?;
        self.audit
            .record(
                Some(actor),
                "campaign.start",
                "campaign",
                Some(id),
                serde_json::json!({"phase": phase.as_str(), "jobs": queued}),
            )
            .await;

        if queued == 0 {
            // Nothing eligible: the phase is already quiescent.
            let ctx = self.worker_context();
            crate::workers::maybe_complete_phase(&ctx, id, phase).await?;
        }

        self.load_owned(actor, id).await
    }

    /// Pause dispatch; in-flight batches complete and ack
    pub async fn pause_campaign(&self, actor: &str, id: Uuid) -> Result<Campaign> {
        let campaign = self.load_owned(actor, id).await?;
        let (_, next_status) =
            lifecycle::transition(campaign.current_phase, campaign.phase_status, Command::Pause)?;
        let updated = if next_status == campaign.phase_status {
            campaign
        } else {
            self.store
                .update_campaign(
                    id,
                    campaign.version,
                    CampaignPatch {
                        phase_status: Some(next_status),
                        ..Default::default()
                    },
                )
                .await?
        };
        self.controls.control(id).set_paused(true);
        self.store
            .outbox_append(
                id,
                EngineEvent::CampaignUpdated {
                    phase: updated.current_phase,
                    status: updated.phase_status,
                },
            )
            .await?;
        self.audit
            .record(Some(actor), "campaign.pause", "campaign", Some(id), serde_json::Value::Null)
            .await;
        Ok(updated)
    }

    /// Clear the pause flag and resume dispatch
    pub async fn resume_campaign(&self, actor: &str, id: Uuid) -> Result<Campaign> {
        let campaign = self.load_owned(actor, id).await?;
        let (_, next_status) =
            lifecycle::transition(campaign.current_phase, campaign.phase_status, Command::Resume)?;
        let updated = if next_status == campaign.phase_status {
            campaign
        } else {
            self.store
                .update_campaign(
                    id,
                    campaign.version,
                    CampaignPatch {
                        phase_status: Some(next_status),
                        ..Default::default()
                    },
                )
                .await?
        };
        self.controls.control(id).set_paused(false);
        self.store
            .outbox_append(
                id,
                EngineEvent::CampaignUpdated {
                    phase: updated.current_phase,
                    status: updated.phase_status,
                },
            )
            .await?;
        self.audit
            .record(Some(actor), "campaign.resume", "campaign", Some(id), serde_json::Value::Null)
            .await;
        // The pause may have outlived the last in-flight batch, in which case
        // no future ack will run the completion check.
        let ctx = self.worker_context();
        crate::workers::maybe_complete_phase(&ctx, id, updated.current_phase).await?;
        self.load_owned(actor, id).await
    }

    /// Cancel: abort in-flight work, purge queued jobs, stop producing rows
    pub async fn cancel_campaign(&self, actor: &str, id: Uuid) -> Result<Campaign> {
        let campaign = self.load_owned(actor, id).await?;
        let (_, next_status) =
            lifecycle::transition(campaign.current_phase, campaign.phase_status, Command::Cancel)?;

        self.controls.control(id).cancel();
        let purged = self.queue.purge_campaign(id).await?;

        let updated = if next_status == campaign.phase_status {
            campaign
        } else {
            self.store
                .update_campaign(
                    id,
                    campaign.version,
                    CampaignPatch {
                        phase_status: Some(next_status),
                        ..Default::default()
                    },
                )
                .await?
        };
        tracing::info!(campaign_id = %id, purged, "Campaign cancelled");
        self.store
            .outbox_append(
                id,
                EngineEvent::CampaignUpdated {
                    phase: updated.current_phase,
                    status: updated.phase_status,
                },
            )
            .await?;
        self.audit
            .record(
                Some(actor),
                "campaign.cancel",
                "campaign",
                Some(id),
                serde_json::json!({"purged_jobs": purged}),
            )
            .await;
        Ok(updated)
    }

    /// Move a failed phase back to `configured`, preserving written results
    pub async fn retry_phase(&self, actor: &str, id: Uuid) -> Result<Campaign> {
        let campaign = self.load_owned(actor, id).await?;
        let (_, next_status) =
            lifecycle::transition(campaign.current_phase, campaign.phase_status, Command::Retry)?;

        self.store
            .clear_phase_failures(id, campaign.current_phase)
            .await?;
        let updated = self
            .store
            .update_campaign(
                id,
                campaign.version,
                CampaignPatch {
                    phase_status: Some(next_status),
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.audit
            .record(
                Some(actor),
                "campaign.retry",
                "campaign",
                Some(id),
                serde_json::json!({"phase": campaign.current_phase.as_str()}),
            )
            .await;
        Ok(updated)
    }

    /// Delete a terminal campaign and all child rows
    pub async fn delete_campaign(&self, actor: &str, id: Uuid) -> Result<()> {
        let campaign = self.load_owned(actor, id).await?;
        if !campaign.phase_status.is_terminal() {
            return Err(Error::invalid_state(
                "delete",
                format_args!("({}, {})", campaign.current_phase, campaign.phase_status),
            ));
        }

        let purged = self.queue.purge_campaign(id).await?;
        // The deletion event outlives the campaign row.
        self.store
            .outbox_append(id, EngineEvent::CampaignDeleted)
            .await?;
        self.store.delete_campaign(id).await?;
        self.controls.remove(id);
        tracing::info!(campaign_id = %id, purged, "Campaign deleted");
        self.audit
            .record(
                Some(actor),
                "campaign.delete",
                "campaign",
                Some(id),
                serde_json::json!({"purged_jobs": purged}),
            )
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn list_generated(
        &self,
        actor: &str,
        id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<GeneratedDomain>> {
        self.load_owned(actor, id).await?;
        self.store
            .list_generated(id, limit.clamp(1, 1_000), cursor)
            .await
    }

    pub async fn list_dns_results(
        &self,
        actor: &str,
        id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<DnsResult>> {
        self.load_owned(actor, id).await?;
        self.store
            .list_dns_results(id, limit.clamp(1, 1_000), cursor)
            .await
    }

    pub async fn list_http_results(
        &self,
        actor: &str,
        id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<HttpResult>> {
        self.load_owned(actor, id).await?;
        self.store
            .list_http_results(id, limit.clamp(1, 1_000), cursor)
            .await
    }

    pub async fn list_leads(
        &self,
        actor: &str,
        id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Lead>> {
        self.load_owned(actor, id).await?;
        self.store.list_leads(id, limit.clamp(1, 1_000), cursor).await
    }

    pub async fn list_audit(
        &self,
        actor: &str,
        id: Uuid,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        self.load_owned(actor, id).await?;
        self.audit.list(Some(id), limit.clamp(1, 1_000)).await
    }

    /// Current shared offset and total combinations for a pattern
    pub async fn pattern_offset(&self, pattern: &PatternSpec) -> Result<PatternOffsets> {
        pattern.validate()?;
        let fingerprint = pattern.fingerprint();
        Ok(PatternOffsets {
            current_offset: self.offsets.peek(&fingerprint).await?,
            total_combinations: pattern.total_combinations(),
        })
    }

    /// Metadata plus a generated-domain slice for each owned campaign
    ///
    /// Campaigns the actor does not own are silently skipped. Fan-out is
    /// bounded: batches of [`BULK_BATCH`] campaigns, a handful in flight.
    pub async fn bulk_enriched_data(
        &self,
        actor: &str,
        campaign_ids: &[Uuid],
        limit: usize,
        offset: usize,
    ) -> Result<HashMap<Uuid, EnrichedCampaign>> {
        let limit = limit.clamp(1, 1_000);
        let mut bundles = HashMap::new();

        for batch in campaign_ids.chunks(BULK_BATCH) {
            let results: Vec<Option<(Uuid, EnrichedCampaign)>> = stream::iter(batch.iter().copied())
                .map(|id| async move {
                    let campaign = self.store.get_campaign(id).await.ok().flatten()?;
                    if campaign.owner_id != actor {
                        return None;
                    }
                    let domains = self.generated_slice(id, limit, offset).await.ok()?;
                    Some((id, EnrichedCampaign { campaign, domains }))
                })
                .buffer_unordered(BULK_CONCURRENCY)
                .collect()
                .await;
            bundles.extend(results.into_iter().flatten());
        }
        Ok(bundles)
    }

    // ------------------------------------------------------------------
    // Persona / proxy / keyword administration
    // ------------------------------------------------------------------

    pub async fn upsert_persona(&self, actor: &str, persona: Persona) -> Result<()> {
        if persona.name.trim().is_empty() {
            return Err(Error::validation("persona name must not be empty"));
        }
        if let PersonaConfig::Http(http) = &persona.config {
            if http.user_agent.trim().is_empty() {
                return Err(Error::validation("HTTP persona requires a user agent"));
            }
        }
        let id = persona.id;
        self.store.upsert_persona(persona).await?;
        self.audit
            .record(Some(actor), "persona.upsert", "persona", Some(id), serde_json::Value::Null)
            .await;
        Ok(())
    }

    pub async fn list_personas(&self, kind: Option<crate::model::PersonaKind>) -> Result<Vec<Persona>> {
        self.store.list_personas(kind).await
    }

    pub async fn upsert_proxy(&self, actor: &str, proxy: Proxy) -> Result<()> {
        if proxy.address.trim().is_empty() {
            return Err(Error::validation("proxy address must not be empty"));
        }
        let id = proxy.id;
        self.store.upsert_proxy(proxy).await?;
        self.audit
            .record(Some(actor), "proxy.upsert", "proxy", Some(id), serde_json::Value::Null)
            .await;
        Ok(())
    }

    pub async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        self.store.list_proxies().await
    }

    /// Consume a health verdict from the external checker
    pub async fn set_proxy_health(&self, id: Uuid, healthy: bool) -> Result<()> {
        self.store.set_proxy_health(id, healthy).await?;
        self.audit
            .record(
                None,
                "proxy.health",
                "proxy",
                Some(id),
                serde_json::json!({"healthy": healthy}),
            )
            .await;
        Ok(())
    }

    pub async fn upsert_keyword_set(&self, actor: &str, set: KeywordSet) -> Result<()> {
        if set.rules.is_empty() {
            return Err(Error::validation("keyword set requires at least one rule"));
        }
        // Reject malformed rules now instead of mid-probe.
        compile_rules(&set.rules)?;
        let id = set.id;
        self.store.upsert_keyword_set(set).await?;
        self.audit
            .record(Some(actor), "keyword_set.upsert", "keyword_set", Some(id), serde_json::Value::Null)
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn worker_context(&self) -> crate::workers::WorkerContext {
        crate::workers::WorkerContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            controls: self.controls.clone(),
            config: self.config.clone(),
        }
    }

    /// Offset/limit slice over generated rows, for clients without cursors
    async fn generated_slice(
        &self,
        id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GeneratedDomain>> {
        let page = self.store.list_generated(id, offset + limit, None).await?;
        Ok(page.items.into_iter().skip(offset).collect())
    }

    async fn load_owned(&self, actor: &str, id: Uuid) -> Result<Campaign> {
        let campaign = self
            .store
            .get_campaign(id)
            .await?
            .ok_or_else(|| Error::not_found(format_args!("campaign {id}")))?;
        if campaign.owner_id != actor {
            return Err(Error::Forbidden(format!(
                "campaign {id} belongs to another user"
            )));
        }
        Ok(campaign)
    }

    async fn validate_phase_config(&self, config: &PhaseConfig) -> Result<()> {
        match config {
            PhaseConfig::Generation(_) | PhaseConfig::Analysis(_) => Ok(()),
            PhaseConfig::DnsValidation(cfg) => {
                if cfg.persona_ids.is_empty() {
                    return Err(Error::validation(
                        "dns_validation requires at least one persona",
                    ));
                }
                self.require_personas(&cfg.persona_ids, crate::model::PersonaKind::Dns)
                    .await
            }
            PhaseConfig::HttpKeywordValidation(cfg) => {
                if cfg.persona_ids.is_empty() {
                    return Err(Error::validation(
                        "http_keyword_validation requires at least one persona",
                    ));
                }
                self.require_personas(&cfg.persona_ids, crate::model::PersonaKind::Http)
                    .await?;
                let set = self
                    .store
                    .get_keyword_set(cfg.keyword_set_id)
                    .await?
                    .ok_or_else(|| {
                        Error::not_found(format_args!("keyword set {}", cfg.keyword_set_id))
                    })?;
                compile_rules(&set.rules)?;
                Ok(())
            }
        }
    }

    async fn require_personas(
        &self,
        ids: &[Uuid],
        kind: crate::model::PersonaKind,
    ) -> Result<()> {
        for id in ids {
            let persona = self
                .store
                .get_persona(*id)
                .await?
                .ok_or_else(|| Error::not_found(format_args!("persona {id}")))?;
            if persona.kind() != kind {
                return Err(Error::Validation(format!(
                    "persona {id} is not a {kind:?} persona"
                )));
            }
        }
        Ok(())
    }

    /// Reserve the campaign's offset range; returns `(start, end)`
    async fn prepare_generation(&self, campaign: &Campaign) -> Result<(BigUint, BigUint)> {
        // A previous failed start keeps its reservation; re-reserving would
        // leak a hole in the shared numbering.
        if let Some(value) = campaign.metadata.get("generation_offsets") {
            let start = value
                .get("start")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<BigUint>().ok());
            let end = value
                .get("end")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<BigUint>().ok());
            if let (Some(start), Some(end)) = (start, end) {
                return Ok((start, end));
            }
        }
        let reservation = self
            .offsets
            .reserve(&campaign.fingerprint, campaign.requested_count)
            .await?;
        Ok((reservation.start, reservation.end))
    }

    async fn enqueue_generation(&self, campaign: &Campaign) -> Result<u64> {
        let offsets = campaign
            .metadata
            .get("generation_offsets")
            .ok_or_else(|| Error::Internal("generation offsets missing after start".into()))?;
        let parse = |key: &str| -> Result<u64> {
            offsets
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    Error::validation("reserved offset range exceeds 64-bit row offsets")
                })
        };
        let (start, end) = (parse("start")?, parse("end")?);

        if campaign.phase_counters(Phase::Generation).total == 0 {
            self.store
                .set_phase_total(campaign.id, Phase::Generation, end - start)
                .await?;
        }

        let batch = self.config.pools.batch_size as u64;
        let mut jobs = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let upper = (cursor + batch).min(end);
            jobs.push(NewJob {
                campaign_id: campaign.id,
                phase: Phase::Generation,
                payload: JobPayload::OffsetRange {
                    start: cursor,
                    end: upper,
                },
                priority: 0,
            });
            cursor = upper;
        }
        let queued = jobs.len() as u64;
        if !jobs.is_empty() {
            self.queue.enqueue(jobs).await?;
        }
        Ok(queued)
    }

    /// Enqueue batches over domains eligible for a downstream phase
    ///
    /// Walks the unprobed set, so a start after `retry` re-enqueues only the
    /// work that never produced a result. The phase total is committed before
    /// any job becomes visible; otherwise a fast worker could complete the
    /// phase against a zero total and have its counters reset underneath it.
    async fn enqueue_eligible(&self, campaign: &Campaign, phase: Phase) -> Result<u64> {
        if campaign.phase_counters(phase).total == 0 {
            let total = match phase {
                Phase::DnsValidation => self.store.count_generated(campaign.id).await?,
                Phase::HttpKeywordValidation => {
                    self.store
                        .count_dns_results(campaign.id, Some(ProbeStatus::Ok))
                        .await?
                }
                Phase::Analysis => {
                    let mut total = 0u64;
                    let mut after: Option<String> = None;
                    loop {
                        let page = self
                            .store
                            .unprobed_domains(campaign.id, phase, after.as_deref(), ELIGIBLE_PAGE)
                            .await?;
                        if page.is_empty() {
                            break;
                        }
                        total += page.len() as u64;
                        after = page.last().cloned();
                    }
                    total
                }
                Phase::Generation => unreachable!("generation uses offset ranges"),
            };
            self.store.set_phase_total(campaign.id, phase, total).await?;
        }

        let batch = self.config.pools.batch_size;
        let mut after: Option<String> = None;
        let mut queued = 0u64;
        loop {
            let page = self
                .store
                .unprobed_domains(campaign.id, phase, after.as_deref(), ELIGIBLE_PAGE)
                .await?;
            if page.is_empty() {
                break;
            }
            after = page.last().cloned();
            let jobs: Vec<NewJob> = page
                .chunks(batch)
                .map(|chunk| NewJob {
                    campaign_id: campaign.id,
                    phase,
                    payload: JobPayload::Domains {
                        names: chunk.to_vec(),
                    },
                    priority: 0,
                })
                .collect();
            queued += jobs.len() as u64;
            self.queue.enqueue(jobs).await?;
        }
        Ok(queued)
    }

    /// Fail fast when proxy routing is requested and nothing is eligible
    async fn ensure_proxies_available(&self) -> Result<()> {
        let proxies = self.store.list_proxies().await?;
        if !proxies.iter().any(Proxy::is_eligible) {
            return Err(Error::NoProxyAvailable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pattern::PatternType;
    use crate::queue::MemoryJobQueue;
    use crate::store::memory::MemoryStore;
    use tokio_util::sync::CancellationToken;

    fn spec() -> PatternSpec {
        PatternSpec {
            pattern_type: PatternType::Prefix,
            variable_length: 3,
            character_set: "ab".to_string(),
            constant_string: "x".to_string(),
            tld: "com".to_string(),
        }
    }

    fn orchestrator() -> Orchestrator {
        let config = Arc::new(EngineConfig::default());
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new(&config.queue));
        let controls = Arc::new(ControlRegistry::new(CancellationToken::new()));
        Orchestrator::new(store, queue, controls, config)
    }

    fn new_campaign(count: u64) -> NewCampaign {
        NewCampaign {
            name: "widgets".to_string(),
            owner_id: "user-a".to_string(),
            pattern: spec(),
            requested_count: count,
        }
    }

    #[tokio::test]
    async fn test_create_validates_inputs() {
        let orch = orchestrator();

        let mut bad = new_campaign(4);
        bad.name = "  ".to_string();
        assert!(matches!(
            orch.create_campaign(bad).await,
            Err(Error::Validation(_))
        ));

        let mut bad = new_campaign(0);
        bad.name = "ok".to_string();
        assert!(matches!(
            orch.create_campaign(bad).await,
            Err(Error::Validation(_))
        ));

        // More domains than the pattern space holds.
        assert!(matches!(
            orch.create_campaign(new_campaign(9)).await,
            Err(Error::Validation(_))
        ));

        let created = orch.create_campaign(new_campaign(8)).await.unwrap();
        assert_eq!(created.current_phase, Phase::Generation);
        assert_eq!(created.phase_status, PhaseStatus::Configured);
    }

    #[tokio::test]
    async fn test_cross_user_access_is_forbidden() {
        let orch = orchestrator();
        let campaign = orch.create_campaign(new_campaign(4)).await.unwrap();

        assert!(matches!(
            orch.get_campaign("user-b", campaign.id).await,
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            orch.pause_campaign("user-b", campaign.id).await,
            Err(Error::Forbidden(_))
        ));

        // Bulk reads silently skip foreign campaigns.
        let bundles = orch
            .bulk_enriched_data("user-b", &[campaign.id], 10, 0)
            .await
            .unwrap();
        assert!(bundles.is_empty());
    }

    #[tokio::test]
    async fn test_start_generation_reserves_and_enqueues() {
        let orch = orchestrator();
        let campaign = orch.create_campaign(new_campaign(8)).await.unwrap();

        let started = orch
            .start_phase("user-a", campaign.id, Phase::Generation)
            .await
            .unwrap();
        assert_eq!(started.phase_status, PhaseStatus::InProgress);
        assert_eq!(started.phase_counters(Phase::Generation).total, 8);
        assert_eq!(orch.queue.pending_for_campaign(campaign.id).await.unwrap(), 1);

        // The shared offset moved.
        let offsets = orch.pattern_offset(&spec()).await.unwrap();
        assert_eq!(offsets.current_offset, BigUint::from(8u32));
        assert_eq!(offsets.total_combinations, BigUint::from(8u32));
    }

    #[tokio::test]
    async fn test_start_requires_configuration_order() {
        let orch = orchestrator();
        let campaign = orch.create_campaign(new_campaign(4)).await.unwrap();
        // DNS cannot start while generation is the current phase.
        assert!(matches!(
            orch.start_phase("user-a", campaign.id, Phase::DnsValidation)
                .await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_configure_rejects_unknown_personas() {
        let orch = orchestrator();
        let campaign = orch.create_campaign(new_campaign(4)).await.unwrap();
        let err = orch
            .configure_phase(
                "user-a",
                campaign.id,
                PhaseConfig::DnsValidation(DnsPhaseConfig {
                    persona_ids: vec![Uuid::new_v4()],
                    rotation: Default::default(),
                    processing_speed_per_minute: None,
                    phase_timeout_secs: None,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_requires_terminal_state() {
        let orch = orchestrator();
        let campaign = orch.create_campaign(new_campaign(4)).await.unwrap();
        assert!(matches!(
            orch.delete_campaign("user-a", campaign.id).await,
            Err(Error::InvalidState(_))
        ));

        orch.cancel_campaign("user-a", campaign.id).await.unwrap();
        orch.delete_campaign("user-a", campaign.id).await.unwrap();
        assert!(matches!(
            orch.get_campaign("user-a", campaign.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let orch = orchestrator();
        let campaign = orch.create_campaign(new_campaign(4)).await.unwrap();
        // Creation lands in `configured`, one of cancel's legal sources.
        assert_eq!(campaign.phase_status, PhaseStatus::Configured);
        let first = orch.cancel_campaign("user-a", campaign.id).await.unwrap();
        assert_eq!(first.phase_status, PhaseStatus::Cancelled);
        // Re-cancelling a terminal campaign is a no-op, not an error.
        let second = orch.cancel_campaign("user-a", campaign.id).await.unwrap();
        assert_eq!(second.phase_status, PhaseStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_http_start_blocked_when_no_proxy_is_healthy() {
        let orch = orchestrator();
        orch.upsert_proxy(
            "admin",
            Proxy {
                id: Uuid::new_v4(),
                protocol: crate::model::ProxyProtocol::Http,
                address: "10.0.0.1:8080".to_string(),
                credentials: None,
                enabled: true,
                healthy: false,
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            orch.ensure_proxies_available().await,
            Err(Error::NoProxyAvailable)
        ));
    }

    #[tokio::test]
    async fn test_pattern_offset_validates_spec() {
        let orch = orchestrator();
        let mut bad = spec();
        bad.character_set = String::new();
        assert!(matches!(
            orch.pattern_offset(&bad).await,
            Err(Error::Validation(_))
        ));
    }
}
