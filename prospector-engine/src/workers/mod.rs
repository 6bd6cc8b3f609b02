//! Phase worker pools
//!
//! Each phase owns a bounded pool of workers sharing one claim loop: claim a
//! job, load its campaign, honor pause/cancel, run the phase processor, then
//! ack/nack and drive phase completion. Processors run inside spawned tasks
//! so a panic dead-letters the job and fails the phase instead of killing
//! the worker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::control::{CampaignControl, ControlRegistry};
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::lifecycle::{self, Command};
use crate::model::{Campaign, CampaignPatch, CounterDelta, Job, Phase, PhaseAggregate, PhaseStatus};
use crate::queue::{JobQueue, NackOutcome};
use crate::store::EngineStore;

pub mod analysis;
pub mod dns;
pub mod generation;
pub mod http;

/// Shared handles every pool needs
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn EngineStore>,
    pub queue: Arc<dyn JobQueue>,
    pub controls: Arc<ControlRegistry>,
    pub config: Arc<EngineConfig>,
}

/// How a batch failed
#[derive(Debug)]
pub enum ProcessError {
    /// Queue-level retry applies
    Transient(Error),
    /// Programming or invariant error; fails the phase
    Fatal(Error),
}

/// Phase-specific batch logic plugged into the shared claim loop
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// Phase whose jobs this processor claims
    fn phase(&self) -> Phase;

    /// Short name used in worker ids and logs
    fn pool_name(&self) -> &'static str;

    /// Per-minute throttle from the campaign's phase config, if any
    fn rate_limit(&self, campaign: &Campaign) -> Option<u32>;

    /// Process one claimed batch
    async fn process(
        &self,
        job: &Job,
        campaign: &Campaign,
        control: &CampaignControl,
    ) -> std::result::Result<(), ProcessError>;
}

/// Spawn `size` workers for a processor
pub fn spawn_pool(
    ctx: WorkerContext,
    processor: Arc<dyn JobProcessor>,
    size: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..size)
        .map(|index| {
            let ctx = ctx.clone();
            let processor = processor.clone();
            tokio::spawn(async move {
                let worker_id = format!(
                    "{}-{}-{index}",
                    ctx.config.service.name,
                    processor.pool_name()
                );
                run_worker(ctx, processor, worker_id).await;
            })
        })
        .collect()
}

async fn run_worker(ctx: WorkerContext, processor: Arc<dyn JobProcessor>, worker_id: String) {
    let shutdown = ctx.controls.root_token().clone();
    let poll = ctx.config.queue.poll_interval();
    let lease = ctx.config.queue.claim_lease();
    tracing::debug!(worker_id, "Worker started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let claimed = match ctx.queue.claim(&worker_id, processor.phase(), lease).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Claim failed");
                if wait_or_shutdown(&shutdown, poll).await {
                    break;
                }
                continue;
            }
        };

        let Some(job) = claimed else {
            if wait_or_shutdown(&shutdown, poll).await {
                break;
            }
            continue;
        };

        if let Err(e) = handle_job(&ctx, &processor, &worker_id, job).await {
            tracing::warn!(worker_id, error = %e, "Job handling failed");
        }
    }
    tracing::debug!(worker_id, "Worker stopped");
}

/// Sleep for the poll interval; returns true when shutdown fired
async fn wait_or_shutdown(shutdown: &CancellationToken, poll: std::time::Duration) -> bool {
    tokio::select! {
        biased;

        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(poll) => false,
    }
}

async fn handle_job(
    ctx: &WorkerContext,
    processor: &Arc<dyn JobProcessor>,
    worker_id: &str,
    job: Job,
) -> Result<()> {
    let Some(campaign) = ctx.store.get_campaign(job.campaign_id).await? else {
        // Campaign deleted while the job sat in the queue.
        return ctx.queue.ack(job.id).await;
    };
    let control = ctx.controls.control(job.campaign_id);

    if control.is_cancelled()
        || campaign.phase_status == PhaseStatus::Cancelled
        || campaign.phase_status == PhaseStatus::Failed
        || campaign.current_phase != job.phase
    {
        // Stale work; the purge on cancel/fail may have raced this claim.
        return ctx.queue.ack(job.id).await;
    }

    if control.is_paused() || campaign.phase_status == PhaseStatus::Paused {
        return ctx
            .queue
            .release(job.id, ctx.config.queue.poll_interval())
            .await;
    }

    control.ensure_rate(processor.rate_limit(&campaign));

    let outcome = {
        let processor = processor.clone();
        let job = job.clone();
        let campaign = campaign.clone();
        let control = control.clone();
        tokio::spawn(async move { processor.process(&job, &campaign, &control).await }).await
    };

    match outcome {
        Ok(Ok(())) => {
            ctx.queue.ack(job.id).await?;
            maybe_complete_phase(ctx, job.campaign_id, job.phase).await?;
        }
        Ok(Err(ProcessError::Transient(e))) => {
            tracing::warn!(
                worker_id,
                job_id = %job.id,
                campaign_id = %job.campaign_id,
                error = %e,
                "Batch failed, handing back to the queue"
            );
            let outcome = ctx.queue.nack(job.id, &e.to_string()).await?;
            if outcome == NackOutcome::DeadLettered {
                // The batch will never produce rows; count it against the
                // phase so the operator sees the loss.
                let lost = job.payload.len() as u64;
                ctx.store
                    .bump_counters(
                        job.campaign_id,
                        job.phase,
                        CounterDelta {
                            processed: lost,
                            succeeded: 0,
                            failed: lost,
                        },
                    )
                    .await?;
                maybe_complete_phase(ctx, job.campaign_id, job.phase).await?;
            }
        }
        Ok(Err(ProcessError::Fatal(e))) => {
            tracing::error!(
                worker_id,
                job_id = %job.id,
                campaign_id = %job.campaign_id,
                error = %e,
                "Fatal batch error, failing phase"
            );
            ctx.queue.ack(job.id).await?;
            fail_phase(ctx, job.campaign_id, job.phase, &e).await?;
        }
        Err(join_error) => {
            let e = Error::WorkerFatal(format!("batch task panicked: {join_error}"));
            tracing::error!(
                worker_id,
                job_id = %job.id,
                campaign_id = %job.campaign_id,
                error = %e,
                "Batch panicked, failing phase"
            );
            ctx.queue.ack(job.id).await?;
            fail_phase(ctx, job.campaign_id, job.phase, &e).await?;
        }
    }
    Ok(())
}

/// Periodically fail phases that outlived their configured timeout
///
/// Phase timeouts are per-campaign and have no default; campaigns without one
/// are never touched.
pub fn spawn_phase_watchdog(
    ctx: WorkerContext,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("Phase watchdog started");
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    if let Err(e) = sweep_phase_timeouts(&ctx).await {
                        tracing::warn!(error = %e, "Phase timeout sweep failed");
                    }
                }
            }
        }
        tracing::debug!("Phase watchdog stopped");
    })
}

/// One pass over in-progress campaigns; returns how many phases were failed
pub(crate) async fn sweep_phase_timeouts(ctx: &WorkerContext) -> Result<u64> {
    let mut failed = 0;
    let mut offset = 0;
    loop {
        let campaigns = ctx.store.list_campaigns(None, 200, offset).await?;
        if campaigns.is_empty() {
            break;
        }
        offset += campaigns.len();
        for campaign in campaigns {
            if campaign.phase_status != PhaseStatus::InProgress {
                continue;
            }
            let Some(timeout) = phase_timeout(&campaign)? else {
                continue;
            };
            let key = format!("{}_started_at", campaign.current_phase);
            let Some(started_at) = campaign
                .metadata
                .get(&key)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok())
            else {
                continue;
            };
            let deadline = started_at
                + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
            if Utc::now() > deadline {
                let error = Error::WorkerFatal(format!(
                    "phase {} exceeded its timeout of {}s",
                    campaign.current_phase,
                    timeout.as_secs()
                ));
                fail_phase(ctx, campaign.id, campaign.current_phase, &error).await?;
                failed += 1;
            }
        }
    }
    Ok(failed)
}

/// The configured timeout for the campaign's current phase, if any
fn phase_timeout(campaign: &Campaign) -> Result<Option<std::time::Duration>> {
    use crate::model::{AnalysisPhaseConfig, DnsPhaseConfig, GenerationConfig, HttpPhaseConfig};

    let secs = match campaign.current_phase {
        Phase::Generation => campaign
            .phase_config::<GenerationConfig>(Phase::Generation)?
            .and_then(|c| c.phase_timeout_secs),
        Phase::DnsValidation => campaign
            .phase_config::<DnsPhaseConfig>(Phase::DnsValidation)?
            .and_then(|c| c.phase_timeout_secs),
        Phase::HttpKeywordValidation => campaign
            .phase_config::<HttpPhaseConfig>(Phase::HttpKeywordValidation)?
            .and_then(|c| c.phase_timeout_secs),
        Phase::Analysis => campaign
            .phase_config::<AnalysisPhaseConfig>(Phase::Analysis)?
            .and_then(|c| c.phase_timeout_secs),
    };
    Ok(secs.map(std::time::Duration::from_secs))
}

/// Complete the phase when all work is accounted for, else publish progress
///
/// Racing workers serialize on the campaign version; the loser observes the
/// conflict and walks away.
pub(crate) async fn maybe_complete_phase(
    ctx: &WorkerContext,
    campaign_id: uuid::Uuid,
    phase: Phase,
) -> Result<bool> {
    let Some(campaign) = ctx.store.get_campaign(campaign_id).await? else {
        return Ok(false);
    };
    if campaign.current_phase != phase || campaign.phase_status != PhaseStatus::InProgress {
        return Ok(false);
    }

    let counters = campaign.phase_counters(phase);
    let pending = ctx.queue.pending_for_campaign(campaign_id).await?;
    let quiescent = pending == 0 && counters.processed >= counters.total;

    if !quiescent {
        ctx.store
            .outbox_append(
                campaign_id,
                EngineEvent::PhaseProgress {
                    phase,
                    processed: counters.processed,
                    total: counters.total,
                },
            )
            .await?;
        return Ok(false);
    }

    let (_, status) = lifecycle::transition(phase, campaign.phase_status, Command::Complete)?;
    let mut results = campaign.results.clone();
    *results.slot_mut(phase) = Some(PhaseAggregate {
        total: counters.total,
        succeeded: counters.succeeded,
        failed: counters.failed,
        completed_at: Some(Utc::now()),
    });
    let patch = CampaignPatch {
        phase_status: Some(status),
        results: Some(results),
        ..Default::default()
    };
    match ctx
        .store
        .update_campaign(campaign_id, campaign.version, patch)
        .await
    {
        Ok(_) => {
            tracing::info!(campaign_id = %campaign_id, phase = %phase, "Phase completed");
            ctx.store
                .outbox_append(campaign_id, EngineEvent::PhaseCompleted { phase })
                .await?;
            Ok(true)
        }
        Err(Error::Conflict(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Move an in-progress phase to `failed` and stop dispatch for the campaign
pub(crate) async fn fail_phase(
    ctx: &WorkerContext,
    campaign_id: uuid::Uuid,
    phase: Phase,
    error: &Error,
) -> Result<()> {
    let Some(campaign) = ctx.store.get_campaign(campaign_id).await? else {
        return Ok(());
    };
    if campaign.current_phase != phase || campaign.phase_status != PhaseStatus::InProgress {
        return Ok(());
    }

    let (_, status) = lifecycle::transition(phase, campaign.phase_status, Command::Fail)?;
    let patch = CampaignPatch {
        phase_status: Some(status),
        last_error: Some(Some(error.to_string())),
        ..Default::default()
    };
    match ctx
        .store
        .update_campaign(campaign_id, campaign.version, patch)
        .await
    {
        Ok(_) => {}
        Err(Error::Conflict(_)) => return Ok(()),
        Err(e) => return Err(e),
    }

    let purged = ctx.queue.purge_campaign(campaign_id).await?;
    tracing::error!(
        campaign_id = %campaign_id,
        phase = %phase,
        purged,
        error = %error,
        "Phase failed; dispatch stopped until operator intervention"
    );
    ctx.store
        .outbox_append(
            campaign_id,
            EngineEvent::PhaseFailed {
                phase,
                error_kind: error.kind().to_string(),
            },
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnsPhaseConfig, NewCampaign};
    use crate::pattern::{PatternSpec, PatternType};
    use crate::queue::MemoryJobQueue;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;

    fn context() -> WorkerContext {
        let config = Arc::new(EngineConfig::default());
        WorkerContext {
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(MemoryJobQueue::new(&config.queue)),
            controls: Arc::new(ControlRegistry::new(CancellationToken::new())),
            config,
        }
    }

    async fn in_progress_campaign(
        ctx: &WorkerContext,
        timeout_secs: Option<u64>,
        started_secs_ago: i64,
    ) -> uuid::Uuid {
        let campaign = ctx
            .store
            .create_campaign(NewCampaign {
                name: "watchdog".to_string(),
                owner_id: "user-a".to_string(),
                pattern: PatternSpec {
                    pattern_type: PatternType::Prefix,
                    variable_length: 2,
                    character_set: "ab".to_string(),
                    constant_string: String::new(),
                    tld: "com".to_string(),
                },
                requested_count: 4,
            })
            .await
            .unwrap();

        let config = DnsPhaseConfig {
            persona_ids: vec![uuid::Uuid::new_v4()],
            rotation: Default::default(),
            processing_speed_per_minute: None,
            phase_timeout_secs: timeout_secs,
        };
        let started_at = Utc::now() - chrono::Duration::seconds(started_secs_ago);
        ctx.store
            .update_campaign(
                campaign.id,
                campaign.version,
                CampaignPatch {
                    current_phase: Some(Phase::DnsValidation),
                    phase_status: Some(PhaseStatus::InProgress),
                    metadata: vec![
                        (
                            "dns_validation_config".to_string(),
                            serde_json::to_value(&config).unwrap(),
                        ),
                        (
                            "dns_validation_started_at".to_string(),
                            serde_json::Value::String(started_at.to_rfc3339()),
                        ),
                    ],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        campaign.id
    }

    #[tokio::test]
    async fn test_expired_phase_is_failed_by_the_sweep() {
        let ctx = context();
        let id = in_progress_campaign(&ctx, Some(10), 60).await;

        assert_eq!(sweep_phase_timeouts(&ctx).await.unwrap(), 1);
        let campaign = ctx.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.phase_status, PhaseStatus::Failed);
        assert!(campaign.last_error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_phase_within_timeout_is_untouched() {
        let ctx = context();
        let id = in_progress_campaign(&ctx, Some(600), 1).await;

        assert_eq!(sweep_phase_timeouts(&ctx).await.unwrap(), 0);
        let campaign = ctx.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.phase_status, PhaseStatus::InProgress);
    }

    #[tokio::test]
    async fn test_phase_without_timeout_never_expires() {
        let ctx = context();
        let id = in_progress_campaign(&ctx, None, 3_600).await;

        assert_eq!(sweep_phase_timeouts(&ctx).await.unwrap(), 0);
        let campaign = ctx.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.phase_status, PhaseStatus::InProgress);
    }
}
