//! Generation phase processor
//!
//! Walks the job's reserved offset range through the campaign's pattern.
//! Illegal names are skipped but their offsets still count, so the numbering
//! stays deterministic across campaigns sharing a fingerprint. Duplicate rows
//! from a re-delivered batch are absorbed by the insert's conflict skip.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigUint;

use crate::control::CampaignControl;
use crate::error::Error;
use crate::model::{
    Campaign, CounterDelta, GeneratedDomain, GenerationConfig, Job, JobPayload, Phase,
};
use crate::pattern::is_valid_domain;
use crate::store::EngineStore;

use super::{JobProcessor, ProcessError};

pub struct GenerationProcessor {
    store: Arc<dyn EngineStore>,
}

impl GenerationProcessor {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }
}

fn store_error(e: Error) -> ProcessError {
    if e.is_retriable() {
        ProcessError::Transient(e)
    } else {
        ProcessError::Fatal(e)
    }
}

#[async_trait]
impl JobProcessor for GenerationProcessor {
    fn phase(&self) -> Phase {
        Phase::Generation
    }

    fn pool_name(&self) -> &'static str {
        "generate"
    }

    fn rate_limit(&self, campaign: &Campaign) -> Option<u32> {
        campaign
            .phase_config::<GenerationConfig>(Phase::Generation)
            .ok()
            .flatten()
            .and_then(|cfg| cfg.processing_speed_per_minute)
    }

    async fn process(
        &self,
        job: &Job,
        campaign: &Campaign,
        control: &CampaignControl,
    ) -> std::result::Result<(), ProcessError> {
        let JobPayload::OffsetRange { start, end } = &job.payload else {
            return Err(ProcessError::Fatal(Error::Internal(
                "generation job carries a domain-list payload".to_string(),
            )));
        };

        let mut rows = Vec::with_capacity((end - start) as usize);
        let mut consumed = 0u64;
        let mut skipped = 0u64;
        let now = Utc::now();

        for offset in *start..*end {
            if control.is_cancelled() {
                break;
            }
            control.throttle().await;

            let name = campaign
                .pattern
                .domain_at(&BigUint::from(offset))
                .map_err(ProcessError::Fatal)?;
            consumed += 1;
            if is_valid_domain(&name) {
                rows.push(GeneratedDomain {
                    campaign_id: campaign.id,
                    global_offset: offset,
                    domain_name: name,
                    created_at: now,
                });
            } else {
                skipped += 1;
            }
        }

        let inserted = if rows.is_empty() {
            0
        } else {
            self.store
                .insert_generated(rows)
                .await
                .map_err(store_error)? as u64
        };

        if skipped > 0 {
            tracing::debug!(
                campaign_id = %campaign.id,
                skipped,
                "Skipped illegal domain names; offsets still consumed"
            );
        }

        self.store
            .bump_counters(
                campaign.id,
                Phase::Generation,
                CounterDelta {
                    processed: consumed,
                    succeeded: inserted,
                    failed: skipped,
                },
            )
            .await
            .map_err(store_error)?;
        self.store
            .reconcile_counters(campaign.id, Phase::Generation)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
