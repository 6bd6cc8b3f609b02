//! Analysis phase processor
//!
//! Reads HTTP results with keyword matches and materializes lead rows: one
//! per domain, scored by how many distinct rules matched, carrying the
//! distinct rule categories. A minimum score from the phase config filters
//! weak hits.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::control::CampaignControl;
use crate::error::Error;
use crate::model::{
    AnalysisPhaseConfig, Campaign, CounterDelta, Job, JobPayload, Lead, Phase,
};
use crate::store::EngineStore;

use super::{JobProcessor, ProcessError};

pub struct AnalysisProcessor {
    store: Arc<dyn EngineStore>,
}

impl AnalysisProcessor {
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
impl JobProcessor for AnalysisProcessor {
    fn phase(&self) -> Phase {
        Phase::Analysis
    }

    fn pool_name(&self) -> &'static str {
        "analysis"
    }

    fn rate_limit(&self, _campaign: &Campaign) -> Option<u32> {
        None
    }

    async fn process(
        &self,
        job: &Job,
        campaign: &Campaign,
        control: &CampaignControl,
    ) -> std::result::Result<(), ProcessError> {
        let config: AnalysisPhaseConfig = campaign
            .phase_config(Phase::Analysis)
            .map_err(ProcessError::Fatal)?
            .unwrap_or_default();
        let JobPayload::Domains { names } = &job.payload else {
            return Err(ProcessError::Fatal(Error::Internal(
                "analysis job carries an offset-range payload".to_string(),
            )));
        };

        if control.is_cancelled() {
            return Ok(());
        }

        let results = self
            .store
            .get_http_results(campaign.id, names)
            .await
            .map_err(store_error)?;

        let now = Utc::now();
        let leads: Vec<Lead> = results
            .iter()
            .filter(|result| !result.matched_keywords.is_empty())
            .filter_map(|result| {
                let score = result.matched_keywords.len() as u32;
                if score < config.min_score {
                    return None;
                }
                let categories: BTreeSet<String> = result
                    .matched_keywords
                    .iter()
                    .filter_map(|m| m.category.clone())
                    .collect();
                Some(Lead {
                    campaign_id: campaign.id,
                    domain_name: result.domain_name.clone(),
                    categories: categories.into_iter().collect(),
                    score,
                    created_at: now,
                })
            })
            .collect();

        let inserted = if leads.is_empty() {
            0
        } else {
            self.store.insert_leads(leads).await.map_err(store_error)? as u64
        };

        self.store
            .bump_counters(
                campaign.id,
                Phase::Analysis,
                CounterDelta {
                    processed: names.len() as u64,
                    succeeded: inserted,
                    failed: 0,
                },
            )
            .await
            .map_err(store_error)?;
        self.store
            .reconcile_counters(campaign.id, Phase::Analysis)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
