//! In-memory store backend
//!
//! Reference implementation used by tests and single-process deployments.
//! Every trait method applies under one lock, so each call is atomic;
//! idempotency comes from the same upsert keys the durable backend uses.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigUint;
use num_traits::Zero;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventEnvelope, OutboxEntry};
use crate::model::{
    AuditRecord, Campaign, CampaignPatch, CounterDelta, DnsResult, GeneratedDomain, HttpResult,
    KeywordSet, Lead, NewCampaign, Persona, PersonaKind, Phase, PhaseCounters, PhaseStatus,
    ProbeStatus, Proxy,
};

use super::{Cursor, EngineStore, OffsetReservation, Page};

struct OutboxRecord {
    entry: OutboxEntry,
    published: bool,
}

#[derive(Default)]
struct Inner {
    campaigns: HashMap<Uuid, Campaign>,
    generated: HashMap<Uuid, BTreeMap<u64, GeneratedDomain>>,
    generated_names: HashMap<Uuid, HashSet<String>>,
    dns: HashMap<Uuid, BTreeMap<String, DnsResult>>,
    http: HashMap<Uuid, BTreeMap<String, HttpResult>>,
    leads: HashMap<Uuid, BTreeMap<String, Lead>>,
    offsets: HashMap<String, BigUint>,
    personas: HashMap<Uuid, Persona>,
    proxies: HashMap<Uuid, Proxy>,
    keyword_sets: HashMap<Uuid, KeywordSet>,
    outbox: Vec<OutboxRecord>,
    outbox_next_id: i64,
    outbox_seq: HashMap<Uuid, u64>,
    audit: Vec<AuditRecord>,
}

/// In-memory [`EngineStore`] backend
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

fn campaign_not_found(id: Uuid) -> Error {
    Error::not_found(format_args!("campaign {id}"))
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let fingerprint = new.pattern.fingerprint();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            name: new.name,
            current_phase: Phase::Generation,
            phase_status: PhaseStatus::Configured,
            version: 1,
            pattern: new.pattern,
            fingerprint,
            requested_count: new.requested_count,
            counters: BTreeMap::new(),
            results: Default::default(),
            metadata: serde_json::Map::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.lock().campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>> {
        Ok(self.lock().campaigns.get(&id).cloned())
    }

    async fn list_campaigns(
        &self,
        owner_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Campaign>> {
        let inner = self.lock();
        let mut campaigns: Vec<Campaign> = inner
            .campaigns
            .values()
            .filter(|c| owner_id.is_none_or(|owner| c.owner_id == owner))
            .cloned()
            .collect();
        campaigns.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(campaigns.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_campaign(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: CampaignPatch,
    ) -> Result<Campaign> {
        let mut inner = self.lock();
        let campaign = inner
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| campaign_not_found(id))?;
        if campaign.version != expected_version {
            return Err(Error::Conflict(format!(
                "campaign {id} is at version {}, expected {expected_version}",
                campaign.version
            )));
        }
        if let Some(phase) = patch.current_phase {
            campaign.current_phase = phase;
        }
        if let Some(status) = patch.phase_status {
            campaign.phase_status = status;
        }
        for (key, value) in patch.metadata {
            campaign.metadata.insert(key, value);
        }
        if let Some(last_error) = patch.last_error {
            campaign.last_error = last_error;
        }
        if let Some(results) = patch.results {
            campaign.results = results;
        }
        campaign.version += 1;
        campaign.updated_at = Utc::now();
        Ok(campaign.clone())
    }

    async fn delete_campaign(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        inner
            .campaigns
            .remove(&id)
            .ok_or_else(|| campaign_not_found(id))?;
        inner.generated.remove(&id);
        inner.generated_names.remove(&id);
        inner.dns.remove(&id);
        inner.http.remove(&id);
        inner.leads.remove(&id);
        // The audit trail is append-only and outlives the campaign.
        Ok(())
    }

    async fn set_phase_total(&self, campaign_id: Uuid, phase: Phase, total: u64) -> Result<()> {
        let mut inner = self.lock();
        let campaign = inner
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| campaign_not_found(campaign_id))?;
        campaign.counters.insert(
            phase,
            PhaseCounters {
                total,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn bump_counters(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        delta: CounterDelta,
    ) -> Result<PhaseCounters> {
        let mut inner = self.lock();
        let campaign = inner
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| campaign_not_found(campaign_id))?;
        let counters = campaign.counters.entry(phase).or_default();
        counters.processed += delta.processed;
        counters.succeeded += delta.succeeded;
        counters.failed += delta.failed;
        Ok(*counters)
    }

    async fn clear_phase_failures(&self, campaign_id: Uuid, phase: Phase) -> Result<()> {
        let mut inner = self.lock();
        let campaign = inner
            .campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| campaign_not_found(campaign_id))?;
        if let Some(counters) = campaign.counters.get_mut(&phase) {
            counters.failed = 0;
        }
        Ok(())
    }

    async fn reconcile_counters(&self, campaign_id: Uuid, phase: Phase) -> Result<PhaseCounters> {
        let mut inner = self.lock();
        if !inner.campaigns.contains_key(&campaign_id) {
            return Err(campaign_not_found(campaign_id));
        }

        let (row_processed, row_succeeded, row_failed) = match phase {
            Phase::Generation => {
                let rows = inner
                    .generated
                    .get(&campaign_id)
                    .map(|m| m.len() as u64)
                    .unwrap_or(0);
                (None, Some(rows), None)
            }
            Phase::DnsValidation => {
                let rows = inner.dns.get(&campaign_id);
                let total = rows.map(|m| m.len() as u64).unwrap_or(0);
                let ok = rows
                    .map(|m| m.values().filter(|r| r.status == ProbeStatus::Ok).count() as u64)
                    .unwrap_or(0);
                (Some(total), Some(ok), Some(total - ok))
            }
            Phase::HttpKeywordValidation => {
                let rows = inner.http.get(&campaign_id);
                let total = rows.map(|m| m.len() as u64).unwrap_or(0);
                let ok = rows
                    .map(|m| m.values().filter(|r| r.status == ProbeStatus::Ok).count() as u64)
                    .unwrap_or(0);
                (Some(total), Some(ok), Some(total - ok))
            }
            Phase::Analysis => {
                let rows = inner
                    .leads
                    .get(&campaign_id)
                    .map(|m| m.len() as u64)
                    .unwrap_or(0);
                (None, Some(rows), None)
            }
        };

        let campaign = inner
            .campaigns
            .get_mut(&campaign_id)
            .expect("checked above");
        let counters = campaign.counters.entry(phase).or_default();
        // Rows are the authority, but never regress counts that track work
        // rows cannot witness (dead-lettered batches).
        if let Some(processed) = row_processed {
            counters.processed = counters.processed.max(processed);
        }
        if let Some(succeeded) = row_succeeded {
            counters.succeeded = succeeded;
        }
        if let Some(failed) = row_failed {
            counters.failed = counters.failed.max(failed);
        }
        Ok(*counters)
    }

    async fn insert_generated(&self, rows: Vec<GeneratedDomain>) -> Result<usize> {
        let mut inner = self.lock();
        let mut inserted = 0;
        for row in rows {
            if !inner.campaigns.contains_key(&row.campaign_id) {
                return Err(campaign_not_found(row.campaign_id));
            }
            let names = inner.generated_names.entry(row.campaign_id).or_default();
            if names.contains(&row.domain_name) {
                continue;
            }
            let by_offset = inner.generated.entry(row.campaign_id).or_default();
            if by_offset.contains_key(&row.global_offset) {
                continue;
            }
            inner
                .generated_names
                .entry(row.campaign_id)
                .or_default()
                .insert(row.domain_name.clone());
            inner
                .generated
                .entry(row.campaign_id)
                .or_default()
                .insert(row.global_offset, row);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn count_generated(&self, campaign_id: Uuid) -> Result<u64> {
        Ok(self
            .lock()
            .generated
            .get(&campaign_id)
            .map(|m| m.len() as u64)
            .unwrap_or(0))
    }

    async fn generated_in_range(
        &self,
        campaign_id: Uuid,
        start: u64,
        end: u64,
    ) -> Result<Vec<GeneratedDomain>> {
        Ok(self
            .lock()
            .generated
            .get(&campaign_id)
            .map(|rows| rows.range(start..end).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default())
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
                Some(cursor.sort_key.parse::<u64>().map_err(|_| {
                    Error::validation("malformed pagination cursor")
                })?)
            }
            None => None,
        };

        let inner = self.lock();
        let Some(rows) = inner.generated.get(&campaign_id) else {
            return Ok(Page {
                items: Vec::new(),
                next_cursor: None,
            });
        };
        let range = match after {
            Some(offset) => rows.range((Excluded(offset), Unbounded)),
            None => rows.range(..),
        };
        let mut items: Vec<GeneratedDomain> = range.map(|(_, r)| r.clone()).collect();
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
        let mut inner = self.lock();
        let known = inner
            .generated_names
            .get(&row.campaign_id)
            .is_some_and(|names| names.contains(&row.domain_name));
        if !known {
            return Err(Error::Validation(format!(
                "no generated domain {} in campaign {}",
                row.domain_name, row.campaign_id
            )));
        }
        let results = inner.dns.entry(row.campaign_id).or_default();
        let attempts = results
            .get(&row.domain_name)
            .map(|existing| existing.attempts + 1)
            .unwrap_or(1);
        results.insert(
            row.domain_name.clone(),
            DnsResult { attempts, ..row },
        );
        Ok(())
    }

    async fn list_dns_results(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<DnsResult>> {
        let after = cursor.map(Cursor::decode).transpose()?.map(|c| c.sort_key);
        let inner = self.lock();
        let Some(rows) = inner.dns.get(&campaign_id) else {
            return Ok(Page {
                items: Vec::new(),
                next_cursor: None,
            });
        };
        let range = match &after {
            Some(name) => rows.range::<String, _>((Excluded(name.clone()), Unbounded)),
            None => rows.range::<String, _>(..),
        };
        let mut items: Vec<DnsResult> = range.map(|(_, r)| r.clone()).collect();
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
        Ok(self
            .lock()
            .dns
            .get(&campaign_id)
            .map(|rows| {
                rows.values()
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn dns_resolved_domains(
        &self,
        campaign_id: Uuid,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let inner = self.lock();
        let Some(rows) = inner.dns.get(&campaign_id) else {
            return Ok(Vec::new());
        };
        let range = match after {
            Some(name) => rows.range::<str, _>((Excluded(name), Unbounded)),
            None => rows.range::<str, _>(..),
        };
        Ok(range
            .filter(|(_, r)| r.status == ProbeStatus::Ok)
            .take(limit)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn upsert_http_result(&self, row: HttpResult) -> Result<()> {
        let mut inner = self.lock();
        let known = inner
            .generated_names
            .get(&row.campaign_id)
            .is_some_and(|names| names.contains(&row.domain_name));
        if !known {
            return Err(Error::Validation(format!(
                "no generated domain {} in campaign {}",
                row.domain_name, row.campaign_id
            )));
        }
        let results = inner.http.entry(row.campaign_id).or_default();
        let attempts = results
            .get(&row.domain_name)
            .map(|existing| existing.attempts + 1)
            .unwrap_or(1);
        results.insert(
            row.domain_name.clone(),
            HttpResult { attempts, ..row },
        );
        Ok(())
    }

    async fn list_http_results(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<HttpResult>> {
        let after = cursor.map(Cursor::decode).transpose()?.map(|c| c.sort_key);
        let inner = self.lock();
        let Some(rows) = inner.http.get(&campaign_id) else {
            return Ok(Page {
                items: Vec::new(),
                next_cursor: None,
            });
        };
        let range = match &after {
            Some(name) => rows.range::<String, _>((Excluded(name.clone()), Unbounded)),
            None => rows.range::<String, _>(..),
        };
        let mut items: Vec<HttpResult> = range.map(|(_, r)| r.clone()).collect();
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
        Ok(self
            .lock()
            .http
            .get(&campaign_id)
            .map(|rows| {
                rows.values()
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn http_matched_domains(
        &self,
        campaign_id: Uuid,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let inner = self.lock();
        let Some(rows) = inner.http.get(&campaign_id) else {
            return Ok(Vec::new());
        };
        let range = match after {
            Some(name) => rows.range::<str, _>((Excluded(name), Unbounded)),
            None => rows.range::<str, _>(..),
        };
        Ok(range
            .filter(|(_, r)| !r.matched_keywords.is_empty())
            .take(limit)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_http_results(
        &self,
        campaign_id: Uuid,
        domains: &[String],
    ) -> Result<Vec<HttpResult>> {
        let inner = self.lock();
        let Some(rows) = inner.http.get(&campaign_id) else {
            return Ok(Vec::new());
        };
        Ok(domains
            .iter()
            .filter_map(|name| rows.get(name).cloned())
            .collect())
    }

    async fn unprobed_domains(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut eligible: Vec<String> = match phase {
            Phase::Generation => {
                return Err(Error::validation(
                    "generation has no probe results to backfill",
                ));
            }
            Phase::DnsValidation => {
                let probed = inner.dns.get(&campaign_id);
                inner
                    .generated
                    .get(&campaign_id)
                    .map(|rows| {
                        rows.values()
                            .map(|r| r.domain_name.clone())
                            .filter(|name| !probed.is_some_and(|m| m.contains_key(name)))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            Phase::HttpKeywordValidation => {
                let probed = inner.http.get(&campaign_id);
                inner
                    .dns
                    .get(&campaign_id)
                    .map(|rows| {
                        rows.values()
                            .filter(|r| r.status == ProbeStatus::Ok)
                            .map(|r| r.domain_name.clone())
                            .filter(|name| !probed.is_some_and(|m| m.contains_key(name)))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            Phase::Analysis => {
                let probed = inner.leads.get(&campaign_id);
                inner
                    .http
                    .get(&campaign_id)
                    .map(|rows| {
                        rows.values()
                            .filter(|r| !r.matched_keywords.is_empty())
                            .map(|r| r.domain_name.clone())
                            .filter(|name| !probed.is_some_and(|m| m.contains_key(name)))
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };
        eligible.sort();
        Ok(eligible
            .into_iter()
            .filter(|name| after.is_none_or(|a| name.as_str() > a))
            .take(limit)
            .collect())
    }

    async fn insert_leads(&self, rows: Vec<Lead>) -> Result<usize> {
        let mut inner = self.lock();
        let mut inserted = 0;
        for row in rows {
            let leads = inner.leads.entry(row.campaign_id).or_default();
            if leads.contains_key(&row.domain_name) {
                continue;
            }
            leads.insert(row.domain_name.clone(), row);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn list_leads(
        &self,
        campaign_id: Uuid,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Lead>> {
        let after = cursor.map(Cursor::decode).transpose()?.map(|c| c.sort_key);
        let inner = self.lock();
        let Some(rows) = inner.leads.get(&campaign_id) else {
            return Ok(Page {
                items: Vec::new(),
                next_cursor: None,
            });
        };
        let range = match &after {
            Some(name) => rows.range::<String, _>((Excluded(name.clone()), Unbounded)),
            None => rows.range::<String, _>(..),
        };
        let mut items: Vec<Lead> = range.map(|(_, r)| r.clone()).collect();
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
        let mut inner = self.lock();
        let current = inner
            .offsets
            .entry(fingerprint.to_string())
            .or_insert_with(BigUint::zero);
        let start = current.clone();
        *current += count;
        let end = current.clone();
        Ok(OffsetReservation { start, end })
    }

    async fn peek_offset(&self, fingerprint: &str) -> Result<BigUint> {
        Ok(self
            .lock()
            .offsets
            .get(fingerprint)
            .cloned()
            .unwrap_or_else(BigUint::zero))
    }

    async fn upsert_persona(&self, persona: Persona) -> Result<()> {
        self.lock().personas.insert(persona.id, persona);
        Ok(())
    }

    async fn get_persona(&self, id: Uuid) -> Result<Option<Persona>> {
        Ok(self.lock().personas.get(&id).cloned())
    }

    async fn list_personas(&self, kind: Option<PersonaKind>) -> Result<Vec<Persona>> {
        let inner = self.lock();
        let mut personas: Vec<Persona> = inner
            .personas
            .values()
            .filter(|p| kind.is_none_or(|k| p.kind() == k))
            .cloned()
            .collect();
        personas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(personas)
    }

    async fn upsert_proxy(&self, proxy: Proxy) -> Result<()> {
        self.lock().proxies.insert(proxy.id, proxy);
        Ok(())
    }

    async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        let inner = self.lock();
        let mut proxies: Vec<Proxy> = inner.proxies.values().cloned().collect();
        proxies.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(proxies)
    }

    async fn set_proxy_health(&self, id: Uuid, healthy: bool) -> Result<()> {
        let mut inner = self.lock();
        let proxy = inner
            .proxies
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format_args!("proxy {id}")))?;
        proxy.healthy = healthy;
        Ok(())
    }

    async fn upsert_keyword_set(&self, set: KeywordSet) -> Result<()> {
        self.lock().keyword_sets.insert(set.id, set);
        Ok(())
    }

    async fn get_keyword_set(&self, id: Uuid) -> Result<Option<KeywordSet>> {
        Ok(self.lock().keyword_sets.get(&id).cloned())
    }

    async fn outbox_append(&self, campaign_id: Uuid, event: EngineEvent) -> Result<u64> {
        let mut inner = self.lock();
        let seq = inner.outbox_seq.entry(campaign_id).or_insert(0);
        *seq += 1;
        let seq = *seq;
        inner.outbox_next_id += 1;
        let id = inner.outbox_next_id;
        inner.outbox.push(OutboxRecord {
            entry: OutboxEntry {
                id,
                envelope: EventEnvelope {
                    campaign_id,
                    seq,
                    at: Utc::now(),
                    event,
                },
            },
            published: false,
        });
        Ok(seq)
    }

    async fn outbox_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .lock()
            .outbox
            .iter()
            .filter(|r| !r.published)
            .take(limit)
            .map(|r| r.entry.clone())
            .collect())
    }

    async fn outbox_mark_published(&self, ids: &[i64]) -> Result<()> {
        let mut inner = self.lock();
        for record in inner.outbox.iter_mut() {
            if ids.contains(&record.entry.id) {
                record.published = true;
            }
        }
        inner.outbox.retain(|r| !r.published);
        Ok(())
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<()> {
        self.lock().audit.push(record);
        Ok(())
    }

    async fn list_audit(&self, entity_id: Option<Uuid>, limit: usize) -> Result<Vec<AuditRecord>> {
        Ok(self
            .lock()
            .audit
            .iter()
            .rev()
            .filter(|r| entity_id.is_none_or(|id| r.entity_id == Some(id)))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DnsErrorKind;
    use crate::pattern::PatternType;
    use crate::pattern::PatternSpec;
    use std::sync::Arc;

    fn spec() -> PatternSpec {
        PatternSpec {
            pattern_type: PatternType::Prefix,
            variable_length: 3,
            character_set: "ab".to_string(),
            constant_string: "x".to_string(),
            tld: "com".to_string(),
        }
    }

    async fn campaign(store: &MemoryStore) -> Campaign {
        store
            .create_campaign(NewCampaign {
                name: "widgets".to_string(),
                owner_id: "user-a".to_string(),
                pattern: spec(),
                requested_count: 8,
            })
            .await
            .unwrap()
    }

    fn generated(campaign_id: Uuid, offset: u64, name: &str) -> GeneratedDomain {
        GeneratedDomain {
            campaign_id,
            global_offset: offset,
            domain_name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    fn dns_row(campaign_id: Uuid, name: &str, ok: bool) -> DnsResult {
        DnsResult {
            campaign_id,
            domain_name: name.to_string(),
            persona_id: Uuid::new_v4(),
            status: if ok { ProbeStatus::Ok } else { ProbeStatus::Failed },
            resolved_addresses: Vec::new(),
            error_kind: (!ok).then_some(DnsErrorKind::Nxdomain),
            attempts: 0,
            last_checked_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_version_conflict_detected() {
        let store = MemoryStore::new();
        let c = campaign(&store).await;
        let updated = store
            .update_campaign(c.id, c.version, CampaignPatch::default())
            .await
            .unwrap();
        assert_eq!(updated.version, c.version + 1);
        // Stale version loses.
        let err = store
            .update_campaign(c.id, c.version, CampaignPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_generated_insert_skips_duplicates() {
        let store = MemoryStore::new();
        let c = campaign(&store).await;
        let rows = vec![
            generated(c.id, 0, "aaax.com"),
            generated(c.id, 1, "baax.com"),
        ];
        assert_eq!(store.insert_generated(rows.clone()).await.unwrap(), 2);
        // Concurrent reservations can race the same rows in; they no-op.
        assert_eq!(store.insert_generated(rows).await.unwrap(), 0);
        assert_eq!(store.count_generated(c.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dns_upsert_is_idempotent_and_bumps_attempts() {
        let store = MemoryStore::new();
        let c = campaign(&store).await;
        store
            .insert_generated(vec![generated(c.id, 0, "aaax.com")])
            .await
            .unwrap();

        store.upsert_dns_result(dns_row(c.id, "aaax.com", false)).await.unwrap();
        store.upsert_dns_result(dns_row(c.id, "aaax.com", true)).await.unwrap();

        assert_eq!(store.count_dns_results(c.id, None).await.unwrap(), 1);
        let page = store.list_dns_results(c.id, 10, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        // Last write wins, attempts accumulate.
        assert_eq!(page.items[0].status, ProbeStatus::Ok);
        assert_eq!(page.items[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_result_requires_generated_row() {
        let store = MemoryStore::new();
        let c = campaign(&store).await;
        let err = store
            .upsert_dns_result(dns_row(c.id, "ghost.com", true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_reservations_are_disjoint_and_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let fp = spec().fingerprint();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                store.reserve_offsets(&fp, 100).await.unwrap()
            }));
        }
        let mut ranges = Vec::new();
        for handle in handles {
            ranges.push(handle.await.unwrap());
        }

        ranges.sort_by(|a, b| a.start.cmp(&b.start));
        let mut expected = BigUint::zero();
        for range in &ranges {
            assert_eq!(range.start, expected, "gap or overlap in reservations");
            expected = range.end.clone();
        }
        assert_eq!(store.peek_offset(&fp).await.unwrap(), BigUint::from(800u32));
    }

    #[tokio::test]
    async fn test_list_generated_pagination_round_trip() {
        let store = MemoryStore::new();
        let c = campaign(&store).await;
        let rows: Vec<GeneratedDomain> = (0..25)
            .map(|i| generated(c.id, i, &format!("d{i:03}.com")))
            .collect();
        store.insert_generated(rows).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .list_generated(c.id, 7, cursor.as_deref())
                .await
                .unwrap();
            seen.extend(page.items.iter().map(|r| r.global_offset));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, (0..25).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_cursor_stable_under_concurrent_inserts() {
        let store = MemoryStore::new();
        let c = campaign(&store).await;
        store
            .insert_generated((0..10).map(|i| generated(c.id, i, &format!("d{i:02}.com"))).collect())
            .await
            .unwrap();

        let first = store.list_generated(c.id, 5, None).await.unwrap();
        // Rows inserted behind the cursor must not shift the next page.
        store
            .insert_generated(vec![generated(c.id, 2, "dupe-offset.com")])
            .await
            .unwrap();
        let second = store
            .list_generated(c.id, 5, first.next_cursor.as_deref())
            .await
            .unwrap();
        let offsets: Vec<u64> = second.items.iter().map(|r| r.global_offset).collect();
        assert_eq!(offsets, vec![5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = MemoryStore::new();
        let c = campaign(&store).await;
        store
            .insert_generated(vec![generated(c.id, 0, "aaax.com")])
            .await
            .unwrap();
        store.upsert_dns_result(dns_row(c.id, "aaax.com", true)).await.unwrap();

        store.delete_campaign(c.id).await.unwrap();
        assert!(store.get_campaign(c.id).await.unwrap().is_none());
        assert_eq!(store.count_generated(c.id).await.unwrap(), 0);
        assert_eq!(store.count_dns_results(c.id, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_counters_matches_rows() {
        let store = MemoryStore::new();
        let c = campaign(&store).await;
        store
            .insert_generated(vec![
                generated(c.id, 0, "aaax.com"),
                generated(c.id, 1, "baax.com"),
                generated(c.id, 2, "abax.com"),
            ])
            .await
            .unwrap();
        store.upsert_dns_result(dns_row(c.id, "aaax.com", false)).await.unwrap();
        store.upsert_dns_result(dns_row(c.id, "baax.com", true)).await.unwrap();
        store.upsert_dns_result(dns_row(c.id, "abax.com", true)).await.unwrap();

        let counters = store
            .reconcile_counters(c.id, Phase::DnsValidation)
            .await
            .unwrap();
        assert_eq!(counters.processed, 3);
        assert_eq!(counters.succeeded, 2);
        assert_eq!(counters.failed, 1);
    }

    #[tokio::test]
    async fn test_outbox_sequences_per_campaign() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(store.outbox_append(a, EngineEvent::CampaignDeleted).await.unwrap(), 1);
        assert_eq!(store.outbox_append(b, EngineEvent::CampaignDeleted).await.unwrap(), 1);
        assert_eq!(store.outbox_append(a, EngineEvent::CampaignDeleted).await.unwrap(), 2);

        let entries = store.outbox_unpublished(10).await.unwrap();
        assert_eq!(entries.len(), 3);
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        store.outbox_mark_published(&ids).await.unwrap();
        assert!(store.outbox_unpublished(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_campaigns_scoped_to_owner() {
        let store = MemoryStore::new();
        let mine = campaign(&store).await;
        store
            .create_campaign(NewCampaign {
                name: "other".to_string(),
                owner_id: "user-b".to_string(),
                pattern: spec(),
                requested_count: 1,
            })
            .await
            .unwrap();

        let listed = store.list_campaigns(Some("user-a"), 10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, mine.id);
        assert_eq!(store.list_campaigns(None, 10, 0).await.unwrap().len(), 2);
    }
}
