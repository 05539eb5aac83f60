//! In-memory repository used by the test suite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dialhub_core::domain::{
    Call, CallDirection, CallEvent, CallId, CallStatus, Campaign, CampaignAssignment, CampaignId,
    Lead, LeadId, LeadStatus,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::Result;
use crate::repository::{NewCall, Repository};

#[derive(Default)]
pub struct MemoryRepository {
    campaigns: DashMap<CampaignId, Campaign>,
    assignments: Mutex<Vec<CampaignAssignment>>,
    leads: DashMap<LeadId, Lead>,
    calls: DashMap<CallId, Call>,
    events: Mutex<Vec<CallEvent>>,
    next_call_id: AtomicI64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            next_call_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn add_lead(&self, lead: Lead) {
        self.leads.insert(lead.id, lead);
    }

    pub fn add_assignment(&self, campaign_id: CampaignId, agent_id: dialhub_core::domain::AgentId) {
        self.assignments.lock().push(CampaignAssignment {
            campaign_id,
            agent_id,
            assigned_at: Utc::now(),
        });
    }

    /// Insert a pre-built call row, e.g. dialing history for metrics tests.
    pub fn seed_call(&self, call: Call) {
        let next = call.id.0 + 1;
        self.next_call_id.fetch_max(next, Ordering::SeqCst);
        self.calls.insert(call.id, call);
    }

    pub fn call(&self, id: CallId) -> Option<Call> {
        self.calls.get(&id).map(|c| c.clone())
    }

    pub fn lead(&self, id: LeadId) -> Option<Lead> {
        self.leads.get(&id).map(|l| l.clone())
    }

    pub fn events_for(&self, call_id: CallId) -> Vec<CallEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.call_id == call_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn campaign_by_id(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.campaigns.get(&id).map(|c| c.clone()))
    }

    async fn assignments_of(&self, campaign_id: CampaignId) -> Result<Vec<CampaignAssignment>> {
        Ok(self
            .assignments
            .lock()
            .iter()
            .filter(|a| a.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn lead_by_id(&self, id: LeadId) -> Result<Option<Lead>> {
        Ok(self.leads.get(&id).map(|l| l.clone()))
    }

    async fn lead_count(&self, campaign_id: CampaignId) -> Result<i64> {
        Ok(self
            .leads
            .iter()
            .filter(|l| l.campaign_id == campaign_id)
            .count() as i64)
    }

    async fn leads_for_selection(
        &self,
        campaign_id: CampaignId,
        statuses: &[LeadStatus],
        limit: i64,
    ) -> Result<Vec<Lead>> {
        let mut leads: Vec<Lead> = self
            .leads
            .iter()
            .filter(|l| {
                l.campaign_id == campaign_id
                    && statuses.contains(&l.status)
                    && !l.phone_number.trim().is_empty()
            })
            .map(|l| l.clone())
            .collect();
        leads.sort_by_key(|l| l.id);
        leads.truncate(limit as usize);
        Ok(leads)
    }

    async fn touch_lead(&self, lead_id: LeadId, contacted_at: DateTime<Utc>) -> Result<()> {
        if let Some(mut lead) = self.leads.get_mut(&lead_id) {
            lead.last_contacted = Some(contacted_at);
        }
        Ok(())
    }

    async fn call_by_id(&self, id: CallId) -> Result<Option<Call>> {
        Ok(self.calls.get(&id).map(|c| c.clone()))
    }

    async fn call_count(&self, lead_id: LeadId) -> Result<i64> {
        Ok(self.calls.iter().filter(|c| c.lead_id == lead_id).count() as i64)
    }

    async fn latest_call(&self, lead_id: LeadId) -> Result<Option<Call>> {
        Ok(self
            .calls
            .iter()
            .filter(|c| c.lead_id == lead_id)
            .max_by_key(|c| (c.started_at, c.id))
            .map(|c| c.clone()))
    }

    async fn recent_calls(
        &self,
        campaign_id: CampaignId,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Call>> {
        let mut calls: Vec<Call> = self
            .calls
            .iter()
            .filter(|c| c.campaign_id == campaign_id && c.started_at >= since)
            .map(|c| c.clone())
            .collect();
        calls.sort_by_key(|c| std::cmp::Reverse((c.started_at, c.id)));
        calls.truncate(limit as usize);
        Ok(calls)
    }

    async fn insert_call(&self, new_call: NewCall) -> Result<Call> {
        let id = CallId(self.next_call_id.fetch_add(1, Ordering::SeqCst));
        let call = Call {
            id,
            lead_id: new_call.lead_id,
            campaign_id: new_call.campaign_id,
            agent_id: new_call.agent_id,
            phone_number: new_call.phone_number,
            direction: CallDirection::Outbound,
            status: CallStatus::Initiated,
            outcome: None,
            disposition_code: None,
            notes: None,
            started_at: new_call.started_at,
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
        };
        self.calls.insert(id, call.clone());
        Ok(call)
    }

    async fn update_call(&self, call: &Call) -> Result<()> {
        self.calls.insert(call.id, call.clone());
        Ok(())
    }

    async fn insert_call_event(
        &self,
        call_id: CallId,
        event_type: &str,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.events.lock().push(CallEvent {
            call_id,
            event_type: event_type.to_string(),
            payload,
            timestamp,
        });
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}
