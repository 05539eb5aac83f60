//! Lead Selector
//!
//! Decides which lead a campaign dials next: dialable status, attempt cap,
//! retry cooldown, then the priority ordering. Time is passed in explicitly
//! so cooldown behavior can be pinned down on simulated clocks.

use chrono::{DateTime, Duration, Utc};
use dialhub_core::domain::{Campaign, Lead, LeadStatus};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::repository::Repository;

/// Lead statuses that remain dialable
const DIALABLE_STATUSES: [LeadStatus; 3] =
    [LeadStatus::New, LeadStatus::Callback, LeadStatus::Interested];

/// How many candidates to pull from storage per selection
const SELECTION_BATCH: i64 = 200;

pub struct LeadSelector {
    repo: Arc<dyn Repository>,
}

impl LeadSelector {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Next eligible lead for the campaign, or `None` when it has run dry.
    pub async fn next_lead(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<Option<Lead>> {
        let candidates = self
            .repo
            .leads_for_selection(campaign.id, &DIALABLE_STATUSES, SELECTION_BATCH)
            .await?;

        let mut eligible = Vec::new();
        for lead in candidates {
            if lead.phone_number.trim().is_empty() {
                continue;
            }
            let attempts = self.repo.call_count(lead.id).await?;
            if attempts >= campaign.max_attempts as i64 {
                continue;
            }
            if attempts > 0 {
                if let Some(last) = self.repo.latest_call(lead.id).await? {
                    let retry_at = last.started_at + Duration::minutes(campaign.retry_delay_minutes);
                    if now < retry_at {
                        continue;
                    }
                }
            }
            eligible.push(lead);
        }

        eligible.sort_by(compare_leads);
        Ok(eligible.into_iter().next())
    }
}

/// Ordering: priority desc, next_contact_date asc (nulls last),
/// last_contacted asc (nulls first), id asc.
fn compare_leads(a: &Lead, b: &Lead) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.next_contact_date, b.next_contact_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| match (a.last_contacted, b.last_contacted) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}
