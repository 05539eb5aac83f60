//! Campaign dialers
//!
//! One cooperative task per running campaign. Manual parks until stopped,
//! Turbo paces one call at a time, Predictive over-dials based on the
//! campaign's recent answer rate so agents spend less time idle.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dialhub_core::domain::{AgentId, Call, Campaign, CampaignId, DialerMode};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::DialerEngine;
use crate::error::Result;
use crate::repository::Repository;

/// Predictive pacing cycle length
const PREDICTIVE_CYCLE: Duration = Duration::from_secs(10);
/// Backoff when a campaign has run out of eligible leads
const NO_LEADS_BACKOFF: Duration = Duration::from_secs(30);
/// Backoff after a failed tick
const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Metrics window: last 24h of calls, capped at the most recent 100
const METRICS_WINDOW_HOURS: i64 = 24;
const METRICS_WINDOW_CAP: i64 = 100;

/// Assumed answer rate for campaigns without history
const DEFAULT_ANSWER_RATE: f64 = 0.3;
/// Assumed mean call duration without history (seconds)
const DEFAULT_AVG_DURATION: f64 = 180.0;
/// An on-call agent counts as "becoming free" past this fraction of the
/// average call duration
const IMMINENT_FRACTION: f64 = 0.8;
/// Hard ceiling on calls per predictive cycle
const MAX_CALLS_PER_CYCLE: usize = 10;

/// A running dialer task plus its cancellation token
pub(crate) struct DialerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DialerHandle {
    pub fn spawn(engine: Arc<DialerEngine>, campaign: &Campaign) -> Self {
        let (shutdown, token) = watch::channel(false);
        let campaign_id = campaign.id;
        let task = match campaign.dialer_mode {
            DialerMode::Manual => tokio::spawn(run_manual(campaign_id, token)),
            DialerMode::Turbo => tokio::spawn(run_turbo(engine, campaign_id, token)),
            DialerMode::Predictive => tokio::spawn(run_predictive(engine, campaign_id, token)),
        };
        Self { shutdown, task }
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Join the task; false when it missed the budget and was abandoned.
    pub async fn join(self, budget: Duration) -> bool {
        tokio::time::timeout(budget, self.task).await.is_ok()
    }
}

/// Sleep that doubles as a cancellation point. Returns true on shutdown.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(wait) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// The manual dialer has no pacing loop; calls arrive through the facade.
async fn run_manual(campaign_id: CampaignId, mut shutdown: watch::Receiver<bool>) {
    info!(campaign_id = %campaign_id, "Manual dialer started");
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    info!(campaign_id = %campaign_id, "Manual dialer stopped");
}

async fn run_turbo(
    engine: Arc<DialerEngine>,
    campaign_id: CampaignId,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(campaign_id = %campaign_id, "Turbo dialer started");
    loop {
        // Re-read the campaign every tick so pacing edits apply live.
        let campaign = match engine.repo().campaign_by_id(campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => {
                warn!(campaign_id = %campaign_id, "Campaign vanished, stopping dialer");
                break;
            }
            Err(e) => {
                warn!(campaign_id = %campaign_id, "Campaign load failed: {}", e);
                if sleep_or_shutdown(&mut shutdown, ERROR_BACKOFF).await {
                    break;
                }
                continue;
            }
        };

        let delay = Duration::from_secs(campaign.turbo_delay_seconds.max(1));
        if sleep_or_shutdown(&mut shutdown, delay).await {
            break;
        }

        match turbo_tick(&engine, &campaign).await {
            Ok(TickOutcome::Placed) | Ok(TickOutcome::Idle) => {}
            Ok(TickOutcome::OutOfLeads) => {
                if sleep_or_shutdown(&mut shutdown, NO_LEADS_BACKOFF).await {
                    break;
                }
            }
            Err(e) => {
                warn!(campaign_id = %campaign_id, "Turbo tick failed: {}", e);
                if sleep_or_shutdown(&mut shutdown, ERROR_BACKOFF).await {
                    break;
                }
            }
        }
    }
    info!(campaign_id = %campaign_id, "Turbo dialer stopped");
}

#[derive(Debug, PartialEq)]
pub(crate) enum TickOutcome {
    Placed,
    Idle,
    OutOfLeads,
}

/// One turbo pacing step: oldest-idle agent, next eligible lead, one call.
pub(crate) async fn turbo_tick(engine: &DialerEngine, campaign: &Campaign) -> Result<TickOutcome> {
    let now = Utc::now();
    if !within_schedule(campaign, now) {
        return Ok(TickOutcome::Idle);
    }
    let agents = engine.available_agents(campaign.id, now).await?;
    let Some(agent) = agents.first().copied() else {
        return Ok(TickOutcome::Idle);
    };
    let Some(lead) = engine.selector().next_lead(campaign, now).await? else {
        return Ok(TickOutcome::OutOfLeads);
    };
    match engine.originate(campaign, &lead, Some(agent)).await {
        Ok(call_id) => {
            info!(
                campaign_id = %campaign.id,
                call_id = %call_id,
                lead_id = %lead.id,
                agent_id = %agent,
                "Turbo dialer placed call"
            );
        }
        Err(e) => {
            warn!(campaign_id = %campaign.id, lead_id = %lead.id, "Turbo originate failed: {}", e);
        }
    }
    Ok(TickOutcome::Placed)
}

async fn run_predictive(
    engine: Arc<DialerEngine>,
    campaign_id: CampaignId,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(campaign_id = %campaign_id, "Predictive dialer started");
    loop {
        if sleep_or_shutdown(&mut shutdown, PREDICTIVE_CYCLE).await {
            break;
        }
        let campaign = match engine.repo().campaign_by_id(campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => {
                warn!(campaign_id = %campaign_id, "Campaign vanished, stopping dialer");
                break;
            }
            Err(e) => {
                warn!(campaign_id = %campaign_id, "Campaign load failed: {}", e);
                continue;
            }
        };
        if let Err(e) = predictive_cycle(&engine, &campaign, &mut shutdown).await {
            warn!(campaign_id = %campaign_id, "Predictive cycle failed: {}", e);
        }
    }
    info!(campaign_id = %campaign_id, "Predictive dialer stopped");
}

/// One predictive pacing cycle. Returns how many calls were submitted.
pub(crate) async fn predictive_cycle(
    engine: &DialerEngine,
    campaign: &Campaign,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<usize> {
    let now = Utc::now();
    if !within_schedule(campaign, now) {
        return Ok(0);
    }

    let assigned = engine.assigned_agents(campaign.id).await?;
    let metrics = refresh_metrics(engine.repo(), campaign.id, now).await?;
    let mut pool = engine.registry().available_for(&assigned, now);
    if pool.is_empty() {
        return Ok(0);
    }
    let imminent = engine.registry().imminent_free(
        &assigned,
        IMMINENT_FRACTION * metrics.avg_duration_secs,
        now,
    );
    let target = calls_needed(
        pool.len(),
        imminent,
        campaign.predictive_ratio,
        metrics.answer_rate,
    );
    debug!(
        campaign_id = %campaign.id,
        available = pool.len(),
        imminent,
        answer_rate = metrics.answer_rate,
        target,
        "Predictive pacing cycle"
    );

    let mut placed = 0;
    for _ in 0..target {
        if *shutdown.borrow() {
            break;
        }
        let Some(lead) = engine.selector().next_lead(campaign, Utc::now()).await? else {
            break;
        };
        // Past the free-agent pool the call is over-dial: it goes out with
        // no agent attached and is bridged to whoever frees up first.
        let agent = select_best_agent(&pool, &metrics);
        if let Some(agent_id) = agent {
            pool.retain(|a| *a != agent_id);
        }
        match engine.originate(campaign, &lead, agent).await {
            Ok(call_id) => {
                placed += 1;
                info!(
                    campaign_id = %campaign.id,
                    call_id = %call_id,
                    lead_id = %lead.id,
                    agent_id = ?agent,
                    "Predictive dialer placed call"
                );
            }
            Err(e) => {
                warn!(campaign_id = %campaign.id, lead_id = %lead.id, "Predictive originate failed: {}", e);
            }
        }
    }
    Ok(placed)
}

/// Per-agent performance over the metrics window
#[derive(Debug, Default, Clone)]
pub(crate) struct AgentWindow {
    pub total_calls: u32,
    pub answered_calls: u32,
    pub answer_rate: f64,
}

/// Campaign-level pacing inputs computed from recent call history
#[derive(Debug, Clone)]
pub(crate) struct CampaignMetrics {
    pub answer_rate: f64,
    pub avg_duration_secs: f64,
    pub per_agent: HashMap<AgentId, AgentWindow>,
}

fn was_answered(call: &Call) -> bool {
    call.answered_at.is_some()
}

/// Recompute the pacing inputs from the last 24h of campaign calls.
pub(crate) async fn refresh_metrics(
    repo: &dyn Repository,
    campaign_id: CampaignId,
    now: DateTime<Utc>,
) -> Result<CampaignMetrics> {
    let since = now - ChronoDuration::hours(METRICS_WINDOW_HOURS);
    let calls = repo
        .recent_calls(campaign_id, since, METRICS_WINDOW_CAP)
        .await?;

    let total = calls.len();
    let answered = calls.iter().filter(|c| was_answered(c)).count();
    let answer_rate = if total > 0 {
        answered as f64 / total as f64
    } else {
        DEFAULT_ANSWER_RATE
    };

    let durations: Vec<i64> = calls
        .iter()
        .filter(|c| was_answered(c))
        .filter_map(|c| c.duration_seconds)
        .filter(|d| *d > 0)
        .collect();
    let avg_duration_secs = if durations.is_empty() {
        DEFAULT_AVG_DURATION
    } else {
        durations.iter().sum::<i64>() as f64 / durations.len() as f64
    };

    let mut per_agent: HashMap<AgentId, AgentWindow> = HashMap::new();
    for call in &calls {
        let Some(agent_id) = call.agent_id else {
            continue;
        };
        let window = per_agent.entry(agent_id).or_default();
        window.total_calls += 1;
        if was_answered(call) {
            window.answered_calls += 1;
        }
    }
    for window in per_agent.values_mut() {
        window.answer_rate = if window.total_calls > 0 {
            window.answered_calls as f64 / window.total_calls as f64
        } else {
            DEFAULT_ANSWER_RATE
        };
    }

    Ok(CampaignMetrics {
        answer_rate,
        avg_duration_secs,
        per_agent,
    })
}

/// How many calls to submit this cycle.
///
/// `floor((available + imminent) * ratio / answer_rate)`, clamped to
/// `[0, min(3 * available, 10)]`. A zero answer rate dials straight to the
/// cap instead of running away.
pub(crate) fn calls_needed(
    available: usize,
    imminent: usize,
    predictive_ratio: f64,
    answer_rate: f64,
) -> usize {
    if available == 0 {
        return 0;
    }
    let cap = (available * 3).min(MAX_CALLS_PER_CYCLE);
    if answer_rate <= 0.0 {
        return cap;
    }
    let raw = ((available + imminent) as f64 * predictive_ratio / answer_rate).floor();
    if raw <= 0.0 {
        return 0;
    }
    (raw as usize).min(cap)
}

/// Score the pool and pick the best agent for the next call.
///
/// `0.7 * answer_rate + 0.3 * min(total_calls / 10, 1)` plus uniform noise
/// in [-0.1, 0.1] so one strong agent does not monopolize every callback.
pub(crate) fn select_best_agent(
    pool: &[AgentId],
    metrics: &CampaignMetrics,
) -> Option<AgentId> {
    match pool {
        [] => None,
        [only] => Some(*only),
        _ => {
            let mut rng = rand::thread_rng();
            pool.iter()
                .copied()
                .map(|agent_id| {
                    let window = metrics.per_agent.get(&agent_id);
                    let answer_rate = window.map_or(DEFAULT_ANSWER_RATE, |w| w.answer_rate);
                    let experience =
                        window.map_or(0.0, |w| (f64::from(w.total_calls) / 10.0).min(1.0));
                    let score =
                        0.7 * answer_rate + 0.3 * experience + rng.gen_range(-0.1..0.1);
                    (agent_id, score)
                })
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(agent_id, _)| agent_id)
        }
    }
}

/// Whether the campaign may dial right now: inside the validity window and
/// inside the daily window resolved in the campaign's timezone.
pub(crate) fn within_schedule(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    if let Some(start) = campaign.start_date {
        if now < start {
            return false;
        }
    }
    if let Some(end) = campaign.end_date {
        if now > end {
            return false;
        }
    }
    let (Some(open), Some(close)) = (campaign.daily_start_time, campaign.daily_end_time) else {
        return true;
    };
    let tz: chrono_tz::Tz = campaign.timezone.parse().unwrap_or_else(|_| {
        warn!(campaign_id = %campaign.id, timezone = %campaign.timezone, "Unknown timezone, using UTC");
        chrono_tz::UTC
    });
    let local = now.with_timezone(&tz).time();
    if open <= close {
        local >= open && local < close
    } else {
        // Window wraps midnight.
        local >= open || local < close
    }
}
