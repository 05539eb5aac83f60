//! Dialer Engine
//!
//! Registry of running campaign dialers, owner of the single AMI session
//! and of all in-memory agent state, and the one place calls are placed
//! from. Everything the HTTP layer may do goes through this facade.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dialhub_ami::{AmiError, AmiMessage, AmiSession, EVENT_SESSION_CLOSED};
use dialhub_telemetry::{Counter, Gauge, Histogram};
use dialhub_core::domain::{
    AgentId, AgentStatus, Call, CallId, CallStatus, Campaign, CampaignId, CampaignStatus,
    DialerMode, DialerStats, Lead, LeadId,
};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::agents::{AgentRegistry, AgentState};
use crate::config::Config;
use crate::dialer::DialerHandle;
use crate::error::{Error, Result};
use crate::leads::LeadSelector;
use crate::reconciler;
use crate::repository::{NewCall, Repository};

/// How long `stop` waits for a dialer task before abandoning it
pub(crate) const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Call lifecycle signals broadcast to subscribers (e.g. a realtime push
/// channel owned by the HTTP layer).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CallRinging { call_id: CallId },
    CallAnswered { call_id: CallId },
    CallEnded { call_id: CallId },
}

/// Operational metrics exported by the engine
#[derive(Clone)]
pub struct EngineMetrics {
    pub calls_originated: Counter,
    pub originate_failures: Counter,
    pub calls_answered: Counter,
    pub calls_completed: Counter,
    pub call_duration_seconds: Histogram,
    pub active_calls: Gauge,
    pub running_dialers: Gauge,
    pub ami_reconnects: Counter,
}

impl EngineMetrics {
    fn new() -> Self {
        Self {
            calls_originated: Counter::new("dialer_calls_originated_total"),
            originate_failures: Counter::new("dialer_originate_failures_total"),
            calls_answered: Counter::new("dialer_calls_answered_total"),
            calls_completed: Counter::new("dialer_calls_completed_total"),
            call_duration_seconds: Histogram::new("dialer_call_duration_seconds"),
            active_calls: Gauge::new("dialer_active_calls"),
            running_dialers: Gauge::new("dialer_running_dialers"),
            ami_reconnects: Counter::new("dialer_ami_reconnects_total"),
        }
    }
}

pub struct DialerEngine {
    config: Config,
    repo: Arc<dyn Repository>,
    registry: AgentRegistry,
    selector: LeadSelector,
    session: RwLock<Option<Arc<AmiSession>>>,
    running: DashMap<CampaignId, DialerHandle>,
    channel_calls: DashMap<String, CallId>,
    stats: DashMap<CampaignId, DialerStats>,
    events_tx: broadcast::Sender<EngineEvent>,
    reconciler_tx: mpsc::Sender<AmiMessage>,
    session_down: Arc<Notify>,
    degraded: AtomicBool,
    metrics: EngineMetrics,
    /// Back-reference handed to spawned dialer tasks
    self_ref: Weak<DialerEngine>,
}

impl DialerEngine {
    /// Build the engine, wire the reconciler onto the session (when one is
    /// given) and start the background workers.
    pub async fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        session: Option<Arc<AmiSession>>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let (reconciler_tx, reconciler_rx) = mpsc::channel(1024);

        let engine = Arc::new_cyclic(|weak| Self {
            registry: AgentRegistry::new(config.agent_day_timezone),
            selector: LeadSelector::new(repo.clone()),
            config,
            repo,
            session: RwLock::new(None),
            running: DashMap::new(),
            channel_calls: DashMap::new(),
            stats: DashMap::new(),
            events_tx,
            reconciler_tx,
            session_down: Arc::new(Notify::new()),
            degraded: AtomicBool::new(false),
            metrics: EngineMetrics::new(),
            self_ref: weak.clone(),
        });

        if let Some(session) = session {
            engine.attach_session(&session).await;
        }

        tokio::spawn(reconciler::run(engine.clone(), reconciler_rx));
        tokio::spawn(Self::supervise_session(engine.clone()));

        engine
    }

    /// Subscribe the reconciler queue and the supervisor to a session and
    /// make it the engine's current one.
    pub async fn attach_session(&self, session: &Arc<AmiSession>) {
        for event in ["Newchannel", "DialBegin", "DialEnd", "Bridge", "Hangup"] {
            let tx = self.reconciler_tx.clone();
            session.subscribe(event, move |msg| {
                if tx.try_send(msg.clone()).is_err() {
                    warn!("Reconciler queue full, dropping AMI event");
                }
            });
        }
        let down = self.session_down.clone();
        session.subscribe(EVENT_SESSION_CLOSED, move |_| down.notify_one());

        *self.session.write().await = Some(session.clone());
    }

    /// Start the campaign's dialer. Idempotent: starting a running campaign
    /// is a no-op.
    pub async fn start(&self, campaign_id: CampaignId) -> Result<()> {
        let campaign = self
            .repo
            .campaign_by_id(campaign_id)
            .await?
            .ok_or(Error::CampaignNotFound(campaign_id))?;
        if campaign.status != CampaignStatus::Active {
            return Err(Error::CampaignNotActive);
        }
        if self.repo.assignments_of(campaign_id).await?.is_empty() {
            return Err(Error::NoAgentsAssigned);
        }
        if self.repo.lead_count(campaign_id).await? == 0 {
            return Err(Error::NoLeadsAvailable);
        }

        match self.running.entry(campaign_id) {
            Entry::Occupied(_) => {
                debug!(campaign_id = %campaign_id, "Dialer already running");
                Ok(())
            }
            Entry::Vacant(slot) => {
                let engine = self
                    .self_ref
                    .upgrade()
                    .ok_or_else(|| Error::Internal("engine is shutting down".to_string()))?;
                slot.insert(DialerHandle::spawn(engine, &campaign));
                self.metrics.running_dialers.inc();
                info!(
                    campaign_id = %campaign_id,
                    mode = campaign.dialer_mode.as_str(),
                    "Dialer started"
                );
                Ok(())
            }
        }
    }

    /// Stop the campaign's dialer, waiting up to the shutdown budget.
    /// Idempotent: stopping a non-running campaign is a no-op.
    pub async fn stop(&self, campaign_id: CampaignId) -> Result<()> {
        let Some((_, handle)) = self.running.remove(&campaign_id) else {
            return Ok(());
        };
        handle.signal_shutdown();
        if !handle.join(SHUTDOWN_BUDGET).await {
            warn!(campaign_id = %campaign_id, "Dialer missed the shutdown budget, abandoning task");
        }
        self.metrics.running_dialers.dec();
        info!(campaign_id = %campaign_id, "Dialer stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let campaign_ids: Vec<CampaignId> = self.running.iter().map(|e| *e.key()).collect();
        for campaign_id in campaign_ids {
            let _ = self.stop(campaign_id).await;
        }
    }

    pub fn running(&self, campaign_id: CampaignId) -> bool {
        self.running.contains_key(&campaign_id)
    }

    /// The single call-placement primitive used by every dialer variant.
    ///
    /// The call row is created before the AMI action is submitted, so even
    /// a failed submission leaves an auditable `failed` call behind.
    /// Predictive over-dial may place calls with no agent attached yet.
    pub async fn originate(
        &self,
        campaign: &Campaign,
        lead: &Lead,
        agent: Option<AgentId>,
    ) -> Result<CallId> {
        let now = Utc::now();
        let call = self
            .repo
            .insert_call(NewCall {
                lead_id: lead.id,
                campaign_id: campaign.id,
                agent_id: agent,
                phone_number: lead.phone_number.clone(),
                started_at: now,
            })
            .await?;

        if let Some(agent_id) = agent {
            if let Err(e) = self.registry.begin_call(agent_id, call.id, now) {
                self.record_originate_failure(campaign.id, call, None, &e).await;
                return Err(e);
            }
        }

        let channel = format!("SIP/{}/{}", self.config.ami_username, lead.phone_number);
        let caller_id = format!("<{}>", lead.phone_number);
        let call_id_var = call.id.to_string();
        let agent_channel = agent.map(|a| format!("Agent/{}", a));

        let mut variables: Vec<(&str, &str)> = vec![("CALL_ID", call_id_var.as_str())];
        if let Some(agent_channel) = agent_channel.as_deref() {
            variables.push(("AGENT_CHANNEL", agent_channel));
        }
        variables.push(("PHONE_NUMBER", lead.phone_number.as_str()));

        let submit = match self.session().await {
            Some(session) => session
                .originate(
                    &channel,
                    "default",
                    &lead.phone_number,
                    Some(&caller_id),
                    &variables,
                )
                .await
                .map_err(Error::from)
                .and_then(|response| {
                    if response.is_success() {
                        Ok(response)
                    } else {
                        Err(Error::OriginateFailed(
                            response
                                .get("Message")
                                .unwrap_or("originate rejected")
                                .to_string(),
                        ))
                    }
                }),
            None => Err(Error::from(AmiError::NotConnected)),
        };

        match submit {
            Ok(response) => {
                self.repo
                    .insert_call_event(
                        call.id,
                        "originate_response",
                        reconciler::ami_payload(&response),
                        now,
                    )
                    .await?;
                self.channel_calls.insert(channel, call.id);
                if let Some(agent_id) = agent {
                    self.registry.note_call_placed(agent_id, now);
                }
                self.repo.touch_lead(lead.id, now).await?;
                self.with_stats(campaign.id, |s| s.total_calls += 1);
                self.metrics.calls_originated.inc();
                self.metrics.active_calls.inc();
                debug!(
                    campaign_id = %campaign.id,
                    call_id = %call.id,
                    lead_id = %lead.id,
                    "Call originated"
                );
                Ok(call.id)
            }
            Err(e) => {
                self.record_originate_failure(campaign.id, call, agent, &e).await;
                Err(e)
            }
        }
    }

    /// Mark a never-submitted call terminally failed and put the agent
    /// back where it was.
    async fn record_originate_failure(
        &self,
        campaign_id: CampaignId,
        call: Call,
        claimed_agent: Option<AgentId>,
        reason: &Error,
    ) {
        let now = Utc::now();
        let mut failed = call;
        failed.status = CallStatus::Failed;
        failed.mark_ended(now);
        if let Err(db) = self.repo.update_call(&failed).await {
            error!(call_id = %failed.id, "Failed to persist failed call: {}", db);
        }
        if let Err(db) = self
            .repo
            .insert_call_event(
                failed.id,
                "originate_response",
                json!({ "error": reason.to_string() }),
                now,
            )
            .await
        {
            error!(call_id = %failed.id, "Failed to persist originate_response event: {}", db);
        }
        if let Some(agent_id) = claimed_agent {
            self.registry.finish_call(agent_id, failed.id, 0, now);
        }
        self.with_stats(campaign_id, |s| {
            s.total_calls += 1;
            s.failed_calls += 1;
        });
        self.metrics.originate_failures.inc();
        warn!(call_id = %failed.id, "Originate failed: {}", reason);
    }

    /// Manually place a call on a manual-mode campaign.
    pub async fn manual_call(
        &self,
        campaign_id: CampaignId,
        lead_id: LeadId,
        agent_id: AgentId,
    ) -> Result<CallId> {
        let campaign = self
            .repo
            .campaign_by_id(campaign_id)
            .await?
            .ok_or(Error::CampaignNotFound(campaign_id))?;
        if campaign.dialer_mode != DialerMode::Manual {
            return Err(Error::InvalidDialerMode);
        }
        if !self.running(campaign_id) {
            return Err(Error::DialerNotRunning);
        }
        let lead = self
            .repo
            .lead_by_id(lead_id)
            .await?
            .ok_or(Error::LeadNotFound(lead_id))?;
        if lead.campaign_id != campaign_id {
            return Err(Error::LeadNotInCampaign);
        }
        let assigned = self.repo.assignments_of(campaign_id).await?;
        if !assigned.iter().any(|a| a.agent_id == agent_id) {
            return Err(Error::AgentNotAvailable(agent_id));
        }
        if let Some(state) = self.registry.get(agent_id) {
            if state.status != AgentStatus::Available {
                return Err(Error::AgentNotAvailable(agent_id));
            }
        }
        self.originate(&campaign, &lead, Some(agent_id)).await
    }

    /// External agent status change. `on_call` is reserved for the engine
    /// itself, and an agent on an active call can only be released by the
    /// reconciler.
    pub fn update_agent_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<()> {
        if status == AgentStatus::OnCall {
            return Err(Error::Validation(
                "status on_call can only be set by the engine".to_string(),
            ));
        }
        if let Some(state) = self.registry.get(agent_id) {
            if state.status == AgentStatus::OnCall {
                return Err(Error::AgentBusy(agent_id));
            }
        }
        self.registry
            .set_status(agent_id, status, None, Utc::now())
    }

    pub fn agent_status(&self, agent_id: AgentId) -> Option<AgentState> {
        self.registry.get(agent_id)
    }

    pub async fn campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>> {
        self.repo.campaign_by_id(campaign_id).await
    }

    /// Rolling counter bundle for a campaign.
    pub async fn stats(&self, campaign_id: CampaignId) -> Result<DialerStats> {
        let mut stats = self
            .stats
            .get(&campaign_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        let assigned = self.assigned_agents(campaign_id).await?;
        stats.agent_utilization = if assigned.is_empty() {
            0.0
        } else {
            self.registry.on_call_count(&assigned) as f64 / assigned.len() as f64
        };
        Ok(stats)
    }

    /// Hang up a tracked call through the switch.
    pub async fn hangup(&self, call_id: CallId) -> Result<()> {
        let channel = self
            .channel_calls
            .iter()
            .find(|entry| *entry.value() == call_id)
            .map(|entry| entry.key().clone())
            .ok_or(Error::CallNotFound(call_id))?;
        let session = self.session().await.ok_or(Error::ConnectionLost)?;
        session.hangup(&channel).await.map_err(Error::from)?;
        Ok(())
    }

    /// Stop all dialers, then close the AMI session.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        if let Some(session) = self.session().await {
            session.close().await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub async fn session_connected(&self) -> bool {
        match self.session.read().await.as_ref() {
            Some(session) => session.connected(),
            None => false,
        }
    }

    pub async fn repo_ping(&self) -> bool {
        self.repo.ping().await
    }

    pub(crate) async fn session(&self) -> Option<Arc<AmiSession>> {
        self.session.read().await.clone()
    }

    pub(crate) fn broadcast(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn repo(&self) -> &dyn Repository {
        self.repo.as_ref()
    }

    pub(crate) fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub(crate) fn selector(&self) -> &LeadSelector {
        &self.selector
    }

    pub(crate) fn resolve_channel(&self, channel: &str) -> Option<CallId> {
        self.channel_calls.get(channel).map(|entry| *entry.value())
    }

    pub(crate) fn forget_channel(&self, channel: &str) {
        self.channel_calls.remove(channel);
    }

    pub(crate) fn with_stats(&self, campaign_id: CampaignId, update: impl FnOnce(&mut DialerStats)) {
        let mut entry = self.stats.entry(campaign_id).or_default();
        update(&mut entry);
        entry.recalculate();
    }

    pub(crate) async fn assigned_agents(&self, campaign_id: CampaignId) -> Result<Vec<AgentId>> {
        Ok(self
            .repo
            .assignments_of(campaign_id)
            .await?
            .into_iter()
            .map(|a| a.agent_id)
            .collect())
    }

    pub(crate) async fn available_agents(
        &self,
        campaign_id: CampaignId,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<AgentId>> {
        let assigned = self.assigned_agents(campaign_id).await?;
        Ok(self.registry.available_for(&assigned, now))
    }

    /// Reconnect loop: on session loss, retry with capped exponential
    /// backoff; when the budget runs out, stop every dialer and degrade.
    async fn supervise_session(engine: Arc<Self>) {
        loop {
            engine.session_down.notified().await;
            if engine.is_degraded() {
                return;
            }
            warn!("AMI session lost, reconnecting");

            let mut reconnected = false;
            for attempt in 1..=engine.config.ami_reconnect_attempts {
                let backoff =
                    Duration::from_millis(500 * (1u64 << (attempt - 1).min(6))).min(Duration::from_secs(30));
                tokio::time::sleep(backoff).await;
                match AmiSession::connect(engine.config.ami()).await {
                    Ok(session) => {
                        engine.attach_session(&session).await;
                        engine.metrics.ami_reconnects.inc();
                        info!(attempt, "AMI session re-established");
                        reconnected = true;
                        break;
                    }
                    Err(e) => warn!(attempt, "AMI reconnect failed: {}", e),
                }
            }

            if !reconnected {
                error!("AMI reconnect budget exhausted, disabling all dialers");
                engine.degraded.store(true, Ordering::SeqCst);
                engine.stop_all().await;
                return;
            }
        }
    }
}
