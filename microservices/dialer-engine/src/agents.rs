//! Agent Registry
//!
//! Process-wide table of agent availability plus per-day counters. Mutated
//! by the engine when calls are placed and by the reconciler when they end.
//! Nothing here is persisted; the registry is rebuilt lazily as agents are
//! referenced after a restart.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use dialhub_core::domain::{AgentId, AgentStatus, CallId};
use std::cmp::Ordering;

use crate::error::{Error, Result};

/// In-memory state for one agent
#[derive(Debug, Clone)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub current_call_id: Option<CallId>,
    pub current_call_started: Option<DateTime<Utc>>,
    pub last_call_end: Option<DateTime<Utc>>,
    pub calls_today: u32,
    pub talk_time_today: i64,
    day: NaiveDate,
}

impl AgentState {
    fn blank(agent_id: AgentId, day: NaiveDate) -> Self {
        Self {
            agent_id,
            status: AgentStatus::Available,
            current_call_id: None,
            current_call_started: None,
            last_call_end: None,
            calls_today: 0,
            talk_time_today: 0,
            day,
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.calls_today = 0;
            self.talk_time_today = 0;
        }
    }
}

/// Concurrent agent-state table
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentState>,
    /// Timezone whose midnight resets the per-day counters
    day_tz: Tz,
}

impl AgentRegistry {
    pub fn new(day_tz: Tz) -> Self {
        Self {
            agents: DashMap::new(),
            day_tz,
        }
    }

    fn local_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.day_tz).date_naive()
    }

    /// Snapshot of an agent's state, if it has ever been referenced.
    pub fn get(&self, agent_id: AgentId) -> Option<AgentState> {
        self.agents.get(&agent_id).map(|a| a.clone())
    }

    /// Trusted status mutator used by the engine and the reconciler.
    ///
    /// `on_call` requires a call id. Any other status clears the current
    /// call; `available` additionally stamps `last_call_end`.
    pub fn set_status(
        &self,
        agent_id: AgentId,
        status: AgentStatus,
        call_id: Option<CallId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if status == AgentStatus::OnCall && call_id.is_none() {
            return Err(Error::Internal(format!(
                "agent {agent_id} cannot be on_call without a call id"
            )));
        }
        let today = self.local_day(now);
        let mut state = self
            .agents
            .entry(agent_id)
            .or_insert_with(|| AgentState::blank(agent_id, today));
        state.roll_day(today);
        state.status = status;
        match status {
            AgentStatus::OnCall => {
                state.current_call_id = call_id;
                state.current_call_started = Some(now);
            }
            AgentStatus::Available => {
                state.current_call_id = None;
                state.current_call_started = None;
                state.last_call_end = Some(now);
            }
            AgentStatus::Busy | AgentStatus::Offline => {
                state.current_call_id = None;
                state.current_call_started = None;
            }
        }
        Ok(())
    }

    /// Claim an available agent for a call.
    pub fn begin_call(&self, agent_id: AgentId, call_id: CallId, now: DateTime<Utc>) -> Result<()> {
        let today = self.local_day(now);
        let mut state = self
            .agents
            .entry(agent_id)
            .or_insert_with(|| AgentState::blank(agent_id, today));
        state.roll_day(today);
        if state.status != AgentStatus::Available {
            return Err(Error::AgentNotAvailable(agent_id));
        }
        state.status = AgentStatus::OnCall;
        state.current_call_id = Some(call_id);
        state.current_call_started = Some(now);
        Ok(())
    }

    /// Release an agent whose call reached a terminal state.
    ///
    /// No-op unless the agent is still on that exact call, so replayed
    /// events cannot produce a second status transition. Returns whether a
    /// transition happened.
    pub fn finish_call(
        &self,
        agent_id: AgentId,
        call_id: CallId,
        talk_seconds: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(mut state) = self.agents.get_mut(&agent_id) else {
            return false;
        };
        if state.status != AgentStatus::OnCall || state.current_call_id != Some(call_id) {
            return false;
        }
        state.roll_day(self.local_day(now));
        state.status = AgentStatus::Available;
        state.current_call_id = None;
        state.current_call_started = None;
        state.last_call_end = Some(now);
        state.talk_time_today += talk_seconds.max(0);
        true
    }

    /// Count a placed call against the agent's daily total.
    pub fn note_call_placed(&self, agent_id: AgentId, now: DateTime<Utc>) {
        let today = self.local_day(now);
        let mut state = self
            .agents
            .entry(agent_id)
            .or_insert_with(|| AgentState::blank(agent_id, today));
        state.roll_day(today);
        state.calls_today += 1;
    }

    /// Available agents from the assigned pool, oldest idle first.
    ///
    /// Agents never seen before count as available, like the rest of the
    /// registry they materialize on first reference.
    pub fn available_for(&self, assigned: &[AgentId], now: DateTime<Utc>) -> Vec<AgentId> {
        let today = self.local_day(now);
        let mut available: Vec<(AgentId, Option<DateTime<Utc>>)> = assigned
            .iter()
            .filter_map(|agent_id| {
                let state = self
                    .agents
                    .entry(*agent_id)
                    .or_insert_with(|| AgentState::blank(*agent_id, today));
                (state.status == AgentStatus::Available).then(|| (*agent_id, state.last_call_end))
            })
            .collect();
        available.sort_by(|a, b| match (a.1, b.1) {
            // Never-called agents have been idle the longest.
            (None, None) => a.0.cmp(&b.0),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y).then(a.0.cmp(&b.0)),
        });
        available.into_iter().map(|(agent_id, _)| agent_id).collect()
    }

    /// Seconds the agent has spent on its current call, or zero.
    pub fn on_call_duration(&self, agent_id: AgentId, now: DateTime<Utc>) -> i64 {
        self.agents
            .get(&agent_id)
            .filter(|s| s.status == AgentStatus::OnCall)
            .and_then(|s| s.current_call_started)
            .map(|started| (now - started).num_seconds())
            .unwrap_or(0)
    }

    /// Agents from the assigned pool whose current call has run at least
    /// `threshold_secs`, i.e. the ones predicted to become free soon.
    pub fn imminent_free(
        &self,
        assigned: &[AgentId],
        threshold_secs: f64,
        now: DateTime<Utc>,
    ) -> usize {
        assigned
            .iter()
            .copied()
            .filter(|agent_id| {
                self.agents
                    .get(agent_id)
                    .filter(|s| s.status == AgentStatus::OnCall)
                    .is_some_and(|s| self.duration_of(&s, now) as f64 >= threshold_secs)
            })
            .count()
    }

    /// Count of assigned agents currently on a call.
    pub fn on_call_count(&self, assigned: &[AgentId]) -> usize {
        assigned
            .iter()
            .copied()
            .filter(|agent_id| {
                self.agents
                    .get(agent_id)
                    .is_some_and(|s| s.status == AgentStatus::OnCall)
            })
            .count()
    }

    fn duration_of(&self, state: &AgentState, now: DateTime<Utc>) -> i64 {
        state
            .current_call_started
            .map(|started| (now - started).num_seconds())
            .unwrap_or(0)
    }
}
