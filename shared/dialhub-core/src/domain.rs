//! Core domain types for the outbound dialing platform

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique call identifier (dense integer key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub i64);

/// Unique lead identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeadId(pub i64);

/// Unique campaign identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CampaignId(pub i64);

/// Unique agent identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub i64);

macro_rules! impl_id_display {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

impl_id_display!(CallId, LeadId, CampaignId, AgentId);

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

/// Call lifecycle status
///
/// Transitions are monotonic along `initiated -> ringing -> answered ->
/// completed`, with terminal shortcuts to `busy`/`no_answer`/`failed`.
/// A call in a terminal status is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Busy,
    NoAnswer,
    Failed,
    Completed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Busy | Self::NoAnswer | Self::Failed | Self::Completed)
    }

    /// Whether the monotonic status lattice permits `self -> next`.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            Self::Initiated => true,
            Self::Ringing => !matches!(next, Self::Initiated),
            Self::Answered => matches!(next, Self::Completed),
            Self::Busy | Self::NoAnswer | Self::Failed | Self::Completed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Busy => "busy",
            Self::NoAnswer => "no_answer",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(Self::Initiated),
            "ringing" => Some(Self::Ringing),
            "answered" => Some(Self::Answered),
            "busy" => Some(Self::Busy),
            "no_answer" => Some(Self::NoAnswer),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A single outbound call placed against a lead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub agent_id: Option<AgentId>,
    pub phone_number: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub outcome: Option<String>,
    pub disposition_code: Option<String>,
    pub notes: Option<String>,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl Call {
    /// Set duration from the start/end timestamps when both are present.
    pub fn calculate_duration(&mut self) {
        if let Some(ended) = self.ended_at {
            self.duration_seconds = Some((ended - self.started_at).num_seconds());
        }
    }

    /// Stamp the end of the call and derive its duration.
    pub fn mark_ended(&mut self, when: DateTime<Utc>) {
        self.ended_at = Some(when);
        self.calculate_duration();
    }
}

/// Append-only per-call audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub call_id: CallId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Lead status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Callback,
    Interested,
    Contacted,
    DoNotCall,
    Converted,
    Invalid,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Callback => "callback",
            Self::Interested => "interested",
            Self::Contacted => "contacted",
            Self::DoNotCall => "do_not_call",
            Self::Converted => "converted",
            Self::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "callback" => Some(Self::Callback),
            "interested" => Some(Self::Interested),
            "contacted" => Some(Self::Contacted),
            "do_not_call" => Some(Self::DoNotCall),
            "converted" => Some(Self::Converted),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// A dialable contact belonging to a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub campaign_id: CampaignId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_number: String,
    pub status: LeadStatus,
    /// Higher priority leads are dialed sooner
    pub priority: i32,
    pub last_contacted: Option<DateTime<Utc>>,
    pub next_contact_date: Option<DateTime<Utc>>,
}

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Dialing strategy for a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialerMode {
    Manual,
    Turbo,
    Predictive,
}

impl DialerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Turbo => "turbo",
            Self::Predictive => "predictive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "turbo" => Some(Self::Turbo),
            "predictive" => Some(Self::Predictive),
            _ => None,
        }
    }
}

/// Pacing configuration for an outbound campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub status: CampaignStatus,
    pub dialer_mode: DialerMode,
    pub max_attempts: i32,
    pub retry_delay_minutes: i64,
    pub predictive_ratio: f64,
    pub turbo_delay_seconds: u64,
    pub daily_start_time: Option<NaiveTime>,
    pub daily_end_time: Option<NaiveTime>,
    /// IANA timezone name resolving the daily window (falls back to UTC)
    pub timezone: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl Campaign {
    /// A campaign with default pacing knobs, used as a construction base.
    pub fn new(id: CampaignId, name: impl Into<String>, dialer_mode: DialerMode) -> Self {
        Self {
            id,
            name: name.into(),
            status: CampaignStatus::Draft,
            dialer_mode,
            max_attempts: 3,
            retry_delay_minutes: 60,
            predictive_ratio: 1.2,
            turbo_delay_seconds: 5,
            daily_start_time: None,
            daily_end_time: None,
            timezone: "UTC".to_string(),
            start_date: None,
            end_date: None,
        }
    }
}

/// (campaign, agent) assignment pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignAssignment {
    pub campaign_id: CampaignId,
    pub agent_id: AgentId,
    pub assigned_at: DateTime<Utc>,
}

/// Agent availability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    OnCall,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::OnCall => "on_call",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "on_call" => Some(Self::OnCall),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Rolling per-campaign dialer counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialerStats {
    pub total_calls: u64,
    pub answered_calls: u64,
    pub busy_calls: u64,
    pub no_answer_calls: u64,
    pub failed_calls: u64,
    pub total_duration_seconds: i64,
    pub average_call_duration: f64,
    pub answer_rate: f64,
    pub agent_utilization: f64,
}

impl DialerStats {
    /// Refresh the derived ratios from the raw counters.
    pub fn recalculate(&mut self) {
        self.answer_rate = if self.total_calls > 0 {
            self.answered_calls as f64 / self.total_calls as f64
        } else {
            0.0
        };
        self.average_call_duration = if self.answered_calls > 0 {
            self.total_duration_seconds as f64 / self.answered_calls as f64
        } else {
            0.0
        };
    }
}
