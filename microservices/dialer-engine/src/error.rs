//! Error types for the Dialer Engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dialhub_ami::AmiError;
use dialhub_core::domain::{AgentId, CallId, CampaignId, LeadId};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Dialer Engine error kinds
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    #[error("Lead not found: {0}")]
    LeadNotFound(LeadId),

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("Campaign must be active to start dialer")]
    CampaignNotActive,

    #[error("No agents assigned to campaign")]
    NoAgentsAssigned,

    #[error("No leads available in campaign")]
    NoLeadsAvailable,

    #[error("Agent {0} is not available")]
    AgentNotAvailable(AgentId),

    #[error("Lead does not belong to the campaign")]
    LeadNotInCampaign,

    #[error("Campaign is not in manual dialer mode")]
    InvalidDialerMode,

    #[error("Dialer is not running for this campaign")]
    DialerNotRunning,

    #[error("Agent {0} is on an active call")]
    AgentBusy(AgentId),

    #[error("AMI unreachable: {0}")]
    AmiUnreachable(String),

    #[error("AMI authentication failed")]
    AmiAuthFailed,

    #[error("AMI action timed out")]
    AmiActionTimeout,

    #[error("AMI connection lost")]
    ConnectionLost,

    #[error("Originate rejected by the switch: {0}")]
    OriginateFailed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code surfaced to API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            Self::LeadNotFound(_) => "LEAD_NOT_FOUND",
            Self::CallNotFound(_) => "CALL_NOT_FOUND",
            Self::CampaignNotActive => "CAMPAIGN_NOT_ACTIVE",
            Self::NoAgentsAssigned => "NO_AGENTS_ASSIGNED",
            Self::NoLeadsAvailable => "NO_LEADS_AVAILABLE",
            Self::AgentNotAvailable(_) => "AGENT_NOT_AVAILABLE",
            Self::LeadNotInCampaign => "LEAD_NOT_IN_CAMPAIGN",
            Self::InvalidDialerMode => "INVALID_DIALER_MODE",
            Self::DialerNotRunning => "DIALER_NOT_RUNNING",
            Self::AgentBusy(_) => "AGENT_BUSY",
            Self::AmiUnreachable(_) => "AMI_UNREACHABLE",
            Self::AmiAuthFailed => "AMI_AUTH_FAILED",
            Self::AmiActionTimeout => "AMI_ACTION_TIMEOUT",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::OriginateFailed(_) => "ORIGINATE_FAILED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<AmiError> for Error {
    fn from(err: AmiError) -> Self {
        match err {
            AmiError::ConnectFailed(reason) => Error::AmiUnreachable(reason),
            AmiError::AuthFailed(_) => Error::AmiAuthFailed,
            AmiError::ActionTimeout => Error::AmiActionTimeout,
            AmiError::ConnectionLost | AmiError::Cancelled | AmiError::NotConnected => {
                Error::ConnectionLost
            }
            AmiError::Protocol(reason) => Error::AmiUnreachable(reason),
            AmiError::Io(e) => Error::AmiUnreachable(e.to_string()),
        }
    }
}

impl From<dialhub_core::CoreError> for Error {
    fn from(err: dialhub_core::CoreError) -> Self {
        match err {
            dialhub_core::CoreError::Database(reason) => Error::Database(reason),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::CampaignNotFound(_) | Error::LeadNotFound(_) | Error::CallNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::CampaignNotActive
            | Error::NoAgentsAssigned
            | Error::NoLeadsAvailable
            | Error::AgentNotAvailable(_)
            | Error::LeadNotInCampaign
            | Error::InvalidDialerMode
            | Error::DialerNotRunning
            | Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::AgentBusy(_) => StatusCode::CONFLICT,
            Error::AmiUnreachable(_)
            | Error::AmiAuthFailed
            | Error::ConnectionLost
            | Error::OriginateFailed(_) => StatusCode::BAD_GATEWAY,
            Error::AmiActionTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Database(_) | Error::Internal(_) => {
                tracing::error!("Internal error: {:?}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}
