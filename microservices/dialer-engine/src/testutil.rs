//! Shared fixtures for the engine test suite

use chrono::{DateTime, Utc};
use dialhub_ami::{AmiConfig, AmiMessage};
use dialhub_core::domain::{
    AgentId, Call, CallDirection, CallId, CallStatus, Campaign, CampaignId, CampaignStatus,
    DialerMode, Lead, LeadId, LeadStatus,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::config::Config;

pub(crate) fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_url: String::new(),
        db_pool_size: 2,
        ami_host: "127.0.0.1".to_string(),
        ami_port: 0,
        ami_username: "dialer".to_string(),
        ami_secret_encrypted: String::new(),
        ami_action_timeout_secs: 2,
        ami_reconnect_attempts: 1,
        agent_day_timezone: chrono_tz::UTC,
    }
}

pub(crate) fn test_campaign(id: i64, dialer_mode: DialerMode) -> Campaign {
    let mut campaign = Campaign::new(CampaignId(id), format!("Campaign {id}"), dialer_mode);
    campaign.status = CampaignStatus::Active;
    campaign
}

pub(crate) fn test_lead(id: i64, campaign_id: i64, phone_number: &str) -> Lead {
    Lead {
        id: LeadId(id),
        campaign_id: CampaignId(campaign_id),
        first_name: None,
        last_name: None,
        phone_number: phone_number.to_string(),
        status: LeadStatus::New,
        priority: 1,
        last_contacted: None,
        next_contact_date: None,
    }
}

/// A finished call for metrics history. Uses a lead id far away from the
/// fixtures so it never interferes with selection.
pub(crate) fn seeded_history_call(
    id: i64,
    campaign_id: i64,
    agent_id: Option<AgentId>,
    answered: bool,
    duration_seconds: Option<i64>,
    started_at: DateTime<Utc>,
) -> Call {
    Call {
        id: CallId(id),
        lead_id: LeadId(9000 + id),
        campaign_id: CampaignId(campaign_id),
        agent_id,
        phone_number: "+15559990000".to_string(),
        direction: CallDirection::Outbound,
        status: if answered {
            CallStatus::Completed
        } else {
            CallStatus::NoAnswer
        },
        outcome: None,
        disposition_code: None,
        notes: None,
        started_at,
        answered_at: answered.then_some(started_at),
        ended_at: Some(started_at),
        duration_seconds,
    }
}

/// Auto-responding mock switch: greets, accepts the login, then answers
/// every action with Success (or Error) while recording it.
pub(crate) struct MockSwitch {
    addr: SocketAddr,
    actions: Arc<Mutex<Vec<AmiMessage>>>,
}

impl MockSwitch {
    pub async fn spawn(succeed: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let actions: Arc<Mutex<Vec<AmiMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = actions.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(b"Asterisk Call Manager/5.0\r\n")
                .await
                .unwrap();

            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                while let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let block: Vec<u8> = buf.drain(..pos + 4).collect();
                    let msg = AmiMessage::parse(&String::from_utf8_lossy(&block[..pos]));
                    let id = msg.action_id().unwrap_or("").to_string();
                    let is_login = msg.get("Action") == Some("Login");
                    if !is_login {
                        recorded.lock().unwrap().push(msg);
                    }
                    let reply = if is_login || succeed {
                        format!("Response: Success\r\nActionID: {}\r\n\r\n", id)
                    } else {
                        format!(
                            "Response: Error\r\nActionID: {}\r\nMessage: Originate failed\r\n\r\n",
                            id
                        )
                    };
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
        });

        Self { addr, actions }
    }

    pub fn ami_config(&self) -> AmiConfig {
        let mut config = AmiConfig::new("127.0.0.1", self.addr.port(), "dialer", "secret");
        config.action_timeout = Duration::from_secs(2);
        config.keepalive_interval = None;
        config
    }

    pub fn originate_count(&self) -> usize {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.get("Action") == Some("Originate"))
            .count()
    }

    pub fn last_originate(&self) -> Option<AmiMessage> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|m| m.get("Action") == Some("Originate"))
            .cloned()
    }
}
