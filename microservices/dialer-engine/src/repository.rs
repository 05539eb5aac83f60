//! Repository port over persistent storage
//!
//! The engine only ever talks to this trait, so the dialing logic is
//! testable without a database. Production runs on PostgreSQL through a
//! deadpool-managed pool; tests run on the in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use dialhub_core::domain::{
    Call, CallDirection, CallId, CallStatus, Campaign, CampaignAssignment, CampaignId,
    CampaignStatus, DialerMode, Lead, LeadId, LeadStatus,
};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use tracing::info;

use crate::error::{Error, Result};

/// Fields the engine provides when creating a call row
#[derive(Debug, Clone)]
pub struct NewCall {
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub agent_id: Option<dialhub_core::domain::AgentId>,
    pub phone_number: String,
    pub started_at: DateTime<Utc>,
}

/// Narrow persistence port consumed by the engine
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    async fn campaign_by_id(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn assignments_of(&self, campaign_id: CampaignId) -> Result<Vec<CampaignAssignment>>;

    async fn lead_by_id(&self, id: LeadId) -> Result<Option<Lead>>;
    async fn lead_count(&self, campaign_id: CampaignId) -> Result<i64>;
    async fn leads_for_selection(
        &self,
        campaign_id: CampaignId,
        statuses: &[LeadStatus],
        limit: i64,
    ) -> Result<Vec<Lead>>;
    /// Stamp `last_contacted` after an originate.
    async fn touch_lead(&self, lead_id: LeadId, contacted_at: DateTime<Utc>) -> Result<()>;

    async fn call_by_id(&self, id: CallId) -> Result<Option<Call>>;
    async fn call_count(&self, lead_id: LeadId) -> Result<i64>;
    async fn latest_call(&self, lead_id: LeadId) -> Result<Option<Call>>;
    async fn recent_calls(
        &self,
        campaign_id: CampaignId,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Call>>;
    async fn insert_call(&self, new_call: NewCall) -> Result<Call>;
    async fn update_call(&self, call: &Call) -> Result<()>;
    async fn insert_call_event(
        &self,
        call_id: CallId,
        event_type: &str,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Liveness probe for readiness checks.
    async fn ping(&self) -> bool;
}

/// Retry budget for statements aborted by a serialization failure
const WRITE_RETRIES: usize = 2;

fn is_serialization_failure(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE)
}

fn db_err(err: impl std::fmt::Display) -> Error {
    Error::Database(err.to_string())
}

/// PostgreSQL-backed repository
pub struct PgRepository {
    pool: Pool,
}

impl PgRepository {
    /// Build the connection pool and verify it answers.
    pub async fn connect(database_url: &str, pool_size: usize) -> Result<Self> {
        info!(pool_size, "Creating database connection pool");

        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e| Error::Internal(format!("Invalid DATABASE_URL: {}", e)))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| Error::Internal(format!("Pool build failed: {}", e)))?;

        let repo = Self { pool };
        let client = repo.pool.get().await.map_err(db_err)?;
        client.simple_query("SELECT 1").await.map_err(db_err)?;
        Ok(repo)
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool.get().await.map_err(db_err)
    }

    fn row_to_campaign(row: &Row) -> Result<Campaign> {
        let status: String = row.get("status");
        let mode: String = row.get("dialer_mode");
        Ok(Campaign {
            id: CampaignId(row.get("id")),
            name: row.get("name"),
            status: CampaignStatus::parse(&status)
                .ok_or_else(|| db_err(format!("unknown campaign status {status}")))?,
            dialer_mode: DialerMode::parse(&mode)
                .ok_or_else(|| db_err(format!("unknown dialer mode {mode}")))?,
            max_attempts: row.get("max_attempts"),
            retry_delay_minutes: row.get::<_, i32>("retry_delay_minutes") as i64,
            predictive_ratio: row.get("predictive_ratio"),
            turbo_delay_seconds: row.get::<_, i32>("turbo_delay_seconds") as u64,
            daily_start_time: row.get("daily_start_time"),
            daily_end_time: row.get("daily_end_time"),
            timezone: row.get("timezone"),
            start_date: row.get("start_date"),
            end_date: row.get("end_date"),
        })
    }

    fn row_to_lead(row: &Row) -> Result<Lead> {
        let status: String = row.get("status");
        Ok(Lead {
            id: LeadId(row.get("id")),
            campaign_id: CampaignId(row.get("campaign_id")),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            phone_number: row.get("phone_number"),
            status: LeadStatus::parse(&status)
                .ok_or_else(|| db_err(format!("unknown lead status {status}")))?,
            priority: row.get("priority"),
            last_contacted: row.get("last_contacted"),
            next_contact_date: row.get("next_contact_date"),
        })
    }

    fn row_to_call(row: &Row) -> Result<Call> {
        let status: String = row.get("status");
        let direction: String = row.get("direction");
        Ok(Call {
            id: CallId(row.get("id")),
            lead_id: LeadId(row.get("lead_id")),
            campaign_id: CampaignId(row.get("campaign_id")),
            agent_id: row
                .get::<_, Option<i64>>("agent_id")
                .map(dialhub_core::domain::AgentId),
            phone_number: row.get("phone_number"),
            direction: if direction == "inbound" {
                CallDirection::Inbound
            } else {
                CallDirection::Outbound
            },
            status: CallStatus::parse(&status)
                .ok_or_else(|| db_err(format!("unknown call status {status}")))?,
            outcome: row.get("outcome"),
            disposition_code: row.get("disposition_code"),
            notes: row.get("notes"),
            started_at: row.get("started_at"),
            answered_at: row.get("answered_at"),
            ended_at: row.get("ended_at"),
            duration_seconds: row.get("duration_seconds"),
        })
    }

    async fn execute_with_retry(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<u64> {
        let client = self.client().await?;
        let mut attempts = 0;
        loop {
            match client.execute(sql, params).await {
                Ok(count) => return Ok(count),
                Err(e) if is_serialization_failure(&e) && attempts < WRITE_RETRIES => {
                    attempts += 1;
                    tracing::debug!(attempts, "Retrying statement after serialization failure");
                }
                Err(e) => return Err(db_err(e)),
            }
        }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn campaign_by_id(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM campaigns WHERE id = $1", &[&id.0])
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_campaign).transpose()
    }

    async fn assignments_of(&self, campaign_id: CampaignId) -> Result<Vec<CampaignAssignment>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT campaign_id, agent_id, assigned_at FROM campaign_assignments \
                 WHERE campaign_id = $1 ORDER BY assigned_at ASC",
                &[&campaign_id.0],
            )
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| CampaignAssignment {
                campaign_id: CampaignId(row.get("campaign_id")),
                agent_id: dialhub_core::domain::AgentId(row.get("agent_id")),
                assigned_at: row.get("assigned_at"),
            })
            .collect())
    }

    async fn lead_by_id(&self, id: LeadId) -> Result<Option<Lead>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM leads WHERE id = $1", &[&id.0])
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_lead).transpose()
    }

    async fn lead_count(&self, campaign_id: CampaignId) -> Result<i64> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM leads WHERE campaign_id = $1",
                &[&campaign_id.0],
            )
            .await
            .map_err(db_err)?;
        Ok(row.get(0))
    }

    async fn leads_for_selection(
        &self,
        campaign_id: CampaignId,
        statuses: &[LeadStatus],
        limit: i64,
    ) -> Result<Vec<Lead>> {
        let status_values: Vec<String> =
            statuses.iter().map(|s| s.as_str().to_string()).collect();
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM leads \
                 WHERE campaign_id = $1 AND status = ANY($2) \
                   AND phone_number IS NOT NULL AND phone_number <> '' \
                 ORDER BY priority DESC, id ASC LIMIT $3",
                &[&campaign_id.0, &status_values, &limit],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_lead).collect()
    }

    async fn touch_lead(&self, lead_id: LeadId, contacted_at: DateTime<Utc>) -> Result<()> {
        self.execute_with_retry(
            "UPDATE leads SET last_contacted = $2 WHERE id = $1",
            &[&lead_id.0, &contacted_at],
        )
        .await?;
        Ok(())
    }

    async fn call_by_id(&self, id: CallId) -> Result<Option<Call>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM calls WHERE id = $1", &[&id.0])
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_call).transpose()
    }

    async fn call_count(&self, lead_id: LeadId) -> Result<i64> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM calls WHERE lead_id = $1",
                &[&lead_id.0],
            )
            .await
            .map_err(db_err)?;
        Ok(row.get(0))
    }

    async fn latest_call(&self, lead_id: LeadId) -> Result<Option<Call>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM calls WHERE lead_id = $1 ORDER BY started_at DESC, id DESC LIMIT 1",
                &[&lead_id.0],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_call).transpose()
    }

    async fn recent_calls(
        &self,
        campaign_id: CampaignId,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Call>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM calls WHERE campaign_id = $1 AND started_at >= $2 \
                 ORDER BY started_at DESC LIMIT $3",
                &[&campaign_id.0, &since, &limit],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_call).collect()
    }

    async fn insert_call(&self, new_call: NewCall) -> Result<Call> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO calls \
                 (lead_id, campaign_id, agent_id, phone_number, direction, status, started_at) \
                 VALUES ($1, $2, $3, $4, 'outbound', 'initiated', $5) \
                 RETURNING *",
                &[
                    &new_call.lead_id.0,
                    &new_call.campaign_id.0,
                    &new_call.agent_id.map(|a| a.0),
                    &new_call.phone_number,
                    &new_call.started_at,
                ],
            )
            .await
            .map_err(db_err)?;
        Self::row_to_call(&row)
    }

    async fn update_call(&self, call: &Call) -> Result<()> {
        self.execute_with_retry(
            "UPDATE calls SET \
             status = $2, outcome = $3, disposition_code = $4, notes = $5, \
             answered_at = $6, ended_at = $7, duration_seconds = $8 \
             WHERE id = $1",
            &[
                &call.id.0,
                &call.status.as_str(),
                &call.outcome,
                &call.disposition_code,
                &call.notes,
                &call.answered_at,
                &call.ended_at,
                &call.duration_seconds,
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_call_event(
        &self,
        call_id: CallId,
        event_type: &str,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.execute_with_retry(
            "INSERT INTO call_events (call_id, event_type, event_data, timestamp) \
             VALUES ($1, $2, $3, $4)",
            &[&call_id.0, &event_type, &payload, &timestamp],
        )
        .await?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        match self.pool.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }
}
