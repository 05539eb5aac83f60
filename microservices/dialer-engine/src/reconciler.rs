//! Call State Reconciler
//!
//! Consumes AMI events queued by the session subscription and folds them
//! into the persisted call records, the agent registry and the per-campaign
//! counters. Events are processed serially on one task, so transitions on a
//! single call are strictly sequential; the status lattice makes every
//! handler idempotent under replays and reordering.

use chrono::{DateTime, Utc};
use dialhub_ami::AmiMessage;
use dialhub_core::domain::{Call, CallId, CallStatus};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{DialerEngine, EngineEvent};
use crate::error::Result;

/// Serial worker loop fed by the engine's session subscriptions.
pub(crate) async fn run(engine: Arc<DialerEngine>, mut events: mpsc::Receiver<AmiMessage>) {
    info!("Call reconciler started");
    while let Some(msg) = events.recv().await {
        if let Err(e) = handle_event(&engine, &msg).await {
            warn!(
                event = msg.event().unwrap_or("unknown"),
                "Reconciler failed to apply event: {}", e
            );
        }
    }
    debug!("Call reconciler stopped");
}

/// Apply one AMI event to the call it resolves to.
pub(crate) async fn handle_event(engine: &DialerEngine, msg: &AmiMessage) -> Result<()> {
    match msg.event() {
        Some("Newchannel") => on_newchannel(engine, msg).await,
        Some("DialBegin") => on_dial_begin(engine, msg).await,
        Some("DialEnd") => on_dial_end(engine, msg).await,
        Some("Bridge") => on_bridge(engine, msg).await,
        Some("Hangup") => on_hangup(engine, msg).await,
        _ => Ok(()),
    }
}

/// Flatten an AMI message into an event payload bag.
pub(crate) fn ami_payload(msg: &AmiMessage) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in msg.fields() {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(map)
}

/// Resolve the event's channel against the engine's channel map.
fn resolve(engine: &DialerEngine, msg: &AmiMessage) -> Option<(String, CallId)> {
    for key in ["Channel", "Channel1", "Channel2"] {
        if let Some(channel) = msg.get(key) {
            if let Some(call_id) = engine.resolve_channel(channel) {
                return Some((channel.to_string(), call_id));
            }
        }
    }
    None
}

async fn load_call(engine: &DialerEngine, call_id: CallId) -> Result<Option<Call>> {
    let call = engine.repo().call_by_id(call_id).await?;
    if call.is_none() {
        warn!(call_id = %call_id, "Channel map references a missing call");
    }
    Ok(call)
}

async fn on_newchannel(engine: &DialerEngine, msg: &AmiMessage) -> Result<()> {
    let Some((_, call_id)) = resolve(engine, msg) else {
        return Ok(());
    };
    engine
        .repo()
        .insert_call_event(call_id, "new_channel", ami_payload(msg), Utc::now())
        .await
}

async fn on_dial_begin(engine: &DialerEngine, msg: &AmiMessage) -> Result<()> {
    let Some((_, call_id)) = resolve(engine, msg) else {
        return Ok(());
    };
    let now = Utc::now();
    engine
        .repo()
        .insert_call_event(call_id, "dial_begin", ami_payload(msg), now)
        .await?;
    let Some(mut call) = load_call(engine, call_id).await? else {
        return Ok(());
    };
    if call.status.can_transition_to(CallStatus::Ringing) {
        call.status = CallStatus::Ringing;
        engine.repo().update_call(&call).await?;
        engine.broadcast(EngineEvent::CallRinging { call_id });
        debug!(call_id = %call_id, "Call ringing");
    }
    Ok(())
}

async fn on_dial_end(engine: &DialerEngine, msg: &AmiMessage) -> Result<()> {
    let Some((channel, call_id)) = resolve(engine, msg) else {
        return Ok(());
    };
    let now = Utc::now();
    engine
        .repo()
        .insert_call_event(call_id, "dial_end", ami_payload(msg), now)
        .await?;
    let Some(mut call) = load_call(engine, call_id).await? else {
        return Ok(());
    };

    let dial_status = msg.get("DialStatus").unwrap_or("");
    if dial_status == "ANSWER" {
        mark_answered(engine, &mut call, now).await?;
        return Ok(());
    }

    let target = match dial_status {
        "BUSY" | "CONGESTION" => CallStatus::Busy,
        "NOANSWER" | "CANCEL" => CallStatus::NoAnswer,
        _ => CallStatus::Failed,
    };
    if !call.status.can_transition_to(target) {
        // Replayed or out-of-order: the audit row above is all that happens.
        return Ok(());
    }
    call.status = target;
    call.mark_ended(now);
    engine.repo().update_call(&call).await?;
    release_agent(engine, &call, 0, now);
    engine.forget_channel(&channel);
    engine.metrics().active_calls.dec();
    engine.with_stats(call.campaign_id, |s| match target {
        CallStatus::Busy => s.busy_calls += 1,
        CallStatus::NoAnswer => s.no_answer_calls += 1,
        _ => s.failed_calls += 1,
    });
    debug!(call_id = %call_id, status = target.as_str(), dial_status, "Dial ended");
    Ok(())
}

async fn on_bridge(engine: &DialerEngine, msg: &AmiMessage) -> Result<()> {
    let Some((_, call_id)) = resolve(engine, msg) else {
        return Ok(());
    };
    let now = Utc::now();
    engine
        .repo()
        .insert_call_event(call_id, "bridge", ami_payload(msg), now)
        .await?;
    let Some(mut call) = load_call(engine, call_id).await? else {
        return Ok(());
    };
    mark_answered(engine, &mut call, now).await
}

async fn on_hangup(engine: &DialerEngine, msg: &AmiMessage) -> Result<()> {
    let Some((channel, call_id)) = resolve(engine, msg) else {
        return Ok(());
    };
    let now = Utc::now();
    engine
        .repo()
        .insert_call_event(call_id, "hangup", ami_payload(msg), now)
        .await?;
    let Some(mut call) = load_call(engine, call_id).await? else {
        return Ok(());
    };
    if !call.status.can_transition_to(CallStatus::Completed) {
        return Ok(());
    }
    call.status = CallStatus::Completed;
    call.mark_ended(now);
    engine.repo().update_call(&call).await?;

    let talk_seconds = call.duration_seconds.unwrap_or(0);
    release_agent(engine, &call, talk_seconds, now);
    engine.forget_channel(&channel);
    engine.with_stats(call.campaign_id, |s| {
        s.total_duration_seconds += talk_seconds.max(0);
    });
    engine.metrics().calls_completed.inc();
    engine.metrics().call_duration_seconds.record(talk_seconds.max(0) as f64);
    engine.metrics().active_calls.dec();
    engine.broadcast(EngineEvent::CallEnded { call_id });
    info!(call_id = %call_id, duration = talk_seconds, "Call completed");
    Ok(())
}

/// `ringing -> answered`, whether reported by DialEnd{ANSWER} or Bridge.
/// Whichever arrives first wins; the second is a no-op.
async fn mark_answered(engine: &DialerEngine, call: &mut Call, now: DateTime<Utc>) -> Result<()> {
    if !call.status.can_transition_to(CallStatus::Answered) {
        return Ok(());
    }
    call.status = CallStatus::Answered;
    call.answered_at = Some(now);
    engine.repo().update_call(call).await?;
    engine.with_stats(call.campaign_id, |s| s.answered_calls += 1);
    engine.metrics().calls_answered.inc();
    engine.broadcast(EngineEvent::CallAnswered { call_id: call.id });
    debug!(call_id = %call.id, "Call answered");
    Ok(())
}

fn release_agent(engine: &DialerEngine, call: &Call, talk_seconds: i64, now: DateTime<Utc>) {
    if let Some(agent_id) = call.agent_id {
        if engine.registry().finish_call(agent_id, call.id, talk_seconds, now) {
            debug!(agent_id = %agent_id, call_id = %call.id, "Agent released");
        }
    }
}
