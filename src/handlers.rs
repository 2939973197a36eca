//! HTTP and WebSocket handlers for the admin surface (C14).

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::arbiter::ThreatType;
use crate::bus::BusEvent;
use crate::orchestrator::PersistenceLevel;
use crate::persistence::MarkerMetadata;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ArmRequest {
    pub account_id: u32,
    pub reason: String,
    pub level: Option<PersistenceLevel>,
}

#[derive(Serialize)]
pub struct ArmResponse {
    pub status: String,
}

/// POST /admin/marker/arm
pub async fn arm_marker(State(state): State<Arc<AppState>>, Json(req): Json<ArmRequest>) -> Json<ArmResponse> {
    let level = req.level.unwrap_or(state.config.persistence.level);
    let metadata = MarkerMetadata {
        account_id: req.account_id,
        ban_id: req.account_id,
        created_at: chrono::Utc::now(),
        expires_at: chrono::Utc::now() + chrono::Duration::days(30),
        violation_type: req.reason.clone(),
        severity: 0.9,
        reason: req.reason,
        version: 1,
        hardware_id: crate::fingerprint::HardwareId([0u8; 32]),
        component_snapshot: crate::fingerprint::ComponentSnapshot(std::collections::HashMap::new()),
        app_signature: "sentinel".to_string(),
        extra: None,
    };

    let result = state
        .orchestrator
        .arm(level, metadata, &state.fingerprint, state.config.crypto.kdf_iterations)
        .await;
    let status = match result {
        Ok(crate::orchestrator::OrchestratorState::Armed) => "armed",
        Ok(crate::orchestrator::OrchestratorState::Degraded) => "degraded",
        Ok(_) => "unknown",
        Err(_) => "error",
    };

    state.audit.record(
        "admin",
        None,
        "marker.arm",
        "account",
        &req.account_id.to_string(),
        status,
        result.is_ok(),
        None,
    );
    state.broadcast(BusEvent::MarkerArmed { account_id: req.account_id });

    Json(ArmResponse { status: status.to_string() })
}

#[derive(Deserialize)]
pub struct CheckQuery {
    pub account_id: u32,
}

#[derive(Serialize)]
pub struct CheckResponse {
    pub state: String,
    pub detected_locations: usize,
    pub total_locations: usize,
}

/// GET /admin/marker/check
pub async fn check_marker(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<CheckQuery>,
) -> Json<CheckResponse> {
    let result = state
        .orchestrator
        .check(query.account_id, &state.fingerprint)
        .await
        .unwrap_or(crate::orchestrator::MarkerVerificationResult {
            state: crate::persistence::MarkerState::Absent,
            detected_locations: 0,
            total_locations: 0,
            metadata: None,
            detected_paths: vec![],
            confidence_score: 0.0,
        });

    Json(CheckResponse {
        state: format!("{:?}", result.state),
        detected_locations: result.detected_locations,
        total_locations: result.total_locations,
    })
}

#[derive(Deserialize)]
pub struct RemoveAllRequest {
    pub confirm: String,
}

#[derive(Serialize)]
pub struct RemoveAllResponse {
    pub removed: usize,
}

/// POST /admin/marker/remove-all
pub async fn remove_all_markers(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemoveAllRequest>,
) -> Json<RemoveAllResponse> {
    let removed = state
        .orchestrator
        .remove_all(&req.confirm, &state.remove_all_key)
        .await
        .unwrap_or(0);
    state.audit.record(
        "admin",
        None,
        "marker.remove_all",
        "markers",
        "*",
        &format!("removed={removed}"),
        removed > 0,
        None,
    );
    Json(RemoveAllResponse { removed })
}

/// One replayable event plus the ground-truth label it's expected to
/// trigger, the wire shape the CLI reads from a recording file.
#[derive(Deserialize)]
pub struct LabeledRuleEvent {
    #[serde(flatten)]
    pub event: crate::rules::RuleEvent,
    pub expected: bool,
}

#[derive(Deserialize)]
pub struct RuleTestRequest {
    pub days: Option<u32>,
    #[serde(default)]
    pub events: Vec<LabeledRuleEvent>,
}

#[derive(Serialize)]
pub struct RuleTestResponse {
    pub precision: f32,
    pub recall: f32,
    pub events_replayed: usize,
}

/// POST /admin/rule/test — replays a recorded window of session activity
/// against the active rule set. The recording comes from the CLI, which
/// reads it from the path given to `rule test`; `days` is accepted for a
/// future server-side history source but currently unused since the server
/// keeps no independent event log to slice by age.
pub async fn test_rules(State(state): State<Arc<AppState>>, Json(req): Json<RuleTestRequest>) -> Json<RuleTestResponse> {
    let _days = req.days.unwrap_or(7);
    let events: Vec<(crate::rules::RuleEvent, bool)> =
        req.events.into_iter().map(|e| (e.event, e.expected)).collect();
    let events_replayed = events.len();
    let mut engine = state.rules.lock().await;
    let (precision, recall) = engine.test_against_history(&events);
    Json(RuleTestResponse { precision, recall, events_replayed })
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub signature_count: usize,
    pub subscriber_count: usize,
    pub audit_entries: usize,
}

/// GET /admin/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        signature_count: state.signatures.len(),
        subscriber_count: state.bus.subscriber_count(),
        audit_entries: state.audit.len(),
    })
}

/// GET /ws — live feed of bus events.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.bus.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

pub fn threat_type_from_str(s: &str) -> ThreatType {
    match s {
        "speed_hack" => ThreatType::SpeedHack,
        "packet_injection" => ThreatType::PacketInjection,
        "bot_automation" => ThreatType::BotAutomation,
        _ => ThreatType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_test_request_parses_labeled_events_from_a_flat_recording() {
        let body = r#"{
            "days": 7,
            "events": [
                {"timestamp_ms": 1, "fields": {"speed": 80.0}, "expected": true},
                {"timestamp_ms": 2, "fields": {"speed": 10.0}, "expected": false}
            ]
        }"#;
        let req: RuleTestRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.days, Some(7));
        assert_eq!(req.events.len(), 2);
        assert!(req.events[0].expected);
        assert_eq!(req.events[0].event.fields.get("speed"), Some(&80.0));
    }

    #[test]
    fn rule_test_request_defaults_to_no_events() {
        let req: RuleTestRequest = serde_json::from_str(r#"{"days": 1}"#).unwrap();
        assert!(req.events.is_empty());
    }
}
