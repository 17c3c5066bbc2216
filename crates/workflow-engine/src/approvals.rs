//! Approval subsystem
//!
//! Issues signed approval tickets for suspended human tasks, verifies the
//! external approve/reject callbacks and enforces deadlines. Tokens are
//! HMAC-SHA256 over `execution_id:node_id:issued_at` with the server
//! secret; they embed no sensitive data and verify by recomputation.

use crate::EngineError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use event_bus::{Event, EventKind, EventSink};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// A signed, time-bounded permission to act on one suspended human task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub execution_id: Uuid,
    pub node_id: String,
    pub assignee: String,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

/// What a consumed ticket resolved to; the engine resumes the execution
/// from this.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub execution_id: Uuid,
    pub node_id: String,
    pub assignee: String,
    pub approved: bool,
    pub payload: serde_json::Value,
}

enum TicketState {
    Open(ApprovalTicket),
    Consumed,
}

pub struct ApprovalService {
    secret: Vec<u8>,
    tickets: DashMap<(Uuid, String), TicketState>,
    sink: Arc<dyn EventSink>,
}

impl ApprovalService {
    pub fn new(secret: impl Into<Vec<u8>>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            secret: secret.into(),
            tickets: DashMap::new(),
            sink,
        }
    }

    pub fn default_timeout_ms() -> u64 {
        DEFAULT_TIMEOUT_MS
    }

    /// Issue a ticket for `(execution_id, node_id)`, replacing any open
    /// one so at most one ticket per suspended node is live, and emit
    /// `human_approval_requested`.
    pub async fn issue(
        &self,
        execution_id: Uuid,
        node_id: &str,
        assignee: &str,
        timeout_ms: Option<u64>,
    ) -> ApprovalTicket {
        let issued_at = Utc::now();
        let deadline = issued_at
            + chrono::Duration::milliseconds(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS) as i64);
        let token = self.sign(execution_id, node_id, issued_at);
        let ticket = ApprovalTicket {
            execution_id,
            node_id: node_id.to_string(),
            assignee: assignee.to_string(),
            issued_at,
            deadline,
            token,
        };

        self.tickets.insert(
            (execution_id, node_id.to_string()),
            TicketState::Open(ticket.clone()),
        );

        self.sink
            .publish(Event::new(
                execution_id,
                Some(node_id.to_string()),
                EventKind::HumanApprovalRequested,
                json!({
                    "assignee": ticket.assignee,
                    "deadline": ticket.deadline,
                    "token": ticket.token,
                }),
            ))
            .await;
        info!(
            execution_id = %execution_id,
            node_id,
            assignee,
            "Approval ticket issued"
        );
        ticket
    }

    /// Verify a callback token and consume the matching open ticket.
    pub async fn respond(
        &self,
        token: &str,
        action: ApprovalAction,
        payload: serde_json::Value,
    ) -> Result<ApprovalOutcome, EngineError> {
        let (execution_id, node_id, _issued_at) = self.verify(token)?;

        let key = (execution_id, node_id.clone());
        let ticket = {
            let mut entry = self
                .tickets
                .get_mut(&key)
                .ok_or(EngineError::InvalidToken)?;
            match &*entry {
                TicketState::Open(ticket) => {
                    // A re-issued ticket invalidates earlier tokens.
                    if ticket.token != token {
                        return Err(EngineError::InvalidToken);
                    }
                    if ticket.deadline <= Utc::now() {
                        return Err(EngineError::TokenExpired);
                    }
                    let ticket = ticket.clone();
                    *entry = TicketState::Consumed;
                    ticket
                }
                TicketState::Consumed => return Err(EngineError::TicketConsumed),
            }
        };

        let approved = action == ApprovalAction::Approve;
        let kind = if approved {
            EventKind::HumanApproved
        } else {
            EventKind::HumanRejected
        };
        self.sink
            .publish(Event::new(
                execution_id,
                Some(node_id.clone()),
                kind,
                json!({"assignee": ticket.assignee, "payload": payload}),
            ))
            .await;

        Ok(ApprovalOutcome {
            execution_id,
            node_id,
            assignee: ticket.assignee,
            approved,
            payload,
        })
    }

    /// Deadline enforcement: consume a still-open ticket and emit
    /// `approval_timeout`. Returns the expired ticket, or `None` when an
    /// earlier approve/reject (or a re-issue) won the race.
    pub async fn expire(
        &self,
        execution_id: Uuid,
        node_id: &str,
        token: &str,
    ) -> Option<ApprovalTicket> {
        let key = (execution_id, node_id.to_string());
        let expired = {
            let mut entry = self.tickets.get_mut(&key)?;
            match &*entry {
                TicketState::Open(ticket) if ticket.token == token => {
                    let ticket = ticket.clone();
                    *entry = TicketState::Consumed;
                    Some(ticket)
                }
                _ => None,
            }
        };

        if let Some(ticket) = &expired {
            warn!(
                execution_id = %execution_id,
                node_id,
                assignee = %ticket.assignee,
                "Approval ticket expired"
            );
            self.sink
                .publish(Event::new(
                    execution_id,
                    Some(node_id.to_string()),
                    EventKind::ApprovalTimeout,
                    json!({"assignee": ticket.assignee, "deadline": ticket.deadline}),
                ))
                .await;
        }
        expired
    }

    pub fn open_ticket(&self, execution_id: Uuid, node_id: &str) -> Option<ApprovalTicket> {
        match self
            .tickets
            .get(&(execution_id, node_id.to_string()))?
            .value()
        {
            TicketState::Open(ticket) => Some(ticket.clone()),
            TicketState::Consumed => None,
        }
    }

    fn sign(&self, execution_id: Uuid, node_id: &str, issued_at: DateTime<Utc>) -> String {
        let issued_ms = issued_at.timestamp_millis();
        let message = format!("{}:{}:{}", execution_id, node_id, issued_ms);
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        // node_id goes last so author-chosen ids may contain separators.
        URL_SAFE_NO_PAD.encode(format!("{}:{}:{}:{}", execution_id, issued_ms, signature, node_id))
    }

    /// Recompute the signature for a presented token.
    fn verify(&self, token: &str) -> Result<(Uuid, String, DateTime<Utc>), EngineError> {
        let decoded = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| EngineError::InvalidToken)?;
        let decoded = String::from_utf8(decoded).map_err(|_| EngineError::InvalidToken)?;

        let mut parts = decoded.splitn(4, ':');
        let execution_id = parts
            .next()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(EngineError::InvalidToken)?;
        let issued_ms = parts
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(EngineError::InvalidToken)?;
        let signature = parts.next().ok_or(EngineError::InvalidToken)?;
        let node_id = parts.next().ok_or(EngineError::InvalidToken)?;

        let message = format!("{}:{}:{}", execution_id, node_id, issued_ms);
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        let expected = hex::decode(signature).map_err(|_| EngineError::InvalidToken)?;
        mac.verify_slice(&expected)
            .map_err(|_| EngineError::InvalidToken)?;

        let issued_at = Utc
            .timestamp_millis_opt(issued_ms)
            .single()
            .ok_or(EngineError::InvalidToken)?;
        Ok((execution_id, node_id.to_string(), issued_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::{EventBus, EventFilter};

    fn service(bus: &EventBus) -> ApprovalService {
        ApprovalService::new(b"test-secret".to_vec(), Arc::new(bus.clone()))
    }

    #[tokio::test]
    async fn approve_consumes_the_ticket() {
        let bus = EventBus::default();
        let approvals = service(&bus);
        let execution_id = Uuid::new_v4();
        let ticket = approvals
            .issue(execution_id, "review", "u@example.com", Some(60_000))
            .await;

        let outcome = approvals
            .respond(&ticket.token, ApprovalAction::Approve, json!({"comment": "ok"}))
            .await
            .unwrap();
        assert!(outcome.approved);
        assert_eq!(outcome.execution_id, execution_id);
        assert_eq!(outcome.node_id, "review");

        // First response wins; the second sees a consumed ticket.
        let err = approvals
            .respond(&ticket.token, ApprovalAction::Reject, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TicketConsumed));

        let kinds: Vec<EventKind> = bus
            .recent(10, &EventFilter::for_execution(execution_id))
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::HumanApprovalRequested, EventKind::HumanApproved]
        );
    }

    #[tokio::test]
    async fn token_is_bound_to_its_execution() {
        let bus = EventBus::default();
        let approvals = service(&bus);
        let ticket_a = approvals
            .issue(Uuid::new_v4(), "review", "u@example.com", None)
            .await;
        let _ticket_b = approvals
            .issue(Uuid::new_v4(), "review", "u@example.com", None)
            .await;

        // A token signed for execution A must not validate against a
        // tampered body naming execution B.
        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(&ticket_a.token).unwrap()).unwrap();
        let forged_body = decoded.replacen(
            &decoded[..36],
            &Uuid::new_v4().to_string(),
            1,
        );
        let forged = URL_SAFE_NO_PAD.encode(forged_body);
        let err = approvals
            .respond(&forged, ApprovalAction::Approve, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidToken));
    }

    #[tokio::test]
    async fn garbage_tokens_are_rejected() {
        let bus = EventBus::default();
        let approvals = service(&bus);
        for bad in ["", "not-base64!!!", "bm90IGEgdG9rZW4"] {
            let err = approvals
                .respond(bad, ApprovalAction::Approve, json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidToken));
        }
    }

    #[tokio::test]
    async fn reissue_invalidates_the_old_token() {
        let bus = EventBus::default();
        let approvals = service(&bus);
        let execution_id = Uuid::new_v4();
        let first = approvals
            .issue(execution_id, "review", "primary@example.com", None)
            .await;
        // Escalation re-issues to the secondary assignee.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = approvals
            .issue(execution_id, "review", "secondary@example.com", None)
            .await;

        let err = approvals
            .respond(&first.token, ApprovalAction::Approve, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidToken));

        let outcome = approvals
            .respond(&second.token, ApprovalAction::Approve, json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.assignee, "secondary@example.com");
    }

    #[tokio::test]
    async fn expire_consumes_only_open_tickets() {
        let bus = EventBus::default();
        let approvals = service(&bus);
        let execution_id = Uuid::new_v4();
        let ticket = approvals
            .issue(execution_id, "review", "u@example.com", None)
            .await;

        assert!(approvals
            .expire(execution_id, "review", &ticket.token)
            .await
            .is_some());
        // Second expiry and late responses both lose.
        assert!(approvals
            .expire(execution_id, "review", &ticket.token)
            .await
            .is_none());
        let err = approvals
            .respond(&ticket.token, ApprovalAction::Approve, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TicketConsumed));
    }
}
