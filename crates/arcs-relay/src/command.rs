//! Command router: controller-to-device control traffic.
//!
//! Every command runs through structural validation, a per-session rate
//! limit keyed by command kind, and a sanitized audit entry before the
//! original bytes are released for delivery. Device-to-controller traffic
//! passes through untouched.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use arcs_core::{AuditLog, Operation, RateLimiter};
use arcs_proto::{sanitize, validate_message, ErrorCode, ErrorMessage, MessageKind};

/// What the connection handler should do with a command.
#[derive(Debug)]
pub enum CommandOutcome {
    /// Deliver these bytes to the session's device-leg, verbatim.
    Forward(Bytes),
    /// Return this error envelope to the sending controller.
    Reject(Bytes),
}

impl CommandOutcome {
    fn reject(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Reject(Bytes::from(ErrorMessage::new(code, message).to_bytes()))
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, Self::Forward(_))
    }
}

/// Map a command kind onto its rate-limit bucket.
fn operation_for(kind: MessageKind) -> Option<Operation> {
    Some(match kind {
        MessageKind::Touch => Operation::Touch,
        MessageKind::Key => Operation::Key,
        MessageKind::Macro => Operation::Macro,
        MessageKind::Ai => Operation::Ai,
        MessageKind::System => Operation::System,
        MessageKind::AppControl => Operation::AppControl,
        _ => return None,
    })
}

pub struct CommandRouter {
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
}

impl CommandRouter {
    pub fn new(limiter: Arc<RateLimiter>, audit: Arc<AuditLog>) -> Self {
        Self { limiter, audit }
    }

    /// Validate, rate-limit, audit, and release a controller command.
    pub async fn route_to_device(&self, session_id: &str, raw: &[u8]) -> CommandOutcome {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(session = session_id, "malformed command json: {e}");
                return CommandOutcome::reject(ErrorCode::InvalidCommand, "malformed JSON");
            }
        };

        let kind = match validate_message(&value) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(session = session_id, "command failed validation: {e}");
                return CommandOutcome::reject(ErrorCode::InvalidCommand, e.to_string());
            }
        };

        let Some(op) = operation_for(kind) else {
            warn!(session = session_id, kind = %kind, "not a control command");
            return CommandOutcome::reject(
                ErrorCode::InvalidCommand,
                format!("{kind} is not a control command"),
            );
        };

        if !self.limiter.allow(session_id, op) {
            self.audit
                .rate_limit_exceeded(session_id, op.as_str())
                .await;
            return CommandOutcome::reject(ErrorCode::RateLimit, "rate limit exceeded");
        }

        self.audit
            .command_received(session_id, kind.as_type_str(), sanitize(&value).to_string())
            .await;

        CommandOutcome::Forward(Bytes::copy_from_slice(raw))
    }

    /// Device-to-controller traffic: acks, status, errors. Forwarded with
    /// no validation beyond logging.
    pub fn route_to_controller(&self, session_id: &str, raw: &[u8]) -> Bytes {
        debug!(session = session_id, len = raw.len(), "relaying device message");
        Bytes::copy_from_slice(raw)
    }
}
