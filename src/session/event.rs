//! Events emitted on a notification stream and their SSE encoding.

use axum::response::sse::Event;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::model::NotificationRecord;
use crate::store::IdentityError;

/// Status carried by a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Alive,
    Degraded,
    DegradedTimeout,
}

/// Terminal reason sent before a stream is closed at authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    NotAuthenticated,
    DbUnavailable,
    UserNotFound,
}

impl StreamErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAuthenticated => "not_authenticated",
            Self::DbUnavailable => "db_unavailable",
            Self::UserNotFound => "user_not_found",
        }
    }
}

impl From<&IdentityError> for StreamErrorKind {
    fn from(e: &IdentityError) -> Self {
        match e {
            IdentityError::NotAuthenticated => Self::NotAuthenticated,
            IdentityError::Unavailable(_) => Self::DbUnavailable,
            IdentityError::UserNotFound => Self::UserNotFound,
        }
    }
}

/// One discrete message on a notification stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Notification(Arc<NotificationRecord>),
    Heartbeat(HeartbeatStatus),
    Error(StreamErrorKind),
}

impl StreamEvent {
    /// SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Notification(_) => "notification",
            Self::Heartbeat(_) => "heartbeat",
            Self::Error(_) => "error",
        }
    }

    /// Client reconnect delay sent as the SSE `retry:` field.
    pub fn retry_hint(&self) -> Duration {
        match self {
            Self::Notification(_) => Duration::from_secs(5),
            Self::Heartbeat(_) => Duration::from_secs(10),
            Self::Error(_) => Duration::from_secs(30),
        }
    }

    /// JSON body of the SSE `data:` field.
    pub fn data(&self) -> serde_json::Value {
        match self {
            Self::Notification(record) => serde_json::to_value(record.as_ref())
                .unwrap_or_else(|e| {
                    tracing::error!(error = %e, notification_id = %record.id, "Failed to encode notification");
                    serde_json::Value::Null
                }),
            Self::Heartbeat(status) => json!({ "status": status }),
            Self::Error(kind) => json!({ "error": kind }),
        }
    }

    /// Encode as an SSE frame.
    pub fn to_sse(&self) -> Event {
        Event::default()
            .event(self.name())
            .data(self.data().to_string())
            .retry(self.retry_hint())
    }
}
