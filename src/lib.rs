//! Herald: real-time notification fan-out for connected clients.
//!
//! Herald keeps one long-lived Server-Sent Events stream per open client
//! and pushes every announced notification onto each live stream of the
//! target user. The durable notification history lives in the Event Store;
//! the live path here is purely in-memory and is rebuilt on restart.
//!
//! # Architecture
//!
//! - **Announcer**: persist-then-broadcast entry point for business logic
//! - **Connection Registry**: `user -> {session -> queue}` fan-out map
//! - **Session Handler**: per-connection state machine with heartbeats and a
//!   bounded degraded mode
//! - **Liveness Monitor**: shared health flag for the announce path
//!
//! # Modules
//!
//! - [`announcer`]: notification creation and fan-out
//! - [`api`]: HTTP router (SSE stream and control endpoints)
//! - [`config`]: CLI and environment configuration
//! - [`liveness`]: health flag and store probe
//! - [`model`]: identifiers and notification records
//! - [`observability`]: metrics and tracing setup
//! - [`registry`]: live session registry
//! - [`server`]: HTTP server setup
//! - [`session`]: per-connection stream handler
//! - [`store`]: Event Store and identity lookup

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // session::SessionHandler is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod announcer;
pub mod api;
pub mod config;
pub mod liveness;
pub mod model;
pub mod observability;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) identifier.
///
/// Used for notification ids; newest-first listings sort naturally.
///
/// # Example
///
/// ```
/// let id = herald::generate_id();
/// assert!(id.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
