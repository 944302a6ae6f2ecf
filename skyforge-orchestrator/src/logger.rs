use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::Result;

/// Install the fmt subscriber. Safe to call more than once.
pub fn init() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}

/// Start/complete pair for one top-level action (ALLOCATE, DELETE, ...).
pub struct ActionLog {
    id: Uuid,
    action_type: &'static str,
    started: Instant,
}

impl ActionLog {
    pub fn start(action_type: &'static str, metadata: serde_json::Value) -> Self {
        let id = Uuid::new_v4();
        info!(
            action_id = %id,
            action = action_type,
            status = "in_progress",
            metadata = %metadata,
            "[Action] {} started",
            action_type
        );
        Self {
            id,
            action_type,
            started: Instant::now(),
        }
    }

    pub fn complete(self, status: &str, error_message: Option<&str>) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        match error_message {
            Some(error) => warn!(
                action_id = %self.id,
                action = self.action_type,
                status,
                duration_ms,
                error,
                "[Action] {} finished",
                self.action_type
            ),
            None => info!(
                action_id = %self.id,
                action = self.action_type,
                status,
                duration_ms,
                "[Action] {} finished",
                self.action_type
            ),
        }
    }

    /// Complete from an outcome; cancellations are reported as such.
    pub fn finish<T>(self, result: &Result<T>) {
        match result {
            Ok(_) => self.complete("success", None),
            Err(e) if e.is_cancelled() => self.complete("cancelled", Some(&e.to_string())),
            Err(e) => self.complete("failed", Some(&e.to_string())),
        }
    }
}
