//! Call ids for correlating the log lines of one balanced call.

use uuid::Uuid;

/// Generate a new, globally unique call id.
pub fn generate_call_id() -> String {
    Uuid::new_v4().to_string()
}
