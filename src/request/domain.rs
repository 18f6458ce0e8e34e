use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RequestState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RequestState::Pending, RequestState::InProgress)
                | (RequestState::Pending, RequestState::Failed)
                | (RequestState::InProgress, RequestState::Completed)
                | (RequestState::InProgress, RequestState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }

    /// Active states hold the one-turn-per-thread slot.
    pub fn is_active(self) -> bool {
        matches!(self, RequestState::Pending | RequestState::InProgress)
    }

    pub(crate) fn to_db(self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::InProgress => "in_progress",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        }
    }

    pub(crate) fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RequestState::Pending),
            "in_progress" => Some(RequestState::InProgress),
            "completed" => Some(RequestState::Completed),
            "failed" => Some(RequestState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db())
    }
}

/// One user turn being processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub request_id: String,
    pub thread_id: String,
    pub triggering_message_id: String,
    /// The user's message text, kept for semantic retrieval during
    /// context assembly. The message store itself lives outside this
    /// crate.
    #[serde(default)]
    pub triggering_message_text: String,
    #[serde(default)]
    pub response_message_id: Option<String>,
    pub status: RequestState,
    pub progress: f64,
    #[serde(default)]
    pub results: Option<Value>,
    #[serde(default)]
    pub token_cost: Option<i64>,
    pub created_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        assert!(RequestState::Pending.can_transition_to(RequestState::InProgress));
        assert!(RequestState::InProgress.can_transition_to(RequestState::Completed));
        assert!(RequestState::InProgress.can_transition_to(RequestState::Failed));
        assert!(!RequestState::Completed.can_transition_to(RequestState::InProgress));
        assert!(!RequestState::Failed.can_transition_to(RequestState::Pending));
        assert!(!RequestState::InProgress.can_transition_to(RequestState::Pending));
    }

    #[test]
    fn active_states_hold_the_thread_slot() {
        assert!(RequestState::Pending.is_active());
        assert!(RequestState::InProgress.is_active());
        assert!(!RequestState::Completed.is_active());
        assert!(!RequestState::Failed.is_active());
    }
}
