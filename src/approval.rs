use crate::store::{Store, StoreError};
use crate::tools::ToolInput;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("tool call `{tool_call_id}` not found")]
    UnknownToolCall { tool_call_id: String },
    #[error("tool call `{tool_call_id}` is `{status}`; only rejected calls can be revised")]
    RevisionRequiresRejected {
        tool_call_id: String,
        status: ApprovalStatus,
    },
    #[error("invalid approval status `{value}` in database")]
    InvalidStatus { value: String },
    #[error("invalid tool payload for call `{tool_call_id}`: {source}")]
    InvalidPayload {
        tool_call_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ApprovalStatus::Approved | ApprovalStatus::Rejected)
    }

    fn to_db(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    fn from_db(value: &str) -> Result<Self, ApprovalError> {
        match value {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(ApprovalError::InvalidStatus {
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionEntry {
    pub tool_input: ToolInput,
    #[serde(default)]
    pub reviewer_note: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolCall {
    pub tool_call_id: String,
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: ToolInput,
    pub approval_status: ApprovalStatus,
    #[serde(default)]
    pub reviewer_note: Option<String>,
    pub revision_count: u32,
    #[serde(default)]
    pub revision_history: Vec<RevisionEntry>,
    pub created_at: i64,
    #[serde(default)]
    pub resolved_at: Option<i64>,
}

/// Result of an approve/reject call. `newly_resolved` is false when
/// the call was already terminal: duplicate client retries are a
/// no-op and must not re-trigger tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub call: PendingToolCall,
    pub newly_resolved: bool,
}

/// Scope for listing pending calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingScope {
    Request(String),
    Thread(String),
}

/// Holds, exposes, and resolves tool calls awaiting human review.
/// Exactly one outcome terminates a call; resolution is a
/// compare-and-swap on the pending status.
#[derive(Debug, Clone)]
pub struct ToolApprovalGate {
    store: Store,
}

impl ToolApprovalGate {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn create_pending(
        &self,
        tool_call_id: &str,
        request_id: &str,
        input: &ToolInput,
        now: i64,
    ) -> Result<PendingToolCall, ApprovalError> {
        let payload =
            serde_json::to_string(input).map_err(|source| ApprovalError::InvalidPayload {
                tool_call_id: tool_call_id.to_string(),
                source,
            })?;

        let connection = self.store.connect()?;
        connection
            .execute(
                "
                INSERT INTO pending_tool_calls (
                    tool_call_id, request_id, tool_name, tool_input,
                    approval_status, revision_count, revision_history, created_at
                ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, '[]', ?5)
                ",
                params![tool_call_id, request_id, input.name(), payload, now],
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        self.load(tool_call_id)
    }

    pub fn load(&self, tool_call_id: &str) -> Result<PendingToolCall, ApprovalError> {
        let connection = self.store.connect()?;
        let row = connection
            .query_row(
                "
                SELECT tool_call_id, request_id, tool_name, tool_input, approval_status,
                       reviewer_note, revision_count, revision_history, created_at, resolved_at
                FROM pending_tool_calls
                WHERE tool_call_id = ?1
                ",
                params![tool_call_id],
                map_call_row,
            )
            .optional()
            .map_err(|source| ApprovalError::Sql { source })?;
        row.ok_or_else(|| ApprovalError::UnknownToolCall {
            tool_call_id: tool_call_id.to_string(),
        })?
    }

    pub fn list_pending(&self, scope: &PendingScope) -> Result<Vec<PendingToolCall>, ApprovalError> {
        let connection = self.store.connect()?;
        let sql = match scope {
            PendingScope::Request(_) => {
                "
                SELECT tool_call_id, request_id, tool_name, tool_input, approval_status,
                       reviewer_note, revision_count, revision_history, created_at, resolved_at
                FROM pending_tool_calls
                WHERE request_id = ?1 AND approval_status = 'pending'
                ORDER BY created_at ASC, tool_call_id ASC
                "
            }
            PendingScope::Thread(_) => {
                "
                SELECT p.tool_call_id, p.request_id, p.tool_name, p.tool_input, p.approval_status,
                       p.reviewer_note, p.revision_count, p.revision_history, p.created_at,
                       p.resolved_at
                FROM pending_tool_calls p
                JOIN agent_requests r ON r.request_id = p.request_id
                WHERE r.thread_id = ?1 AND p.approval_status = 'pending'
                ORDER BY p.created_at ASC, p.tool_call_id ASC
                "
            }
        };
        let key = match scope {
            PendingScope::Request(request_id) => request_id,
            PendingScope::Thread(thread_id) => thread_id,
        };

        let mut statement = connection
            .prepare(sql)
            .map_err(|source| ApprovalError::Sql { source })?;
        let rows = statement
            .query_map(params![key], map_call_row)
            .map_err(|source| ApprovalError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|source| ApprovalError::Sql { source })??);
        }
        Ok(out)
    }

    /// All calls for a request regardless of status, oldest first.
    pub fn list_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<PendingToolCall>, ApprovalError> {
        let connection = self.store.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT tool_call_id, request_id, tool_name, tool_input, approval_status,
                       reviewer_note, revision_count, revision_history, created_at, resolved_at
                FROM pending_tool_calls
                WHERE request_id = ?1
                ORDER BY created_at ASC, tool_call_id ASC
                ",
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        let rows = statement
            .query_map(params![request_id], map_call_row)
            .map_err(|source| ApprovalError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|source| ApprovalError::Sql { source })??);
        }
        Ok(out)
    }

    pub fn count_resolved_for_request(&self, request_id: &str) -> Result<i64, ApprovalError> {
        let connection = self.store.connect()?;
        connection
            .query_row(
                "
                SELECT COUNT(*) FROM pending_tool_calls
                WHERE request_id = ?1 AND approval_status != 'pending'
                ",
                params![request_id],
                |row| row.get(0),
            )
            .map_err(|source| ApprovalError::Sql { source })
    }

    pub fn approve(&self, tool_call_id: &str, now: i64) -> Result<Resolution, ApprovalError> {
        self.resolve(tool_call_id, ApprovalStatus::Approved, None, now)
    }

    pub fn reject(
        &self,
        tool_call_id: &str,
        reason: Option<&str>,
        now: i64,
    ) -> Result<Resolution, ApprovalError> {
        self.resolve(tool_call_id, ApprovalStatus::Rejected, reason, now)
    }

    fn resolve(
        &self,
        tool_call_id: &str,
        decision: ApprovalStatus,
        reason: Option<&str>,
        now: i64,
    ) -> Result<Resolution, ApprovalError> {
        let connection = self.store.connect()?;
        // Only a currently-pending call transitions; a concurrent or
        // repeated resolution observes the terminal row instead.
        let updated = connection
            .execute(
                "
                UPDATE pending_tool_calls
                SET approval_status = ?2, reviewer_note = ?3, resolved_at = ?4
                WHERE tool_call_id = ?1 AND approval_status = 'pending'
                ",
                params![tool_call_id, decision.to_db(), reason, now],
            )
            .map_err(|source| ApprovalError::Sql { source })?;

        let call = self.load(tool_call_id)?;
        Ok(Resolution {
            call,
            newly_resolved: updated > 0,
        })
    }

    /// Returns a rejected call to review with a corrected input. The
    /// replaced input joins the revision history together with the
    /// reviser's note.
    pub fn revise(
        &self,
        tool_call_id: &str,
        new_input: &ToolInput,
        note: Option<&str>,
        now: i64,
    ) -> Result<PendingToolCall, ApprovalError> {
        let current = self.load(tool_call_id)?;
        if current.approval_status != ApprovalStatus::Rejected {
            return Err(ApprovalError::RevisionRequiresRejected {
                tool_call_id: tool_call_id.to_string(),
                status: current.approval_status,
            });
        }

        let mut history = current.revision_history.clone();
        history.push(RevisionEntry {
            tool_input: current.tool_input.clone(),
            reviewer_note: note.map(str::to_string),
            timestamp: now,
        });
        let history_payload = serde_json::to_string(&history).map_err(|source| {
            ApprovalError::InvalidPayload {
                tool_call_id: tool_call_id.to_string(),
                source,
            }
        })?;
        let input_payload = serde_json::to_string(new_input).map_err(|source| {
            ApprovalError::InvalidPayload {
                tool_call_id: tool_call_id.to_string(),
                source,
            }
        })?;

        let connection = self.store.connect()?;
        let updated = connection
            .execute(
                "
                UPDATE pending_tool_calls
                SET tool_input = ?2, tool_name = ?3, approval_status = 'pending',
                    reviewer_note = NULL, resolved_at = NULL,
                    revision_count = revision_count + 1, revision_history = ?4
                WHERE tool_call_id = ?1 AND approval_status = 'rejected'
                ",
                params![tool_call_id, input_payload, new_input.name(), history_payload],
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        if updated == 0 {
            // Lost a race: someone else already moved the call on.
            let call = self.load(tool_call_id)?;
            return Err(ApprovalError::RevisionRequiresRejected {
                tool_call_id: tool_call_id.to_string(),
                status: call.approval_status,
            });
        }
        self.load(tool_call_id)
    }
}

fn map_call_row(
    row: &rusqlite::Row<'_>,
) -> Result<Result<PendingToolCall, ApprovalError>, rusqlite::Error> {
    let tool_call_id: String = row.get(0)?;
    let request_id: String = row.get(1)?;
    let tool_name: String = row.get(2)?;
    let input_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let reviewer_note: Option<String> = row.get(5)?;
    let revision_count: i64 = row.get(6)?;
    let history_raw: String = row.get(7)?;
    let created_at: i64 = row.get(8)?;
    let resolved_at: Option<i64> = row.get(9)?;

    let parsed = (|| {
        let approval_status = ApprovalStatus::from_db(&status_raw)?;
        let tool_input: ToolInput =
            serde_json::from_str(&input_raw).map_err(|source| ApprovalError::InvalidPayload {
                tool_call_id: tool_call_id.clone(),
                source,
            })?;
        let revision_history: Vec<RevisionEntry> = serde_json::from_str(&history_raw)
            .map_err(|source| ApprovalError::InvalidPayload {
                tool_call_id: tool_call_id.clone(),
                source,
            })?;
        Ok(PendingToolCall {
            tool_call_id: tool_call_id.clone(),
            request_id,
            tool_name,
            tool_input,
            approval_status,
            reviewer_note,
            revision_count: revision_count.max(0) as u32,
            revision_history,
            created_at,
            resolved_at,
        })
    })();
    Ok(parsed)
}
