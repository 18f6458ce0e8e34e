use crate::request::domain::{AgentRequest, RequestState};
use crate::request::events::{EventPayload, ExecutionEvent};
use crate::shared::ids::generate_id;
use crate::store::{Store, StoreError};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum RequestStoreError {
    #[error("an agent request is already active for thread `{thread_id}`")]
    Conflict { thread_id: String },
    #[error("thread `{thread_id}` not found")]
    UnknownThread { thread_id: String },
    #[error("agent request `{request_id}` not found")]
    UnknownRequest { request_id: String },
    #[error("agent request state transition `{from}` -> `{to}` is invalid")]
    InvalidTransition {
        from: RequestState,
        to: RequestState,
    },
    #[error("invalid request status `{value}` in database")]
    InvalidStatus { value: String },
    #[error("invalid event payload for request `{request_id}` sequence {sequence}: {source}")]
    InvalidEventPayload {
        request_id: String,
        sequence: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("request validation failed: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
}

/// Persistence for agent requests and their execution event log. The
/// one-active-request-per-thread invariant and the monotonic event
/// sequence both live inside write transactions here.
#[derive(Debug, Clone)]
pub struct RequestStore {
    store: Store,
}

impl RequestStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Check-then-insert under one immediate transaction: of two
    /// concurrent submits for a thread, exactly one wins; the loser
    /// sees `Conflict`.
    pub fn create(
        &self,
        thread_id: &str,
        triggering_message_id: &str,
        triggering_message_text: &str,
        now: i64,
    ) -> Result<AgentRequest, RequestStoreError> {
        if triggering_message_id.trim().is_empty() {
            return Err(RequestStoreError::Validation(
                "triggering message id must be non-empty".to_string(),
            ));
        }
        let request_id = generate_id("req", now).map_err(RequestStoreError::Validation)?;

        let mut connection = self.store.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| RequestStoreError::Sql { source })?;

        let thread_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM threads WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| RequestStoreError::Sql { source })?;
        if thread_exists.is_none() {
            return Err(RequestStoreError::UnknownThread {
                thread_id: thread_id.to_string(),
            });
        }

        let active: i64 = tx
            .query_row(
                "
                SELECT COUNT(*) FROM agent_requests
                WHERE thread_id = ?1 AND status IN ('pending', 'in_progress')
                ",
                params![thread_id],
                |row| row.get(0),
            )
            .map_err(|source| RequestStoreError::Sql { source })?;
        if active > 0 {
            return Err(RequestStoreError::Conflict {
                thread_id: thread_id.to_string(),
            });
        }

        tx.execute(
            "
            INSERT INTO agent_requests (
                request_id, thread_id, triggering_message_id, triggering_message_text,
                status, progress, created_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0.0, ?5)
            ",
            params![
                request_id,
                thread_id,
                triggering_message_id,
                triggering_message_text,
                now
            ],
        )
        .map_err(|source| RequestStoreError::Sql { source })?;
        tx.commit()
            .map_err(|source| RequestStoreError::Sql { source })?;

        self.load(&request_id)
    }

    pub fn load(&self, request_id: &str) -> Result<AgentRequest, RequestStoreError> {
        let connection = self.store.connect()?;
        let row = connection
            .query_row(
                "
                SELECT request_id, thread_id, triggering_message_id, triggering_message_text,
                       response_message_id, status, progress, results, token_cost,
                       created_at, completed_at
                FROM agent_requests
                WHERE request_id = ?1
                ",
                params![request_id],
                map_request_row,
            )
            .optional()
            .map_err(|source| RequestStoreError::Sql { source })?;
        row.ok_or_else(|| RequestStoreError::UnknownRequest {
            request_id: request_id.to_string(),
        })?
    }

    pub fn active_request_for_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<AgentRequest>, RequestStoreError> {
        let connection = self.store.connect()?;
        let row = connection
            .query_row(
                "
                SELECT request_id, thread_id, triggering_message_id, triggering_message_text,
                       response_message_id, status, progress, results, token_cost,
                       created_at, completed_at
                FROM agent_requests
                WHERE thread_id = ?1 AND status IN ('pending', 'in_progress')
                ORDER BY created_at DESC
                LIMIT 1
                ",
                params![thread_id],
                map_request_row,
            )
            .optional()
            .map_err(|source| RequestStoreError::Sql { source })?;
        row.transpose()
    }

    /// Forward-only transition, guarded on the current status so a
    /// racing writer cannot double-apply it.
    pub fn transition(
        &self,
        request_id: &str,
        next: RequestState,
        now: i64,
    ) -> Result<AgentRequest, RequestStoreError> {
        let current = self.load(request_id)?;
        if !current.status.can_transition_to(next) {
            return Err(RequestStoreError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }

        let connection = self.store.connect()?;
        let completed_at: Option<i64> = next.is_terminal().then_some(now);
        let updated = connection
            .execute(
                "
                UPDATE agent_requests
                SET status = ?2, completed_at = COALESCE(?3, completed_at)
                WHERE request_id = ?1 AND status = ?4
                ",
                params![
                    request_id,
                    next.to_db(),
                    completed_at,
                    current.status.to_db()
                ],
            )
            .map_err(|source| RequestStoreError::Sql { source })?;
        if updated == 0 {
            let reloaded = self.load(request_id)?;
            return Err(RequestStoreError::InvalidTransition {
                from: reloaded.status,
                to: next,
            });
        }
        self.load(request_id)
    }

    /// Progress never decreases, regardless of caller ordering.
    pub fn update_progress(
        &self,
        request_id: &str,
        progress: f64,
    ) -> Result<(), RequestStoreError> {
        let clamped = progress.clamp(0.0, 1.0);
        let connection = self.store.connect()?;
        let updated = connection
            .execute(
                "
                UPDATE agent_requests
                SET progress = MAX(progress, ?2)
                WHERE request_id = ?1
                ",
                params![request_id, clamped],
            )
            .map_err(|source| RequestStoreError::Sql { source })?;
        if updated == 0 {
            return Err(RequestStoreError::UnknownRequest {
                request_id: request_id.to_string(),
            });
        }
        Ok(())
    }

    /// Terminal success: status, response message, results, token
    /// cost, and full progress in one guarded update.
    pub fn complete(
        &self,
        request_id: &str,
        response_message_id: &str,
        results: &Value,
        token_cost: i64,
        now: i64,
    ) -> Result<AgentRequest, RequestStoreError> {
        let connection = self.store.connect()?;
        let updated = connection
            .execute(
                "
                UPDATE agent_requests
                SET status = 'completed', response_message_id = ?2, results = ?3,
                    token_cost = ?4, progress = 1.0, completed_at = ?5
                WHERE request_id = ?1 AND status = 'in_progress'
                ",
                params![
                    request_id,
                    response_message_id,
                    results.to_string(),
                    token_cost,
                    now
                ],
            )
            .map_err(|source| RequestStoreError::Sql { source })?;
        if updated == 0 {
            let current = self.load(request_id)?;
            return Err(RequestStoreError::InvalidTransition {
                from: current.status,
                to: RequestState::Completed,
            });
        }
        self.load(request_id)
    }

    /// Monotonic append: the next sequence number is computed and the
    /// row inserted inside one immediate transaction, so concurrent
    /// appends can neither skip nor duplicate a sequence.
    pub fn append_event(
        &self,
        request_id: &str,
        payload: &EventPayload,
        now: i64,
    ) -> Result<ExecutionEvent, RequestStoreError> {
        let body = serde_json::to_string(payload).map_err(|source| {
            RequestStoreError::InvalidEventPayload {
                request_id: request_id.to_string(),
                sequence: -1,
                source,
            }
        })?;

        let mut connection = self.store.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| RequestStoreError::Sql { source })?;

        let sequence: i64 = tx
            .query_row(
                "
                SELECT COALESCE(MAX(sequence), 0) + 1
                FROM execution_events
                WHERE request_id = ?1
                ",
                params![request_id],
                |row| row.get(0),
            )
            .map_err(|source| RequestStoreError::Sql { source })?;

        tx.execute(
            "
            INSERT INTO execution_events (request_id, sequence, event_type, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![request_id, sequence, payload.type_name(), body, now],
        )
        .map_err(|source| RequestStoreError::Sql { source })?;
        tx.commit()
            .map_err(|source| RequestStoreError::Sql { source })?;

        Ok(ExecutionEvent {
            request_id: request_id.to_string(),
            sequence,
            payload: payload.clone(),
            created_at: now,
        })
    }

    pub fn events(&self, request_id: &str) -> Result<Vec<ExecutionEvent>, RequestStoreError> {
        let connection = self.store.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT request_id, sequence, payload, created_at
                FROM execution_events
                WHERE request_id = ?1
                ORDER BY sequence ASC
                ",
            )
            .map_err(|source| RequestStoreError::Sql { source })?;

        let rows = statement
            .query_map(params![request_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(|source| RequestStoreError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            let (request_id, sequence, body, created_at) =
                row.map_err(|source| RequestStoreError::Sql { source })?;
            let payload: EventPayload = serde_json::from_str(&body).map_err(|source| {
                RequestStoreError::InvalidEventPayload {
                    request_id: request_id.clone(),
                    sequence,
                    source,
                }
            })?;
            out.push(ExecutionEvent {
                request_id,
                sequence,
                payload,
                created_at,
            });
        }
        Ok(out)
    }

    pub fn has_terminal_event(&self, request_id: &str) -> Result<bool, RequestStoreError> {
        let connection = self.store.connect()?;
        let count: i64 = connection
            .query_row(
                "
                SELECT COUNT(*) FROM execution_events
                WHERE request_id = ?1 AND event_type IN ('completion', 'error')
                ",
                params![request_id],
                |row| row.get(0),
            )
            .map_err(|source| RequestStoreError::Sql { source })?;
        Ok(count > 0)
    }

    pub fn count_events_of_type(
        &self,
        request_id: &str,
        type_name: &str,
    ) -> Result<i64, RequestStoreError> {
        let connection = self.store.connect()?;
        connection
            .query_row(
                "
                SELECT COUNT(*) FROM execution_events
                WHERE request_id = ?1 AND event_type = ?2
                ",
                params![request_id, type_name],
                |row| row.get(0),
            )
            .map_err(|source| RequestStoreError::Sql { source })
    }
}

fn map_request_row(
    row: &rusqlite::Row<'_>,
) -> Result<Result<AgentRequest, RequestStoreError>, rusqlite::Error> {
    let request_id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let triggering_message_id: String = row.get(2)?;
    let triggering_message_text: String = row.get(3)?;
    let response_message_id: Option<String> = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let progress: f64 = row.get(6)?;
    let results_raw: Option<String> = row.get(7)?;
    let token_cost: Option<i64> = row.get(8)?;
    let created_at: i64 = row.get(9)?;
    let completed_at: Option<i64> = row.get(10)?;

    let parsed = (|| {
        let status = RequestState::from_db(&status_raw).ok_or_else(|| {
            RequestStoreError::InvalidStatus {
                value: status_raw.clone(),
            }
        })?;
        let results = match results_raw {
            None => None,
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|source| {
                RequestStoreError::InvalidEventPayload {
                    request_id: request_id.clone(),
                    sequence: -1,
                    source,
                }
            })?),
        };
        Ok(AgentRequest {
            request_id: request_id.clone(),
            thread_id,
            triggering_message_id,
            triggering_message_text,
            response_message_id,
            status,
            progress,
            results,
            token_cost,
            created_at,
            completed_at,
        })
    })();
    Ok(parsed)
}
