use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
}

/// Handle to the durable store. Cheap to clone; every operation opens
/// its own connection so callers on different OS threads never share
/// connection state.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };

        // Ensure open is valid now to fail fast.
        let _ = store.connect()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS threads (
                    thread_id TEXT NOT NULL PRIMARY KEY,
                    parent_thread_id TEXT
                        REFERENCES threads(thread_id),
                    blacklisted_branches TEXT NOT NULL DEFAULT '[]',
                    summary TEXT NOT NULL DEFAULT '',
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS documents (
                    document_id TEXT NOT NULL PRIMARY KEY,
                    content_hash TEXT,
                    index_status TEXT NOT NULL DEFAULT 'pending',
                    indexed_at INTEGER,
                    last_error TEXT
                );

                CREATE TABLE IF NOT EXISTS document_chunks (
                    document_id TEXT NOT NULL
                        REFERENCES documents(document_id) ON DELETE CASCADE,
                    chunk_index INTEGER NOT NULL,
                    text TEXT NOT NULL,
                    token_count INTEGER NOT NULL,
                    embedding BLOB NOT NULL,
                    document_version TEXT NOT NULL,
                    PRIMARY KEY (document_id, chunk_index)
                );

                CREATE TABLE IF NOT EXISTS context_references (
                    reference_id TEXT NOT NULL,
                    thread_id TEXT NOT NULL
                        REFERENCES threads(thread_id) ON DELETE CASCADE,
                    entity_type TEXT NOT NULL,
                    entity_reference TEXT NOT NULL,
                    display_label TEXT NOT NULL,
                    source TEXT NOT NULL,
                    priority_tier INTEGER NOT NULL,
                    added_at INTEGER NOT NULL,
                    relevance_score REAL,
                    PRIMARY KEY (thread_id, entity_type, entity_reference)
                );

                CREATE TABLE IF NOT EXISTS agent_requests (
                    request_id TEXT NOT NULL PRIMARY KEY,
                    thread_id TEXT NOT NULL
                        REFERENCES threads(thread_id),
                    triggering_message_id TEXT NOT NULL,
                    triggering_message_text TEXT NOT NULL DEFAULT '',
                    response_message_id TEXT,
                    status TEXT NOT NULL,
                    progress REAL NOT NULL DEFAULT 0.0,
                    results TEXT,
                    token_cost INTEGER,
                    created_at INTEGER NOT NULL,
                    completed_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS execution_events (
                    request_id TEXT NOT NULL
                        REFERENCES agent_requests(request_id) ON DELETE CASCADE,
                    sequence INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (request_id, sequence)
                );

                CREATE TABLE IF NOT EXISTS pending_tool_calls (
                    tool_call_id TEXT NOT NULL PRIMARY KEY,
                    request_id TEXT NOT NULL
                        REFERENCES agent_requests(request_id) ON DELETE CASCADE,
                    tool_name TEXT NOT NULL,
                    tool_input TEXT NOT NULL,
                    approval_status TEXT NOT NULL DEFAULT 'pending',
                    reviewer_note TEXT,
                    revision_count INTEGER NOT NULL DEFAULT 0,
                    revision_history TEXT NOT NULL DEFAULT '[]',
                    created_at INTEGER NOT NULL,
                    resolved_at INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_agent_requests_thread_status
                    ON agent_requests(thread_id, status);
                CREATE INDEX IF NOT EXISTS idx_execution_events_request
                    ON execution_events(request_id, sequence);
                CREATE INDEX IF NOT EXISTS idx_pending_tool_calls_request
                    ON pending_tool_calls(request_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_document_chunks_document
                    ON document_chunks(document_id, chunk_index);
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    pub(crate) fn connect(&self) -> Result<Connection, StoreError> {
        let connection =
            Connection::open(&self.db_path).map_err(|source| StoreError::Open {
                path: self.db_path.display().to_string(),
                source,
            })?;
        connection
            .execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_record_sets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("state/draftloom.db")).expect("open");
        store.ensure_schema().expect("schema");

        let connection = store.connect().expect("connect");
        let mut statement = connection
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name ASC")
            .expect("prepare");
        let names: Vec<String> = statement
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");

        for expected in [
            "agent_requests",
            "context_references",
            "document_chunks",
            "documents",
            "execution_events",
            "pending_tool_calls",
            "threads",
        ] {
            assert!(names.iter().any(|name| name == expected), "{expected}");
        }
    }
}
