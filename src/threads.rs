use crate::shared::ids::validate_identifier_value;
use crate::store::{Store, StoreError};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("thread `{thread_id}` not found")]
    UnknownThread { thread_id: String },
    #[error("thread ancestry for `{thread_id}` revisited `{revisited}`; parent chain is corrupt")]
    AncestryCycle {
        thread_id: String,
        revisited: String,
    },
    #[error("invalid blacklist payload for thread `{thread_id}`: {source}")]
    InvalidBlacklist {
        thread_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("thread validation failed: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub thread_id: String,
    #[serde(default)]
    pub parent_thread_id: Option<String>,
    #[serde(default)]
    pub blacklisted_branches: Vec<String>,
    #[serde(default)]
    pub summary: String,
    pub created_at: i64,
}

impl ThreadRecord {
    pub fn is_root(&self) -> bool {
        self.parent_thread_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ThreadRepository {
    store: Store,
}

impl ThreadRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn create_thread(
        &self,
        thread_id: &str,
        parent_thread_id: Option<&str>,
        summary: &str,
        now: i64,
    ) -> Result<ThreadRecord, ThreadError> {
        validate_identifier_value("thread id", thread_id).map_err(ThreadError::Validation)?;
        if let Some(parent) = parent_thread_id {
            // Parent must already exist; ids are minted after parent
            // selection, so this also keeps the chain acyclic.
            self.load_thread(parent)?;
        }

        let record = ThreadRecord {
            thread_id: thread_id.to_string(),
            parent_thread_id: parent_thread_id.map(str::to_string),
            blacklisted_branches: Vec::new(),
            summary: summary.to_string(),
            created_at: now,
        };

        let connection = self.store.connect()?;
        connection
            .execute(
                "
                INSERT INTO threads (
                    thread_id, parent_thread_id, blacklisted_branches, summary, created_at
                ) VALUES (?1, ?2, '[]', ?3, ?4)
                ",
                params![
                    record.thread_id,
                    record.parent_thread_id,
                    record.summary,
                    record.created_at
                ],
            )
            .map_err(|source| ThreadError::Sql { source })?;
        Ok(record)
    }

    pub fn load_thread(&self, thread_id: &str) -> Result<ThreadRecord, ThreadError> {
        let connection = self.store.connect()?;
        let row = connection
            .query_row(
                "
                SELECT thread_id, parent_thread_id, blacklisted_branches, summary, created_at
                FROM threads
                WHERE thread_id = ?1
                ",
                params![thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|source| ThreadError::Sql { source })?;

        let Some((thread_id, parent_thread_id, blacklist_raw, summary, created_at)) = row else {
            return Err(ThreadError::UnknownThread {
                thread_id: thread_id.to_string(),
            });
        };

        let blacklisted_branches: Vec<String> = serde_json::from_str(&blacklist_raw)
            .map_err(|source| ThreadError::InvalidBlacklist {
                thread_id: thread_id.clone(),
                source,
            })?;

        Ok(ThreadRecord {
            thread_id,
            parent_thread_id,
            blacklisted_branches,
            summary,
            created_at,
        })
    }

    pub fn set_blacklisted_branches(
        &self,
        thread_id: &str,
        branches: &[String],
    ) -> Result<ThreadRecord, ThreadError> {
        // Persist as a sorted, deduplicated set.
        let normalized: Vec<String> = branches
            .iter()
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let payload = serde_json::to_string(&normalized).map_err(|source| {
            ThreadError::InvalidBlacklist {
                thread_id: thread_id.to_string(),
                source,
            }
        })?;

        let connection = self.store.connect()?;
        let updated = connection
            .execute(
                "UPDATE threads SET blacklisted_branches = ?2 WHERE thread_id = ?1",
                params![thread_id, payload],
            )
            .map_err(|source| ThreadError::Sql { source })?;
        if updated == 0 {
            return Err(ThreadError::UnknownThread {
                thread_id: thread_id.to_string(),
            });
        }
        self.load_thread(thread_id)
    }

    pub fn update_summary(&self, thread_id: &str, summary: &str) -> Result<(), ThreadError> {
        let connection = self.store.connect()?;
        let updated = connection
            .execute(
                "UPDATE threads SET summary = ?2 WHERE thread_id = ?1",
                params![thread_id, summary],
            )
            .map_err(|source| ThreadError::Sql { source })?;
        if updated == 0 {
            return Err(ThreadError::UnknownThread {
                thread_id: thread_id.to_string(),
            });
        }
        Ok(())
    }

    /// Ancestors of a thread, nearest first. Iterative walk with a
    /// visited-set guard so a corrupted parent chain surfaces as an
    /// error instead of looping.
    pub fn ancestry(&self, thread_id: &str) -> Result<Vec<ThreadRecord>, ThreadError> {
        let start = self.load_thread(thread_id)?;
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.thread_id.clone());

        let mut out = Vec::new();
        let mut cursor = start.parent_thread_id;
        while let Some(parent_id) = cursor {
            if !visited.insert(parent_id.clone()) {
                return Err(ThreadError::AncestryCycle {
                    thread_id: thread_id.to_string(),
                    revisited: parent_id,
                });
            }
            let parent = self.load_thread(&parent_id)?;
            cursor = parent.parent_thread_id.clone();
            out.push(parent);
        }
        Ok(out)
    }

    /// Root threads have depth 0.
    pub fn depth(&self, thread_id: &str) -> Result<usize, ThreadError> {
        Ok(self.ancestry(thread_id)?.len())
    }
}
