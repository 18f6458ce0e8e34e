use crate::shared::ids::generate_id;
use crate::store::{Store, StoreError};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("invalid entity type `{value}` in database")]
    InvalidEntityType { value: String },
    #[error("invalid reference source `{value}` in database")]
    InvalidSource { value: String },
    #[error("invalid priority tier `{value}` in database")]
    InvalidTier { value: i64 },
    #[error("reference validation failed: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    File,
    Folder,
    Thread,
}

impl EntityType {
    pub(crate) fn to_db(self) -> &'static str {
        match self {
            EntityType::File => "file",
            EntityType::Folder => "folder",
            EntityType::Thread => "thread",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self, ReferenceError> {
        match value {
            "file" => Ok(EntityType::File),
            "folder" => Ok(EntityType::Folder),
            "thread" => Ok(EntityType::Thread),
            other => Err(ReferenceError::InvalidEntityType {
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    Inherited,
    Manual,
    AgentAdded,
    Mentioned,
}

impl ReferenceSource {
    /// Tier 1 is explicit user intent; inheritance ranks above
    /// agent-originated material.
    pub fn default_tier(self) -> u8 {
        match self {
            ReferenceSource::Manual | ReferenceSource::Mentioned => 1,
            ReferenceSource::Inherited => 2,
            ReferenceSource::AgentAdded => 3,
        }
    }

    pub(crate) fn to_db(self) -> &'static str {
        match self {
            ReferenceSource::Inherited => "inherited",
            ReferenceSource::Manual => "manual",
            ReferenceSource::AgentAdded => "agent_added",
            ReferenceSource::Mentioned => "mentioned",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self, ReferenceError> {
        match value {
            "inherited" => Ok(ReferenceSource::Inherited),
            "manual" => Ok(ReferenceSource::Manual),
            "agent_added" => Ok(ReferenceSource::AgentAdded),
            "mentioned" => Ok(ReferenceSource::Mentioned),
            other => Err(ReferenceError::InvalidSource {
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextReference {
    pub reference_id: String,
    pub thread_id: String,
    pub entity_type: EntityType,
    pub entity_reference: String,
    pub display_label: String,
    pub source: ReferenceSource,
    pub priority_tier: u8,
    pub added_at: i64,
    #[serde(default)]
    pub relevance_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ReferenceRepository {
    store: Store,
}

impl ReferenceRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert or promote. A duplicate (thread, entity) keeps one row:
    /// the stronger tier wins, the source follows a tier promotion,
    /// and a known relevance score is never lost.
    pub fn upsert(
        &self,
        thread_id: &str,
        entity_type: EntityType,
        entity_reference: &str,
        display_label: &str,
        source: ReferenceSource,
        relevance_score: Option<f64>,
        now: i64,
    ) -> Result<ContextReference, ReferenceError> {
        if entity_reference.trim().is_empty() {
            return Err(ReferenceError::Validation(
                "entity reference must be non-empty".to_string(),
            ));
        }
        let reference_id =
            generate_id("ref", now).map_err(ReferenceError::Validation)?;
        let tier = source.default_tier();

        let connection = self.store.connect()?;
        connection
            .execute(
                "
                INSERT INTO context_references (
                    reference_id, thread_id, entity_type, entity_reference,
                    display_label, source, priority_tier, added_at, relevance_score
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(thread_id, entity_type, entity_reference) DO UPDATE SET
                    display_label = excluded.display_label,
                    source = CASE
                        WHEN excluded.priority_tier < priority_tier THEN excluded.source
                        ELSE source
                    END,
                    priority_tier = MIN(priority_tier, excluded.priority_tier),
                    relevance_score = COALESCE(excluded.relevance_score, relevance_score)
                ",
                params![
                    reference_id,
                    thread_id,
                    entity_type.to_db(),
                    entity_reference,
                    display_label,
                    source.to_db(),
                    i64::from(tier),
                    now,
                    relevance_score,
                ],
            )
            .map_err(|source| ReferenceError::Sql { source })?;

        self.load(thread_id, entity_type, entity_reference)
    }

    pub fn load(
        &self,
        thread_id: &str,
        entity_type: EntityType,
        entity_reference: &str,
    ) -> Result<ContextReference, ReferenceError> {
        let connection = self.store.connect()?;
        connection
            .query_row(
                "
                SELECT reference_id, thread_id, entity_type, entity_reference,
                       display_label, source, priority_tier, added_at, relevance_score
                FROM context_references
                WHERE thread_id = ?1 AND entity_type = ?2 AND entity_reference = ?3
                ",
                params![thread_id, entity_type.to_db(), entity_reference],
                map_reference_row,
            )
            .map_err(|source| ReferenceError::Sql { source })
    }

    /// All references for a thread, strongest tier first, then oldest
    /// first within a tier.
    pub fn list_for_thread(&self, thread_id: &str) -> Result<Vec<ContextReference>, ReferenceError> {
        let connection = self.store.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT reference_id, thread_id, entity_type, entity_reference,
                       display_label, source, priority_tier, added_at, relevance_score
                FROM context_references
                WHERE thread_id = ?1
                ORDER BY priority_tier ASC, added_at ASC, entity_reference ASC
                ",
            )
            .map_err(|source| ReferenceError::Sql { source })?;

        let rows = statement
            .query_map(params![thread_id], map_reference_row)
            .map_err(|source| ReferenceError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|source| ReferenceError::Sql { source })?);
        }
        Ok(out)
    }

    pub fn remove(
        &self,
        thread_id: &str,
        entity_type: EntityType,
        entity_reference: &str,
    ) -> Result<bool, ReferenceError> {
        let connection = self.store.connect()?;
        let removed = connection
            .execute(
                "
                DELETE FROM context_references
                WHERE thread_id = ?1 AND entity_type = ?2 AND entity_reference = ?3
                ",
                params![thread_id, entity_type.to_db(), entity_reference],
            )
            .map_err(|source| ReferenceError::Sql { source })?;
        Ok(removed > 0)
    }
}

fn map_reference_row(row: &rusqlite::Row<'_>) -> Result<ContextReference, rusqlite::Error> {
    let reference_id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let entity_type_raw: String = row.get(2)?;
    let entity_reference: String = row.get(3)?;
    let display_label: String = row.get(4)?;
    let source_raw: String = row.get(5)?;
    let tier_raw: i64 = row.get(6)?;
    let added_at: i64 = row.get(7)?;
    let relevance_score: Option<f64> = row.get(8)?;

    let entity_type = EntityType::from_db(&entity_type_raw).map_err(to_from_sql_err)?;
    let source = ReferenceSource::from_db(&source_raw).map_err(to_from_sql_err)?;
    let priority_tier = u8::try_from(tier_raw)
        .ok()
        .filter(|tier| (1..=3).contains(tier))
        .ok_or(ReferenceError::InvalidTier { value: tier_raw })
        .map_err(to_from_sql_err)?;

    Ok(ContextReference {
        reference_id,
        thread_id,
        entity_type,
        entity_reference,
        display_label,
        source,
        priority_tier,
        added_at,
        relevance_score,
    })
}

fn to_from_sql_err(err: ReferenceError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(err.to_string())),
    )
}
