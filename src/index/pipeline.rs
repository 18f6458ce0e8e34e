use crate::index::chunker::{chunk_text, ChunkLimits, ChunkPiece};
use crate::index::embedder::{EmbedderClient, EmbedderError, EmbedderGateway};
use crate::store::{Store, StoreError};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("document `{document_id}` not found")]
    UnknownDocument { document_id: String },
    #[error("embedding failed for document `{document_id}`: {source}")]
    Embed {
        document_id: String,
        #[source]
        source: EmbedderError,
    },
    #[error("invalid index status `{value}` in database")]
    InvalidStatus { value: String },
    #[error("failed to decode embedding for document `{document_id}` chunk {chunk_index}")]
    InvalidEmbedding {
        document_id: String,
        chunk_index: i64,
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
pub enum IndexStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl IndexStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, IndexStatus::Completed | IndexStatus::Failed)
    }
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexStatus::Pending => write!(f, "pending"),
            IndexStatus::InProgress => write!(f, "in_progress"),
            IndexStatus::Completed => write!(f, "completed"),
            IndexStatus::Failed => write!(f, "failed"),
        }
    }
}

fn status_from_db(value: &str) -> Result<IndexStatus, IndexError> {
    match value {
        "pending" => Ok(IndexStatus::Pending),
        "in_progress" => Ok(IndexStatus::InProgress),
        "completed" => Ok(IndexStatus::Completed),
        "failed" => Ok(IndexStatus::Failed),
        other => Err(IndexError::InvalidStatus {
            value: other.to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub document_id: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    pub index_status: IndexStatus,
    #[serde(default)]
    pub indexed_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    pub embedding: Vec<f32>,
    pub document_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOutcome {
    pub document_id: String,
    pub status: IndexStatus,
    pub chunk_count: usize,
    pub document_version: String,
}

/// Keeps a document's chunk/embedding set in sync with its content.
/// The chunk set swap is one transaction: readers observe the complete
/// old set or the complete new set, never a mix.
pub struct IndexingPipeline<C> {
    store: Store,
    gateway: EmbedderGateway<C>,
    limits: ChunkLimits,
}

impl<C: EmbedderClient> IndexingPipeline<C> {
    pub fn new(store: Store, gateway: EmbedderGateway<C>) -> Self {
        Self {
            store,
            gateway,
            limits: ChunkLimits::default(),
        }
    }

    pub fn with_chunk_limits(mut self, limits: ChunkLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn index_document(
        &self,
        document_id: &str,
        text: &str,
        now: i64,
    ) -> Result<IndexOutcome, IndexError> {
        self.mark_in_progress(document_id, now)?;

        let document_version = content_hash(text);
        let chunks: Vec<ChunkPiece> = chunk_text(text, self.limits).collect();
        let chunk_texts: Vec<String> = chunks.iter().map(|piece| piece.text.clone()).collect();

        match self.gateway.embed_batch(&chunk_texts) {
            Ok(vectors) => {
                self.replace_chunk_set(document_id, &document_version, &chunks, &vectors, now)?;
                Ok(IndexOutcome {
                    document_id: document_id.to_string(),
                    status: IndexStatus::Completed,
                    chunk_count: chunks.len(),
                    document_version,
                })
            }
            Err(source) => {
                // Prior chunk set stays in place; only the status row
                // records the failure.
                self.mark_failed(document_id, &source.to_string(), now)?;
                Err(IndexError::Embed {
                    document_id: document_id.to_string(),
                    source,
                })
            }
        }
    }

    pub fn document_status(&self, document_id: &str) -> Result<DocumentRecord, IndexError> {
        let connection = self.store.connect()?;
        let row = connection
            .query_row(
                "
                SELECT document_id, content_hash, index_status, indexed_at, last_error
                FROM documents
                WHERE document_id = ?1
                ",
                params![document_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|source| IndexError::Sql { source })?;

        let Some((document_id, content_hash, status_raw, indexed_at, last_error)) = row else {
            return Err(IndexError::UnknownDocument {
                document_id: document_id.to_string(),
            });
        };

        Ok(DocumentRecord {
            document_id,
            content_hash,
            index_status: status_from_db(&status_raw)?,
            indexed_at,
            last_error,
        })
    }

    pub fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>, IndexError> {
        let connection = self.store.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT document_id, chunk_index, text, token_count, embedding, document_version
                FROM document_chunks
                WHERE document_id = ?1
                ORDER BY chunk_index ASC
                ",
            )
            .map_err(|source| IndexError::Sql { source })?;

        let rows = statement
            .query_map(params![document_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|source| IndexError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            let (document_id, chunk_index, text, token_count, blob, document_version) =
                row.map_err(|source| IndexError::Sql { source })?;
            let embedding =
                decode_embedding(&blob).ok_or(IndexError::InvalidEmbedding {
                    document_id: document_id.clone(),
                    chunk_index,
                })?;
            out.push(StoredChunk {
                document_id,
                chunk_index,
                text,
                token_count,
                embedding,
                document_version,
            });
        }
        Ok(out)
    }

    fn mark_in_progress(&self, document_id: &str, now: i64) -> Result<(), IndexError> {
        let connection = self.store.connect()?;
        connection
            .execute(
                "
                INSERT INTO documents (document_id, index_status, indexed_at)
                VALUES (?1, 'in_progress', ?2)
                ON CONFLICT(document_id) DO UPDATE SET
                    index_status='in_progress',
                    last_error=NULL
                ",
                params![document_id, now],
            )
            .map_err(|source| IndexError::Sql { source })?;
        Ok(())
    }

    fn mark_failed(&self, document_id: &str, reason: &str, now: i64) -> Result<(), IndexError> {
        let connection = self.store.connect()?;
        connection
            .execute(
                "
                UPDATE documents
                SET index_status='failed', last_error=?2, indexed_at=?3
                WHERE document_id=?1
                ",
                params![document_id, reason, now],
            )
            .map_err(|source| IndexError::Sql { source })?;
        Ok(())
    }

    fn replace_chunk_set(
        &self,
        document_id: &str,
        document_version: &str,
        chunks: &[ChunkPiece],
        vectors: &[Vec<f32>],
        now: i64,
    ) -> Result<(), IndexError> {
        let mut connection = self.store.connect()?;
        let tx = connection
            .transaction()
            .map_err(|source| IndexError::Sql { source })?;

        tx.execute(
            "DELETE FROM document_chunks WHERE document_id = ?1",
            params![document_id],
        )
        .map_err(|source| IndexError::Sql { source })?;

        for (piece, vector) in chunks.iter().zip(vectors) {
            tx.execute(
                "
                INSERT INTO document_chunks (
                    document_id, chunk_index, text, token_count, embedding, document_version
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    document_id,
                    piece.index as i64,
                    piece.text,
                    piece.token_count as i64,
                    encode_embedding(vector),
                    document_version,
                ],
            )
            .map_err(|source| IndexError::Sql { source })?;
        }

        tx.execute(
            "
            UPDATE documents
            SET content_hash=?2, index_status='completed', indexed_at=?3, last_error=NULL
            WHERE document_id=?1
            ",
            params![document_id, document_version, now],
        )
        .map_err(|source| IndexError::Sql { source })?;

        tx.commit().map_err(|source| IndexError::Sql { source })
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub(crate) fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Tolerant decode: raw little-endian f32 bytes, or a JSON array from
/// an older writer.
pub(crate) fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if let Ok(parsed) = serde_json::from_slice::<Vec<f32>>(blob) {
        return Some(parsed);
    }
    if blob.len() % 4 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Some(out)
}
