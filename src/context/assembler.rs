use crate::context::reference::{
    ContextReference, EntityType, ReferenceError, ReferenceRepository, ReferenceSource,
};
use crate::index::chunker::estimate_tokens;
use crate::index::embedder::{EmbedderClient, EmbedderGateway};
use crate::index::pipeline::decode_embedding;
use crate::store::{Store, StoreError};
use crate::threads::{ThreadError, ThreadRepository};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("thread error: {0}")]
    Thread(#[from] ThreadError),
    #[error("reference error: {0}")]
    Reference(#[from] ReferenceError),
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

/// Payload for the `context_ready` execution event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextReadySummary {
    pub document_count: usize,
    pub assembled_chars: usize,
    pub token_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledReference {
    pub reference: ContextReference,
    pub content: String,
    pub token_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledContext {
    pub thread_id: String,
    pub references: Vec<AssembledReference>,
    pub summary: ContextReadySummary,
    /// Tier-1 material alone did not fit the budget; packing trimmed
    /// oldest-first and the turn proceeds with a warning.
    pub overflow: bool,
    /// The embedder was unavailable, so semantic matches were skipped
    /// and only tiers 1-2 were considered.
    pub semantic_degraded: bool,
}

struct Candidate {
    reference: ContextReference,
    /// Pre-resolved material for semantic hits (the matching chunk);
    /// other candidates resolve against the chunk index on demand.
    preresolved: Option<String>,
}

/// Produces the ranked, deduplicated, token-budgeted reference set for
/// one thread: explicit references first, then branch-ancestry
/// inheritance, then semantic retrieval over the chunk index.
pub struct ContextAssembler<C> {
    store: Store,
    threads: ThreadRepository,
    references: ReferenceRepository,
    gateway: EmbedderGateway<C>,
    top_k: usize,
}

impl<C: EmbedderClient> ContextAssembler<C> {
    pub fn new(store: Store, gateway: EmbedderGateway<C>, top_k: usize) -> Self {
        Self {
            threads: ThreadRepository::new(store.clone()),
            references: ReferenceRepository::new(store.clone()),
            store,
            gateway,
            top_k,
        }
    }

    pub fn assemble(
        &self,
        thread_id: &str,
        budget_tokens: usize,
        query_text: &str,
    ) -> Result<AssembledContext, ContextError> {
        let thread = self.threads.load_thread(thread_id)?;

        let mut candidates: Vec<Candidate> = Vec::new();
        let own_references = self.references.list_for_thread(thread_id)?;

        // Tier 1 (manual, mentioned) and stored tier-2/3 rows for the
        // thread itself.
        for reference in &own_references {
            candidates.push(Candidate {
                reference: reference.clone(),
                preresolved: None,
            });
        }

        // Tier 2: walk the parent chain, skipping blacklisted
        // ancestors. An excluded ancestor only hides its own material;
        // the walk continues above it.
        for ancestor in self.threads.ancestry(thread_id)? {
            if thread
                .blacklisted_branches
                .iter()
                .any(|excluded| excluded == &ancestor.thread_id)
            {
                continue;
            }
            for inherited in self.references.list_for_thread(&ancestor.thread_id)? {
                if inherited.source == ReferenceSource::Inherited {
                    continue;
                }
                candidates.push(Candidate {
                    preresolved: None,
                    reference: ContextReference {
                        thread_id: thread_id.to_string(),
                        source: ReferenceSource::Inherited,
                        priority_tier: 2,
                        ..inherited
                    },
                });
            }
        }

        // Tier 3: semantic matches. Embedder trouble degrades to
        // tiers 1-2 instead of failing the turn.
        let mut semantic_degraded = false;
        if !query_text.trim().is_empty() && self.top_k > 0 {
            match self.gateway.embed_query(query_text) {
                Ok(query_embedding) => {
                    for hit in self.semantic_matches(&query_embedding)? {
                        candidates.push(hit);
                    }
                }
                Err(_) => {
                    semantic_degraded = true;
                }
            }
        }

        let deduplicated = dedupe_candidates(candidates);
        let resolved = self.resolve_content(deduplicated)?;
        Ok(pack_into_budget(
            thread_id,
            resolved,
            budget_tokens,
            semantic_degraded,
        ))
    }

    fn semantic_matches(&self, query_embedding: &[f32]) -> Result<Vec<Candidate>, ContextError> {
        let query_norm = l2_norm(query_embedding);
        if query_norm == 0.0 {
            return Ok(Vec::new());
        }

        let connection = self.store.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT c.document_id, c.chunk_index, c.text, c.embedding,
                       COALESCE(d.indexed_at, 0)
                FROM document_chunks c
                JOIN documents d ON d.document_id = c.document_id
                WHERE d.index_status = 'completed'
                ",
            )
            .map_err(|source| ContextError::Sql { source })?;

        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(|source| ContextError::Sql { source })?;

        // Best-scoring chunk per document.
        struct DocumentHit {
            score: f64,
            chunk_text: String,
            indexed_at: i64,
        }
        let mut by_document: HashMap<String, DocumentHit> = HashMap::new();

        for row in rows {
            let (document_id, chunk_index, text, blob, indexed_at) =
                row.map_err(|source| ContextError::Sql { source })?;
            let Some(embedding) = decode_embedding(&blob) else {
                return Err(ContextError::InvalidEmbedding {
                    document_id,
                    chunk_index,
                });
            };
            if embedding.len() != query_embedding.len() {
                continue;
            }
            let score = f64::from(cosine_similarity(query_embedding, query_norm, &embedding));
            match by_document.entry(document_id) {
                Entry::Occupied(mut slot) => {
                    let hit = slot.get_mut();
                    if score > hit.score {
                        hit.score = score;
                        hit.chunk_text = text;
                        hit.indexed_at = indexed_at;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(DocumentHit {
                        score,
                        chunk_text: text,
                        indexed_at,
                    });
                }
            }
        }

        let mut scored: Vec<(String, DocumentHit)> = by_document.into_iter().collect();
        scored.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.1.indexed_at.cmp(&a.1.indexed_at))
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(scored
            .into_iter()
            .take(self.top_k)
            .map(|(document_id, hit)| Candidate {
                reference: ContextReference {
                    reference_id: format!("sem-{document_id}"),
                    thread_id: String::new(),
                    entity_type: EntityType::File,
                    entity_reference: document_id.clone(),
                    display_label: document_id,
                    source: ReferenceSource::AgentAdded,
                    priority_tier: 3,
                    added_at: hit.indexed_at,
                    relevance_score: Some(hit.score),
                },
                preresolved: Some(hit.chunk_text),
            })
            .collect())
    }

    fn resolve_content(
        &self,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<AssembledReference>, ContextError> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let content = match (&candidate.preresolved, candidate.reference.entity_type) {
                (Some(preresolved), _) => preresolved.clone(),
                (None, EntityType::File) => {
                    let chunks = self.document_text(&candidate.reference.entity_reference)?;
                    if chunks.is_empty() {
                        candidate.reference.display_label.clone()
                    } else {
                        chunks
                    }
                }
                (None, EntityType::Thread) => {
                    match self.threads.load_thread(&candidate.reference.entity_reference) {
                        Ok(referenced) if !referenced.summary.is_empty() => referenced.summary,
                        _ => candidate.reference.display_label.clone(),
                    }
                }
                (None, EntityType::Folder) => candidate.reference.display_label.clone(),
            };
            let token_count = estimate_tokens(&content);
            out.push(AssembledReference {
                reference: candidate.reference,
                content,
                token_count,
            });
        }
        Ok(out)
    }

    fn document_text(&self, document_id: &str) -> Result<String, ContextError> {
        let connection = self.store.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT text FROM document_chunks
                WHERE document_id = ?1
                ORDER BY chunk_index ASC
                ",
            )
            .map_err(|source| ContextError::Sql { source })?;
        let rows = statement
            .query_map(params![document_id], |row| row.get::<_, String>(0))
            .map_err(|source| ContextError::Sql { source })?;

        let mut parts = Vec::new();
        for row in rows {
            parts.push(row.map_err(|source| ContextError::Sql { source })?);
        }
        Ok(parts.join("\n\n"))
    }
}

/// Keep the strongest tier per (entity type, entity reference); a
/// known relevance score survives promotion.
fn dedupe_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_entity: HashMap<(EntityType, String), Candidate> = HashMap::new();
    for candidate in candidates {
        let key = (
            candidate.reference.entity_type,
            candidate.reference.entity_reference.clone(),
        );
        match by_entity.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let score = candidate
                    .reference
                    .relevance_score
                    .or(existing.reference.relevance_score);
                if candidate.reference.priority_tier < existing.reference.priority_tier {
                    *existing = candidate;
                }
                existing.reference.relevance_score = score;
            }
        }
    }
    by_entity.into_values().collect()
}

fn pack_into_budget(
    thread_id: &str,
    mut resolved: Vec<AssembledReference>,
    budget_tokens: usize,
    semantic_degraded: bool,
) -> AssembledContext {
    // Tier ascending; newest first inside tiers 1-2 so overflow trims
    // the oldest explicit references; semantic hits by relevance.
    resolved.sort_by(|a, b| {
        a.reference
            .priority_tier
            .cmp(&b.reference.priority_tier)
            .then_with(|| match a.reference.priority_tier {
                3 => b
                    .reference
                    .relevance_score
                    .unwrap_or(0.0)
                    .partial_cmp(&a.reference.relevance_score.unwrap_or(0.0))
                    .unwrap_or(Ordering::Equal),
                _ => b.reference.added_at.cmp(&a.reference.added_at),
            })
            .then_with(|| a.reference.entity_reference.cmp(&b.reference.entity_reference))
    });

    let tier_one_tokens: usize = resolved
        .iter()
        .filter(|item| item.reference.priority_tier == 1)
        .map(|item| item.token_count)
        .sum();
    let overflow = tier_one_tokens > budget_tokens;

    let mut packed = Vec::new();
    let mut used_tokens = 0usize;
    for item in resolved {
        if used_tokens + item.token_count > budget_tokens {
            break;
        }
        used_tokens += item.token_count;
        packed.push(item);
    }

    let assembled_chars: usize = packed.iter().map(|item| item.content.len()).sum();
    let document_count = packed
        .iter()
        .filter(|item| item.reference.entity_type == EntityType::File)
        .count();

    AssembledContext {
        thread_id: thread_id.to_string(),
        summary: ContextReadySummary {
            document_count,
            assembled_chars,
            token_count: used_tokens,
        },
        references: packed,
        overflow,
        semantic_degraded,
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn cosine_similarity(a: &[f32], a_norm: f32, b: &[f32]) -> f32 {
    let b_norm = l2_norm(b);
    if b_norm == 0.0 {
        return 0.0;
    }
    let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    dot / (a_norm * b_norm)
}
