pub mod chunker;
pub mod embedder;
pub mod pipeline;

pub use chunker::{chunk_text, ChunkLimits, ChunkPiece};
pub use embedder::{
    EmbedderClient, EmbedderError, EmbedderGateway, HashEmbedderClient, HttpEmbedderClient,
    RetryPolicy,
};
pub use pipeline::{
    content_hash, DocumentRecord, IndexError, IndexOutcome, IndexStatus, IndexingPipeline,
    StoredChunk,
};
