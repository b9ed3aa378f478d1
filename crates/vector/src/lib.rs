pub mod embed;
pub mod openai;
pub mod store;

pub use embed::{cosine_similarity, EmbedError, Embedder, HashEmbedder};
pub use openai::OpenAiEmbedder;
pub use store::{
    doc_id, EntryMetadata, InMemoryVectorStore, SearchFilter, SearchHit, Source, SqlVectorStore,
    VectorEntry, VectorError, VectorIndex,
};
