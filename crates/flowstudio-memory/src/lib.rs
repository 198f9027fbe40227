pub mod embeddings;
pub mod files;
pub mod graphs;
pub mod knowledge;
pub mod store;

pub use embeddings::{cosine_similarity, EmbeddingProvider, HttpEmbeddingProvider};
pub use files::LocalFiles;
pub use graphs::JsonGraphDir;
pub use knowledge::SqliteKnowledgeStore;
pub use store::SqliteStore;
