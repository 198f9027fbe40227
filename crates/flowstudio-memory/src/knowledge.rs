use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::traits::RetrievalBackend;
use flowstudio_core::types::{Passage, RetrievalMethod, RetrievalQuery};

use crate::embeddings::{cosine_similarity, from_blob, to_blob, EmbeddingProvider};

const LEXICAL_WEIGHT: f64 = 0.4;
const VECTOR_WEIGHT: f64 = 0.6;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS passages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        knowledge_id TEXT NOT NULL,
        source_document TEXT NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB
    );

    CREATE INDEX IF NOT EXISTS idx_passages_knowledge ON passages(knowledge_id);

    CREATE VIRTUAL TABLE IF NOT EXISTS passages_fts USING fts5(
        content,
        knowledge_id UNINDEXED,
        content_rowid=id,
        tokenize='porter unicode61'
    );

    CREATE TRIGGER IF NOT EXISTS passages_ai AFTER INSERT ON passages BEGIN
        INSERT INTO passages_fts(rowid, content, knowledge_id)
        VALUES (new.id, new.content, new.knowledge_id);
    END;";

/// SQLite knowledge base: FTS5 lexical search, stored embeddings, and a hybrid of both.
pub struct SqliteKnowledgeStore {
    conn: Mutex<Connection>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl SqliteKnowledgeStore {
    pub fn open(path: &Path, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        debug!(path = %path.display(), "Knowledge store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            embedder,
        })
    }

    pub fn in_memory(embedder: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            embedder,
        })
    }

    /// Store one passage, embedding it when a provider is configured.
    pub async fn add_passage(
        &self,
        knowledge_id: &str,
        source_document: &str,
        content: &str,
    ) -> Result<i64> {
        let embedding = match &self.embedder {
            Some(embedder) => embedder
                .embed(&[content.to_string()])
                .await?
                .into_iter()
                .next()
                .map(|v| to_blob(&v)),
            None => None,
        };

        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO passages (knowledge_id, source_document, content, embedding)
             VALUES (?1, ?2, ?3, ?4)",
            params![knowledge_id, source_document, content, embedding],
        )
        .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    /// Split a document into paragraph chunks and store each one.
    pub async fn add_document(
        &self,
        knowledge_id: &str,
        source_document: &str,
        text: &str,
        max_chunk_chars: usize,
    ) -> Result<usize> {
        let chunks = chunk_text(text, max_chunk_chars);
        for chunk in &chunks {
            self.add_passage(knowledge_id, source_document, chunk).await?;
        }
        Ok(chunks.len())
    }

    fn lexical(&self, knowledge_id: &str, query: &str, limit: usize) -> Result<Vec<(i64, Passage)>> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(vec![]);
        };
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT passages.id, passages.content, passages.source_document, passages_fts.rank
                 FROM passages_fts
                 JOIN passages ON passages.id = passages_fts.rowid
                 WHERE passages_fts MATCH ?1 AND passages_fts.knowledge_id = ?2
                 ORDER BY passages_fts.rank
                 LIMIT ?3",
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![fts_query, knowledge_id, limit as i64], |row| {
                let rank: f64 = row.get(3)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    Passage {
                        text_content: row.get(1)?,
                        source_document: row.get(2)?,
                        score: bm25_score(rank),
                    },
                ))
            })
            .map_err(|e| FlowError::Database(e.to_string()))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FlowError::Database(e.to_string()))
    }

    fn vector(&self, knowledge_id: &str, query_vec: &[f32], limit: usize) -> Result<Vec<(i64, Passage)>> {
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, content, source_document, embedding FROM passages
                 WHERE knowledge_id = ?1 AND embedding IS NOT NULL",
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![knowledge_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let mut scored = Vec::new();
        for row in rows {
            let (id, content, source, blob) = row.map_err(|e| FlowError::Database(e.to_string()))?;
            let sim = cosine_similarity(query_vec, &from_blob(&blob)) as f64;
            scored.push((
                id,
                Passage {
                    text_content: content,
                    source_document: source,
                    score: sim,
                },
            ));
        }

        scored.sort_by(|a, b| b.1.score.partial_cmp(&a.1.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn embed_query(&self, query: &str) -> Result<Option<Vec<f32>>> {
        match &self.embedder {
            Some(embedder) => Ok(embedder.embed(&[query.to_string()]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn search(&self, q: &RetrievalQuery) -> Result<Vec<Passage>> {
        let mut method = q.method;
        let query_vec = match method {
            RetrievalMethod::Lexical => None,
            _ => self.embed_query(&q.query).await?,
        };
        if method != RetrievalMethod::Lexical && query_vec.is_none() {
            warn!(method = ?method, "No embedding provider configured, using lexical search");
            method = RetrievalMethod::Lexical;
        }

        let mut results = match (method, query_vec) {
            (RetrievalMethod::Vector, Some(v)) => self.vector(&q.knowledge_id, &v, q.top_k)?,
            (RetrievalMethod::Hybrid, Some(v)) => {
                let candidates = q.top_k * 2;
                let lexical = self.lexical(&q.knowledge_id, &q.query, candidates)?;
                let vector = self.vector(&q.knowledge_id, &v, candidates)?;
                combine(lexical, vector)
            }
            _ => self.lexical(&q.knowledge_id, &q.query, q.top_k)?,
        };

        results.retain(|(_, p)| p.score >= q.score_threshold);
        results.truncate(q.top_k);
        Ok(results.into_iter().map(|(_, p)| p).collect())
    }
}

impl RetrievalBackend for SqliteKnowledgeStore {
    fn retrieve(&self, query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<Passage>>> {
        Box::pin(async move {
            let passages = self.search(&query).await?;
            debug!(
                knowledge_id = %query.knowledge_id,
                method = ?query.method,
                hits = passages.len(),
                "Knowledge retrieval"
            );
            Ok(passages)
        })
    }
}

/// Weighted merge of lexical and vector hits keyed by passage id.
fn combine(lexical: Vec<(i64, Passage)>, vector: Vec<(i64, Passage)>) -> Vec<(i64, Passage)> {
    let mut merged: HashMap<i64, (Passage, f64, f64)> = HashMap::new();
    for (id, p) in lexical {
        let score = p.score;
        merged.entry(id).or_insert((p, 0.0, 0.0)).1 = score;
    }
    for (id, p) in vector {
        let score = p.score;
        merged.entry(id).or_insert((p, 0.0, 0.0)).2 = score;
    }

    let mut out: Vec<(i64, Passage)> = merged
        .into_iter()
        .map(|(id, (mut p, lex, vec))| {
            p.score = LEXICAL_WEIGHT * lex + VECTOR_WEIGHT * vec;
            (id, p)
        })
        .collect();
    out.sort_by(|a, b| {
        b.1.score
            .partial_cmp(&a.1.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    out
}

/// Quote each word and OR them together so arbitrary input is a valid FTS5 query.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

/// Map an FTS5 bm25 rank (more negative is better) onto 0..1.
fn bm25_score(rank: f64) -> f64 {
    let r = (-rank).max(0.0);
    r / (1.0 + r)
}

/// Split text on blank lines, packing paragraphs into chunks of at most `max_chars`.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.len() + para.len() + 2 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Embeds by keyword presence so similarity is predictable.
    struct KeywordEmbedder;

    impl EmbeddingProvider for KeywordEmbedder {
        fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
            let out = texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        if t.contains("refund") { 1.0 } else { 0.0 },
                        if t.contains("shipping") { 1.0 } else { 0.0 },
                        0.1,
                    ]
                })
                .collect();
            Box::pin(async move { Ok(out) })
        }

        fn dimensions(&self) -> usize {
            3
        }
    }

    fn query(method: RetrievalMethod, q: &str) -> RetrievalQuery {
        RetrievalQuery {
            method,
            knowledge_id: "kb".into(),
            query: q.into(),
            top_k: 5,
            score_threshold: 0.0,
        }
    }

    async fn seeded(embedder: Option<Arc<dyn EmbeddingProvider>>) -> SqliteKnowledgeStore {
        let store = SqliteKnowledgeStore::in_memory(embedder).unwrap();
        store
            .add_passage("kb", "policy.md", "Refunds are issued within 14 days.")
            .await
            .unwrap();
        store
            .add_passage("kb", "shipping.md", "Shipping takes three business days.")
            .await
            .unwrap();
        for filler in ["Our office is open on weekdays.", "Contact support by email."] {
            store.add_passage("kb", "about.md", filler).await.unwrap();
        }
        store
            .add_passage("other", "x.md", "Refunds in another knowledge base.")
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_fts_query_sanitizes() {
        assert_eq!(fts_query("what's up?").unwrap(), "\"what\" OR \"s\" OR \"up\"");
        assert!(fts_query("?!").is_none());
    }

    #[test]
    fn test_bm25_score_range() {
        assert_eq!(bm25_score(0.0), 0.0);
        assert!(bm25_score(-3.0) > bm25_score(-1.0));
        assert!(bm25_score(-100.0) < 1.0);
    }

    #[test]
    fn test_chunk_text() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        assert_eq!(chunk_text(text, 10), vec!["aaaa\n\nbbbb", "cccc"]);
        assert_eq!(chunk_text(text, 100).len(), 1);
        assert!(chunk_text("  \n\n ", 10).is_empty());
    }

    #[tokio::test]
    async fn test_lexical_scoped_to_knowledge_id() {
        let store = seeded(None).await;
        let hits = store
            .retrieve(query(RetrievalMethod::Lexical, "refunds"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_document, "policy.md");
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_vector_without_embedder_falls_back() {
        let store = seeded(None).await;
        let hits = store
            .retrieve(query(RetrievalMethod::Vector, "shipping"))
            .await
            .unwrap();
        assert_eq!(hits[0].source_document, "shipping.md");
    }

    #[tokio::test]
    async fn test_vector_search() {
        let store = seeded(Some(Arc::new(KeywordEmbedder))).await;
        let hits = store
            .retrieve(query(RetrievalMethod::Vector, "how long for a refund"))
            .await
            .unwrap();
        assert_eq!(hits[0].source_document, "policy.md");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_hybrid_weights_and_threshold() {
        let store = seeded(Some(Arc::new(KeywordEmbedder))).await;
        let mut q = query(RetrievalMethod::Hybrid, "shipping");
        q.score_threshold = 0.5;
        let hits = store.retrieve(q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_document, "shipping.md");
        assert!(hits[0].score <= 1.0);
    }
}
