use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::graph::Graph;
use flowstudio_core::traits::GraphStore;

/// Graph records stored as `<dir>/<id>.json`.
pub struct JsonGraphDir {
    dir: PathBuf,
}

impl JsonGraphDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a graph under its id, creating the directory if needed.
    pub fn save(&self, id: &str, graph: &Graph) -> Result<PathBuf> {
        let path = self.path_for(id)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&path, serde_json::to_string_pretty(graph)?)?;
        Ok(path)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(FlowError::GraphNotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl GraphStore for JsonGraphDir {
    fn load_graph(&self, id: &str) -> BoxFuture<'_, Result<Graph>> {
        let id = id.to_string();

        Box::pin(async move {
            let path = self.path_for(&id)?;
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FlowError::GraphNotFound(id));
                }
                Err(e) => return Err(e.into()),
            };
            let mut graph: Graph = serde_json::from_str(&content)?;
            graph.id.get_or_insert(id);
            debug!(path = %path.display(), nodes = graph.nodes.len(), "Graph loaded");
            Ok(graph)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstudio_core::graph::{Edge, Node, NodeKind};

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonGraphDir::new(dir.path().join("graphs"));
        let graph = Graph::new(
            vec![
                Node::new("start", NodeKind::Entry),
                Node::new("out", NodeKind::Answer),
            ],
            vec![Edge::new("start", "out")],
        );
        store.save("3f2a-91", &graph).unwrap();

        let loaded = store.load_graph("3f2a-91").await.unwrap();
        assert_eq!(loaded.id.as_deref(), Some("3f2a-91"));
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.edges[0].target, "out");
    }

    #[tokio::test]
    async fn test_missing_graph() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonGraphDir::new(dir.path());
        let err = store.load_graph("nope").await.unwrap_err();
        assert!(matches!(err, FlowError::GraphNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let store = JsonGraphDir::new("/tmp");
        assert!(matches!(
            store.load_graph("../etc/passwd").await,
            Err(FlowError::GraphNotFound(_))
        ));
    }
}
