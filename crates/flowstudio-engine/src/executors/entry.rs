use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use flowstudio_core::error::Result;
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::traits::FileAccess;
use flowstudio_core::types::FileRef;

use super::{NodeHandler, NodeOutput};
use crate::context::ExecutionContext;

/// Passes the run input through and exposes uploaded files as the
/// `files` and `file_content` step fields.
pub struct EntryHandler {
    files: Arc<dyn FileAccess>,
}

impl EntryHandler {
    pub fn new(files: Arc<dyn FileAccess>) -> Self {
        Self { files }
    }

    async fn describe_files(&self, files: &[FileRef]) -> String {
        if files.is_empty() {
            return "No files available".to_string();
        }
        let mut lines = vec![format!("Files available ({}):", files.len())];
        for file in files {
            let size = match &file.path {
                Some(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
                None => None,
            };
            lines.push(match size {
                Some(bytes) => format!("{} ({bytes} bytes)", file.name),
                None => file.name.clone(),
            });
        }
        lines.join("\n")
    }

    async fn first_text_content(&self, files: &[FileRef]) -> String {
        let Some(file) = files.iter().find(|f| !f.is_image()) else {
            return "No file content available".to_string();
        };
        match self.files.fetch(file).await {
            Ok(bytes) => format!(
                "File Content ({}):\n\n{}",
                file.name,
                String::from_utf8_lossy(&bytes)
            ),
            Err(e) => {
                warn!(file = %file.name, error = %e, "Failed to read uploaded file");
                "No file content available".to_string()
            }
        }
    }
}

impl NodeHandler for EntryHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Entry
    }

    fn execute<'a>(
        &'a self,
        _node: &'a Node,
        input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let files = self.describe_files(&ctx.uploaded_files).await;
            let content = self.first_text_content(&ctx.uploaded_files).await;
            debug!(run_id = %ctx.run_id, files = ctx.uploaded_files.len(), "Entry node");

            Ok(NodeOutput::new(input.clone())
                .with_extra("files", files)
                .with_extra("file_content", content))
        })
    }
}
