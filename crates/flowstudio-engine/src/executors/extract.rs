use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use flowstudio_core::error::Result;
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::Diagnostic;
use flowstudio_core::traits::FileAccess;
use flowstudio_core::types::FileRef;

use super::{resolved_config, NodeHandler, NodeOutput};
use crate::context::ExecutionContext;
use crate::text::strip_html_tags;

/// Document formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Csv,
    Json,
    Xml,
    Html,
}

impl DocumentFormat {
    /// Detect from the file extension, then the MIME type.
    pub fn detect(file: &FileRef) -> Option<Self> {
        let ext = std::path::Path::new(&file.name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        let by_ext = match ext.as_deref() {
            Some("txt" | "text" | "log") => Some(Self::PlainText),
            Some("md" | "markdown") => Some(Self::Markdown),
            Some("csv") => Some(Self::Csv),
            Some("json") => Some(Self::Json),
            Some("xml") => Some(Self::Xml),
            Some("html" | "htm") => Some(Self::Html),
            _ => None,
        };
        by_ext.or_else(|| {
            let mime = file.media_type();
            match mime.as_str() {
                "text/markdown" => Some(Self::Markdown),
                "text/csv" => Some(Self::Csv),
                "application/json" => Some(Self::Json),
                "application/xml" | "text/xml" => Some(Self::Xml),
                "text/html" => Some(Self::Html),
                m if m.starts_with("text/") => Some(Self::PlainText),
                _ => None,
            }
        })
    }
}

/// Convert raw bytes to plain text.
pub fn extract_text(format: DocumentFormat, bytes: &[u8]) -> std::result::Result<String, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("not valid UTF-8: {e}"))?;
    Ok(match format {
        DocumentFormat::PlainText | DocumentFormat::Markdown | DocumentFormat::Csv => {
            text.to_string()
        }
        DocumentFormat::Json => {
            let value: serde_json::Value =
                serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
            serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?
        }
        DocumentFormat::Xml | DocumentFormat::Html => strip_html_tags(text),
    })
}

/// Text extraction from uploaded or downloaded documents.
pub struct ExtractHandler {
    files: Arc<dyn FileAccess>,
}

impl ExtractHandler {
    pub fn new(files: Arc<dyn FileAccess>) -> Self {
        Self { files }
    }

    async fn extract_one(&self, file: &FileRef) -> std::result::Result<String, Diagnostic> {
        let failed = |message: String| Diagnostic::ExtractionFailed {
            file: file.name.clone(),
            message,
        };
        let format = DocumentFormat::detect(file)
            .ok_or_else(|| failed(format!("unsupported type {}", file.media_type())))?;
        let bytes = self
            .files
            .fetch(file)
            .await
            .map_err(|e| failed(e.to_string()))?;
        extract_text(format, &bytes).map_err(failed)
    }
}

impl NodeHandler for ExtractHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Extract
    }

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        _input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let mut diagnostics = Vec::new();

            let targets: Vec<FileRef> = match resolved_config(node, "url", ctx) {
                Some(r) if !r.text.trim().is_empty() => {
                    diagnostics.extend(r.diagnostics());
                    vec![FileRef::remote(r.text.trim())]
                }
                _ => match node.config_u64("fileIndex") {
                    Some(i) => ctx.uploaded_files.get(i as usize).cloned().into_iter().collect(),
                    None => ctx.uploaded_files.clone(),
                },
            };

            if targets.is_empty() {
                diagnostics.push(Diagnostic::ExtractionFailed {
                    file: String::new(),
                    message: "no file to extract".into(),
                });
            }

            let mut sections = Vec::new();
            for file in &targets {
                match self.extract_one(file).await {
                    Ok(text) => {
                        debug!(node_id = %node.id, file = %file.name, chars = text.len(), "Extracted text");
                        sections.push((file.name.clone(), text));
                    }
                    Err(diagnostic) => {
                        warn!(node_id = %node.id, %diagnostic, "Extraction failed");
                        diagnostics.push(diagnostic);
                    }
                }
            }

            let output = match sections.as_slice() {
                [(_, only)] => only.clone(),
                many => many
                    .iter()
                    .map(|(name, text)| format!("=== {name} ===\n{text}"))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            };
            let names: Vec<String> = sections.into_iter().map(|(name, _)| name).collect();
            Ok(NodeOutput::new(output)
                .with_extra("files", names)
                .with_diagnostics(diagnostics))
        })
    }
}
