use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info, warn};

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::{value_to_text, Diagnostic};
use flowstudio_core::traits::FileAccess;

use super::{cancellable, NodeHandler, NodeOutput};
use crate::context::ExecutionContext;
use crate::resolver;

/// A `{key, value}` row of headers, params or form bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyValue {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
    /// `text` or `file` for multipart rows.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyType {
    None,
    Raw,
    Json,
    UrlEncoded,
    FormData,
    Binary,
}

impl BodyType {
    fn parse(s: &str) -> Self {
        match s {
            "raw" => Self::Raw,
            "json" => Self::Json,
            "x-www-form-urlencoded" => Self::UrlEncoded,
            "form-data" => Self::FormData,
            "binary" => Self::Binary,
            _ => Self::None,
        }
    }
}

/// Outbound HTTP call with every string field variable-resolved.
pub struct HttpHandler {
    client: reqwest::Client,
    files: Arc<dyn FileAccess>,
}

/// Resolves templates while collecting unresolved-reference diagnostics.
struct Templates<'a> {
    ctx: &'a ExecutionContext,
    diagnostics: Vec<Diagnostic>,
}

impl Templates<'_> {
    fn text(&mut self, template: &str) -> String {
        let resolved = resolver::resolve(template, &self.ctx.trace);
        self.diagnostics.extend(resolved.diagnostics());
        resolved.text
    }

    fn value(&mut self, value: &serde_json::Value) -> String {
        self.text(&value_to_text(value))
    }

    fn pairs<'r>(&mut self, rows: impl IntoIterator<Item = &'r KeyValue>) -> Vec<(String, String)> {
        rows.into_iter()
            .filter(|r| !r.key.is_empty())
            .map(|r| (r.key.clone(), self.value(&r.value)))
            .collect()
    }
}

impl HttpHandler {
    pub fn new(client: reqwest::Client, files: Arc<dyn FileAccess>) -> Self {
        Self { client, files }
    }

    fn config_error(node: &Node, message: impl Into<String>) -> FlowError {
        FlowError::InvalidNodeConfig {
            node_id: node.id.clone(),
            message: message.into(),
        }
    }

    /// Multipart form with every uploaded file attached under each `file` row.
    async fn multipart(
        &self,
        node: &Node,
        fields: Vec<(String, String)>,
        file_keys: &[&str],
        ctx: &ExecutionContext,
    ) -> Result<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new();
        for (key, value) in fields {
            form = form.text(key, value);
        }
        for key in file_keys {
            for file in &ctx.uploaded_files {
                let bytes = self.files.fetch(file).await?;
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(file.name.clone())
                    .mime_str(&file.media_type())
                    .map_err(|e| Self::config_error(node, e.to_string()))?;
                debug!(node_id = %node.id, file = %file.name, field = %key, "Attaching file");
                form = form.part(key.to_string(), part);
            }
        }
        Ok(form)
    }
}

impl NodeHandler for HttpHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Http
    }

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        _input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let mut templates = Templates {
                ctx,
                diagnostics: Vec::new(),
            };

            let url = templates.text(node.config_str("url").unwrap_or_default());
            if url.trim().is_empty() {
                return Err(Self::config_error(node, "http node has no url"));
            }
            let method_name = node.config_str("method").unwrap_or("GET").to_ascii_uppercase();
            let method = reqwest::Method::from_bytes(method_name.as_bytes())
                .map_err(|_| Self::config_error(node, format!("invalid method '{method_name}'")))?;

            let headers: Vec<KeyValue> = node.config_as("headers")?.unwrap_or_default();
            let params: Vec<KeyValue> = node.config_as("params")?.unwrap_or_default();
            let header_pairs = templates.pairs(&headers);
            let query = templates.pairs(&params);

            let mut request = self.client.request(method.clone(), url.as_str());
            for (key, value) in &header_pairs {
                let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| Self::config_error(node, format!("header '{key}': {e}")))?;
                let value = reqwest::header::HeaderValue::from_str(value)
                    .map_err(|e| Self::config_error(node, format!("header '{key}': {e}")))?;
                request = request.header(name, value);
            }
            if !query.is_empty() {
                request = request.query(&query);
            }
            if let Some(secs) = node.config_u64("timeoutSecs") {
                request = request.timeout(Duration::from_secs(secs));
            }

            let body_type = BodyType::parse(node.config_str("bodyType").unwrap_or("none"));
            let body_data = node.config.get("bodyData").cloned().unwrap_or_default();
            request = match body_type {
                BodyType::None => request,
                BodyType::Raw => request.body(templates.value(&body_data)),
                BodyType::Json => {
                    let text = templates.value(&body_data);
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(json) => request.json(&json),
                        Err(e) => {
                            warn!(node_id = %node.id, error = %e, "JSON body does not parse, sending raw");
                            request.body(text)
                        }
                    }
                }
                BodyType::UrlEncoded => {
                    let rows: Vec<KeyValue> = node.config_as("bodyData")?.unwrap_or_default();
                    request.form(&templates.pairs(&rows))
                }
                BodyType::FormData => {
                    let rows: Vec<KeyValue> = node.config_as("bodyData")?.unwrap_or_default();
                    let is_file = |r: &KeyValue| r.kind.as_deref() == Some("file");
                    let fields = templates.pairs(rows.iter().filter(|r| !is_file(*r)));
                    let file_keys: Vec<&str> = rows
                        .iter()
                        .filter(|r| is_file(*r) && !r.key.is_empty())
                        .map(|r| r.key.as_str())
                        .collect();
                    if file_keys.is_empty() || ctx.uploaded_files.is_empty() {
                        request.form(&fields)
                    } else {
                        request.multipart(self.multipart(node, fields, &file_keys, ctx).await?)
                    }
                }
                BodyType::Binary => {
                    let text = templates.value(&body_data);
                    match ctx.uploaded_files.first() {
                        Some(file) if text.is_empty() => request.body(self.files.fetch(file).await?),
                        _ => request.body(text.into_bytes()),
                    }
                }
            };

            info!(run_id = %ctx.run_id, node_id = %node.id, method = %method, url = %url, "Sending HTTP request");

            let send = async {
                let resp = request.send().await.map_err(|e| FlowError::ExternalCallFailed {
                    service: "http".into(),
                    message: e.to_string(),
                })?;
                let status = resp.status();
                let response_headers: serde_json::Map<String, serde_json::Value> = resp
                    .headers()
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.as_str().to_string(),
                            serde_json::Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
                        )
                    })
                    .collect();
                let text = resp.text().await.map_err(|e| FlowError::ExternalCallFailed {
                    service: "http".into(),
                    message: e.to_string(),
                })?;
                Ok((status, response_headers, text))
            };
            let (status, response_headers, text) = cancellable(ctx, send).await?;
            let mut diagnostics = templates.diagnostics;

            if !status.is_success() {
                warn!(node_id = %node.id, status = status.as_u16(), "HTTP request returned non-success status");
                diagnostics.push(Diagnostic::HttpStatus {
                    status: status.as_u16(),
                });
                return Ok(NodeOutput::new(text).with_diagnostics(diagnostics));
            }

            let body = serde_json::from_str::<serde_json::Value>(&text)
                .unwrap_or(serde_json::Value::String(text));
            debug!(node_id = %node.id, status = status.as_u16(), "HTTP request complete");
            Ok(NodeOutput::new(serde_json::json!({
                "status": status.as_u16(),
                "headers": response_headers,
                "body": body,
            }))
            .with_diagnostics(diagnostics))
        })
    }
}
