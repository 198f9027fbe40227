use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::traits::FileAccess;
use flowstudio_core::types::FileRef;

/// Reads uploaded files from disk and downloads remote references.
pub struct LocalFiles {
    http: reqwest::Client,
    max_bytes: usize,
}

impl LocalFiles {
    pub fn new(timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            max_bytes: 20 * 1024 * 1024,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl Default for LocalFiles {
    fn default() -> Self {
        Self::new(30)
    }
}

impl FileAccess for LocalFiles {
    fn fetch(&self, file: &FileRef) -> BoxFuture<'_, Result<Vec<u8>>> {
        let file = file.clone();

        Box::pin(async move {
            let bytes = if let Some(path) = &file.path {
                tokio::fs::read(path).await?
            } else if let Some(url) = &file.url {
                debug!(url = %url, "Downloading file");
                let resp = self.http.get(url).send().await.map_err(|e| {
                    FlowError::ExternalCallFailed {
                        service: "file download".into(),
                        message: e.to_string(),
                    }
                })?;
                if !resp.status().is_success() {
                    return Err(FlowError::ExternalCallFailed {
                        service: "file download".into(),
                        message: format!("HTTP {} for {}", resp.status(), url),
                    });
                }
                resp.bytes()
                    .await
                    .map_err(|e| FlowError::ExternalCallFailed {
                        service: "file download".into(),
                        message: e.to_string(),
                    })?
                    .to_vec()
            } else {
                return Err(FlowError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("file '{}' has neither a path nor a url", file.name),
                )));
            };

            if bytes.len() > self.max_bytes {
                return Err(FlowError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("file '{}' exceeds {} bytes", file.name, self.max_bytes),
                )));
            }
            Ok(bytes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_local() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("notes.txt");
        std::fs::write(&p, "hello").unwrap();
        let bytes = LocalFiles::default().fetch(&FileRef::local(&p)).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_fetch_missing_local() {
        let err = LocalFiles::default()
            .fetch(&FileRef::local("/definitely/not/here.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Io(_)));
    }

    #[tokio::test]
    async fn test_fetch_remote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.md"))
            .respond_with(ResponseTemplate::new(200).set_body_string("# Title"))
            .mount(&server)
            .await;
        let file = FileRef::remote(format!("{}/doc.md", server.uri()));
        let bytes = LocalFiles::default().fetch(&file).await.unwrap();
        assert_eq!(bytes, b"# Title");
    }

    #[tokio::test]
    async fn test_fetch_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("big.txt");
        std::fs::write(&p, "0123456789").unwrap();
        let err = LocalFiles::default()
            .with_max_bytes(4)
            .fetch(&FileRef::local(&p))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
