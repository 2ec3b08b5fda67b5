use async_trait::async_trait;
use tracing::{debug, warn};

use pageinfra_common::Sku;

use crate::error::{StoreError, StoreResult};
use crate::traits::SearchIndex;

/// Meilisearch documents endpoint. Writes are enqueued as tasks on the
/// server side; a 202 means accepted, not yet searchable.
pub struct MeilisearchIndex {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl MeilisearchIndex {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn documents_url(&self, index: &str) -> String {
        format!("{}/indexes/{}/documents?primaryKey=code", self.base_url, index)
    }
}

#[async_trait]
impl SearchIndex for MeilisearchIndex {
    async fn add_documents(&self, index: &str, skus: &[Sku]) -> StoreResult<()> {
        if skus.is_empty() {
            return Ok(());
        }

        let mut request = self.client.post(self.documents_url(index)).json(skus);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = format!("{} {}", status.as_u16(), body);
            // 5xx is the server being down or overloaded; 4xx is our payload.
            return Err(if status.is_server_error() {
                StoreError::Unavailable(message)
            } else {
                StoreError::Rejected(message)
            });
        }

        debug!(index, documents = skus.len(), "Search documents enqueued");
        Ok(())
    }
}

/// Used when no search server is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndex;

#[async_trait]
impl SearchIndex for NoopIndex {
    async fn add_documents(&self, index: &str, skus: &[Sku]) -> StoreResult<()> {
        if !skus.is_empty() {
            warn!(index, documents = skus.len(), "No search index configured, documents dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_url_trims_trailing_slash() {
        let index = MeilisearchIndex::new("http://localhost:7700/", None);
        assert_eq!(
            index.documents_url("rihappy"),
            "http://localhost:7700/indexes/rihappy/documents?primaryKey=code"
        );
    }

    #[tokio::test]
    async fn noop_index_accepts_everything() {
        let skus = vec![Sku::new("A", serde_json::json!({"name": "a"}))];
        NoopIndex.add_documents("rihappy", &skus).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        // Port 9 (discard) is closed on test hosts.
        let index = MeilisearchIndex::new("http://127.0.0.1:9", None);
        let skus = vec![Sku::new("A", serde_json::json!({}))];
        let err = index.add_documents("rihappy", &skus).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
