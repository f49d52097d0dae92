use crate::cache::MetadataCache;
use crate::error::PipelineError;
use crate::models::TokenMetadata;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, mint: &str) -> Result<TokenMetadata>;
}

#[derive(Debug, Deserialize)]
struct DasResponse {
    result: Option<DasAsset>,
}

#[derive(Debug, Deserialize)]
struct DasAsset {
    content: DasContent,
}

#[derive(Debug, Deserialize)]
struct DasContent {
    #[serde(default)]
    json_uri: String,
    #[serde(default)]
    metadata: DasMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct DasMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    symbol: String,
}

#[derive(Debug, Default, Deserialize)]
struct OffchainJson {
    image: Option<String>,
    description: Option<String>,
}

/// Resolves metadata with the DAS `getAsset` method, then reads the
/// off-chain JSON document for image and description.
pub struct DasMetadataSource {
    client: reqwest::Client,
    rpc_url: String,
}

impl DasMetadataSource {
    pub fn new(rpc_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            rpc_url: rpc_url.into(),
        })
    }

    async fn offchain(&self, uri: &str) -> OffchainJson {
        if uri.is_empty() {
            return OffchainJson::default();
        }
        let fetched = async {
            self.client
                .get(uri)
                .send()
                .await?
                .error_for_status()?
                .json::<OffchainJson>()
                .await
        }
        .await;
        match fetched {
            Ok(doc) => doc,
            Err(err) => {
                debug!(uri, "off-chain metadata unavailable: {err}");
                OffchainJson::default()
            }
        }
    }
}

#[async_trait]
impl MetadataSource for DasMetadataSource {
    async fn fetch(&self, mint: &str) -> Result<TokenMetadata> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "launchpad",
            "method": "getAsset",
            "params": { "id": mint },
        });
        let response: DasResponse = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| PipelineError::Upstream(e.to_string()))?
            .json()
            .await
            .context("Failed to parse getAsset response")?;
        let asset = response
            .result
            .with_context(|| format!("getAsset returned no asset for {mint}"))?;
        let doc = self.offchain(&asset.content.json_uri).await;
        Ok(TokenMetadata {
            name: asset.content.metadata.name,
            symbol: asset.content.metadata.symbol,
            uri: asset.content.json_uri,
            image: doc.image,
            description: doc.description,
        })
    }
}

/// Metadata lookups routed through the shared LRU cache.
#[derive(Clone)]
pub struct CachedMetadata {
    source: Arc<dyn MetadataSource>,
    cache: Arc<MetadataCache<TokenMetadata>>,
}

impl CachedMetadata {
    pub fn new(source: Arc<dyn MetadataSource>, cache: Arc<MetadataCache<TokenMetadata>>) -> Self {
        Self { source, cache }
    }

    pub async fn get(&self, mint: &str) -> Result<TokenMetadata> {
        self.cache
            .get_or_fetch(mint, || self.source.fetch(mint))
            .await
    }

    pub fn cache(&self) -> &MetadataCache<TokenMetadata> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl MetadataSource for Counting {
        async fn fetch(&self, mint: &str) -> Result<TokenMetadata> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(TokenMetadata {
                name: format!("{mint}-name"),
                symbol: "SYM".into(),
                ..TokenMetadata::default()
            })
        }
    }

    #[tokio::test]
    async fn test_cached_metadata_fetches_once() {
        let source = Arc::new(Counting(AtomicUsize::new(0)));
        let cached = CachedMetadata::new(
            source.clone(),
            Arc::new(MetadataCache::new(16, Duration::from_secs(3600))),
        );
        let a = cached.get("m1").await.unwrap();
        let b = cached.get("m1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name, "m1-name");
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_das_response_shape() {
        let raw = r#"{"jsonrpc":"2.0","id":"1","result":{"content":{"json_uri":"https://x/1.json","metadata":{"name":"Cat","symbol":"CAT"}}}}"#;
        let parsed: DasResponse = serde_json::from_str(raw).unwrap();
        let asset = parsed.result.unwrap();
        assert_eq!(asset.content.metadata.name, "Cat");
        assert_eq!(asset.content.json_uri, "https://x/1.json");
    }
}
