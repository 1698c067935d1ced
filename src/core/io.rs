use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::core::error::{PipelineError, Result};

/// Where published artifacts live. Keys are `/`-separated relative paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Public URL an object will have once uploaded, if the store publishes objects.
    fn public_url(&self, key: &str) -> Option<String>;

    /// Stores `bytes` under `key`; returns the public URL when there is one.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<Option<String>>;

    /// `Ok(None)` when the object does not exist or the store is not configured.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    None,
    Local {
        root: String,
        #[serde(default)]
        public_base_url: Option<String>,
    },
    Http {
        endpoint: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        public_base_url: Option<String>,
    },
}

impl StorageConfig {
    pub fn apply_env<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let StorageConfig::Http { token, .. } = self {
            if token.is_none() {
                *token = lookup("STORAGE_TOKEN");
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            StorageConfig::None => Ok(()),
            StorageConfig::Local { root, .. } if root.trim().is_empty() => Err(
                PipelineError::configuration("storage.root is required for the local provider"),
            ),
            StorageConfig::Http { endpoint, .. } => {
                url::Url::parse(endpoint).map_err(|e| {
                    PipelineError::configuration(format!("storage.endpoint is not a URL: {}", e))
                })?;
                Ok(())
            }
            StorageConfig::Local { .. } => Ok(()),
        }
    }
}

pub fn create_object_store(
    config: &StorageConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn ObjectStore>> {
    config.validate()?;
    Ok(match config {
        StorageConfig::None => Arc::new(NoopObjectStore),
        StorageConfig::Local {
            root,
            public_base_url,
        } => Arc::new(LocalObjectStore::new(root, public_base_url.clone())),
        StorageConfig::Http {
            endpoint,
            token,
            public_base_url,
        } => Arc::new(HttpObjectStore::new(
            endpoint,
            token.clone(),
            public_base_url.clone(),
            client,
        )),
    })
}

fn validate_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if key.is_empty() || escapes {
        return Err(PipelineError::storage(format!("invalid object key: {}", key)));
    }
    Ok(())
}

fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

// --- No-op ---

pub struct NoopObjectStore;

#[async_trait]
impl ObjectStore for NoopObjectStore {
    fn public_url(&self, _key: &str) -> Option<String> {
        None
    }

    async fn put(&self, key: &str, _bytes: &[u8], _content_type: &str) -> Result<Option<String>> {
        log::debug!("Object storage not configured, skipping upload of {}", key);
        Ok(None)
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

// --- Local directory ---

/// Writes objects under a directory, e.g. one served by a static web server.
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url,
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn public_url(&self, key: &str) -> Option<String> {
        self.public_base_url
            .as_deref()
            .map(|base| join_url(base, key))
    }

    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&path, bytes).await?;
        log::info!("Stored {} ({} bytes) at {:?}", key, bytes.len(), path);
        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// --- HTTP (S3-compatible PUT/GET) ---

pub struct HttpObjectStore {
    endpoint: String,
    token: Option<String>,
    public_base_url: Option<String>,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        public_base_url: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            public_base_url,
            client,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn public_url(&self, key: &str) -> Option<String> {
        let base = self.public_base_url.as_deref().unwrap_or(&self.endpoint);
        Some(join_url(base, key))
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let url = join_url(&self.endpoint, key);
        let request = self
            .client
            .put(&url)
            .header("Content-Type", content_type)
            .body(bytes.to_vec());
        let resp = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("object storage", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("object storage", status, &body));
        }
        log::info!("Uploaded {} ({} bytes)", key, bytes.len());
        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let url = join_url(&self.endpoint, key);
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("object storage", e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("object storage", status, &body));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PipelineError::from_reqwest("object storage", e))?;
        Ok(Some(bytes.to_vec()))
    }
}
