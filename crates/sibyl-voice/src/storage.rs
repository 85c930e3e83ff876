//! Capture archival: the object-store boundary plus a local directory store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file under `key`.
    async fn put_file(&self, path: &Path, key: &str) -> anyhow::Result<()>;
    /// Whether `key` exists with non-zero content.
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    /// Public URL for a stored key, when the store exposes one.
    fn public_url(&self, key: &str) -> Option<String>;
}

/// Object store speaking plain HTTP: PUT to upload, HEAD to probe.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    public_base: Option<String>,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            public_base: None,
            token: None,
        }
    }

    pub fn with_public_url(mut self, public_base: impl Into<String>) -> Self {
        self.public_base = Some(public_base.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_file(&self, path: &Path, key: &str) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let mut req = self.client.put(self.object_url(key)).body(bytes);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("upload of '{key}' failed: {}", resp.status());
        }

        // verify the write actually landed
        if !self.exists(key).await? {
            anyhow::bail!("no data transferred for key '{key}'");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut req = self.client.head(self.object_url(key));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            anyhow::bail!("existence probe for '{key}' failed: {}", resp.status());
        }
        // a zero-length object counts as missing
        Ok(resp.content_length().is_none_or(|len| len > 0))
    }

    fn public_url(&self, key: &str) -> Option<String> {
        self.public_base
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), key))
    }
}

/// Archive store that copies captures into a directory tree.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn put_file(&self, path: &Path, key: &str) -> anyhow::Result<()> {
        let dest = self.root.join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &dest).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(tokio::fs::metadata(self.root.join(key))
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false))
    }

    fn public_url(&self, _key: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dir_store_put_and_exists() {
        let src_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();

        let src = src_dir.path().join("clip.wav");
        tokio::fs::write(&src, b"RIFFdata").await.unwrap();

        let store = DirStore::new(store_dir.path());
        assert!(!store.exists("user-audio/alice/clip.wav").await.unwrap());

        store.put_file(&src, "user-audio/alice/clip.wav").await.unwrap();
        assert!(store.exists("user-audio/alice/clip.wav").await.unwrap());
        assert!(store.public_url("user-audio/alice/clip.wav").is_none());
    }

    #[test]
    fn test_http_store_url_join() {
        let store = HttpObjectStore::new("https://objects.example.com/bucket/")
            .with_public_url("https://cdn.example.com");

        assert_eq!(
            store.object_url("user-audio/a/b.wav"),
            "https://objects.example.com/bucket/user-audio/a/b.wav"
        );
        assert_eq!(
            store.public_url("user-audio/a/b.wav").unwrap(),
            "https://cdn.example.com/user-audio/a/b.wav"
        );
    }
}
