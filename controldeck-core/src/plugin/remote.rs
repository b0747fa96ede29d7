//! Remote module repositories.
//!
//! A repository is a base URL serving `index.json`:
//!
//! ```json
//! {"modules": [{"file": "docker.toml"}, {"file": "vpn.toml", "url": "https://cdn.example.org/vpn.toml"}]}
//! ```
//!
//! Entries without a `url` are fetched from `<base>/<file>`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryIndex {
    #[serde(default)]
    pub modules: Vec<RepositoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub file: String,
    pub url: Option<String>,
}

impl RepositoryEntry {
    pub fn resolve_url(&self, base: &str) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => join_url(base, &self.file),
        }
    }

    /// File stem used as the module id when the source declares none.
    pub fn stem(&self) -> &str {
        let file = self.file.rsplit('/').next().unwrap_or(&self.file);
        file.strip_suffix(".toml").unwrap_or(file)
    }
}

pub fn join_url(base: &str, file: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file.trim_start_matches('/'))
}

/// Fetches text documents over the network.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

/// `reqwest` client with a per-request deadline.
pub struct HttpRepositoryClient {
    client: reqwest::Client,
}

impl HttpRepositoryClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("controldeck/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RepositoryClient for HttpRepositoryClient {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        debug!(url = %url, "Fetching remote module document");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{url} returned HTTP {status}");
        }

        response
            .text()
            .await
            .with_context(|| format!("failed to read body of {url}"))
    }
}

/// Downloads a repository index.
pub async fn fetch_index(client: &dyn RepositoryClient, base: &str) -> Result<RepositoryIndex> {
    let url = join_url(base, INDEX_FILE);
    let body = client.fetch_text(&url).await?;
    serde_json::from_str(&body).with_context(|| format!("invalid repository index at {url}"))
}
