//! Interfaces to the services around the supervisor: name classification,
//! media-library refresh and discovery-link scraping.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LibraryConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Movie,
    Series,
    #[default]
    Other,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Movie => "movie",
            ContentKind::Series => "series",
            ContentKind::Other => "other",
        }
    }
}

/// What a name classifier made of a content name. Stored with the record but
/// otherwise opaque to the supervisor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ContentKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
}

pub trait NameClassifier: Send + Sync {
    fn classify(&self, name: &str) -> Classification;
}

/// Treats every name as an unclassified item titled after itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughClassifier;

impl NameClassifier for PassthroughClassifier {
    fn classify(&self, name: &str) -> Classification {
        Classification {
            kind: ContentKind::Other,
            title: name.trim().to_string(),
            season: None,
            episode: None,
        }
    }
}

#[async_trait]
pub trait LibraryNotifier: Send + Sync {
    async fn notify_library_update(&self, kind: ContentKind) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLibraryNotifier;

#[async_trait]
impl LibraryNotifier for NoopLibraryNotifier {
    async fn notify_library_update(&self, kind: ContentKind) -> Result<()> {
        debug!(kind = kind.as_str(), "library refresh not configured");
        Ok(())
    }
}

/// POSTs to a refresh agent, authenticated with an `X-Auth-Token` header.
pub struct HttpLibraryNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpLibraryNotifier {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building library notifier client")?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl LibraryNotifier for HttpLibraryNotifier {
    async fn notify_library_update(&self, kind: ContentKind) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(serde_json::json!({ "kind": kind.as_str() }).to_string());
        if let Some(token) = &self.token {
            req = req.header("X-Auth-Token", token);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("library refresh returned {status}");
        }
        Ok(())
    }
}

#[async_trait]
pub trait DiscoveryLinkExtractor: Send + Sync {
    /// Candidate peer-discovery URIs found on `page_url`.
    async fn extract(&self, page_url: &str) -> Result<Vec<String>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoDiscovery;

#[async_trait]
impl DiscoveryLinkExtractor for NoDiscovery {
    async fn extract(&self, page_url: &str) -> Result<Vec<String>> {
        anyhow::bail!("no link extractor configured for {page_url}")
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn NameClassifier>,
    pub notifier: Arc<dyn LibraryNotifier>,
    pub extractor: Arc<dyn DiscoveryLinkExtractor>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            classifier: Arc::new(PassthroughClassifier),
            notifier: Arc::new(NoopLibraryNotifier),
            extractor: Arc::new(NoDiscovery),
        }
    }
}

impl Collaborators {
    /// Defaults, with the HTTP library notifier when a refresh URL is configured.
    pub fn from_config(library: &LibraryConfig) -> Self {
        let mut collab = Self::default();
        if let Some(url) = library.refresh_url.as_deref().filter(|u| !u.is_empty()) {
            match HttpLibraryNotifier::new(url, library.auth_token.clone()) {
                Ok(notifier) => collab.notifier = Arc::new(notifier),
                Err(err) => warn!(error = %err, "library notifier disabled"),
            }
        }
        collab
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_keeps_the_name() {
        let c = PassthroughClassifier.classify("  Some Film 2019 ");
        assert_eq!(c.kind, ContentKind::Other);
        assert_eq!(c.title, "Some Film 2019");
        assert_eq!(c.season, None);
    }

    #[test]
    fn classification_omits_empty_episode_fields() {
        let json = serde_json::to_value(Classification {
            kind: ContentKind::Series,
            title: "Show".into(),
            season: Some(2),
            episode: None,
        })
        .expect("json");
        assert_eq!(json, serde_json::json!({"kind": "series", "title": "Show", "season": 2}));
    }

    #[tokio::test]
    async fn noop_notifier_always_succeeds() {
        NoopLibraryNotifier
            .notify_library_update(ContentKind::Movie)
            .await
            .expect("noop");
    }
}
