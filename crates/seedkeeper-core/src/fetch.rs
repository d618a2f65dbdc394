//! Download of descriptor files linked by URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs as afs;
use tracing::{debug, info};
use url::Url;

use seedkeeper_engine::Metainfo;

use crate::config::FetchConfig;
use crate::placement::sanitize_component;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("not a descriptor link (expected http(s)://…/*.torrent): {0}")]
    UnsupportedUrl(String),
    #[error("request failed: {0}")]
    Http(String),
    #[error("server answered {0}")]
    Status(u16),
    #[error("descriptor larger than {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("downloaded file is not a descriptor: {0}")]
    Invalid(String),
    #[error("spooling descriptor: {0}")]
    Io(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct FetchedDescriptor {
    pub bytes: Vec<u8>,
    /// Copy kept on disk until the transfer reaches a terminal state.
    pub spooled: PathBuf,
    pub digest: String,
}

pub struct DescriptorFetcher {
    client: reqwest::Client,
    max_bytes: u64,
    spool_dir: PathBuf,
}

/// True for `http(s)` URLs whose path ends in `.torrent`.
pub fn is_descriptor_url(candidate: &str) -> bool {
    parse_descriptor_url(candidate).is_ok()
}

fn parse_descriptor_url(candidate: &str) -> Result<Url, FetchError> {
    let unsupported = || FetchError::UnsupportedUrl(candidate.to_string());
    let url = Url::parse(candidate.trim()).map_err(|_| unsupported())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(unsupported());
    }
    if !url.path().to_ascii_lowercase().ends_with(".torrent") {
        return Err(unsupported());
    }
    Ok(url)
}

impl DescriptorFetcher {
    pub fn new(config: &FetchConfig, spool_dir: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            max_bytes: config.max_descriptor_bytes,
            spool_dir: spool_dir.into(),
        })
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Download the descriptor at `candidate` and spool it for `owner`, the
    /// session that will hold it until its transfer ends.
    pub async fn fetch(&self, candidate: &str, owner: &str) -> Result<FetchedDescriptor, FetchError> {
        let url = parse_descriptor_url(candidate)?;
        debug!(%url, "fetching descriptor");
        let mut resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        if resp.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(FetchError::TooLarge {
                limit: self.max_bytes,
            });
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if (bytes.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        let fetched = self.spool(owner, bytes).await?;
        info!(%url, digest = %fetched.digest, "descriptor fetched");
        Ok(fetched)
    }

    /// Check `bytes` parse as a descriptor and keep a copy named by owner and
    /// digest, so sessions fetching the same link never share a file.
    pub async fn spool(&self, owner: &str, bytes: Vec<u8>) -> Result<FetchedDescriptor, FetchError> {
        let meta = Metainfo::from_bytes(&bytes).map_err(|e| FetchError::Invalid(e.to_string()))?;
        afs::create_dir_all(&self.spool_dir)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        let spooled = self.spool_dir.join(format!(
            "{}-{}.torrent",
            sanitize_component(owner),
            meta.info_hash
        ));
        afs::write(&spooled, &bytes)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        Ok(FetchedDescriptor {
            bytes,
            spooled,
            digest: meta.info_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedkeeper_engine::metainfo::encode_descriptor;

    #[test]
    fn only_http_descriptor_links_are_accepted() {
        assert!(is_descriptor_url("https://example.org/files/film.torrent"));
        assert!(is_descriptor_url("http://example.org/a.TORRENT?x=1"));
        assert!(!is_descriptor_url("https://example.org/film.html"));
        assert!(!is_descriptor_url("ftp://example.org/a.torrent"));
        assert!(!is_descriptor_url("magnet:?xt=urn:btih:abc"));
        assert!(!is_descriptor_url("film.torrent"));
    }

    #[tokio::test]
    async fn unsupported_url_fails_before_any_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = DescriptorFetcher::new(&FetchConfig::default(), dir.path()).expect("client");
        let err = fetcher
            .fetch("https://example.org/page", "chat-1")
            .await
            .expect_err("rejected");
        assert!(matches!(err, FetchError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn spool_names_file_by_owner_and_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = dir.path().join("spool");
        let fetcher = DescriptorFetcher::new(&FetchConfig::default(), &spool).expect("client");
        let bytes = encode_descriptor("a.mkv", &[("a.mkv", 10)], 16384);
        let first = fetcher.spool("chat-1", bytes.clone()).await.expect("spool");
        assert_eq!(first.spooled, spool.join(format!("chat-1-{}.torrent", first.digest)));
        assert_eq!(std::fs::read(&first.spooled).expect("read"), bytes);

        let second = fetcher.spool("chat/2", bytes.clone()).await.expect("spool");
        assert_eq!(second.digest, first.digest);
        assert_eq!(second.spooled, spool.join(format!("chat 2-{}.torrent", second.digest)));
        assert!(first.spooled.exists());

        let err = fetcher
            .spool("chat-1", b"not bencode".to_vec())
            .await
            .expect_err("invalid");
        assert!(matches!(err, FetchError::Invalid(_)));
    }
}
