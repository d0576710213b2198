//! CDN discovery and release metadata retrieval.
//!
//! The resolver never touches the filesystem. Every request carries its own
//! timeout; there is no retry here, callers re-run the pipeline instead.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tracing::{debug, info, warn};

use crate::config::{CdnCandidate, UpdaterConfig};
use crate::error::{Result, UpdateError};
use crate::fetcher::{join_url, CdnFetcher};
use crate::manifest::VersionManifest;

const LATEST_VERSION_PATH: &str = "updates/latestver";
const DATA_PATH: &str = "updates/data";

/// Finds a reachable CDN and reads release metadata from it.
#[derive(Clone)]
pub struct CdnResolver {
    fetcher: Arc<dyn CdnFetcher>,
    candidates: Vec<CdnCandidate>,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl CdnResolver {
    pub fn new(fetcher: Arc<dyn CdnFetcher>, config: &UpdaterConfig) -> Self {
        Self {
            fetcher,
            candidates: config.cdn_candidates.clone(),
            probe_timeout: config.probe_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Try each candidate in order and return the first base URL that answers.
    pub async fn resolve_base_url(&self) -> Result<Url> {
        let mut last_error = None;
        for candidate in &self.candidates {
            match self.try_candidate(candidate).await {
                Ok(url) => {
                    info!(%url, "using CDN");
                    return Ok(url);
                }
                Err(err) => {
                    warn!(?candidate, error = %err, "CDN candidate unreachable");
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(UpdateError::Network { message, source }) => UpdateError::Network {
                message: format!("no CDN endpoint responded (last: {message})"),
                source,
            },
            Some(other) => UpdateError::network(format!("no CDN endpoint responded (last: {other})")),
            None => UpdateError::network("no CDN endpoints configured"),
        })
    }

    async fn try_candidate(&self, candidate: &CdnCandidate) -> Result<Url> {
        let base = match candidate {
            CdnCandidate::Direct(raw) => parse_base(raw)?,
            CdnCandidate::Pointer(raw) => {
                let pointer = parse_base(raw)?;
                let body = self.fetcher.fetch_bytes(&pointer, self.probe_timeout).await?;
                let text = String::from_utf8_lossy(&body);
                debug!(pointer = %pointer, target = %text.trim(), "followed CDN pointer");
                parse_base(text.trim())?
            }
        };
        self.check_reachable(&base).await?;
        Ok(base)
    }

    /// A base only counts once it serves the latest-version marker.
    async fn check_reachable(&self, base: &Url) -> Result<()> {
        let url = join_url(base, LATEST_VERSION_PATH)?;
        self.fetcher.fetch_bytes(&url, self.probe_timeout).await?;
        Ok(())
    }

    /// Version identifier of the newest release.
    pub async fn fetch_latest_version(&self, base: &Url) -> Result<semver::Version> {
        let url = join_url(base, LATEST_VERSION_PATH)?;
        let body = self.fetcher.fetch_bytes(&url, self.request_timeout).await?;
        let text = std::str::from_utf8(&body)
            .map_err(|_| UpdateError::manifest("latest version is not valid UTF-8"))?;
        semver::Version::parse(text.trim())
            .map_err(|err| UpdateError::manifest(format!("invalid latest version {:?}: {err}", text.trim())))
    }

    /// Manifest of the newest release. Safe to call repeatedly.
    pub async fn fetch_manifest(&self, base: &Url) -> Result<VersionManifest> {
        let version = self.fetch_latest_version(base).await?;
        let url = join_url(base, &format!("updates/{version}/manifest.json"))?;
        let body = self.fetcher.fetch_bytes(&url, self.request_timeout).await?;
        let manifest = VersionManifest::from_slice(&body)?;
        if manifest.parsed_version()? != version {
            return Err(UpdateError::manifest(format!(
                "manifest describes {} but latest version is {version}",
                manifest.version
            )));
        }
        info!(version = %manifest.version, files = manifest.files.len(), "fetched manifest");
        Ok(manifest)
    }

    /// Payload of one release file.
    pub async fn fetch_file(&self, base: &Url, path: &str) -> Result<Vec<u8>> {
        let url = join_url(base, &format!("{DATA_PATH}/{path}"))?;
        self.fetcher.fetch_bytes(&url, self.request_timeout).await
    }
}

fn parse_base(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|err| UpdateError::network(format!("invalid CDN URL {raw:?}: {err}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned bodies keyed by URL and records every request.
    #[derive(Default)]
    pub(crate) struct MockFetcher {
        entries: HashMap<String, Vec<u8>>,
        pub(crate) requests: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        pub(crate) fn insert(&mut self, url: &str, data: impl Into<Vec<u8>>) {
            self.entries.insert(url.to_string(), data.into());
        }
    }

    #[async_trait]
    impl CdnFetcher for MockFetcher {
        async fn fetch_bytes(&self, url: &Url, _timeout: Duration) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(url.to_string());
            self.entries
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| UpdateError::network(format!("connection refused: {url}")))
        }
    }

    fn resolver(fetcher: MockFetcher, candidates: Vec<CdnCandidate>) -> CdnResolver {
        let config = UpdaterConfig {
            cdn_candidates: candidates,
            ..UpdaterConfig::default()
        };
        CdnResolver::new(Arc::new(fetcher), &config)
    }

    #[tokio::test]
    async fn first_reachable_candidate_wins() {
        let mut fetcher = MockFetcher::default();
        fetcher.insert("https://link.example/cdn", "https://b.example/ctgp7\n");
        fetcher.insert("https://b.example/ctgp7/updates/latestver", "1.0.0");

        let resolver = resolver(
            fetcher,
            vec![
                CdnCandidate::Direct("https://a.example".into()),
                CdnCandidate::Pointer("https://link.example/cdn".into()),
            ],
        );
        let base = resolver.resolve_base_url().await.unwrap();
        assert_eq!(base.as_str(), "https://b.example/ctgp7");
    }

    #[tokio::test]
    async fn pointer_to_dead_cdn_falls_through_to_next_candidate() {
        let mut fetcher = MockFetcher::default();
        fetcher.insert("https://link.example/cdn", "https://dead.example/ctgp7");
        fetcher.insert("https://mirror.example/updates/latestver", "1.0.0");

        let resolver = resolver(
            fetcher,
            vec![
                CdnCandidate::Pointer("https://link.example/cdn".into()),
                CdnCandidate::Direct("https://mirror.example".into()),
            ],
        );
        let base = resolver.resolve_base_url().await.unwrap();
        assert_eq!(base.as_str(), "https://mirror.example/");
        let latest = resolver.fetch_latest_version(&base).await.unwrap();
        assert_eq!(latest, semver::Version::new(1, 0, 0));
    }

    #[tokio::test]
    async fn no_reachable_candidate_is_a_network_error() {
        let resolver = resolver(
            MockFetcher::default(),
            vec![CdnCandidate::Direct("https://a.example".into())],
        );
        let err = resolver.resolve_base_url().await.unwrap_err();
        assert!(err.is_network_error());
    }

    #[tokio::test]
    async fn manifest_version_must_match_latest() {
        let mut fetcher = MockFetcher::default();
        fetcher.insert("https://a.example/updates/latestver", "1.2.0");
        fetcher.insert(
            "https://a.example/updates/1.2.0/manifest.json",
            r#"{"version":"1.1.0","files":[]}"#,
        );
        let resolver = resolver(fetcher, vec![]);
        let base = Url::parse("https://a.example").unwrap();
        assert!(matches!(
            resolver.fetch_manifest(&base).await,
            Err(UpdateError::Manifest(_))
        ));
    }

    #[tokio::test]
    async fn fetch_manifest_is_repeatable() {
        let mut fetcher = MockFetcher::default();
        fetcher.insert("https://a.example/updates/latestver", "1.2.0\r\n");
        fetcher.insert(
            "https://a.example/updates/1.2.0/manifest.json",
            r#"{"version":"1.2.0","files":[{"path":"old.bin","action":"remove"}]}"#,
        );
        let resolver = resolver(fetcher, vec![]);
        let base = Url::parse("https://a.example").unwrap();
        let first = resolver.fetch_manifest(&base).await.unwrap();
        let second = resolver.fetch_manifest(&base).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.version, "1.2.0");
    }
}
