use crate::error::{Result, UpdateError};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

/// Abstraction over fetching content from the CDN.
#[async_trait]
pub trait CdnFetcher: Send + Sync {
    /// Fetch the body at `url`, giving up after `timeout`.
    async fn fetch_bytes(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>>;
}

/// Builder for [`HttpCdnClient`].
#[derive(Default)]
pub struct HttpCdnClientBuilder {
    user_agent: Option<String>,
}

impl HttpCdnClientBuilder {
    /// Override the user agent sent with every request.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<HttpCdnClient> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| format!("sd-updater/{}", env!("CARGO_PKG_VERSION")));
        let client = Client::builder().user_agent(user_agent).build()?;
        Ok(HttpCdnClient { client })
    }
}

/// reqwest-backed CDN fetcher.
#[derive(Clone)]
pub struct HttpCdnClient {
    client: Client,
}

impl HttpCdnClient {
    /// Create a new builder.
    pub fn builder() -> HttpCdnClientBuilder {
        HttpCdnClientBuilder::default()
    }
}

#[async_trait]
impl CdnFetcher for HttpCdnClient {
    async fn fetch_bytes(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>> {
        tracing::debug!(%url, "fetching");
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Join a `/` separated relative path onto a base URL, treating the base as a directory.
pub(crate) fn join_url(base: &Url, relative: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(relative.trim_start_matches('/'))
        .map_err(|err| UpdateError::network(format!("invalid CDN URL for {relative}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_takes_a_custom_user_agent() {
        let builder = HttpCdnClient::builder().user_agent("installer/1.0");
        assert_eq!(builder.user_agent.as_deref(), Some("installer/1.0"));
        assert!(builder.build().is_ok());
    }

    #[test]
    fn join_keeps_base_path() {
        let base = Url::parse("https://cdn.example.net/ctgp7").unwrap();
        let url = join_url(&base, "updates/latestver").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.net/ctgp7/updates/latestver");

        let base = Url::parse("https://cdn.example.net/ctgp7/").unwrap();
        let url = join_url(&base, "/updates/data/romfs/a b.bin").unwrap();
        assert_eq!(
            url.as_str(),
            "https://cdn.example.net/ctgp7/updates/data/romfs/a%20b.bin"
        );
    }
}
