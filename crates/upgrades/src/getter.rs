//! Retrieval of index documents, selected by URL scheme.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use url::Url;

/// Fetches the raw bytes behind a URL.
#[async_trait::async_trait]
pub trait IndexGetter: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Vec<u8>>;
}

/// Getter registry keyed by URL scheme.
#[derive(Clone)]
pub struct IndexGetters {
    providers: Vec<(Vec<String>, Arc<dyn IndexGetter>)>,
}

impl IndexGetters {
    pub fn empty() -> Self { Self { providers: Vec::new() } }

    /// Register `getter` for each of `schemes`; later registrations win.
    pub fn with(mut self, schemes: &[&str], getter: Arc<dyn IndexGetter>) -> Self {
        self.providers.insert(0, (schemes.iter().map(|s| s.to_ascii_lowercase()).collect(), getter));
        self
    }

    pub fn by_scheme(&self, scheme: &str) -> Option<Arc<dyn IndexGetter>> {
        let scheme = scheme.to_ascii_lowercase();
        self.providers
            .iter()
            .find(|(schemes, _)| schemes.iter().any(|s| *s == scheme))
            .map(|(_, g)| Arc::clone(g))
    }
}

impl Default for IndexGetters {
    /// `http` and `https` served by [`HttpGetter`].
    fn default() -> Self {
        Self::empty().with(&["http", "https"], Arc::new(HttpGetter::new()))
    }
}

#[derive(Clone, Debug)]
pub struct HttpGetterOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for HttpGetterOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl HttpGetterOptions {
    /// Defaults overridden by `STAGEHAND_HTTP_CONNECT_TIMEOUT_SECS`,
    /// `STAGEHAND_HTTP_TIMEOUT_SECS` and `STAGEHAND_MAX_INDEX_BYTES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs);
        Self {
            connect_timeout: secs("STAGEHAND_HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(d.connect_timeout),
            request_timeout: secs("STAGEHAND_HTTP_TIMEOUT_SECS").unwrap_or(d.request_timeout),
            max_body_bytes: std::env::var("STAGEHAND_MAX_INDEX_BYTES")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(d.max_body_bytes),
        }
    }
}

/// Plain HTTP(S) GET with a body size cap; non-2xx responses are errors.
#[derive(Clone, Debug)]
pub struct HttpGetter {
    client: Arc<OnceLock<reqwest::Client>>,
    options: HttpGetterOptions,
}

impl HttpGetter {
    pub fn new() -> Self { Self::with_options(HttpGetterOptions::from_env()) }

    pub fn with_options(options: HttpGetterOptions) -> Self {
        Self { client: Arc::new(OnceLock::new()), options }
    }

    fn client(&self) -> Result<&reqwest::Client> {
        if let Some(c) = self.client.get() {
            return Ok(c);
        }
        let built = reqwest::Client::builder()
            .connect_timeout(self.options.connect_timeout)
            .timeout(self.options.request_timeout)
            .build()
            .context("building http client")?;
        Ok(self.client.get_or_init(|| built))
    }
}

impl Default for HttpGetter {
    fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl IndexGetter for HttpGetter {
    async fn get(&self, url: &Url) -> Result<Vec<u8>> {
        let res = self
            .client()?
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("requesting {}", url))?
            .error_for_status()?;

        let max = self.options.max_body_bytes;
        if let Some(len) = res.content_length() {
            if len > max as u64 {
                return Err(anyhow!("response from {} is {} bytes; limit is {}", url, len, max));
            }
        }
        let mut body = Vec::new();
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("reading response from {}", url))?;
            if body.len() + chunk.len() > max {
                return Err(anyhow!("response from {} exceeds {} bytes", url, max));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}
