//! HTTP fetcher with disk cache read/write-through.

use tracing::{debug, warn};

use crate::cache::disk::DiskCache;
use crate::cancel::CancelToken;
use crate::error::{LoadError, LoadResult};
use crate::key::RequestContext;
use crate::registry::FetcherFactory;
use crate::request::{CachePolicy, ImageRequest};

use super::{DataSource, FetchedSource, Fetcher, ImageOrigin};

/// Fetches `http(s)` uris, serving from and writing through the disk
/// cache as the request's disk policy allows.
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    disk_key: String,
    policy: CachePolicy,
    disk_cache: Option<DiskCache>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("url", &self.url)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&mut self, cancel: &CancelToken) -> LoadResult<FetchedSource> {
        let Some(disk_cache) = self.disk_cache.clone() else {
            let (bytes, mime_hint) = self.download(cancel).await?;
            return Ok(FetchedSource {
                source: DataSource::from_bytes(bytes),
                mime_hint,
                origin: ImageOrigin::Network,
            });
        };

        // Serialize check-snapshot-else-download per disk key so two
        // distinct request keys for one source do not both download.
        let lock = disk_cache.key_lock(&self.disk_key);
        let _guard = lock.lock().await;

        if self.policy.read_enabled()
            && let Some(snapshot) = disk_cache.open_snapshot(&self.disk_key)
        {
            debug!(url = %self.url, "serving fetch from disk cache");
            return Ok(FetchedSource {
                source: DataSource::from_snapshot(snapshot),
                mime_hint: None,
                origin: ImageOrigin::DiskCache,
            });
        }

        let (bytes, mime_hint) = self.download(cancel).await?;

        if self.policy.write_enabled() {
            // Disk persistence is best-effort: a failed write degrades
            // to "no cache", the fetched bytes still serve the request.
            match disk_cache.edit(&self.disk_key) {
                Some(mut editor) => {
                    let write = async {
                        editor.write_all(&bytes).await?;
                        editor.commit().await
                    };
                    if let Err(e) = write.await {
                        warn!(url = %self.url, error = %e, "disk cache write failed");
                    }
                }
                None => {
                    warn!(url = %self.url, "disk cache edit busy, skipping write");
                }
            }
        }

        Ok(FetchedSource {
            source: DataSource::from_bytes(bytes),
            mime_hint,
            origin: ImageOrigin::Network,
        })
    }
}

impl HttpFetcher {
    async fn download(
        &self,
        cancel: &CancelToken,
    ) -> LoadResult<(bytes::Bytes, Option<String>)> {
        debug!(url = %self.url, "downloading image");
        let send = self.client.get(&self.url).send();
        let response = tokio::select! {
            response = send => {
                response.map_err(|e| LoadError::fetch(format!("request failed: {e}")))?
            }
            () = cancel.cancelled() => return Err(LoadError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(LoadError::fetch(format!(
                "HTTP {}: {}",
                response.status(),
                response.status().canonical_reason().unwrap_or("unknown")
            )));
        }

        let mime_hint = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let body = response.bytes();
        let bytes = tokio::select! {
            bytes = body => {
                bytes.map_err(|e| LoadError::fetch(format!("read body: {e}")))?
            }
            () = cancel.cancelled() => return Err(LoadError::Cancelled),
        };

        Ok((bytes, mime_hint))
    }
}

/// Factory for [`HttpFetcher`]; accepts `http://` and `https://` uris.
pub struct HttpFetcherFactory {
    client: reqwest::Client,
    disk_cache: Option<DiskCache>,
}

impl std::fmt::Debug for HttpFetcherFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcherFactory").finish_non_exhaustive()
    }
}

impl HttpFetcherFactory {
    /// Creates the factory with a shared client and optional disk cache.
    #[must_use]
    pub fn new(client: reqwest::Client, disk_cache: Option<DiskCache>) -> Self {
        Self { client, disk_cache }
    }
}

impl FetcherFactory for HttpFetcherFactory {
    fn name(&self) -> &'static str {
        "pictor.fetcher.http"
    }

    fn create(&self, request: &ImageRequest, ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
        let uri = request.uri();
        if !uri.starts_with("http://") && !uri.starts_with("https://") {
            return None;
        }
        Some(Box::new(HttpFetcher {
            client: self.client.clone(),
            url: uri.to_string(),
            disk_key: ctx.disk_key().to_string(),
            policy: request.disk_cache_policy(),
            disk_cache: self.disk_cache.clone(),
        }))
    }
}
