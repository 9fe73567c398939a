//! Chain-of-responsibility pipeline that executes one request.
//!
//! Each stage may short-circuit with a result, rewrite the effective
//! request before handing it down, or post-process the result on the way
//! back up. The engine assembles the chain as: memory-cache stage
//! (read before, write after), user request interceptors, user decode
//! interceptors (innermost, so their post-processing happens before the
//! memory write), and the terminal engine stage (fetch + decode).

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::memory::MemoryCache;
use crate::cancel::CancelToken;
use crate::decode::{DecodedImage, sniff_mime};
use crate::error::{LoadError, LoadResult};
use crate::fetch::ImageOrigin;
use crate::key::{RequestContext, RequestKey};
use crate::registry::ComponentRegistry;
use crate::request::ImageRequest;

/// A successfully loaded image and where it came from.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// The decoded image.
    pub image: DecodedImage,
    /// Which tier produced the payload.
    pub origin: ImageOrigin,
}

/// One stage of the pipeline.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync {
    /// Processes the request, either short-circuiting with a result or
    /// delegating via [`Chain::proceed`].
    async fn intercept(&self, chain: Chain<'_>) -> LoadResult<ImageResponse>;
}

/// Hands a request down the remaining stages.
///
/// Stages may substitute the effective request, but the request key and
/// context identity are fixed for the whole execution — substitutions
/// that would change the key are flagged and do not re-key the work.
pub struct Chain<'a> {
    context: &'a RequestContext,
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: ImageRequest,
    cancel: &'a CancelToken,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        context: &'a RequestContext,
        interceptors: &'a [Arc<dyn Interceptor>],
        cancel: &'a CancelToken,
    ) -> Self {
        let request = context.request().clone();
        Self {
            context,
            interceptors,
            index: 0,
            request,
            cancel,
        }
    }

    /// The effective request at this stage.
    #[must_use]
    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// The shared execution context.
    #[must_use]
    pub fn context(&self) -> &RequestContext {
        self.context
    }

    /// The execution's cancellation token.
    #[must_use]
    pub fn cancel(&self) -> &CancelToken {
        self.cancel
    }

    /// Runs the next stage with the given effective request.
    ///
    /// # Errors
    /// Whatever the downstream stages produce.
    pub async fn proceed(self, request: ImageRequest) -> LoadResult<ImageResponse> {
        self.cancel.check()?;
        if RequestKey::for_request(&request) != *self.context.key() {
            warn!(
                key = %self.context.key(),
                "interceptor substituted a request with a different key; identity kept"
            );
        }
        let Some(interceptor) = self.interceptors.get(self.index) else {
            // The engine stage terminates every assembled chain.
            return Err(LoadError::fetch("interceptor chain exhausted"));
        };
        let interceptor = interceptor.clone();
        let next = Chain {
            context: self.context,
            interceptors: self.interceptors,
            index: self.index + 1,
            request,
            cancel: self.cancel,
        };
        interceptor.intercept(next).await
    }

    pub(crate) async fn run(self) -> LoadResult<ImageResponse> {
        let request = self.request.clone();
        self.proceed(request).await
    }
}

/// Outermost stage: memory-cache read before the rest of the chain,
/// memory-cache write after it, both gated by the request's policy.
pub(crate) struct MemoryCacheStage {
    cache: Arc<MemoryCache>,
}

impl MemoryCacheStage {
    pub(crate) fn new(cache: Arc<MemoryCache>) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl Interceptor for MemoryCacheStage {
    async fn intercept(&self, chain: Chain<'_>) -> LoadResult<ImageResponse> {
        let policy = chain.request().memory_cache_policy();
        let key = chain.context().key().clone();

        if policy.read_enabled()
            && let Some(image) = self.cache.get(&key)
        {
            return Ok(ImageResponse {
                image,
                origin: ImageOrigin::MemoryCache,
            });
        }

        let request = chain.request().clone();
        let response = chain.proceed(request).await?;

        if policy.write_enabled() {
            self.cache.put(key, response.image.clone());
        }
        Ok(response)
    }
}

/// Terminal stage: resolve a fetcher, fetch, sniff, resolve a decoder,
/// decode. Fetch and decode hold permits from independent limiters.
pub(crate) struct EngineStage {
    registry: ComponentRegistry,
    fetch_permits: Arc<Semaphore>,
    decode_permits: Arc<Semaphore>,
}

impl EngineStage {
    pub(crate) fn new(
        registry: ComponentRegistry,
        fetch_permits: Arc<Semaphore>,
        decode_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            registry,
            fetch_permits,
            decode_permits,
        }
    }

    async fn acquire(
        permits: &Arc<Semaphore>,
        cancel: &CancelToken,
    ) -> LoadResult<tokio::sync::OwnedSemaphorePermit> {
        tokio::select! {
            permit = permits.clone().acquire_owned() => {
                permit.map_err(|_| LoadError::Cancelled)
            }
            () = cancel.cancelled() => Err(LoadError::Cancelled),
        }
    }
}

#[async_trait::async_trait]
impl Interceptor for EngineStage {
    async fn intercept(&self, chain: Chain<'_>) -> LoadResult<ImageResponse> {
        let ctx = chain.context();
        let cancel = chain.cancel();
        let request = chain.request();

        let mut fetcher = self
            .registry
            .resolve_fetcher(request, ctx)
            .ok_or_else(|| LoadError::NoFetcher(request.uri().to_string()))?;

        let fetched = {
            let _permit = Self::acquire(&self.fetch_permits, cancel).await?;
            fetcher.fetch(cancel).await?
        };

        let mut source = fetched.source;
        let sniffed = sniff_mime(source.sniff_header().await?);
        let declared = fetched.mime_hint.as_deref();
        let decoder = self
            .registry
            .resolve_decoder(sniffed, declared, ctx)
            .ok_or_else(|| {
                LoadError::NoDecoder(
                    sniffed
                        .or(declared)
                        .unwrap_or("unknown")
                        .to_string(),
                )
            })?;

        let image = {
            let _permit = Self::acquire(&self.decode_permits, cancel).await?;
            decoder.decode(source, ctx, cancel).await?
        };

        debug!(
            key = %ctx.key(),
            origin = %fetched.origin,
            size = image.size_bytes(),
            "request decoded"
        );
        Ok(ImageResponse {
            image,
            origin: fetched.origin,
        })
    }
}
