//! Ordered, extensible registry of fetcher and decoder factories.
//!
//! Resolution is first-match-wins in registration order. The engine
//! appends its built-ins after user components, so a user factory that
//! accepts the same input overrides the built-in.

use std::sync::Arc;

use tracing::trace;

use crate::decode::Decoder;
use crate::fetch::Fetcher;
use crate::key::RequestContext;
use crate::request::ImageRequest;

/// Creates [`Fetcher`] instances for requests it recognizes.
///
/// The name is the component's stable identity: it drives de-duplication
/// during [`ComponentRegistry::merge`] and selection by exclusion lists.
pub trait FetcherFactory: Send + Sync {
    /// Stable identity for equality and override.
    fn name(&self) -> &'static str;

    /// Returns a fetcher if this factory handles the request, `None` to
    /// let resolution fall through to the next factory.
    fn create(&self, request: &ImageRequest, ctx: &RequestContext) -> Option<Box<dyn Fetcher>>;
}

/// Creates [`Decoder`] instances for content it recognizes.
///
/// `sniffed_mime` comes from magic-byte inspection and outranks
/// `declared_mime` (transport-supplied, untrusted).
pub trait DecoderFactory: Send + Sync {
    /// Stable identity for equality and override.
    fn name(&self) -> &'static str;

    /// Returns a decoder if this factory handles the content.
    fn create(
        &self,
        sniffed_mime: Option<&str>,
        declared_mime: Option<&str>,
        ctx: &RequestContext,
    ) -> Option<Box<dyn Decoder>>;
}

/// Ordered lists of fetcher and decoder factories.
///
/// Cheap to clone (the factories are shared).
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    fetchers: Vec<Arc<dyn FetcherFactory>>,
    decoders: Vec<Arc<dyn DecoderFactory>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("fetchers", &self.fetcher_names())
            .field("decoders", &self.decoder_names())
            .finish()
    }
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fetcher factory.
    pub fn add_fetcher(&mut self, factory: Arc<dyn FetcherFactory>) {
        self.fetchers.push(factory);
    }

    /// Appends a decoder factory.
    pub fn add_decoder(&mut self, factory: Arc<dyn DecoderFactory>) {
        self.decoders.push(factory);
    }

    /// Builder-style [`ComponentRegistry::add_fetcher`].
    #[must_use]
    pub fn with_fetcher(mut self, factory: Arc<dyn FetcherFactory>) -> Self {
        self.add_fetcher(factory);
        self
    }

    /// Builder-style [`ComponentRegistry::add_decoder`].
    #[must_use]
    pub fn with_decoder(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.add_decoder(factory);
        self
    }

    /// Combines two registries, preserving relative order (`self` first)
    /// and dropping `other`'s components whose names `self` already has.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for factory in &other.fetchers {
            if !merged.fetchers.iter().any(|f| f.name() == factory.name()) {
                merged.fetchers.push(factory.clone());
            }
        }
        for factory in &other.decoders {
            if !merged.decoders.iter().any(|d| d.name() == factory.name()) {
                merged.decoders.push(factory.clone());
            }
        }
        merged
    }

    /// Derives a registry without the named fetcher factories, so a
    /// caller can force resolution past a specific built-in.
    #[must_use]
    pub fn without_fetchers(&self, names: &[&str]) -> Self {
        let mut derived = self.clone();
        derived.fetchers.retain(|f| !names.contains(&f.name()));
        derived
    }

    /// Derives a registry without the named decoder factories.
    #[must_use]
    pub fn without_decoders(&self, names: &[&str]) -> Self {
        let mut derived = self.clone();
        derived.decoders.retain(|d| !names.contains(&d.name()));
        derived
    }

    /// Resolves the fetcher for a request: first factory in
    /// registration order that accepts it.
    #[must_use]
    pub fn resolve_fetcher(
        &self,
        request: &ImageRequest,
        ctx: &RequestContext,
    ) -> Option<Box<dyn Fetcher>> {
        for factory in &self.fetchers {
            if let Some(fetcher) = factory.create(request, ctx) {
                trace!(factory = factory.name(), uri = request.uri(), "resolved fetcher");
                return Some(fetcher);
            }
        }
        None
    }

    /// Resolves the decoder for fetched content: first factory in
    /// registration order that accepts it.
    #[must_use]
    pub fn resolve_decoder(
        &self,
        sniffed_mime: Option<&str>,
        declared_mime: Option<&str>,
        ctx: &RequestContext,
    ) -> Option<Box<dyn Decoder>> {
        for factory in &self.decoders {
            if let Some(decoder) = factory.create(sniffed_mime, declared_mime, ctx) {
                trace!(factory = factory.name(), "resolved decoder");
                return Some(decoder);
            }
        }
        None
    }

    fn fetcher_names(&self) -> Vec<&'static str> {
        self.fetchers.iter().map(|f| f.name()).collect()
    }

    fn decoder_names(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::error::LoadResult;
    use crate::fetch::{DataSource, FetchedSource, ImageOrigin};
    use crate::key::RequestKey;
    use bytes::Bytes;

    struct MarkedFetcher(&'static str);

    #[async_trait::async_trait]
    impl crate::fetch::Fetcher for MarkedFetcher {
        async fn fetch(&mut self, _cancel: &CancelToken) -> LoadResult<FetchedSource> {
            Ok(FetchedSource {
                source: DataSource::from_bytes(Bytes::from(self.0.as_bytes())),
                mime_hint: None,
                origin: ImageOrigin::Network,
            })
        }
    }

    struct MarkedFactory(&'static str);

    impl FetcherFactory for MarkedFactory {
        fn name(&self) -> &'static str {
            self.0
        }

        fn create(
            &self,
            _request: &ImageRequest,
            _ctx: &RequestContext,
        ) -> Option<Box<dyn Fetcher>> {
            Some(Box::new(MarkedFetcher(self.0)))
        }
    }

    async fn ctx() -> RequestContext {
        let request = ImageRequest::builder("u").build();
        let key = RequestKey::for_request(&request);
        RequestContext::resolve(request, key).await.unwrap()
    }

    async fn marker_of(mut fetcher: Box<dyn Fetcher>) -> String {
        let fetched = fetcher.fetch(&CancelToken::new()).await.unwrap();
        let bytes = fetched.source.into_bytes().await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_resolution_follows_registration_order() {
        let registry = ComponentRegistry::new()
            .with_fetcher(Arc::new(MarkedFactory("A")))
            .with_fetcher(Arc::new(MarkedFactory("B")));
        let ctx = ctx().await;
        let request = ImageRequest::builder("u").build();

        // Both factories match; registration order decides.
        let fetcher = registry.resolve_fetcher(&request, &ctx).unwrap();
        assert_eq!(marker_of(fetcher).await, "A");
    }

    #[tokio::test]
    async fn test_exclusion_falls_through() {
        let registry = ComponentRegistry::new()
            .with_fetcher(Arc::new(MarkedFactory("A")))
            .with_fetcher(Arc::new(MarkedFactory("B")));
        let ctx = ctx().await;
        let request = ImageRequest::builder("u").build();

        let derived = registry.without_fetchers(&["A"]);
        let fetcher = derived.resolve_fetcher(&request, &ctx).unwrap();
        assert_eq!(marker_of(fetcher).await, "B");

        // The original registry is untouched.
        let fetcher = registry.resolve_fetcher(&request, &ctx).unwrap();
        assert_eq!(marker_of(fetcher).await, "A");
    }

    #[tokio::test]
    async fn test_merge_preserves_order_and_dedups() {
        let user = ComponentRegistry::new().with_fetcher(Arc::new(MarkedFactory("A")));
        let builtin = ComponentRegistry::new()
            .with_fetcher(Arc::new(MarkedFactory("A")))
            .with_fetcher(Arc::new(MarkedFactory("B")));

        let merged = user.merge(&builtin);
        assert_eq!(merged.fetcher_names(), vec!["A", "B"]);

        let ctx = ctx().await;
        let request = ImageRequest::builder("u").build();
        let fetcher = merged.resolve_fetcher(&request, &ctx).unwrap();
        assert_eq!(marker_of(fetcher).await, "A");
    }

    #[tokio::test]
    async fn test_no_match_returns_none() {
        let registry = ComponentRegistry::new();
        let ctx = ctx().await;
        let request = ImageRequest::builder("scheme://nowhere").build();
        assert!(registry.resolve_fetcher(&request, &ctx).is_none());
        assert!(registry.resolve_decoder(None, None, &ctx).is_none());
    }
}
