//! Request identity: cache keys and the per-key execution context.

use std::fmt::Write as _;

use crate::error::LoadResult;
use crate::request::{ImageRequest, Scale, Size, TargetSize};

/// Stable cache key derived from a request's cache-relevant fields.
///
/// Two requests with equal keys are the same unit of work: they share one
/// execution, one memory-cache slot and one resolved context. Derivation
/// is a pure function of the request; fields that affect delivery but not
/// identity (transient parameters) are excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    /// Derives the key for a request.
    #[must_use]
    pub fn for_request(request: &ImageRequest) -> Self {
        let mut key = String::with_capacity(request.uri().len() + 32);
        key.push_str(request.uri());
        key.push('#');
        match request.target() {
            TargetSize::Original => key.push_str("orig"),
            TargetSize::Explicit(size) => {
                let _ = write!(key, "{size}");
            }
            TargetSize::Deferred(resolver) => match resolver.cache_key() {
                Some(fragment) => key.push_str(&fragment),
                None => key.push_str("dynamic"),
            },
        }
        let _ = write!(
            key,
            "#{}#{}",
            request.scale().key_fragment(),
            request.precision().key_fragment()
        );
        for (name, fragment) in request.parameters().cache_key_fragments() {
            let _ = write!(key, "#{name}={fragment}");
        }
        Self(key)
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolved parameters shared by every caller attached to one execution.
///
/// Created once per distinct [`RequestKey`] at the start of execution and
/// read-only afterwards. The disk key is the raw uri: disk caching is
/// keyed by source-content identity, independent of target size, so one
/// downloaded blob serves every decode variant of the same source.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request: ImageRequest,
    key: RequestKey,
    disk_key: String,
    size: Option<Size>,
}

impl RequestContext {
    /// Resolves the context for a request, running any deferred size
    /// resolver exactly once.
    ///
    /// # Errors
    /// Returns [`crate::LoadError::SizeUnresolved`] if a deferred size
    /// cannot be resolved; the failure is delivered to all waiters.
    pub async fn resolve(request: ImageRequest, key: RequestKey) -> LoadResult<Self> {
        let size = match request.target() {
            TargetSize::Original => None,
            TargetSize::Explicit(size) => Some(*size),
            TargetSize::Deferred(resolver) => Some(resolver.resolve().await?),
        };
        let disk_key = request.uri().to_string();
        Ok(Self {
            request,
            key,
            disk_key,
            size,
        })
    }

    /// The originating request snapshot.
    #[must_use]
    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// The request key this context belongs to.
    #[must_use]
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// The disk cache key (source-content identity).
    #[must_use]
    pub fn disk_key(&self) -> &str {
        &self.disk_key
    }

    /// The resolved target size; `None` means original dimensions.
    #[must_use]
    pub fn size(&self) -> Option<Size> {
        self.size
    }

    /// The scale policy resolved for this execution.
    #[must_use]
    pub fn scale(&self) -> Scale {
        self.request.scale()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::request::SizeResolver;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_key_is_deterministic() {
        let request = ImageRequest::builder("https://example.com/a.png")
            .size(100, 100)
            .parameter("rotation", "90")
            .build();
        let a = RequestKey::for_request(&request);
        let b = RequestKey::for_request(&request);
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_excludes_transient_fields() {
        let base = ImageRequest::builder("https://example.com/a.png").size(100, 100);
        let plain = base.clone().build();
        let with_transient = base.transient_parameter("listener", "0xbeef").build();
        assert_eq!(
            RequestKey::for_request(&plain),
            RequestKey::for_request(&with_transient)
        );
    }

    #[test]
    fn test_key_varies_with_size_and_scale() {
        let a = ImageRequest::builder("u").size(10, 10).build();
        let b = ImageRequest::builder("u").size(20, 20).build();
        let c = ImageRequest::builder("u")
            .size(10, 10)
            .scale(crate::request::Scale::Fill)
            .build();
        assert_ne!(RequestKey::for_request(&a), RequestKey::for_request(&b));
        assert_ne!(RequestKey::for_request(&a), RequestKey::for_request(&c));
    }

    struct CountingResolver(AtomicUsize);

    #[async_trait::async_trait]
    impl SizeResolver for CountingResolver {
        async fn resolve(&self) -> crate::error::LoadResult<Size> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Size::new(32, 32))
        }
    }

    #[tokio::test]
    async fn test_context_resolves_deferred_size_once() {
        let resolver = Arc::new(CountingResolver(AtomicUsize::new(0)));
        let request = ImageRequest::builder("u")
            .size_resolver(resolver.clone())
            .build();
        let key = RequestKey::for_request(&request);
        let ctx = RequestContext::resolve(request, key).await.unwrap();
        assert_eq!(ctx.size(), Some(Size::new(32, 32)));
        assert_eq!(resolver.0.load(Ordering::SeqCst), 1);
    }

    struct FailingResolver;

    #[async_trait::async_trait]
    impl SizeResolver for FailingResolver {
        async fn resolve(&self) -> crate::error::LoadResult<Size> {
            Err(LoadError::SizeUnresolved("target withdrawn".into()))
        }
    }

    #[tokio::test]
    async fn test_context_propagates_size_failure() {
        let request = ImageRequest::builder("u")
            .size_resolver(Arc::new(FailingResolver))
            .build();
        let key = RequestKey::for_request(&request);
        let err = RequestContext::resolve(request, key).await.unwrap_err();
        assert!(matches!(err, LoadError::SizeUnresolved(_)));
    }
}
