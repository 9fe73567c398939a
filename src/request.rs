//! Immutable image requests and their constituent policies.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::LoadResult;

/// Per-tier cache directive, applied independently to memory and disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Reads and writes allowed.
    #[default]
    Enabled,
    /// The tier is bypassed entirely.
    Disabled,
    /// Reads allowed, writes suppressed.
    ReadOnly,
    /// Writes allowed, reads suppressed.
    WriteOnly,
}

impl CachePolicy {
    /// Returns true if reads from the tier are allowed.
    #[must_use]
    pub const fn read_enabled(self) -> bool {
        matches!(self, Self::Enabled | Self::ReadOnly)
    }

    /// Returns true if writes to the tier are allowed.
    #[must_use]
    pub const fn write_enabled(self) -> bool {
        matches!(self, Self::Enabled | Self::WriteOnly)
    }
}

/// A concrete pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Creates a size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Resolves a target size that depends on runtime container state
/// (e.g. a widget that only knows its extent after layout).
///
/// Resolution runs exactly once per request key; every caller that joins
/// the same in-flight execution shares the resolved value.
#[async_trait::async_trait]
pub trait SizeResolver: Send + Sync {
    /// Resolves the target size.
    ///
    /// # Errors
    /// Returns [`crate::LoadError::SizeUnresolved`] if the target was
    /// withdrawn before a size became available.
    async fn resolve(&self) -> LoadResult<Size>;

    /// A stable fragment mixed into key derivation, if this resolver's
    /// outcome is predictable. Resolvers without one share the generic
    /// dynamic-size key slot for their uri.
    fn cache_key(&self) -> Option<String> {
        None
    }
}

/// How the target size of a request is determined.
#[derive(Clone)]
pub enum TargetSize {
    /// Decode at the source's original dimensions.
    Original,
    /// Decode for a size known up front.
    Explicit(Size),
    /// Decode for a size resolved at execution time.
    Deferred(Arc<dyn SizeResolver>),
}

impl std::fmt::Debug for TargetSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Original => write!(f, "Original"),
            Self::Explicit(size) => write!(f, "Explicit({size})"),
            Self::Deferred(resolver) => match resolver.cache_key() {
                Some(key) => write!(f, "Deferred({key})"),
                None => write!(f, "Deferred"),
            },
        }
    }
}

/// How a decoded image is scaled into the target size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
    /// Fit inside the target, preserving aspect ratio.
    #[default]
    Fit,
    /// Fill the target, cropping overflow.
    Fill,
}

impl Scale {
    pub(crate) const fn key_fragment(self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::Fill => "fill",
        }
    }
}

/// How strictly the decoded dimensions must match the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Output dimensions may differ (e.g. never upscale).
    #[default]
    Inexact,
    /// Output dimensions must match the target exactly.
    Exact,
}

impl Precision {
    pub(crate) const fn key_fragment(self) -> &'static str {
        match self {
            Self::Inexact => "inexact",
            Self::Exact => "exact",
        }
    }
}

/// One extra request parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Opaque value, visible to fetchers/decoders/interceptors.
    pub value: String,
    /// Fragment mixed into key derivation; `None` keeps the parameter
    /// out of the request's identity.
    pub cache_key: Option<String>,
}

/// Ordered, opaque key-value bag attached to a request.
///
/// Iteration order is deterministic (sorted by name) so key derivation
/// stays a pure function of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    entries: BTreeMap<String, Parameter>,
}

impl Parameters {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter whose value also serves as its cache-key fragment.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        self.entries.insert(
            name.into(),
            Parameter {
                cache_key: Some(value.clone()),
                value,
            },
        );
    }

    /// Sets a parameter excluded from key derivation.
    pub fn set_transient(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(
            name.into(),
            Parameter {
                value: value.into(),
                cache_key: None,
            },
        );
    }

    /// Returns a parameter's value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|p| p.value.as_str())
    }

    /// Returns true if no parameters are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(name, fragment)` pairs that participate in key
    /// derivation, in sorted order.
    pub(crate) fn cache_key_fragments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter_map(|(name, p)| p.cache_key.as_deref().map(|k| (name.as_str(), k)))
    }
}

/// An immutable description of one image load.
///
/// Built through [`ImageRequest::builder`]; cloned with overrides through
/// [`ImageRequest::to_builder`].
#[derive(Debug, Clone)]
pub struct ImageRequest {
    uri: String,
    target: TargetSize,
    scale: Scale,
    precision: Precision,
    memory_cache_policy: CachePolicy,
    disk_cache_policy: CachePolicy,
    parameters: Parameters,
}

impl ImageRequest {
    /// Starts building a request for the given uri.
    #[must_use]
    pub fn builder(uri: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(uri)
    }

    /// Returns a builder seeded with this request's fields.
    #[must_use]
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            uri: self.uri.clone(),
            target: self.target.clone(),
            scale: self.scale,
            precision: self.precision,
            memory_cache_policy: self.memory_cache_policy,
            disk_cache_policy: self.disk_cache_policy,
            parameters: self.parameters.clone(),
        }
    }

    /// The source identifier.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The target size descriptor.
    #[must_use]
    pub fn target(&self) -> &TargetSize {
        &self.target
    }

    /// The scale policy.
    #[must_use]
    pub fn scale(&self) -> Scale {
        self.scale
    }

    /// The precision policy.
    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// The memory tier directive.
    #[must_use]
    pub fn memory_cache_policy(&self) -> CachePolicy {
        self.memory_cache_policy
    }

    /// The disk tier directive.
    #[must_use]
    pub fn disk_cache_policy(&self) -> CachePolicy {
        self.disk_cache_policy
    }

    /// The extra parameter bag.
    #[must_use]
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

/// Builder for [`ImageRequest`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    uri: String,
    target: TargetSize,
    scale: Scale,
    precision: Precision,
    memory_cache_policy: CachePolicy,
    disk_cache_policy: CachePolicy,
    parameters: Parameters,
}

impl RequestBuilder {
    fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            target: TargetSize::Original,
            scale: Scale::default(),
            precision: Precision::default(),
            memory_cache_policy: CachePolicy::default(),
            disk_cache_policy: CachePolicy::default(),
            parameters: Parameters::new(),
        }
    }

    /// Replaces the uri.
    #[must_use]
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Requests decoding for an explicit pixel size.
    #[must_use]
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.target = TargetSize::Explicit(Size::new(width, height));
        self
    }

    /// Sets the target size descriptor.
    #[must_use]
    pub fn target(mut self, target: TargetSize) -> Self {
        self.target = target;
        self
    }

    /// Defers size resolution to the given resolver.
    #[must_use]
    pub fn size_resolver(mut self, resolver: Arc<dyn SizeResolver>) -> Self {
        self.target = TargetSize::Deferred(resolver);
        self
    }

    /// Sets the scale policy.
    #[must_use]
    pub const fn scale(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    /// Sets the precision policy.
    #[must_use]
    pub const fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Sets the memory tier directive.
    #[must_use]
    pub const fn memory_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.memory_cache_policy = policy;
        self
    }

    /// Sets the disk tier directive.
    #[must_use]
    pub const fn disk_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.disk_cache_policy = policy;
        self
    }

    /// Sets a parameter that participates in key derivation.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.set(name, value);
        self
    }

    /// Sets a parameter excluded from key derivation.
    #[must_use]
    pub fn transient_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.parameters.set_transient(name, value);
        self
    }

    /// Finalizes the request.
    #[must_use]
    pub fn build(self) -> ImageRequest {
        ImageRequest {
            uri: self.uri,
            target: self.target,
            scale: self.scale,
            precision: self.precision,
            memory_cache_policy: self.memory_cache_policy,
            disk_cache_policy: self.disk_cache_policy,
            parameters: self.parameters,
        }
    }
}
