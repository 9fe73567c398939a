//! Pictor - An asynchronous image loading engine.
//!
//! This crate fetches, decodes, and caches images behind a single
//! [`ImageEngine`] entry point: requests are normalized into stable
//! cache keys, concurrent loads of the same key coalesce, and results
//! flow through a byte-bounded memory cache and a crash-safe journaled
//! disk cache. Fetchers, decoders, and interceptors are pluggable.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Memory and disk cache tiers.
pub mod cache;
/// Cooperative cancellation tokens.
pub mod cancel;
/// Decoder protocol and the built-in raster decoder.
pub mod decode;
/// Engine assembly, execution, and de-duplication.
pub mod engine;
/// Error taxonomy for loads and cache operations.
pub mod error;
/// Fetcher protocol and the built-in http and file fetchers.
pub mod fetch;
/// Chain-of-responsibility request pipeline.
pub mod intercept;
/// Request keys and per-execution context.
pub mod key;
/// Fetcher and decoder component registry.
pub mod registry;
/// Request model: uris, target sizes, policies, parameters.
pub mod request;

pub use cache::{CacheStats, DiskCache, MemoryCache};
pub use cancel::CancelToken;
pub use decode::{DecodedImage, Decoder, ImageInfo};
pub use engine::{EngineBuilder, EngineConfig, ImageEngine, RequestHandle};
pub use error::{CacheError, CacheResult, LoadError, LoadResult};
pub use fetch::{DataSource, FetchedSource, Fetcher, ImageOrigin};
pub use intercept::{Chain, ImageResponse, Interceptor};
pub use key::{RequestContext, RequestKey};
pub use registry::{ComponentRegistry, DecoderFactory, FetcherFactory};
pub use request::{
    CachePolicy, ImageRequest, Parameters, Precision, RequestBuilder, Scale, Size, SizeResolver,
    TargetSize,
};

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
