//! Fetcher protocol: turning a request into raw encoded bytes.

pub mod file;
pub mod http;

use std::path::PathBuf;

use bytes::Bytes;

use crate::cancel::CancelToken;
use crate::error::{LoadError, LoadResult};

pub use file::{FileFetcher, FileFetcherFactory};
pub use http::{HttpFetcher, HttpFetcherFactory};

use crate::cache::disk::Snapshot;

/// Where a response's payload ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    /// Served from the in-memory cache.
    MemoryCache,
    /// Decoded from a disk cache snapshot.
    DiskCache,
    /// Downloaded from the network.
    Network,
    /// Read from a local file outside the cache.
    File,
}

impl std::fmt::Display for ImageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
            Self::File => write!(f, "file"),
        }
    }
}

/// Opaque handle to raw encoded bytes produced by a fetcher.
///
/// Created per fetch and consumed exactly once by a decoder via
/// [`DataSource::into_bytes`]. [`DataSource::sniff_header`] may load the
/// payload early without consuming the handle.
#[derive(Debug)]
pub struct DataSource {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Bytes(Bytes),
    File(PathBuf),
    Snapshot(Snapshot),
}

impl DataSource {
    /// Wraps an in-memory buffer.
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            inner: Inner::Bytes(bytes),
        }
    }

    /// Wraps a file on disk.
    #[must_use]
    pub fn from_file(path: PathBuf) -> Self {
        Self {
            inner: Inner::File(path),
        }
    }

    /// Wraps a committed disk-cache snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: Inner::Snapshot(snapshot),
        }
    }

    /// Loads the payload (if not already in memory) and returns a view of
    /// its leading bytes for content sniffing.
    ///
    /// # Errors
    /// [`LoadError::Fetch`] if the backing file cannot be read.
    pub async fn sniff_header(&mut self) -> LoadResult<&[u8]> {
        let bytes = self.load().await?;
        let end = bytes.len().min(64);
        Ok(&bytes[..end])
    }

    /// Consumes the source, yielding the full payload.
    ///
    /// # Errors
    /// [`LoadError::Fetch`] if the backing file cannot be read.
    pub async fn into_bytes(mut self) -> LoadResult<Bytes> {
        self.load().await?;
        match self.inner {
            Inner::Bytes(bytes) => Ok(bytes),
            // load() replaced the other variants.
            Inner::File(_) | Inner::Snapshot(_) => unreachable!("payload was just loaded"),
        }
    }

    async fn load(&mut self) -> LoadResult<&Bytes> {
        match &mut self.inner {
            Inner::Bytes(_) => {}
            Inner::File(path) => {
                let data = tokio::fs::read(&*path)
                    .await
                    .map_err(|e| LoadError::fetch(format!("read {}: {e}", path.display())))?;
                self.inner = Inner::Bytes(Bytes::from(data));
            }
            Inner::Snapshot(snapshot) => {
                let data = snapshot
                    .read()
                    .await
                    .map_err(|e| LoadError::fetch(format!("read cache snapshot: {e}")))?;
                self.inner = Inner::Bytes(data);
            }
        }
        match &self.inner {
            Inner::Bytes(bytes) => Ok(bytes),
            Inner::File(_) | Inner::Snapshot(_) => unreachable!("payload was just loaded"),
        }
    }
}

/// A fetched payload plus what the transport claimed it was.
#[derive(Debug)]
pub struct FetchedSource {
    /// The payload handle, consumed once by a decoder.
    pub source: DataSource,
    /// Declared mime type, if the transport supplied one. Untrusted;
    /// magic-byte sniffing outranks it during decoder resolution.
    pub mime_hint: Option<String>,
    /// Provenance for response reporting.
    pub origin: ImageOrigin,
}

/// Pluggable strategy turning a request into a [`FetchedSource`].
///
/// Instances are created per execution by a
/// [`crate::registry::FetcherFactory`]. Side effects are bounded to
/// network/filesystem I/O; a fetcher that itself uses the disk cache must
/// honor the request's disk policy.
#[async_trait::async_trait]
pub trait Fetcher: Send {
    /// Fetches the payload.
    ///
    /// # Errors
    /// [`LoadError::Fetch`] on I/O failure, [`LoadError::Cancelled`] if
    /// the token fired mid-transfer.
    async fn fetch(&mut self, cancel: &CancelToken) -> LoadResult<FetchedSource>;
}
