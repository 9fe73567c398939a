//! Local-file fetcher.

use std::path::PathBuf;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{LoadError, LoadResult};
use crate::key::RequestContext;
use crate::registry::FetcherFactory;
use crate::request::ImageRequest;

use super::{DataSource, FetchedSource, Fetcher, ImageOrigin};

/// Fetches `file://` uris and bare absolute paths.
#[derive(Debug)]
pub struct FileFetcher {
    path: PathBuf,
}

#[async_trait::async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&mut self, cancel: &CancelToken) -> LoadResult<FetchedSource> {
        cancel.check()?;
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(LoadError::fetch(format!(
                "no such file: {}",
                self.path.display()
            )));
        }
        debug!(path = %self.path.display(), "serving fetch from local file");
        Ok(FetchedSource {
            source: DataSource::from_file(self.path.clone()),
            mime_hint: mime_from_extension(&self.path).map(str::to_string),
            origin: ImageOrigin::File,
        })
    }
}

fn mime_from_extension(path: &std::path::Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

/// Factory for [`FileFetcher`].
#[derive(Debug, Default)]
pub struct FileFetcherFactory;

impl FetcherFactory for FileFetcherFactory {
    fn name(&self) -> &'static str {
        "pictor.fetcher.file"
    }

    fn create(&self, request: &ImageRequest, _ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
        let uri = request.uri();
        let path = if let Some(stripped) = uri.strip_prefix("file://") {
            PathBuf::from(stripped)
        } else if uri.starts_with('/') {
            PathBuf::from(uri)
        } else {
            return None;
        };
        Some(Box::new(FileFetcher { path }))
    }
}
