//! Built-in decoder backed by the `image` crate.

use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::{LoadError, LoadResult};
use crate::fetch::DataSource;
use crate::key::RequestContext;
use crate::registry::DecoderFactory;
use crate::request::{Precision, Scale, Size};

use super::{DecodedImage, Decoder};

/// Decodes the common raster formats and downscales to the resolved
/// target size.
#[derive(Debug, Default)]
pub struct StandardDecoder {
    mime: Option<String>,
}

impl StandardDecoder {
    /// Creates a decoder that reports the given mime type on its output.
    #[must_use]
    pub fn new(mime: Option<String>) -> Self {
        Self { mime }
    }
}

#[async_trait::async_trait]
impl Decoder for StandardDecoder {
    async fn decode(
        self: Box<Self>,
        source: DataSource,
        ctx: &RequestContext,
        cancel: &CancelToken,
    ) -> LoadResult<DecodedImage> {
        cancel.check()?;
        let bytes = source.into_bytes().await?;
        let target = ctx.size();
        let scale = ctx.scale();
        let precision = ctx.request().precision();
        let cancel = cancel.clone();

        // Decoding is CPU-bound; keep it off the async workers.
        let pixels = tokio::task::spawn_blocking(move || -> LoadResult<image::DynamicImage> {
            cancel.check()?;
            let decoded = image::load_from_memory(&bytes)
                .map_err(|e| LoadError::decode(e.to_string()))?;
            cancel.check()?;
            Ok(scale_to_target(decoded, target, scale, precision))
        })
        .await
        .map_err(|e| LoadError::decode(format!("decode task panicked: {e}")))??;

        trace!(
            width = pixels.width(),
            height = pixels.height(),
            "decoded image"
        );
        Ok(DecodedImage::new(pixels, self.mime))
    }
}

fn scale_to_target(
    decoded: image::DynamicImage,
    target: Option<Size>,
    scale: Scale,
    precision: Precision,
) -> image::DynamicImage {
    let Some(target) = target else {
        return decoded;
    };
    let within_target = decoded.width() <= target.width && decoded.height() <= target.height;
    if precision == Precision::Inexact && within_target {
        // Never upscale for inexact targets.
        return decoded;
    }
    let filter = image::imageops::FilterType::Lanczos3;
    match (scale, precision) {
        (Scale::Fit, Precision::Inexact) => decoded.resize(target.width, target.height, filter),
        (Scale::Fit, Precision::Exact) => {
            decoded.resize_exact(target.width, target.height, filter)
        }
        (Scale::Fill, _) => decoded.resize_to_fill(target.width, target.height, filter),
    }
}

/// Factory for [`StandardDecoder`]; accepts any content whose magic
/// bytes one of the enabled raster formats recognizes.
#[derive(Debug, Default)]
pub struct StandardDecoderFactory;

impl DecoderFactory for StandardDecoderFactory {
    fn name(&self) -> &'static str {
        "pictor.decoder.standard"
    }

    fn create(
        &self,
        sniffed_mime: Option<&str>,
        declared_mime: Option<&str>,
        _ctx: &RequestContext,
    ) -> Option<Box<dyn Decoder>> {
        // Sniffed type wins; the declared one is only a fallback signal.
        let mime = sniffed_mime.or(declared_mime)?;
        if !mime.starts_with("image/") {
            return None;
        }
        Some(Box::new(StandardDecoder::new(Some(mime.to_string()))))
    }
}
