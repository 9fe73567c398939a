//! Decoder protocol: turning fetched bytes into decoded images.

pub mod standard;

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::LoadResult;
use crate::fetch::DataSource;
use crate::key::RequestContext;

pub use standard::{StandardDecoder, StandardDecoderFactory};

/// Dimensions and declared type of a decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Decoded width in pixels.
    pub width: u32,
    /// Decoded height in pixels.
    pub height: u32,
    /// Mime type the content was decoded as, when known.
    pub mime: Option<String>,
}

/// A decoded image with byte-size accounting.
///
/// The pixel payload is shared read-only: the memory cache and every
/// caller hold the same `Arc`. `size_bytes` reports the actual pixel
/// buffer footprint, which the memory cache budget accounting relies on.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: Arc<image::DynamicImage>,
    size_bytes: u64,
    info: ImageInfo,
}

impl DecodedImage {
    /// Wraps a decoded pixel buffer.
    #[must_use]
    pub fn new(pixels: image::DynamicImage, mime: Option<String>) -> Self {
        let size_bytes = pixels.as_bytes().len() as u64;
        let info = ImageInfo {
            width: pixels.width(),
            height: pixels.height(),
            mime,
        };
        Self {
            pixels: Arc::new(pixels),
            size_bytes,
            info,
        }
    }

    /// The shared pixel payload.
    #[must_use]
    pub fn pixels(&self) -> &Arc<image::DynamicImage> {
        &self.pixels
    }

    /// Actual memory footprint of the pixel buffer.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Dimensions and declared type.
    #[must_use]
    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    /// Decoded width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.info.width
    }

    /// Decoded height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.info.height
    }
}

/// Pluggable strategy turning one [`DataSource`] into a [`DecodedImage`].
///
/// Instances are created per fetch by a
/// [`crate::registry::DecoderFactory`] and consume their source once.
#[async_trait::async_trait]
pub trait Decoder: Send {
    /// Decodes the source against the context's resolved target size.
    ///
    /// # Errors
    /// [`crate::LoadError::Decode`] on corrupt or unsupported payloads;
    /// [`crate::LoadError::Cancelled`] if the token fired.
    async fn decode(
        self: Box<Self>,
        source: DataSource,
        ctx: &RequestContext,
        cancel: &CancelToken,
    ) -> LoadResult<DecodedImage>;
}

/// Sniffs a mime type from leading magic bytes.
///
/// Sniffing outranks any declared mime hint during decoder resolution:
/// content types from untrusted sources are unreliable, the bytes are
/// not.
#[must_use]
pub fn sniff_mime(header: &[u8]) -> Option<&'static str> {
    let format = image::guess_format(header).ok()?;
    match format {
        image::ImageFormat::Png => Some("image/png"),
        image::ImageFormat::Jpeg => Some("image/jpeg"),
        image::ImageFormat::Gif => Some("image/gif"),
        image::ImageFormat::WebP => Some("image/webp"),
        image::ImageFormat::Bmp => Some("image/bmp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_png_magic() {
        let header = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];
        assert_eq!(sniff_mime(&header), Some("image/png"));
    }

    #[test]
    fn test_sniff_rejects_garbage() {
        assert_eq!(sniff_mime(b"not an image at all"), None);
    }

    #[test]
    fn test_decoded_image_accounts_bytes() {
        let img = DecodedImage::new(image::DynamicImage::new_rgba8(4, 4), None);
        assert_eq!(img.size_bytes(), 4 * 4 * 4);
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 4);
    }
}
