use std::io;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use image::imageops::FilterType;
use image::{ImageError, ImageFormat, ImageReader, RgbaImage};

use crate::caching::{CacheContents, CacheError, ItemDecoder, LoadSource, OverrideValue};

impl From<ImageError> for CacheError {
    fn from(error: ImageError) -> Self {
        Self::DecodeFailed(error.to_string())
    }
}

fn unrecognized_format() -> CacheError {
    CacheError::DecodeFailed("unrecognized image format".into())
}

/// How decode dimensions are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodePixelType {
    /// Dimensions are in physical pixels.
    #[default]
    Physical,
    /// Dimensions are in logical pixels and multiplied with the decoder's scale factor.
    Logical,
}

impl DecodePixelType {
    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("physical") {
            Some(Self::Physical)
        } else if value.eq_ignore_ascii_case("logical") {
            Some(Self::Logical)
        } else {
            None
        }
    }
}

/// Settable properties of a [`Bitmap`], applied before it is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapOptions {
    /// Width to decode to. `None` keeps the natural width, or scales it proportionally when
    /// only the height is set.
    pub decode_pixel_width: Option<u32>,
    /// Height to decode to, see `decode_pixel_width`.
    pub decode_pixel_height: Option<u32>,
    pub decode_pixel_type: DecodePixelType,
    /// Whether animated images start playing on their own.
    pub auto_play: bool,
}

impl Default for BitmapOptions {
    fn default() -> Self {
        Self {
            decode_pixel_width: None,
            decode_pixel_height: None,
            decode_pixel_type: DecodePixelType::Physical,
            auto_play: true,
        }
    }
}

/// The closed set of property names a [`Bitmap`] knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapProperty {
    DecodePixelWidth,
    DecodePixelHeight,
    DecodePixelType,
    AutoPlay,
    /// Read-only, determined by decoding.
    PixelWidth,
    /// Read-only, determined by decoding.
    PixelHeight,
    /// Read-only, determined by the cache key.
    UriSource,
}

impl BitmapProperty {
    /// Resolves a property name. `Width` and `Height` are aliases of the decode dimensions.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "DecodePixelWidth" | "Width" => Self::DecodePixelWidth,
            "DecodePixelHeight" | "Height" => Self::DecodePixelHeight,
            "DecodePixelType" => Self::DecodePixelType,
            "AutoPlay" => Self::AutoPlay,
            "PixelWidth" => Self::PixelWidth,
            "PixelHeight" => Self::PixelHeight,
            "UriSource" => Self::UriSource,
            _ => return None,
        })
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Self::DecodePixelWidth
                | Self::DecodePixelHeight
                | Self::DecodePixelType
                | Self::AutoPlay
        )
    }

    /// Assigns `value` to this property of `options`.
    ///
    /// Returns `false` and leaves `options` unchanged if the property is read-only or the value
    /// has the wrong type. A decode dimension of `0` means "natural size".
    pub fn apply(self, options: &mut BitmapOptions, value: &OverrideValue) -> bool {
        match self {
            Self::DecodePixelWidth => match value.as_u32() {
                Some(width) => {
                    options.decode_pixel_width = (width > 0).then_some(width);
                    true
                }
                None => false,
            },
            Self::DecodePixelHeight => match value.as_u32() {
                Some(height) => {
                    options.decode_pixel_height = (height > 0).then_some(height);
                    true
                }
                None => false,
            },
            Self::DecodePixelType => match value.as_str().and_then(DecodePixelType::parse) {
                Some(ty) => {
                    options.decode_pixel_type = ty;
                    true
                }
                None => false,
            },
            Self::AutoPlay => match value.as_bool() {
                Some(auto_play) => {
                    options.auto_play = auto_play;
                    true
                }
                None => false,
            },
            Self::PixelWidth | Self::PixelHeight | Self::UriSource => false,
        }
    }
}

/// A decoded image.
///
/// Cloning is cheap, the pixels are shared.
#[derive(Debug, Clone)]
pub struct Bitmap {
    options: BitmapOptions,
    format: ImageFormat,
    pixels: Arc<RgbaImage>,
}

impl Bitmap {
    /// The format the image was stored in.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn options(&self) -> &BitmapOptions {
        &self.options
    }

    pub fn auto_play(&self) -> bool {
        self.options.auto_play
    }

    pub fn pixel_width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn pixel_height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }
}

/// Largest number of pixels an image is resized to, 64 megapixels.
pub const DEFAULT_MAX_DECODE_PIXELS: u64 = 8192 * 8192;

/// The [`ItemDecoder`] producing [`Bitmap`]s.
#[derive(Debug, Clone)]
pub struct BitmapDecoder {
    scale_factor: f64,
    max_decode_pixels: u64,
}

impl Default for BitmapDecoder {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            max_decode_pixels: DEFAULT_MAX_DECODE_PIXELS,
        }
    }
}

impl BitmapDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ratio of physical to logical pixels used for [`DecodePixelType::Logical`].
    pub fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Sets the largest `width * height` an image may be resized to.
    ///
    /// Decode dimensions beyond this fail with [`CacheError::DecodeFailed`].
    pub fn with_max_decode_pixels(mut self, max_decode_pixels: u64) -> Self {
        self.max_decode_pixels = max_decode_pixels;
        self
    }
}

impl ItemDecoder for BitmapDecoder {
    type Item = Bitmap;
    type Builder = BitmapOptions;

    fn create(&self, _source: &LoadSource) -> BitmapOptions {
        BitmapOptions::default()
    }

    fn apply_override(
        &self,
        builder: &mut BitmapOptions,
        name: &str,
        value: &OverrideValue,
    ) -> bool {
        BitmapProperty::from_name(name).is_some_and(|property| property.apply(builder, value))
    }

    fn decode(
        &self,
        options: BitmapOptions,
        source: LoadSource,
    ) -> BoxFuture<'static, CacheContents<Bitmap>> {
        let decoder = self.clone();
        async move {
            tokio::task::spawn_blocking(move || decoder.decode_bitmap(options, source))
                .await
                .unwrap_or_else(|e| Err(e.into()))
        }
        .boxed()
    }

    fn validate(&self, header: &[u8]) -> CacheContents {
        match image::guess_format(header) {
            Ok(_) => Ok(()),
            Err(_) => Err(CacheError::InvalidContent(
                "unrecognized image format".into(),
            )),
        }
    }
}

impl BitmapDecoder {
    fn decode_bitmap(
        &self,
        options: BitmapOptions,
        source: LoadSource,
    ) -> CacheContents<Bitmap> {
        let (format, image) = match source {
            LoadSource::Bytes(bytes) => {
                let format = image::guess_format(&bytes).map_err(|_| unrecognized_format())?;
                (format, image::load_from_memory_with_format(&bytes, format)?)
            }
            LoadSource::Path(path) => {
                let reader = ImageReader::open(&path)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::NotFound => CacheError::NotFound,
                        _ => e.into(),
                    })?
                    .with_guessed_format()?;
                let format = reader.format().ok_or_else(unrecognized_format)?;
                (format, reader.decode()?)
            }
        };

        let natural = (image.width(), image.height());
        let (width, height) = decode_size(natural, &options, self.scale_factor);
        if u64::from(width) * u64::from(height) > self.max_decode_pixels {
            return Err(CacheError::DecodeFailed(format!(
                "decode size {width}x{height} exceeds {} pixels",
                self.max_decode_pixels
            )));
        }

        let mut pixels = image.into_rgba8();
        if (width, height) != natural {
            pixels = image::imageops::resize(&pixels, width, height, FilterType::Triangle);
        }
        tracing::trace!("Decoded {:?} image of {}x{}", format, width, height);

        Ok(Bitmap {
            options,
            format,
            pixels: Arc::new(pixels),
        })
    }
}

/// Computes the dimensions `image` should be decoded to.
///
/// With only one decode dimension set, the other one keeps the aspect ratio.
fn decode_size(
    (width, height): (u32, u32),
    options: &BitmapOptions,
    scale_factor: f64,
) -> (u32, u32) {
    let scale = match options.decode_pixel_type {
        DecodePixelType::Physical => 1.0,
        DecodePixelType::Logical => scale_factor,
    };
    let scaled = |value: u32| ((value as f64 * scale).round() as u32).max(1);
    let proportional =
        |other: u32, target: u32, original: u32| -> u32 {
            ((other as f64 * target as f64 / original.max(1) as f64).round() as u32).max(1)
        };

    match (
        options.decode_pixel_width.map(scaled),
        options.decode_pixel_height.map(scaled),
    ) {
        (None, None) => (width, height),
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, proportional(height, w, width)),
        (None, Some(h)) => (proportional(width, h, height), h),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn options(overrides: &[(&str, OverrideValue)]) -> BitmapOptions {
        let decoder = BitmapDecoder::new();
        let mut options = decoder.create(&LoadSource::Bytes(Bytes::new()));
        for (name, value) in overrides {
            decoder.apply_override(&mut options, name, value);
        }
        options
    }

    #[test]
    fn test_property_names() {
        assert_eq!(
            BitmapProperty::from_name("Width"),
            Some(BitmapProperty::DecodePixelWidth)
        );
        assert_eq!(
            BitmapProperty::from_name("Height"),
            Some(BitmapProperty::DecodePixelHeight)
        );
        assert_eq!(BitmapProperty::from_name("Bogus"), None);
        assert!(!BitmapProperty::PixelWidth.is_writable());
        assert!(BitmapProperty::AutoPlay.is_writable());
    }

    #[test]
    fn test_overrides_are_best_effort() {
        let applied = options(&[
            ("Width", 40u32.into()),
            ("Bogus", 1u32.into()),
            ("PixelHeight", 7u32.into()),
            ("AutoPlay", "yes".into()),
            ("DecodePixelType", "Logical".into()),
        ]);
        assert_eq!(
            applied,
            BitmapOptions {
                decode_pixel_width: Some(40),
                decode_pixel_type: DecodePixelType::Logical,
                ..Default::default()
            }
        );

        // zero resets to the natural size
        let reset = options(&[("Width", 40u32.into()), ("Width", 0u32.into())]);
        assert_eq!(reset.decode_pixel_width, None);
    }

    #[test]
    fn test_decode_size() {
        let natural = (400, 200);
        assert_eq!(decode_size(natural, &options(&[]), 1.0), natural);
        assert_eq!(
            decode_size(natural, &options(&[("Width", 100u32.into())]), 1.0),
            (100, 50)
        );
        assert_eq!(
            decode_size(natural, &options(&[("Height", 100u32.into())]), 1.0),
            (200, 100)
        );
        assert_eq!(
            decode_size(
                natural,
                &options(&[("Width", 10u32.into()), ("Height", 10u32.into())]),
                1.0
            ),
            (10, 10)
        );
        let logical = options(&[
            ("DecodePixelWidth", 100u32.into()),
            ("DecodePixelType", "logical".into()),
        ]);
        assert_eq!(decode_size(natural, &logical, 2.0), (200, 100));
    }

    #[test]
    fn test_validate() {
        let decoder = BitmapDecoder::new();
        let png = objcache_test::png_bytes(4, 2);
        assert_eq!(decoder.validate(&png[..16]), Ok(()));
        assert!(matches!(
            decoder.validate(b"<html>not an image</html>"),
            Err(CacheError::InvalidContent(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_bytes() {
        let decoder = BitmapDecoder::new();
        let source = LoadSource::Bytes(objcache_test::png_bytes(4, 2).into());
        let bitmap = decoder
            .decode(options(&[("Width", 2u32.into())]), source)
            .await
            .unwrap();

        assert_eq!(bitmap.format(), ImageFormat::Png);
        assert_eq!((bitmap.pixel_width(), bitmap.pixel_height()), (2, 1));
        assert!(bitmap.auto_play());
    }

    #[tokio::test]
    async fn test_decode_path() {
        let dir = objcache_test::tempdir();
        let path = dir.path().join("image");
        std::fs::write(&path, objcache_test::png_bytes(3, 5)).unwrap();

        let decoder = BitmapDecoder::new();
        let bitmap = decoder
            .decode(options(&[]), LoadSource::Path(path))
            .await
            .unwrap();
        assert_eq!((bitmap.pixel_width(), bitmap.pixel_height()), (3, 5));
    }

    #[tokio::test]
    async fn test_decode_size_is_capped() {
        let decoder = BitmapDecoder::new();
        let huge = options(&[("Width", u32::MAX.into()), ("Height", u32::MAX.into())]);
        let source = LoadSource::Bytes(objcache_test::png_bytes(1, 1).into());
        let result = decoder.decode(huge, source).await;
        assert!(matches!(result, Err(CacheError::DecodeFailed(_))));

        // the scale factor counts towards the limit
        let decoder = BitmapDecoder::new()
            .with_scale_factor(4.0)
            .with_max_decode_pixels(100);
        let logical = options(&[("Width", 8u32.into()), ("DecodePixelType", "Logical".into())]);
        let source = LoadSource::Bytes(objcache_test::png_bytes(4, 4).into());
        let result = decoder.decode(logical.clone(), source.clone()).await;
        assert!(matches!(result, Err(CacheError::DecodeFailed(_))));

        let decoder = decoder.with_max_decode_pixels(32 * 32);
        let bitmap = decoder.decode(logical, source).await.unwrap();
        assert_eq!((bitmap.pixel_width(), bitmap.pixel_height()), (32, 32));
    }

    #[tokio::test]
    async fn test_decode_garbage() {
        let decoder = BitmapDecoder::new();
        let source = LoadSource::Bytes(Bytes::from_static(b"definitely not an image"));
        let result = decoder.decode(options(&[]), source).await;
        assert_eq!(result.unwrap_err(), unrecognized_format());
    }
}
