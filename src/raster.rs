use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

use image::{DynamicImage, ImageFormat, RgbaImage};

use crate::error::LoadError;

static NEXT_RASTER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// A decoded, CPU-resident pixel buffer.
///
/// Deliberately not `Clone`: a copy is a new snapshot with a new identity and
/// must be requested with [`RasterImage::snapshot`]. Moving a `RasterImage`
/// keeps its identity.
#[derive(Debug)]
pub struct RasterImage {
    id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl RasterImage {
    /// Wraps an RGBA8 buffer. Returns `None` if the buffer length does not
    /// match the dimensions.
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(PixelFormat::Rgba8.bytes_per_pixel())?;
        if pixels.len() != expected {
            return None;
        }
        Some(Self {
            id: NEXT_RASTER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format: PixelFormat::Rgba8,
            pixels,
        })
    }

    pub fn from_rgba_image(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            id: NEXT_RASTER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format: PixelFormat::Rgba8,
            pixels: img.into_raw(),
        }
    }

    #[cfg(test)]
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::from_rgba_image(RgbaImage::from_pixel(width, height, image::Rgba(rgba)))
    }

    /// Decodes a full stream using the declared media type as the decoder hint.
    ///
    /// Unknown media types fall back to content sniffing. GIF sources are
    /// refused since animated editing is not supported.
    pub fn decode<R: Read>(mut reader: R, media_type: &str) -> Result<Self, LoadError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Err(LoadError::Empty);
        }

        let media_type = media_type.trim().to_ascii_lowercase();
        if media_type == "image/gif" {
            return Err(LoadError::Unsupported(media_type));
        }

        let img = match ImageFormat::from_mime_type(&media_type) {
            Some(format) => image::load_from_memory_with_format(&bytes, format)?,
            None => image::load_from_memory(&bytes)?,
        };
        Self::from_dynamic(img)
    }

    /// Best-effort decode that ignores any declared media type.
    pub fn sniff(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.is_empty() {
            return Err(LoadError::Empty);
        }
        Self::from_dynamic(image::load_from_memory(bytes)?)
    }

    fn from_dynamic(img: DynamicImage) -> Result<Self, LoadError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(LoadError::Empty);
        }
        Ok(Self::from_rgba_image(img.into_rgba8()))
    }

    /// Copies the pixels into a new image with its own identity.
    pub fn snapshot(&self) -> Self {
        Self {
            id: NEXT_RASTER_ID.fetch_add(1, Ordering::Relaxed),
            width: self.width,
            height: self.height,
            format: self.format,
            pixels: self.pixels.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[cfg(test)]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }
}

/// Reverses row order in place. GL-style readbacks deliver the bottom row first.
pub fn flip_rows(pixels: &mut [u8], width: u32, height: u32) {
    let stride = width as usize * 4;
    let height = height as usize;
    if stride == 0 || pixels.len() < stride * height {
        return;
    }
    for row in 0..height / 2 {
        let (top, bottom) = pixels.split_at_mut((height - 1 - row) * stride);
        top[row * stride..(row + 1) * stride].swap_with_slice(&mut bottom[..stride]);
    }
}
