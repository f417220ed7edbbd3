use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, ErrorKind},
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, anyhow};
use image::{
    DynamicImage,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use tracing::info;

use crate::raster::RasterImage;

/// Final destination of an edited image.
pub trait PersistenceSink: Send + Sync {
    /// Writes the image and returns an identifier for it.
    fn persist(&self, image: &RasterImage) -> Result<String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg { quality: u8 },
    Png,
}

impl OutputFormat {
    fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg { .. } => "jpg",
            OutputFormat::Png => "png",
        }
    }
}

/// Writes `lumen_<unix_millis>.<ext>` files into a directory.
#[derive(Clone, Debug)]
pub struct FileSink {
    dir: PathBuf,
    format: OutputFormat,
}

impl FileSink {
    pub fn new(dir: PathBuf, format: OutputFormat) -> Self {
        Self { dir, format }
    }

    /// Claims a fresh output file. `create_new` makes the claim atomic, so
    /// concurrent saves in the same millisecond get distinct names.
    fn create_output(&self) -> Result<(PathBuf, File)> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let ext = self.format.extension();
        let mut n = 0;
        loop {
            let name = if n == 0 {
                format!("lumen_{millis}.{ext}")
            } else {
                format!("lumen_{millis}_{n}.{ext}")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to create {}", path.display()));
                }
            }
        }
    }
}

impl PersistenceSink for FileSink {
    fn persist(&self, image: &RasterImage) -> Result<String> {
        let rendered = image
            .to_rgba_image()
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| anyhow!("pixel buffer does not match image dimensions"))?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let (path, file) = self.create_output()?;
        let writer = BufWriter::new(file);
        let (width, height) = image.dimensions();

        let encoded = match self.format {
            OutputFormat::Jpeg { quality } => {
                // JPEG has no alpha channel.
                let encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
                DynamicImage::ImageRgb8(rendered.to_rgb8()).write_with_encoder(encoder)
            }
            OutputFormat::Png => rendered.write_with_encoder(PngEncoder::new(writer)),
        };
        if let Err(err) = encoded {
            let _ = std::fs::remove_file(&path);
            return Err(err).with_context(|| format!("failed to encode {}", path.display()));
        }

        info!(path = %path.display(), width, height, "image saved");
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lumen_persist_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn png_sink_round_trips_pixels() {
        let dir = temp_dir("png");
        let sink = FileSink::new(dir.clone(), OutputFormat::Png);
        let image = RasterImage::solid(3, 2, [10, 20, 30, 255]);
        let id = sink.persist(&image).expect("persist");
        assert!(id.ends_with(".png"));

        let back = image::open(&id).expect("reopen").into_rgba8();
        assert_eq!(back.dimensions(), (3, 2));
        assert_eq!(back.get_pixel(1, 1).0, [10, 20, 30, 255]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn concurrent_saves_never_share_a_file() {
        let dir = temp_dir("concurrent");
        let sink = std::sync::Arc::new(FileSink::new(dir.clone(), OutputFormat::Png));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    sink.persist(&RasterImage::solid(2, 2, [1, 2, 3, 255]))
                        .expect("persist")
                })
            })
            .collect();
        let mut ids: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().expect("save thread"))
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        let files = std::fs::read_dir(&dir).expect("read dir").count();
        assert_eq!(files, 4);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn jpeg_sink_writes_distinct_files() {
        let dir = temp_dir("jpeg");
        let sink = FileSink::new(dir.clone(), OutputFormat::Jpeg { quality: 90 });
        let image = RasterImage::solid(8, 8, [200, 40, 40, 255]);
        let first = sink.persist(&image).expect("persist");
        let second = sink.persist(&image).expect("persist");
        assert_ne!(first, second);

        let back = image::open(&first).expect("reopen").into_rgb8();
        let [r, g, b] = back.get_pixel(4, 4).0;
        assert!(r > 180 && g < 70 && b < 70);
        let _ = std::fs::remove_dir_all(dir);
    }
}
