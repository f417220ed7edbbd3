use rayon::prelude::*;

use super::{DrawParams, Rasterizer, shade};
use crate::error::RenderError;
use crate::raster::{RasterImage, flip_rows};

/// Matches the texture limit of common desktop GPUs.
const MAX_TARGET_DIMENSION: u32 = 16384;

#[derive(Clone, Copy)]
enum Compose {
    /// Transparent clear, source-over blending.
    Blend,
    /// Opaque black clear, fragments replace the target.
    Replace,
}

struct Texture {
    width: u32,
    height: u32,
    texels: Vec<[f32; 4]>,
}

impl Texture {
    fn from_raster(image: &RasterImage) -> Self {
        let texels = image
            .pixels()
            .chunks_exact(4)
            .map(|p| {
                [
                    p[0] as f32 / 255.0,
                    p[1] as f32 / 255.0,
                    p[2] as f32 / 255.0,
                    p[3] as f32 / 255.0,
                ]
            })
            .collect();
        Self {
            width: image.width(),
            height: image.height(),
            texels,
        }
    }

    fn fetch(&self, x: i64, y: i64) -> [f32; 4] {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.texels[y * self.width as usize + x]
    }

    /// Bilinear, clamp-to-edge, texel centers at half-integers.
    fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        let x = u * self.width as f32 - 0.5;
        let y = v * self.height as f32 - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);
        let a = self.fetch(x0, y0);
        let b = self.fetch(x0 + 1, y0);
        let c = self.fetch(x0, y0 + 1);
        let d = self.fetch(x0 + 1, y0 + 1);
        let mut out = [0.0; 4];
        for i in 0..4 {
            let top = a[i] + (b[i] - a[i]) * fx;
            let bottom = c[i] + (d[i] - c[i]) * fx;
            out[i] = top + (bottom - top) * fy;
        }
        out
    }
}

fn to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Software rasterizer with the same draw semantics as the GPU pipeline.
///
/// The framebuffer is stored bottom row first, the way a GL readback
/// delivers it, and flipped when handed out.
pub struct CpuRasterizer {
    texture: Option<Texture>,
    framebuffer: Vec<u8>,
}

impl CpuRasterizer {
    pub fn new() -> Self {
        Self {
            texture: None,
            framebuffer: Vec::new(),
        }
    }

    fn render(
        texture: &Texture,
        target: &mut [u8],
        width: u32,
        height: u32,
        params: &DrawParams,
        compose: Compose,
    ) {
        let m = &params.mvp;
        let (ax, cx) = (m[0][0], m[3][0]);
        let (ay, cy) = (m[1][1], m[3][1]);
        let [hw, hh] = params.half_extent;
        let clear = match compose {
            Compose::Blend => [0, 0, 0, 0],
            Compose::Replace => [0, 0, 0, 255],
        };
        let stride = width as usize * 4;

        target
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(row, line)| {
                let ndc_y = (row as f32 + 0.5) / height as f32 * 2.0 - 1.0;
                let y = if ay != 0.0 { (ndc_y - cy) / ay } else { f32::NAN };
                for (col, px) in line.chunks_exact_mut(4).enumerate() {
                    px.copy_from_slice(&clear);
                    let ndc_x = (col as f32 + 0.5) / width as f32 * 2.0 - 1.0;
                    let x = if ax != 0.0 { (ndc_x - cx) / ax } else { f32::NAN };
                    if !(x >= -hw && x <= hw && y >= -hh && y <= hh) {
                        continue;
                    }
                    let u = (x + hw) / (2.0 * hw);
                    let v = (hh - y) / (2.0 * hh);
                    let texel = texture.sample(u, v);
                    let rgb = shade([texel[0], texel[1], texel[2]], u, params);
                    let a = texel[3];
                    let out = match compose {
                        Compose::Blend => [rgb[0] * a, rgb[1] * a, rgb[2] * a, a],
                        Compose::Replace => [rgb[0], rgb[1], rgb[2], a],
                    };
                    for (dst, v) in px.iter_mut().zip(out) {
                        *dst = to_unorm8(v);
                    }
                }
            });
    }

    fn check_target(&self, width: u32, height: u32) -> Result<usize, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidDimensions { width, height });
        }
        if width > MAX_TARGET_DIMENSION || height > MAX_TARGET_DIMENSION {
            return Err(RenderError::TargetIncomplete {
                width,
                height,
                reason: format!("exceeds {MAX_TARGET_DIMENSION} pixels per axis"),
            });
        }
        Ok(width as usize * height as usize * 4)
    }
}

impl Default for CpuRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Rasterizer for CpuRasterizer {
    fn describe(&self) -> String {
        format!("cpu ({} threads)", rayon::current_num_threads())
    }

    fn max_target_dimension(&self) -> u32 {
        MAX_TARGET_DIMENSION
    }

    fn upload(&mut self, image: &RasterImage) -> Result<(), RenderError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidDimensions { width, height });
        }
        self.texture = Some(Texture::from_raster(image));
        Ok(())
    }

    fn release_texture(&mut self) {
        self.texture = None;
    }

    fn draw_viewport(
        &mut self,
        width: u32,
        height: u32,
        params: &DrawParams,
    ) -> Result<RasterImage, RenderError> {
        let len = self.check_target(width, height)?;
        let texture = self.texture.as_ref().ok_or(RenderError::NotInitialized)?;
        self.framebuffer.resize(len, 0);
        Self::render(
            texture,
            &mut self.framebuffer,
            width,
            height,
            params,
            Compose::Blend,
        );
        let mut pixels = self.framebuffer.clone();
        flip_rows(&mut pixels, width, height);
        RasterImage::from_rgba8(width, height, pixels)
            .ok_or_else(|| RenderError::Readback("framebuffer size mismatch".into()))
    }

    fn draw_offscreen(
        &mut self,
        width: u32,
        height: u32,
        params: &DrawParams,
    ) -> Result<RasterImage, RenderError> {
        let len = self.check_target(width, height)?;
        let texture = self.texture.as_ref().ok_or(RenderError::NotInitialized)?;
        let mut target = vec![0_u8; len];
        Self::render(texture, &mut target, width, height, params, Compose::Replace);
        flip_rows(&mut target, width, height);
        RasterImage::from_rgba8(width, height, target)
            .ok_or_else(|| RenderError::Readback("offscreen target size mismatch".into()))
    }
}
