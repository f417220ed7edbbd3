pub mod cpu;
pub mod engine;
pub mod gpu_pipeline;

use bytemuck::{Pod, Zeroable};

use crate::error::RenderError;
use crate::raster::RasterImage;
use crate::state::{FilterMode, FilterState, Mat4};

/// Luma weights shared by every filter.
pub const LUMA: [f32; 3] = [0.299, 0.587, 0.114];
pub const SWEEP_BAND_WIDTH: f32 = 0.1;
pub const SWEEP_MAX_GLARE: f32 = 0.8;

/// Everything a backend needs to draw one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawParams {
    pub mvp: Mat4,
    /// Half width/height of the textured quad in model space.
    pub half_extent: [f32; 2],
    pub filter: FilterState,
    pub sweep: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Uniforms {
    pub mvp: Mat4,
    pub filter_mode: u32,
    pub intensity: f32,
    pub sweep_pos: f32,
    pub _pad: f32,
}

impl From<&DrawParams> for Uniforms {
    fn from(p: &DrawParams) -> Self {
        Self {
            mvp: p.mvp,
            filter_mode: p.filter.mode().shader_code(),
            intensity: p.filter.intensity(),
            sweep_pos: p.sweep,
            _pad: 0.0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

/// Triangle list over the corners returned by [`quad_vertices`].
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

/// Quad corners in top-left, bottom-left, bottom-right, top-right order.
/// Texture row 0 is the top of the image, so the top edge samples v = 0.
pub fn quad_vertices(half_extent: [f32; 2]) -> [Vertex; 4] {
    let [hw, hh] = half_extent;
    [
        Vertex {
            position: [-hw, hh],
            uv: [0.0, 0.0],
        },
        Vertex {
            position: [-hw, -hh],
            uv: [0.0, 1.0],
        },
        Vertex {
            position: [hw, -hh],
            uv: [1.0, 1.0],
        },
        Vertex {
            position: [hw, hh],
            uv: [1.0, 0.0],
        },
    ]
}

/// Half extents of a quad that fits the image inside the viewport without
/// stretching. The axis on which the image is relatively larger spans [-1, 1].
pub fn fit_quad(image: (u32, u32), viewport: (u32, u32)) -> [f32; 2] {
    if viewport.0 == 0 || viewport.1 == 0 {
        return [1.0, 1.0];
    }
    let viewport_ratio = viewport.0 as f32 / viewport.1 as f32;
    let image_ratio = if image.0 > 0 && image.1 > 0 {
        image.0 as f32 / image.1 as f32
    } else {
        1.0
    };
    if image_ratio >= viewport_ratio {
        [1.0, viewport_ratio / image_ratio]
    } else {
        [image_ratio / viewport_ratio, 1.0]
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// CPU rendition of the fragment stage: filter pass, then sweep gain.
/// Input and output are linear 0..1 RGB; the result is not clamped.
pub fn shade(rgb: [f32; 3], u: f32, params: &DrawParams) -> [f32; 3] {
    let mut out = rgb;
    let intensity = params.filter.intensity();
    if params.filter.is_active() {
        let luma = rgb[0] * LUMA[0] + rgb[1] * LUMA[1] + rgb[2] * LUMA[2];
        match params.filter.mode() {
            FilterMode::Grayscale => {
                for c in out.iter_mut() {
                    *c = mix(*c, luma, intensity);
                }
            }
            FilterMode::Sepia => {
                let sepia = [luma * 1.2, luma, luma * 0.8];
                for (c, s) in out.iter_mut().zip(sepia) {
                    *c = mix(*c, s, intensity);
                }
            }
            FilterMode::Saturation => {
                let factor = 1.0 + intensity;
                for c in out.iter_mut() {
                    *c = (luma + factor * (*c - luma)).clamp(0.0, 1.0);
                }
            }
            FilterMode::None => {}
        }
    }
    if params.sweep > 0.0 {
        let dist = (u - params.sweep).abs();
        let glare = 1.0 - smoothstep(0.0, SWEEP_BAND_WIDTH, dist);
        let gain = 1.0 + SWEEP_MAX_GLARE * glare;
        for c in out.iter_mut() {
            *c *= gain;
        }
    }
    out
}

/// Builds a backend on the thread that will own it.
pub type RasterizerFactory =
    Box<dyn FnOnce() -> Result<Box<dyn Rasterizer>, RenderError> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderBackend {
    /// GPU when an adapter exists, otherwise the CPU rasterizer.
    Auto,
    Gpu,
    Cpu,
}

impl RenderBackend {
    pub fn factory(self) -> RasterizerFactory {
        Box::new(move || -> Result<Box<dyn Rasterizer>, RenderError> {
            match self {
                RenderBackend::Cpu => Ok(Box::new(cpu::CpuRasterizer::new())),
                RenderBackend::Gpu => Ok(Box::new(gpu_pipeline::GpuRasterizer::new()?)),
                RenderBackend::Auto if !gpu_pipeline::is_available() => {
                    Ok(Box::new(cpu::CpuRasterizer::new()))
                }
                RenderBackend::Auto => match gpu_pipeline::GpuRasterizer::new() {
                    Ok(gpu) => Ok(Box::new(gpu)),
                    Err(err) => {
                        tracing::warn!(%err, "gpu rasterizer failed; using cpu");
                        Ok(Box::new(cpu::CpuRasterizer::new()))
                    }
                },
            }
        })
    }
}

/// A rasterization backend. Implementations are created and used on the
/// render thread only.
pub trait Rasterizer {
    /// Short description for logs and the status line.
    fn describe(&self) -> String;

    /// Largest offscreen target the backend can allocate per axis.
    fn max_target_dimension(&self) -> u32;

    /// Replaces the source texture, releasing the previous one.
    fn upload(&mut self, image: &RasterImage) -> Result<(), RenderError>;

    fn release_texture(&mut self);

    /// Draws the viewport frame: transparent clear, alpha blended quad.
    fn draw_viewport(
        &mut self,
        width: u32,
        height: u32,
        params: &DrawParams,
    ) -> Result<RasterImage, RenderError>;

    /// Draws into a temporary target of the given size: opaque black clear,
    /// no blending. The returned image is top row first. Any temporary
    /// resources are released before returning, on success or failure.
    fn draw_offscreen(
        &mut self,
        width: u32,
        height: u32,
        params: &DrawParams,
    ) -> Result<RasterImage, RenderError>;
}
