use tracing::{debug, info, warn};

use super::{DrawParams, Rasterizer, fit_quad};
use crate::error::RenderError;
use crate::raster::RasterImage;
use crate::state::{
    FilterMode, FilterState, Mat4, ScaleBounds, TransformState, mat_mul, ortho,
};

/// Read-only view of the engine state, published by the render thread after
/// each batch of tasks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineSnapshot {
    pub scale: (f32, f32),
    pub translation: (f32, f32),
    pub flipped_h: bool,
    pub flipped_v: bool,
    pub filter: FilterState,
    pub sweep: f32,
    pub texture_size: (u32, u32),
    pub viewport: (u32, u32),
    pub backend: String,
}

impl EngineSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "scale: ({:.2}, {:.2}), translation: ({:.2}, {:.2})",
            self.scale.0, self.scale.1, self.translation.0, self.translation.1
        )
    }
}

/// Owns the texture, the transform/filter/effect uniforms and both draw modes.
///
/// Must only be driven from the render thread.
pub struct RenderEngine {
    rasterizer: Box<dyn Rasterizer>,
    transform: TransformState,
    filter: FilterState,
    sweep: f32,
    projection: Mat4,
    viewport: (u32, u32),
    texture_size: (u32, u32),
    half_extent: [f32; 2],
}

impl RenderEngine {
    pub fn new(rasterizer: Box<dyn Rasterizer>, bounds: ScaleBounds) -> Self {
        info!(backend = %rasterizer.describe(), "render engine created");
        Self {
            rasterizer,
            transform: TransformState::with_bounds(bounds),
            filter: FilterState::default(),
            sweep: 0.0,
            projection: ortho(-1.0, 1.0, -1.0, 1.0, -1.0, 1.0),
            viewport: (0, 0),
            texture_size: (0, 0),
            half_extent: [1.0, 1.0],
        }
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if self.viewport == (width, height) {
            return;
        }
        self.viewport = (width, height);
        self.update_quad();
        debug!(width, height, "viewport set");
    }

    /// Replaces the texture. On failure the previous texture is released so
    /// the engine never draws stale pixels under new dimensions.
    pub fn upload_texture(&mut self, image: &RasterImage) -> Result<(), RenderError> {
        if let Err(err) = self.rasterizer.upload(image) {
            self.rasterizer.release_texture();
            self.texture_size = (0, 0);
            return Err(err);
        }
        self.texture_size = image.dimensions();
        self.update_quad();
        debug!(
            id = image.id(),
            format = ?image.format(),
            width = image.width(),
            height = image.height(),
            "texture uploaded"
        );
        Ok(())
    }

    fn update_quad(&mut self) {
        if self.viewport.0 == 0 || self.viewport.1 == 0 {
            return;
        }
        self.half_extent = fit_quad(self.texture_size, self.viewport);
        debug!(
            half_width = self.half_extent[0],
            half_height = self.half_extent[1],
            "quad updated"
        );
    }

    /// Zooms about a focus point given in viewport pixels.
    pub fn set_scale(&mut self, factor: f32, focus_x: f32, focus_y: f32) -> bool {
        let (vw, vh) = self.viewport_f32();
        let ndc_x = focus_x / vw * 2.0 - 1.0;
        let ndc_y = 1.0 - focus_y / vh * 2.0;
        let changed = self.transform.scale_about(factor, (ndc_x, ndc_y));
        if changed {
            let (sx, sy) = self.transform.scale();
            debug!(factor, sx, sy, focus_x, focus_y, "scale");
        }
        changed
    }

    /// Pans by a delta in viewport pixels. Independent of the current zoom.
    pub fn set_translation(&mut self, dx: f32, dy: f32) {
        let (vw, vh) = self.viewport_f32();
        let gl_dx = dx / vw * 2.0 * (vw / vh);
        let gl_dy = -dy / vh * 2.0;
        self.transform.translate((gl_dx, gl_dy));
        let (tx, ty) = self.transform.translation();
        debug!(dx, dy, tx, ty, "translate");
    }

    fn viewport_f32(&self) -> (f32, f32) {
        (self.viewport.0.max(1) as f32, self.viewport.1.max(1) as f32)
    }

    pub fn flip_horizontally(&mut self) {
        self.transform.flip_horizontally();
        debug!(flipped = self.transform.is_flipped_h(), "flip horizontal");
    }

    pub fn flip_vertically(&mut self) {
        self.transform.flip_vertically();
        debug!(flipped = self.transform.is_flipped_v(), "flip vertical");
    }

    pub fn reset_flip_flags(&mut self) {
        self.transform.reset_flips();
    }

    pub fn set_sweep_position(&mut self, position: f32) {
        self.sweep = position;
    }

    pub fn set_filter_mode(&mut self, mode: FilterMode) {
        self.filter.set_mode(mode);
    }

    pub fn set_filter_intensity(&mut self, intensity: f32) {
        self.filter.set_intensity(intensity);
    }

    /// Full reset: identity transform, no flips, no filter, sweep at rest.
    pub fn reset_transform(&mut self) {
        self.transform.reset();
        self.filter.reset();
        self.sweep = 0.0;
        debug!("transform reset");
    }

    #[cfg(test)]
    pub fn transform(&self) -> &TransformState {
        &self.transform
    }

    pub fn has_texture(&self) -> bool {
        self.texture_size.0 > 0 && self.texture_size.1 > 0
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            scale: self.transform.scale(),
            translation: self.transform.translation(),
            flipped_h: self.transform.is_flipped_h(),
            flipped_v: self.transform.is_flipped_v(),
            filter: self.filter,
            sweep: self.sweep,
            texture_size: self.texture_size,
            viewport: self.viewport,
            backend: self.rasterizer.describe(),
        }
    }

    /// Renders the live view. Returns `None` when there is nothing to draw yet.
    pub fn draw(&mut self) -> Option<Result<RasterImage, RenderError>> {
        let (width, height) = self.viewport;
        if width == 0 || height == 0 || !self.has_texture() {
            return None;
        }
        let params = DrawParams {
            mvp: mat_mul(&self.projection, &self.transform.live_matrix()),
            half_extent: self.half_extent,
            filter: self.filter,
            sweep: self.sweep,
        };
        Some(self.rasterizer.draw_viewport(width, height, &params))
    }

    /// Renders the full-bleed image at texture resolution: flips are baked in,
    /// pan and zoom are ignored.
    pub fn capture(&mut self) -> Result<RasterImage, RenderError> {
        let (width, height) = self.texture_size;
        if width == 0 || height == 0 {
            warn!(width, height, "capture refused: invalid texture dimensions");
            return Err(RenderError::InvalidDimensions { width, height });
        }
        let max = self.rasterizer.max_target_dimension();
        if width > max || height > max {
            return Err(RenderError::TargetIncomplete {
                width,
                height,
                reason: format!("device limit is {max}"),
            });
        }
        let params = DrawParams {
            mvp: mat_mul(&self.projection, &self.transform.offscreen_matrix()),
            half_extent: [1.0, 1.0],
            filter: self.filter,
            sweep: self.sweep,
        };
        debug!(width, height, "offscreen capture");
        self.rasterizer.draw_offscreen(width, height, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::cpu::CpuRasterizer;

    fn engine() -> RenderEngine {
        RenderEngine::new(Box::new(CpuRasterizer::new()), ScaleBounds::default())
    }

    #[test]
    fn capture_without_texture_is_invalid_dimensions() {
        let mut e = engine();
        assert!(matches!(
            e.capture(),
            Err(RenderError::InvalidDimensions {
                width: 0,
                height: 0
            })
        ));
    }

    #[test]
    fn draw_needs_viewport_and_texture() {
        let mut e = engine();
        assert!(e.draw().is_none());
        e.upload_texture(&RasterImage::solid(2, 2, [1, 2, 3, 255]))
            .expect("upload");
        assert!(e.draw().is_none());
        e.set_viewport(4, 4);
        assert!(matches!(e.draw(), Some(Ok(_))));
    }

    #[test]
    fn capture_ignores_pan_and_zoom_but_keeps_flip() {
        let mut e = engine();
        let src = RasterImage::from_rgba_image(image::ImageBuffer::from_fn(2, 1, |x, _| {
            if x == 0 {
                image::Rgba([255, 0, 0, 255])
            } else {
                image::Rgba([0, 0, 255, 255])
            }
        }));
        e.upload_texture(&src).expect("upload");
        e.set_viewport(100, 50);
        e.set_scale(3.0, 10.0, 10.0);
        e.set_translation(20.0, -5.0);
        e.flip_horizontally();

        let out = e.capture().expect("capture");
        assert_eq!(out.dimensions(), (2, 1));
        assert_eq!(out.pixel(0, 0), [0, 0, 255, 255]);
        assert_eq!(out.pixel(1, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn set_scale_uses_viewport_focus() {
        let mut e = engine();
        e.set_viewport(200, 100);
        assert!(e.set_scale(2.0, 150.0, 25.0));
        let m = e.transform().live_matrix();
        // Focus (150, 25) is NDC (0.5, 0.5); the offset is f * (1 - k).
        assert!((m[3][0] + 0.5).abs() < 1e-6);
        assert!((m[3][1] + 0.5).abs() < 1e-6);
        assert!(!e.set_scale(1.0, 0.0, 0.0));
    }

    #[test]
    fn translation_is_aspect_scaled() {
        let mut e = engine();
        e.set_viewport(200, 100);
        e.set_translation(50.0, 25.0);
        let (tx, ty) = e.transform().translation();
        assert!((tx - 1.0).abs() < 1e-6);
        assert!((ty + 0.5).abs() < 1e-6);
    }

    #[test]
    fn reset_clears_transform_filter_and_sweep() {
        let mut e = engine();
        e.set_viewport(10, 10);
        e.set_scale(2.0, 5.0, 5.0);
        e.set_translation(3.0, 3.0);
        e.flip_horizontally();
        e.flip_vertically();
        e.set_filter_mode(FilterMode::Sepia);
        e.set_filter_intensity(0.7);
        e.set_sweep_position(0.4);
        e.reset_transform();

        let s = e.snapshot();
        assert_eq!(s.scale, (1.0, 1.0));
        assert_eq!(s.translation, (0.0, 0.0));
        assert!(!s.flipped_h && !s.flipped_v);
        assert_eq!(s.filter.mode(), FilterMode::None);
        assert_eq!(s.filter.intensity(), 0.0);
        assert_eq!(s.sweep, 0.0);
    }

    #[test]
    fn failed_upload_releases_texture() {
        let mut e = engine();
        e.upload_texture(&RasterImage::solid(2, 2, [0, 0, 0, 255]))
            .expect("upload");
        let empty = RasterImage::from_rgba8(0, 0, Vec::new()).expect("empty raster");
        assert!(e.upload_texture(&empty).is_err());
        assert!(!e.has_texture());
    }
}
