use std::sync::{
    OnceLock,
    atomic::{AtomicBool, Ordering},
    mpsc,
};

use tracing::{debug, error, warn};
use wgpu::util::DeviceExt;

use super::{DrawParams, QUAD_INDICES, Rasterizer, Uniforms, Vertex, quad_vertices};
use crate::error::RenderError;
use crate::raster::RasterImage;

pub const DEBUG_ALLOW_CPU_FALLBACK_ENV: &str = "LUMEN_DEBUG_ALLOW_CPU_FALLBACK";
const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    adapter_backend: String,
    adapter_driver: String,
    adapter_vendor_id: u32,
}

static GPU_CONTEXT: OnceLock<Result<GpuContext, RenderError>> = OnceLock::new();
static GPU_FALLBACK_REPORTED: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Debug, Default)]
/// Snapshot of GPU runtime availability and adapter details.
pub struct RuntimeStatus {
    pub available: bool,
    pub adapter_vendor_id: Option<u32>,
    pub adapter_name: Option<String>,
    pub adapter_backend: Option<String>,
    pub adapter_driver: Option<String>,
    /// Why the GPU is unavailable, when it is.
    pub error: Option<String>,
}

/// Returns whether a compatible GPU adapter is available.
pub fn is_available() -> bool {
    gpu_context().is_some()
}

/// Returns the device's maximum 2D texture dimension, or 0 if GPU is unavailable.
pub fn max_texture_dimension() -> u32 {
    gpu_context()
        .map(|ctx| ctx.device.limits().max_texture_dimension_2d)
        .unwrap_or(0)
}

/// Returns detailed GPU runtime status for startup diagnostics.
pub fn runtime_status() -> RuntimeStatus {
    match gpu_context_result() {
        Ok(ctx) => RuntimeStatus {
            available: true,
            adapter_vendor_id: Some(ctx.adapter_vendor_id),
            adapter_name: Some(ctx.adapter_name.clone()),
            adapter_backend: Some(ctx.adapter_backend.clone()),
            adapter_driver: Some(ctx.adapter_driver.clone()),
            error: None,
        },
        Err(err) => RuntimeStatus {
            error: Some(err.to_string()),
            ..RuntimeStatus::default()
        },
    }
}

pub fn allow_debug_cpu_fallback() -> bool {
    std::env::var(DEBUG_ALLOW_CPU_FALLBACK_ENV)
        .ok()
        .map(|raw| debug_fallback_truthy(&raw))
        .unwrap_or(false)
}

fn debug_fallback_truthy(raw: &str) -> bool {
    let norm = raw.trim().to_ascii_lowercase();
    norm == "1" || norm == "true" || norm == "yes" || norm == "on"
}

fn gpu_context() -> Option<&'static GpuContext> {
    gpu_context_result().ok()
}

fn gpu_context_result() -> Result<&'static GpuContext, &'static RenderError> {
    GPU_CONTEXT.get_or_init(init_gpu_context).as_ref()
}

fn init_gpu_context() -> Result<GpuContext, RenderError> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        force_fallback_adapter: false,
        compatible_surface: None,
    }))
    .ok_or(RenderError::NoAdapter)?;
    let adapter_info = adapter.get_info();
    // Software adapters are slower than the rayon rasterizer.
    if adapter_info.device_type == wgpu::DeviceType::Cpu {
        debug!(adapter = %adapter_info.name, "software adapter skipped");
        return Err(RenderError::NoAdapter);
    }
    let adapter_vendor_id = adapter_info.vendor;
    let adapter_name = adapter_info.name;
    let adapter_backend = adapter_info.backend.to_string();
    let adapter_driver = if adapter_info.driver.trim().is_empty() {
        "unknown".to_string()
    } else {
        adapter_info.driver
    };
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("lumen_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
        },
        None,
    ))
    .map_err(|err| {
        warn!(%err, "gpu device request failed");
        RenderError::Device(err.to_string())
    })?;
    device.on_uncaptured_error(Box::new(|err| {
        error!(%err, "uncaptured wgpu error");
    }));

    Ok(GpuContext {
        device,
        queue,
        adapter_name,
        adapter_backend,
        adapter_driver,
        adapter_vendor_id,
    })
}

fn report_gpu_fallback_once() {
    if !GPU_FALLBACK_REPORTED.swap(true, Ordering::Relaxed) {
        eprintln!(
            "lumen: gpu renderer unavailable or failed; set {}=1 to enable debug CPU fallback",
            DEBUG_ALLOW_CPU_FALLBACK_ENV
        );
    }
}

fn pop_error(device: &wgpu::Device) -> Option<String> {
    pollster::block_on(device.pop_error_scope()).map(|err| err.to_string())
}

#[derive(Clone, Copy)]
enum DrawMode {
    Viewport,
    Offscreen,
}

struct SourceTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

/// Viewport render target, kept across frames and recreated on resize.
struct Surface {
    width: u32,
    height: u32,
    texture: wgpu::Texture,
}

/// wgpu rasterizer: one textured quad, two pipelines (blended viewport and
/// replacing offscreen), readback through a padded staging buffer.
pub struct GpuRasterizer {
    ctx: &'static GpuContext,
    viewport_pipeline: wgpu::RenderPipeline,
    offscreen_pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uniform_buffer: wgpu::Buffer,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    source: Option<SourceTexture>,
    surface: Option<Surface>,
}

impl GpuRasterizer {
    pub fn new() -> Result<Self, RenderError> {
        let ctx = gpu_context_result().map_err(|err| {
            report_gpu_fallback_once();
            err.clone()
        })?;
        let device = &ctx.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("lumen_quad"),
            source: wgpu::ShaderSource::Wgsl(QUAD_SHADER_SRC.into()),
        });
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("lumen_quad_bgl"),
            entries: &quad_layout_entries(),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("lumen_quad_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let viewport_pipeline = create_quad_pipeline(
            device,
            &layout,
            &shader,
            "lumen_viewport",
            wgpu::BlendState::ALPHA_BLENDING,
        );
        let offscreen_pipeline = create_quad_pipeline(
            device,
            &layout,
            &shader,
            "lumen_offscreen",
            wgpu::BlendState::REPLACE,
        );
        if let Some(err) = pop_error(device) {
            report_gpu_fallback_once();
            return Err(RenderError::ShaderCompile(err));
        }

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("lumen_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lumen_uniforms"),
            size: std::mem::size_of::<Uniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let vertex_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lumen_vertices"),
            size: std::mem::size_of::<[Vertex; 4]>() as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("lumen_indices"),
            contents: bytemuck::cast_slice(&QUAD_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        Ok(Self {
            ctx,
            viewport_pipeline,
            offscreen_pipeline,
            bind_group_layout,
            sampler,
            uniform_buffer,
            vertex_buffer,
            index_buffer,
            source: None,
            surface: None,
        })
    }

    fn ensure_surface(&mut self, width: u32, height: u32) {
        if let Some(s) = &self.surface {
            if s.width == width && s.height == height {
                return;
            }
        }
        if let Some(old) = self.surface.take() {
            old.texture.destroy();
        }
        let texture = create_target(&self.ctx.device, "lumen_surface", width, height);
        debug!(width, height, "viewport surface allocated");
        self.surface = Some(Surface {
            width,
            height,
            texture,
        });
    }

    fn render_and_read(
        &self,
        target: &wgpu::Texture,
        width: u32,
        height: u32,
        params: &DrawParams,
        mode: DrawMode,
    ) -> Result<Vec<u8>, String> {
        let source = self.source.as_ref().ok_or("no source texture")?;
        let ctx = self.ctx;
        let (pipeline, clear) = match mode {
            DrawMode::Viewport => (&self.viewport_pipeline, wgpu::Color::TRANSPARENT),
            DrawMode::Offscreen => (&self.offscreen_pipeline, wgpu::Color::BLACK),
        };

        let uniforms = Uniforms::from(params);
        ctx.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        ctx.queue.write_buffer(
            &self.vertex_buffer,
            0,
            bytemuck::cast_slice(&quad_vertices(params.half_extent)),
        );

        let view = target.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lumen_draw_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("lumen_draw_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(clear),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &source.bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            pass.draw_indexed(0..QUAD_INDICES.len() as u32, 0, 0..1);
        }

        // Readback. Texture row 0 is the top of the target, so no row flip.
        let unpadded_bytes_per_row = width.saturating_mul(4);
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let readback = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lumen_readback"),
            size: padded_bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        encoder.copy_texture_to_buffer(
            target.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        ctx.queue.submit([encoder.finish()]);

        let slice = readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = ctx.device.poll(wgpu::Maintain::wait());
        rx.recv()
            .map_err(|_| "map callback dropped".to_string())?
            .map_err(|err| err.to_string())?;

        let mapped = slice.get_mapped_range();
        let unpadded = unpadded_bytes_per_row as usize;
        let padded = padded_bytes_per_row as usize;
        let mut out = vec![0_u8; unpadded * height as usize];
        for row in 0..height as usize {
            let src_offset = row * padded;
            let dst_offset = row * unpadded;
            out[dst_offset..dst_offset + unpadded]
                .copy_from_slice(&mapped[src_offset..src_offset + unpadded]);
        }
        drop(mapped);
        readback.unmap();
        Ok(out)
    }

    fn check_target(&self, width: u32, height: u32) -> Result<(), RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidDimensions { width, height });
        }
        let max = self.max_target_dimension();
        if width > max || height > max {
            return Err(RenderError::TargetIncomplete {
                width,
                height,
                reason: format!("device limit is {max}"),
            });
        }
        Ok(())
    }
}

impl Rasterizer for GpuRasterizer {
    fn describe(&self) -> String {
        format!(
            "gpu ({} / {})",
            self.ctx.adapter_name, self.ctx.adapter_backend
        )
    }

    fn max_target_dimension(&self) -> u32 {
        self.ctx.device.limits().max_texture_dimension_2d
    }

    fn upload(&mut self, image: &RasterImage) -> Result<(), RenderError> {
        let (width, height) = image.dimensions();
        self.check_target(width, height)?;
        self.release_texture();

        let ctx = self.ctx;
        let device = &ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("lumen_source"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        ctx.queue.write_texture(
            texture.as_image_copy(),
            image.pixels(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width.saturating_mul(4)),
                rows_per_image: Some(height),
            },
            extent,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lumen_source_bg"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        if let Some(err) = pop_error(device) {
            texture.destroy();
            return Err(RenderError::Upload(err));
        }
        self.source = Some(SourceTexture {
            texture,
            bind_group,
        });
        Ok(())
    }

    fn release_texture(&mut self) {
        if let Some(source) = self.source.take() {
            source.texture.destroy();
        }
    }

    fn draw_viewport(
        &mut self,
        width: u32,
        height: u32,
        params: &DrawParams,
    ) -> Result<RasterImage, RenderError> {
        self.check_target(width, height)?;
        if self.source.is_none() {
            return Err(RenderError::NotInitialized);
        }
        self.ensure_surface(width, height);
        let Some(surface) = self.surface.as_ref() else {
            return Err(RenderError::NotInitialized);
        };
        let ctx = self.ctx;
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = self.render_and_read(&surface.texture, width, height, params, DrawMode::Viewport);
        let scope_error = pop_error(&ctx.device);
        let pixels = match (result, scope_error) {
            (Ok(pixels), None) => pixels,
            (Err(err), _) | (Ok(_), Some(err)) => {
                warn!(%err, "viewport draw failed");
                return Err(RenderError::Readback(err));
            }
        };
        RasterImage::from_rgba8(width, height, pixels)
            .ok_or_else(|| RenderError::Readback("viewport readback size mismatch".into()))
    }

    fn draw_offscreen(
        &mut self,
        width: u32,
        height: u32,
        params: &DrawParams,
    ) -> Result<RasterImage, RenderError> {
        self.check_target(width, height)?;
        if self.source.is_none() {
            return Err(RenderError::NotInitialized);
        }
        let ctx = self.ctx;
        let device = &ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let target = create_target(device, "lumen_offscreen", width, height);
        let result = self.render_and_read(&target, width, height, params, DrawMode::Offscreen);
        let scope_error = pop_error(device);
        target.destroy();
        let pixels = match (result, scope_error) {
            (Ok(pixels), None) => pixels,
            (_, Some(reason)) => {
                return Err(RenderError::TargetIncomplete {
                    width,
                    height,
                    reason,
                });
            }
            (Err(err), None) => return Err(RenderError::Readback(err)),
        };
        RasterImage::from_rgba8(width, height, pixels)
            .ok_or_else(|| RenderError::Readback("offscreen readback size mismatch".into()))
    }
}

impl Drop for GpuRasterizer {
    fn drop(&mut self) {
        self.release_texture();
        if let Some(surface) = self.surface.take() {
            surface.texture.destroy();
        }
    }
}

fn create_target(device: &wgpu::Device, label: &str, width: u32, height: u32) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn create_quad_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    label: &str,
    blend: wgpu::BlendState,
) -> wgpu::RenderPipeline {
    const ATTRIBUTES: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs_main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<Vertex>() as u64,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &ATTRIBUTES,
            }],
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some("fs_main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format: TARGET_FORMAT,
                blend: Some(blend),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        multiview: None,
        cache: None,
    })
}

/// Uniform block, sampled source texture, sampler.
fn quad_layout_entries() -> [wgpu::BindGroupLayoutEntry; 3] {
    [
        wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 2,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        },
    ]
}

const QUAD_SHADER_SRC: &str = r#"
struct Uniforms {
    mvp: mat4x4<f32>,
    filter_mode: u32,
    intensity: f32,
    sweep_pos: f32,
    _pad: f32,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(0) @binding(1) var src_tex: texture_2d<f32>;
@group(0) @binding(2) var src_sampler: sampler;

const LUMA: vec3<f32> = vec3<f32>(0.299, 0.587, 0.114);
const BAND_WIDTH: f32 = 0.1;
const MAX_GLARE: f32 = 0.8;

struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) uv: vec2<f32>) -> VsOut {
    var out: VsOut;
    out.pos = u.mvp * vec4<f32>(position, 0.0, 1.0);
    out.uv = uv;
    return out;
}

fn adjust_saturation(color: vec3<f32>, ratio: f32) -> vec3<f32> {
    let l = dot(color, LUMA);
    return vec3<f32>(l) + ratio * (color - vec3<f32>(l));
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let color = textureSample(src_tex, src_sampler, in.uv);
    var rgb = color.rgb;

    if (u.filter_mode > 0u && u.intensity > 0.0) {
        let gray = dot(color.rgb, LUMA);
        if (u.filter_mode == 1u) {
            rgb = mix(color.rgb, vec3<f32>(gray), u.intensity);
        } else if (u.filter_mode == 2u) {
            rgb = mix(color.rgb, vec3<f32>(gray * 1.2, gray, gray * 0.8), u.intensity);
        } else if (u.filter_mode == 3u) {
            rgb = clamp(adjust_saturation(color.rgb, 1.0 + u.intensity), vec3<f32>(0.0), vec3<f32>(1.0));
        }
    }

    if (u.sweep_pos > 0.0) {
        let dist = abs(in.uv.x - u.sweep_pos);
        let glare = 1.0 - smoothstep(0.0, BAND_WIDTH, dist);
        rgb = rgb * (1.0 + MAX_GLARE * glare);
    }

    return vec4<f32>(rgb, color.a);
}
"#;

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba};

    use super::{GpuRasterizer, debug_fallback_truthy, is_available, runtime_status};
    use crate::error::RenderError;
    use crate::processing::cpu::CpuRasterizer;
    use crate::processing::{DrawParams, Rasterizer, fit_quad};
    use crate::raster::RasterImage;
    use crate::state::{FilterMode, FilterState, IDENTITY, TransformState};

    fn gradient() -> RasterImage {
        RasterImage::from_rgba_image(ImageBuffer::from_fn(24, 16, |x, y| {
            Rgba([(x * 10) as u8, (y * 15) as u8, 128, 255])
        }))
    }

    fn params(mode: FilterMode, intensity: f32) -> DrawParams {
        let mut filter = FilterState::default();
        filter.set_mode(mode);
        filter.set_intensity(intensity);
        DrawParams {
            mvp: IDENTITY,
            half_extent: [1.0, 1.0],
            filter,
            sweep: 0.0,
        }
    }

    #[test]
    fn debug_fallback_truthy_parser_matches_expected_values() {
        assert!(debug_fallback_truthy("1"));
        assert!(debug_fallback_truthy(" true "));
        assert!(debug_fallback_truthy("YES"));
        assert!(debug_fallback_truthy("on"));
        assert!(!debug_fallback_truthy("0"));
        assert!(!debug_fallback_truthy("false"));
        assert!(!debug_fallback_truthy("no"));
    }

    #[test]
    fn unavailable_gpu_reports_why() {
        if is_available() {
            return;
        }
        let status = runtime_status();
        assert!(status.error.is_some());
        assert!(matches!(
            GpuRasterizer::new(),
            Err(RenderError::NoAdapter | RenderError::Device(_))
        ));
    }

    #[test]
    fn parity_matches_cpu_for_filters() {
        if !is_available() {
            return;
        }
        let src = gradient();
        let mut gpu = GpuRasterizer::new().expect("gpu rasterizer should build");
        let mut cpu = CpuRasterizer::new();
        gpu.upload(&src).expect("gpu upload");
        cpu.upload(&src).expect("cpu upload");

        for mode in FilterMode::ALL {
            let p = params(mode, 0.6);
            let g = gpu.draw_offscreen(24, 16, &p).expect("gpu draw");
            let c = cpu.draw_offscreen(24, 16, &p).expect("cpu draw");
            assert_rgba_close(&c, &g, 2);
        }
    }

    #[test]
    fn parity_matches_cpu_for_flip_capture() {
        if !is_available() {
            return;
        }
        let src = gradient();
        let mut gpu = GpuRasterizer::new().expect("gpu rasterizer should build");
        let mut cpu = CpuRasterizer::new();
        gpu.upload(&src).expect("gpu upload");
        cpu.upload(&src).expect("cpu upload");

        let mut t = TransformState::default();
        t.flip_horizontally();
        t.flip_vertically();
        let p = DrawParams {
            mvp: t.offscreen_matrix(),
            ..params(FilterMode::None, 0.0)
        };
        let g = gpu.draw_offscreen(24, 16, &p).expect("gpu draw");
        let c = cpu.draw_offscreen(24, 16, &p).expect("cpu draw");
        assert_rgba_close(&c, &g, 1);
    }

    #[test]
    fn viewport_frame_letterboxes_transparent() {
        if !is_available() {
            return;
        }
        let src = RasterImage::solid(8, 4, [255, 0, 0, 255]);
        let mut gpu = GpuRasterizer::new().expect("gpu rasterizer should build");
        gpu.upload(&src).expect("gpu upload");
        let p = DrawParams {
            half_extent: fit_quad((8, 4), (16, 16)),
            ..params(FilterMode::None, 0.0)
        };
        let frame = gpu.draw_viewport(16, 16, &p).expect("gpu draw");
        assert_eq!(frame.pixel(8, 0)[3], 0);
        assert_eq!(frame.pixel(8, 8), [255, 0, 0, 255]);
    }

    #[test]
    fn oversized_offscreen_target_is_rejected() {
        if !is_available() {
            return;
        }
        let mut gpu = GpuRasterizer::new().expect("gpu rasterizer should build");
        gpu.upload(&RasterImage::solid(2, 2, [0, 0, 0, 255]))
            .expect("gpu upload");
        let too_big = gpu.max_target_dimension() + 1;
        assert!(
            gpu.draw_offscreen(too_big, 1, &params(FilterMode::None, 0.0))
                .is_err()
        );
    }

    fn assert_rgba_close(cpu: &RasterImage, gpu: &RasterImage, tolerance: u8) {
        assert_eq!(cpu.dimensions(), gpu.dimensions());
        for (i, (c, g)) in cpu.pixels().iter().zip(gpu.pixels()).enumerate() {
            let d = c.abs_diff(*g);
            assert!(
                d <= tolerance,
                "byte {} differed by {} (cpu={}, gpu={}, tol={})",
                i,
                d,
                c,
                g,
                tolerance
            );
        }
    }
}
