mod app;
mod config;
mod error;
mod gesture;
mod history;
mod host;
mod persist;
mod processing;
mod raster;
mod session;
mod state;
mod viewer;

use app::LumenApp;
use config::AppConfig;
use processing::RenderBackend;

const RENDER_BACKEND_ENV: &str = "LUMEN_RENDER_BACKEND";

fn parse_render_backend(value: &str) -> RenderBackend {
    match value.trim().to_ascii_lowercase().as_str() {
        "cpu" => RenderBackend::Cpu,
        "gpu" | "wgpu" => RenderBackend::Gpu,
        _ => RenderBackend::Auto,
    }
}

fn resolve_render_backend(config: &AppConfig) -> RenderBackend {
    if let Ok(raw) = std::env::var(RENDER_BACKEND_ENV) {
        return parse_render_backend(&raw);
    }
    if let Some(raw) = config.render_backend.as_deref() {
        return parse_render_backend(raw);
    }
    RenderBackend::Auto
}

/// The software rasterizer is a debug aid; without the opt-in, `cpu` and
/// `auto` both mean the GPU renderer.
fn effective_render_backend(
    requested: RenderBackend,
    allow_debug_cpu_fallback: bool,
) -> RenderBackend {
    if allow_debug_cpu_fallback {
        requested
    } else {
        RenderBackend::Gpu
    }
}

fn report_render_backend(backend: RenderBackend) {
    let status = processing::gpu_pipeline::runtime_status();
    let adapter_desc = match (
        status.adapter_name.as_deref(),
        status.adapter_backend.as_deref(),
    ) {
        (Some(name), Some(api)) => format!(
            "{} ({}, driver {}, vendor 0x{:04x}, max texture {})",
            name,
            api,
            status.adapter_driver.as_deref().unwrap_or("unknown"),
            status.adapter_vendor_id.unwrap_or_default(),
            processing::gpu_pipeline::max_texture_dimension()
        ),
        (Some(name), None) => name.to_string(),
        _ => "n/a".to_string(),
    };
    let reason = status.error.as_deref().unwrap_or("unknown reason");
    match backend {
        RenderBackend::Cpu => {
            eprintln!("lumen: render backend = cpu (debug fallback mode)");
        }
        RenderBackend::Auto => {
            if status.available {
                eprintln!("lumen: render backend = auto (gpu active on {})", adapter_desc);
            } else {
                eprintln!(
                    "lumen: render backend = auto (gpu unavailable: {}; debug cpu fallback)",
                    reason
                );
            }
        }
        RenderBackend::Gpu => {
            if status.available {
                eprintln!("lumen: render backend = gpu ({})", adapter_desc);
            } else {
                eprintln!(
                    "lumen: render backend = gpu requested, but gpu unavailable ({}); editing disabled",
                    reason
                );
            }
        }
    }
}

fn main() -> eframe::Result {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load();
    let requested = resolve_render_backend(&config);
    let allow_debug_cpu_fallback = processing::gpu_pipeline::allow_debug_cpu_fallback();
    let backend = effective_render_backend(requested, allow_debug_cpu_fallback);
    if requested == RenderBackend::Cpu && backend != RenderBackend::Cpu {
        eprintln!(
            "lumen: cpu backend requires {}=1; using gpu",
            processing::gpu_pipeline::DEBUG_ALLOW_CPU_FALLBACK_ENV
        );
    }
    report_render_backend(backend);

    let width = config.window_width.unwrap_or(1200.0);
    let height = config.window_height.unwrap_or(800.0);

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Lumen")
            .with_app_id("lumen")
            .with_inner_size([width, height]),
        ..Default::default()
    };

    eframe::run_native(
        "lumen",
        native_options,
        Box::new(move |cc| {
            let app = LumenApp::new(cc, config, backend)?;
            Ok(Box::new(app))
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::{effective_render_backend, parse_render_backend};
    use crate::processing::RenderBackend;

    #[test]
    fn parse_render_backend_handles_supported_values() {
        assert_eq!(parse_render_backend("cpu"), RenderBackend::Cpu);
        assert_eq!(parse_render_backend(" GPU "), RenderBackend::Gpu);
        assert_eq!(parse_render_backend("wgpu"), RenderBackend::Gpu);
        assert_eq!(parse_render_backend("auto"), RenderBackend::Auto);
    }

    #[test]
    fn parse_render_backend_defaults_to_auto_for_unknown_values() {
        assert_eq!(parse_render_backend("vulkan-please"), RenderBackend::Auto);
    }

    #[test]
    fn cpu_backends_require_debug_fallback_flag() {
        assert_eq!(
            effective_render_backend(RenderBackend::Cpu, false),
            RenderBackend::Gpu
        );
        assert_eq!(
            effective_render_backend(RenderBackend::Auto, false),
            RenderBackend::Gpu
        );
        assert_eq!(
            effective_render_backend(RenderBackend::Cpu, true),
            RenderBackend::Cpu
        );
        assert_eq!(
            effective_render_backend(RenderBackend::Auto, true),
            RenderBackend::Auto
        );
    }
}
