use thiserror::Error;

/// Failures while turning a source stream into a `RasterImage`.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image stream is empty")]
    Empty,
    #[error("media type {0} cannot be edited")]
    Unsupported(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to read image stream: {0}")]
    Io(#[from] std::io::Error),
}

/// GPU-level failures. These never cross the Surface Host boundary as-is:
/// the host turns them into failed capture results or a failed-init event.
#[derive(Clone, Debug, Error)]
pub enum RenderError {
    #[error("no compatible GPU adapter")]
    NoAdapter,
    #[error("failed to create GPU device: {0}")]
    Device(String),
    #[error("shader program failed to build: {0}")]
    ShaderCompile(String),
    #[error("offscreen target {width}x{height} is incomplete: {reason}")]
    TargetIncomplete {
        width: u32,
        height: u32,
        reason: String,
    },
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("texture upload failed: {0}")]
    Upload(String),
    #[error("pixel readback failed: {0}")]
    Readback(String),
    #[error("renderer is not initialized")]
    NotInitialized,
}
