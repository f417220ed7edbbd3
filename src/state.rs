use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Column-major 4x4 matrix, laid out the way WGSL `mat4x4<f32>` expects.
pub type Mat4 = [[f32; 4]; 4];

pub const IDENTITY: Mat4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

pub fn mat_mul(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [[0.0_f32; 4]; 4];
    for (col, out_col) in out.iter_mut().enumerate() {
        for (row, cell) in out_col.iter_mut().enumerate() {
            *cell = (0..4).map(|k| a[k][row] * b[col][k]).sum();
        }
    }
    out
}

/// Orthographic projection over the given clip box.
pub fn ortho(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
    let mut m = IDENTITY;
    m[0][0] = 2.0 / (right - left);
    m[1][1] = 2.0 / (top - bottom);
    m[2][2] = -2.0 / (far - near);
    m[3][0] = -(right + left) / (right - left);
    m[3][1] = -(top + bottom) / (top - bottom);
    m[3][2] = -(far + near) / (far - near);
    m
}

/// Maps a 2D point through `m`, ignoring z.
#[cfg(test)]
pub fn transform_point(m: &Mat4, x: f32, y: f32) -> (f32, f32) {
    (
        m[0][0] * x + m[1][0] * y + m[3][0],
        m[0][1] * x + m[1][1] * y + m[3][1],
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleBounds {
    pub min: f32,
    pub max: f32,
}

impl Default for ScaleBounds {
    fn default() -> Self {
        Self { min: 0.1, max: 5.0 }
    }
}

impl ScaleBounds {
    pub fn clamp(&self, v: f32) -> f32 {
        v.clamp(self.min, self.max)
    }
}

/// Interactive geometry of the live view.
///
/// The model matrix is never stored: both the live and the offscreen matrix
/// are derived from these fields, so the flip flags cannot disagree with what
/// is drawn. Live model = T(offset) * S(scale) * F(flip).
#[derive(Clone, Debug, PartialEq)]
pub struct TransformState {
    scale: [f32; 2],
    offset: [f32; 2],
    translation: [f32; 2],
    flip_x: bool,
    flip_y: bool,
    bounds: ScaleBounds,
}

impl Default for TransformState {
    fn default() -> Self {
        Self::with_bounds(ScaleBounds::default())
    }
}

impl TransformState {
    pub fn with_bounds(bounds: ScaleBounds) -> Self {
        Self {
            scale: [1.0, 1.0],
            offset: [0.0, 0.0],
            translation: [0.0, 0.0],
            flip_x: false,
            flip_y: false,
            bounds,
        }
    }

    pub fn scale(&self) -> (f32, f32) {
        (self.scale[0], self.scale[1])
    }

    /// Accumulated pan in normalized device units.
    pub fn translation(&self) -> (f32, f32) {
        (self.translation[0], self.translation[1])
    }

    pub fn is_flipped_h(&self) -> bool {
        self.flip_x
    }

    pub fn is_flipped_v(&self) -> bool {
        self.flip_y
    }

    fn flip_signs(&self) -> [f32; 2] {
        [
            if self.flip_x { -1.0 } else { 1.0 },
            if self.flip_y { -1.0 } else { 1.0 },
        ]
    }

    /// Scales by `factor` about a focus point given in model space (NDC at
    /// identity). Each axis is clamped independently. Returns `false` and
    /// leaves the state untouched when clamping yields the current scale.
    pub fn scale_about(&mut self, factor: f32, focus: (f32, f32)) -> bool {
        if !factor.is_finite() || factor <= 0.0 {
            return false;
        }
        let next = [
            self.bounds.clamp(self.scale[0] * factor),
            self.bounds.clamp(self.scale[1] * factor),
        ];
        if next == self.scale {
            return false;
        }
        let k = [next[0] / self.scale[0], next[1] / self.scale[1]];
        let f = self.flip_signs();
        let focus = [focus.0, focus.1];
        for axis in 0..2 {
            self.offset[axis] += self.scale[axis] * f[axis] * focus[axis] * (1.0 - k[axis]);
        }
        self.scale = next;
        true
    }

    /// Pans by `delta` in model space. The delta is not divided by the
    /// current scale here; callers that want 1:1 drag tracking pre-divide.
    pub fn translate(&mut self, delta: (f32, f32)) {
        let f = self.flip_signs();
        self.offset[0] += self.scale[0] * f[0] * delta.0;
        self.offset[1] += self.scale[1] * f[1] * delta.1;
        self.translation[0] += delta.0;
        self.translation[1] += delta.1;
    }

    pub fn flip_horizontally(&mut self) {
        self.flip_x = !self.flip_x;
    }

    pub fn flip_vertically(&mut self) {
        self.flip_y = !self.flip_y;
    }

    pub fn reset_flips(&mut self) {
        self.flip_x = false;
        self.flip_y = false;
    }

    pub fn reset(&mut self) {
        *self = Self::with_bounds(self.bounds);
    }

    /// Matrix used for on-screen drawing.
    pub fn live_matrix(&self) -> Mat4 {
        let f = self.flip_signs();
        let mut m = IDENTITY;
        m[0][0] = self.scale[0] * f[0];
        m[1][1] = self.scale[1] * f[1];
        m[3][0] = self.offset[0];
        m[3][1] = self.offset[1];
        m
    }

    /// Matrix used for full-bleed capture: flips only, no pan or zoom.
    pub fn offscreen_matrix(&self) -> Mat4 {
        let f = self.flip_signs();
        let mut m = IDENTITY;
        m[0][0] = f[0];
        m[1][1] = f[1];
        m
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterMode {
    #[default]
    None,
    Grayscale,
    Sepia,
    Saturation,
}

impl FilterMode {
    pub const ALL: [FilterMode; 3] = [
        FilterMode::Grayscale,
        FilterMode::Sepia,
        FilterMode::Saturation,
    ];

    /// Value of the `filter_mode` shader uniform.
    pub fn shader_code(self) -> u32 {
        match self {
            FilterMode::None => 0,
            FilterMode::Grayscale => 1,
            FilterMode::Sepia => 2,
            FilterMode::Saturation => 3,
        }
    }

    /// Intensity applied when the mode is first selected.
    pub fn default_intensity(self) -> f32 {
        match self {
            FilterMode::None => 0.0,
            FilterMode::Saturation => 0.5,
            _ => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FilterMode::None => "None",
            FilterMode::Grayscale => "Grayscale",
            FilterMode::Sepia => "Sepia",
            FilterMode::Saturation => "Saturation",
        }
    }
}

/// Live filter parameters. `mode == None` always implies `intensity == 0`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FilterState {
    mode: FilterMode,
    intensity: f32,
}

impl FilterState {
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn set_mode(&mut self, mode: FilterMode) {
        self.mode = mode;
        if mode == FilterMode::None {
            self.intensity = 0.0;
        }
    }

    pub fn set_intensity(&mut self, intensity: f32) {
        if self.mode == FilterMode::None {
            self.intensity = 0.0;
            return;
        }
        self.intensity = if intensity.is_finite() {
            intensity.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_active(&self) -> bool {
        self.mode != FilterMode::None && self.intensity > 0.0
    }
}

pub const SWEEP_START: f32 = -0.2;
pub const SWEEP_END: f32 = 1.2;
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_millis(1500);

/// Repeating linear sweep of the light band across the image.
#[derive(Clone, Debug)]
pub struct SweepAnimation {
    period: Duration,
    started_at: Option<Instant>,
}

impl Default for SweepAnimation {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_PERIOD)
    }
}

impl SweepAnimation {
    pub fn new(period: Duration) -> Self {
        let period = if period.is_zero() {
            DEFAULT_SWEEP_PERIOD
        } else {
            period
        };
        Self {
            period,
            started_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn start(&mut self, now: Instant) {
        self.started_at = Some(now);
    }

    pub fn stop(&mut self) {
        self.started_at = None;
    }

    /// Sweep position at `now`, or `None` when the animation is stopped.
    pub fn position_at(&self, now: Instant) -> Option<f32> {
        let started = self.started_at?;
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        let t = (elapsed % self.period.as_secs_f64()) / self.period.as_secs_f64();
        Some(SWEEP_START + (SWEEP_END - SWEEP_START) * t as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn scale_then_inverse_restores_scale() {
        let mut t = TransformState::default();
        assert!(t.scale_about(2.0, (0.3, -0.4)));
        assert!(t.scale_about(0.5, (0.3, -0.4)));
        let (sx, sy) = t.scale();
        assert!(approx(sx, 1.0) && approx(sy, 1.0));
        let m = t.live_matrix();
        assert!(approx(m[3][0], 0.0) && approx(m[3][1], 0.0));
    }

    #[test]
    fn clamped_scale_is_idempotent() {
        let mut t = TransformState::default();
        assert!(t.scale_about(100.0, (0.0, 0.0)));
        assert_eq!(t.scale(), (5.0, 5.0));
        let before = t.live_matrix();
        assert!(!t.scale_about(100.0, (0.5, 0.5)));
        assert_eq!(t.live_matrix(), before);

        assert!(t.scale_about(0.0001, (0.0, 0.0)));
        assert_eq!(t.scale(), (0.1, 0.1));
    }

    #[test]
    fn scale_keeps_focus_point_fixed() {
        let mut t = TransformState::default();
        t.translate((0.2, 0.1));
        let focus = (0.5, -0.25);
        let before = transform_point(&t.live_matrix(), focus.0, focus.1);
        t.scale_about(1.7, focus);
        let after = transform_point(&t.live_matrix(), focus.0, focus.1);
        assert!(approx(before.0, after.0) && approx(before.1, after.1));
    }

    #[test]
    fn scale_keeps_focus_fixed_when_flipped() {
        let mut t = TransformState::default();
        t.flip_horizontally();
        let focus = (0.4, 0.4);
        let before = transform_point(&t.live_matrix(), focus.0, focus.1);
        t.scale_about(2.0, focus);
        let after = transform_point(&t.live_matrix(), focus.0, focus.1);
        assert!(approx(before.0, after.0) && approx(before.1, after.1));
    }

    #[test]
    fn double_flip_is_identity() {
        let mut t = TransformState::default();
        t.flip_horizontally();
        assert!(t.is_flipped_h());
        assert_eq!(t.live_matrix()[0][0], -1.0);
        t.flip_horizontally();
        assert!(!t.is_flipped_h());
        assert_eq!(t.live_matrix(), IDENTITY);
    }

    #[test]
    fn flips_are_independent() {
        let mut t = TransformState::default();
        t.flip_vertically();
        assert!(!t.is_flipped_h());
        assert!(t.is_flipped_v());
        let m = t.offscreen_matrix();
        assert_eq!(m[0][0], 1.0);
        assert_eq!(m[1][1], -1.0);
    }

    #[test]
    fn offscreen_matrix_ignores_pan_and_zoom() {
        let mut t = TransformState::default();
        t.scale_about(3.0, (0.2, 0.2));
        t.translate((0.5, 0.5));
        t.flip_horizontally();
        let m = t.offscreen_matrix();
        assert_eq!(m[0][0], -1.0);
        assert_eq!(m[1][1], 1.0);
        assert_eq!(m[3][0], 0.0);
        assert_eq!(m[3][1], 0.0);
    }

    #[test]
    fn reset_restores_identity() {
        let mut t = TransformState::default();
        t.scale_about(2.5, (0.1, 0.9));
        t.translate((0.3, -0.2));
        t.flip_horizontally();
        t.flip_vertically();
        t.reset();
        assert_eq!(t.scale(), (1.0, 1.0));
        assert_eq!(t.translation(), (0.0, 0.0));
        assert!(!t.is_flipped_h() && !t.is_flipped_v());
        assert_eq!(t.live_matrix(), IDENTITY);
    }

    #[test]
    fn translation_accumulates_model_space_delta() {
        let mut t = TransformState::default();
        t.scale_about(2.0, (0.0, 0.0));
        t.translate((0.25, -0.5));
        assert_eq!(t.translation(), (0.25, -0.5));
        let m = t.live_matrix();
        assert!(approx(m[3][0], 0.5) && approx(m[3][1], -1.0));
    }

    #[test]
    fn mat_mul_composes_translate_and_scale() {
        let mut tr = IDENTITY;
        tr[3][0] = 1.0;
        let mut sc = IDENTITY;
        sc[0][0] = 2.0;
        let m = mat_mul(&tr, &sc);
        assert_eq!(transform_point(&m, 1.0, 0.0), (3.0, 0.0));
    }

    #[test]
    fn ortho_unit_box_keeps_xy() {
        let p = ortho(-1.0, 1.0, -1.0, 1.0, -1.0, 1.0);
        assert_eq!(transform_point(&p, 0.3, -0.7), (0.3, -0.7));
    }

    #[test]
    fn none_filter_forces_zero_intensity() {
        let mut f = FilterState::default();
        f.set_intensity(0.8);
        assert_eq!(f.intensity(), 0.0);
        f.set_mode(FilterMode::Sepia);
        f.set_intensity(1.7);
        assert_eq!(f.intensity(), 1.0);
        f.set_mode(FilterMode::None);
        assert_eq!(f.intensity(), 0.0);
        assert!(!f.is_active());
    }

    #[test]
    fn default_intensity_depends_on_mode() {
        assert_eq!(FilterMode::Saturation.default_intensity(), 0.5);
        assert_eq!(FilterMode::Grayscale.default_intensity(), 1.0);
        assert_eq!(FilterMode::Sepia.default_intensity(), 1.0);
    }

    #[test]
    fn sweep_position_wraps_over_period() {
        let mut anim = SweepAnimation::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        assert_eq!(anim.position_at(t0), None);
        anim.start(t0);
        assert!(approx(anim.position_at(t0).unwrap_or(f32::NAN), SWEEP_START));
        let mid = anim
            .position_at(t0 + Duration::from_millis(500))
            .unwrap_or(f32::NAN);
        assert!(approx(mid, 0.5));
        let wrapped = anim
            .position_at(t0 + Duration::from_millis(1250))
            .unwrap_or(f32::NAN);
        assert!(approx(wrapped, SWEEP_START + 1.4 * 0.25));
        anim.stop();
        assert!(!anim.is_active());
    }
}
