use std::time::{Duration, Instant};

use tracing::trace;

use crate::state::ScaleBounds;

const DOUBLE_TAP_WINDOW: Duration = Duration::from_millis(300);
const DOUBLE_TAP_SLOP: f32 = 24.0;

/// Raw pointer input in view pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PointerEvent {
    /// First pointer touches down.
    Down { x: f32, y: f32 },
    /// An additional pointer touches down.
    PointerDown,
    Move { x: f32, y: f32, pointers: usize },
    /// A secondary pointer lifts; `x, y` is the remaining primary pointer.
    PointerUp { x: f32, y: f32 },
    Up,
    Cancel,
    PinchStart,
    Pinch { factor: f32, focus_x: f32, focus_y: f32 },
    PinchEnd,
    Tap { x: f32, y: f32, at: Instant },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GestureSignal {
    Scale { factor: f32, focus_x: f32, focus_y: f32 },
    Translate { dx: f32, dy: f32 },
    DoubleTap,
}

/// Turns pointer input into scale, translate and double-tap signals.
///
/// Drag deltas are divided by the interpreter's own running scale estimate so
/// that on-screen motion tracks the finger at any zoom level.
#[derive(Debug)]
pub struct GestureInterpreter {
    current_scale: f32,
    bounds: ScaleBounds,
    last: (f32, f32),
    dragging: bool,
    pinching: bool,
    last_tap: Option<(Instant, f32, f32)>,
}

impl Default for GestureInterpreter {
    fn default() -> Self {
        Self::new(ScaleBounds::default())
    }
}

impl GestureInterpreter {
    pub fn new(bounds: ScaleBounds) -> Self {
        Self {
            current_scale: 1.0,
            bounds,
            last: (0.0, 0.0),
            dragging: false,
            pinching: false,
            last_tap: None,
        }
    }

    #[cfg(test)]
    pub fn current_scale(&self) -> f32 {
        self.current_scale
    }

    pub fn reset_scale(&mut self) {
        self.current_scale = 1.0;
    }

    pub fn handle(&mut self, event: PointerEvent) -> Option<GestureSignal> {
        match event {
            PointerEvent::Down { x, y } => {
                self.last = (x, y);
                self.dragging = true;
                None
            }
            PointerEvent::PointerDown => {
                self.dragging = false;
                None
            }
            PointerEvent::Move { x, y, pointers } => {
                if self.pinching || !self.dragging || pointers != 1 {
                    return None;
                }
                let dx = (x - self.last.0) / self.current_scale;
                let dy = (y - self.last.1) / self.current_scale;
                self.last = (x, y);
                if dx == 0.0 && dy == 0.0 {
                    return None;
                }
                trace!(dx, dy, "drag");
                Some(GestureSignal::Translate { dx, dy })
            }
            PointerEvent::PointerUp { x, y } => {
                self.dragging = true;
                self.last = (x, y);
                None
            }
            PointerEvent::Up | PointerEvent::Cancel => {
                self.dragging = false;
                None
            }
            PointerEvent::PinchStart => {
                self.pinching = true;
                None
            }
            PointerEvent::Pinch {
                factor,
                focus_x,
                focus_y,
            } => {
                if !factor.is_finite() || factor <= 0.0 {
                    return None;
                }
                self.pinching = true;
                self.current_scale = self.bounds.clamp(self.current_scale * factor);
                trace!(factor, scale = self.current_scale, "pinch");
                Some(GestureSignal::Scale {
                    factor,
                    focus_x,
                    focus_y,
                })
            }
            PointerEvent::PinchEnd => {
                self.pinching = false;
                None
            }
            PointerEvent::Tap { x, y, at } => {
                if let Some((prev_at, px, py)) = self.last_tap.take() {
                    let close = (x - px).hypot(y - py) <= DOUBLE_TAP_SLOP;
                    if close && at.saturating_duration_since(prev_at) <= DOUBLE_TAP_WINDOW {
                        self.reset_scale();
                        return Some(GestureSignal::DoubleTap);
                    }
                }
                self.last_tap = Some((at, x, y));
                None
            }
        }
    }
}
