use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::warn;

use crate::{
    config::AppConfig,
    gesture::PointerEvent,
    host::SurfaceHost,
    persist::FileSink,
    processing::RenderBackend,
    session::{EditSession, FlipAxis, Mode, Submenu},
    state::{FilterMode, SweepAnimation},
};

const EFFECT_FRAME: Duration = Duration::from_millis(16);
const NOTICE_TTL: Duration = Duration::from_secs(4);
const EXIT_SAVE_WAIT: Duration = Duration::from_secs(5);

pub struct LumenApp {
    session: EditSession,
    config: AppConfig,
    path_input: String,
    texture: Option<egui::TextureHandle>,
    viewport: (u32, u32),
    pinching: bool,
    touches: usize,
    status: Option<(String, Instant)>,
    intensity: f32,
}

impl LumenApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        config: AppConfig,
        backend: RenderBackend,
    ) -> anyhow::Result<Self> {
        let ctx = cc.egui_ctx.clone();
        let host_ctx = ctx.clone();
        let host = SurfaceHost::spawn(
            backend.factory(),
            config.scale_bounds(),
            SweepAnimation::new(config.sweep_period()),
            move || host_ctx.request_repaint(),
        )?;
        let sink = FileSink::new(config.output_dir(), config.output_format());
        let session = EditSession::new(
            host,
            Arc::new(sink),
            config.history_capacity(),
            move || ctx.request_repaint(),
        );

        let mut app = Self {
            session,
            path_input: config
                .last_image
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            config,
            texture: None,
            viewport: (0, 0),
            pinching: false,
            touches: 1,
            status: None,
            intensity: 1.0,
        };
        if let Some(path) = app.config.last_image.clone() {
            if path.is_file() {
                app.open(&path);
            }
        }
        Ok(app)
    }

    fn open(&mut self, path: &Path) {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot open image");
                self.show_status(format!("Cannot open {}: {err}", path.display()));
                return;
            }
        };
        self.texture = None;
        self.session
            .load_image(BufReader::new(file), media_type_for(path));
        self.config.last_image = Some(path.to_path_buf());
    }

    fn show_status(&mut self, text: String) {
        self.status = Some((text, Instant::now()));
    }

    fn toolbar(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            ui.add(
                egui::TextEdit::singleline(&mut self.path_input)
                    .hint_text("Image path")
                    .desired_width(260.0)
                    .font(egui::TextStyle::Monospace),
            );
            if ui.button("Open").clicked() {
                let path = expand_home_prefix(self.path_input.trim());
                self.open(&path);
            }
            ui.separator();

            let editing = self.session.mode() == Mode::Editing;
            if ui
                .add_enabled(self.session.undo_available(), egui::Button::new("Undo"))
                .clicked()
            {
                self.session.undo();
            }
            if ui
                .add_enabled(self.session.redo_available(), egui::Button::new("Redo"))
                .clicked()
            {
                self.session.redo();
            }
            ui.add_enabled_ui(editing, |ui| {
                let submenu = self.session.submenu();
                if ui
                    .selectable_label(submenu == Submenu::Flip, "Flip")
                    .clicked()
                {
                    self.session.open_flip_menu();
                }
                if ui
                    .selectable_label(submenu == Submenu::Filter, "Filter")
                    .clicked()
                {
                    self.session.open_filter_menu();
                }
                if ui
                    .selectable_label(self.session.is_effect_running(), "Effect")
                    .clicked()
                {
                    self.session.toggle_effect();
                }
                if ui.button("Reset").clicked() {
                    self.session.reset();
                }
                let gestures = if self.session.gestures_enabled() {
                    "Gestures: on"
                } else {
                    "Gestures: off"
                };
                if ui.button(gestures).clicked() {
                    self.session.toggle_gestures();
                }
                if ui.button("Status").clicked() {
                    let status = self.session.status();
                    self.show_status(status);
                }
                if ui.button("Save").clicked() {
                    self.session.save();
                }
            });
        });
    }

    fn submenu_bar(&mut self, ui: &mut egui::Ui) {
        match self.session.submenu() {
            Submenu::None => {}
            Submenu::Flip => {
                ui.horizontal(|ui| {
                    if ui.button("↔ Horizontal").clicked() {
                        self.session.toggle_flip(FlipAxis::Horizontal);
                    }
                    if ui.button("↕ Vertical").clicked() {
                        self.session.toggle_flip(FlipAxis::Vertical);
                    }
                    ui.separator();
                    confirm_cancel(ui, &mut self.session);
                });
            }
            Submenu::Filter => {
                ui.horizontal(|ui| {
                    let current = self.session.filter();
                    for mode in FilterMode::ALL {
                        if ui
                            .selectable_label(current.mode() == mode, mode.label())
                            .clicked()
                        {
                            self.session.select_filter(mode);
                            self.intensity = mode.default_intensity();
                        }
                    }
                    ui.separator();
                    ui.label("Intensity");
                    let slider = egui::Slider::new(&mut self.intensity, 0.0_f32..=1.0_f32)
                        .custom_formatter(|v, _| format!("{:.0}%", v * 100.0))
                        .clamping(egui::SliderClamping::Always);
                    let enabled = current.mode() != FilterMode::None;
                    if ui.add_enabled(enabled, slider).changed() {
                        self.session.set_filter_intensity(self.intensity);
                    }
                    ui.separator();
                    confirm_cancel(ui, &mut self.session);
                });
            }
        }
    }

    fn canvas(&mut self, ui: &mut egui::Ui) {
        let rect = ui.available_rect_before_wrap();
        let response = ui.allocate_rect(rect, egui::Sense::click_and_drag());
        let ppp = ui.ctx().pixels_per_point();
        let viewport = (
            (rect.width() * ppp).round().max(1.0) as u32,
            (rect.height() * ppp).round().max(1.0) as u32,
        );
        if viewport != self.viewport {
            self.viewport = viewport;
            self.session.set_viewport(viewport.0, viewport.1);
        }

        if let Some(frame) = self.session.take_frame() {
            let image = egui::ColorImage::from_rgba_premultiplied(
                [frame.width() as usize, frame.height() as usize],
                frame.pixels(),
            );
            if let Some(texture) = self.texture.as_mut() {
                texture.set(image, egui::TextureOptions::LINEAR);
            } else {
                self.texture = Some(ui.ctx().load_texture(
                    "lumen_frame",
                    image,
                    egui::TextureOptions::LINEAR,
                ));
            }
        }
        if let Some(texture) = &self.texture {
            ui.painter().image(
                texture.id(),
                rect,
                egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                egui::Color32::WHITE,
            );
        } else if let Some(err) = self.session.renderer_error() {
            ui.painter().text(
                rect.center(),
                egui::Align2::CENTER_CENTER,
                format!("Renderer unavailable: {err}"),
                egui::FontId::proportional(16.0),
                ui.visuals().error_fg_color,
            );
        }

        for event in pointer_events(
            ui.ctx(),
            &response,
            rect,
            ppp,
            &mut self.pinching,
            &mut self.touches,
        ) {
            self.session.on_pointer(event);
        }
    }
}

fn confirm_cancel(ui: &mut egui::Ui, session: &mut EditSession) {
    if ui.button("✔ Confirm").clicked() {
        session.confirm_submenu();
    }
    if ui.button("✖ Cancel").clicked() {
        session.cancel_submenu();
    }
}

/// Maps egui input over the canvas onto the gesture event model, in
/// viewport pixels relative to the canvas origin.
fn pointer_events(
    ctx: &egui::Context,
    response: &egui::Response,
    rect: egui::Rect,
    ppp: f32,
    pinching: &mut bool,
    last_touches: &mut usize,
) -> Vec<PointerEvent> {
    let local = |pos: egui::Pos2| ((pos.x - rect.min.x) * ppp, (pos.y - rect.min.y) * ppp);
    let mut events = Vec::new();
    let (zoom, touches, cancelled) = ctx.input(|i| {
        (
            i.zoom_delta(),
            i.multi_touch().map(|t| t.num_touches).unwrap_or(1),
            i.events.iter().any(|e| {
                matches!(
                    e,
                    egui::Event::PointerGone
                        | egui::Event::Touch {
                            phase: egui::TouchPhase::Cancel,
                            ..
                        }
                )
            }),
        )
    });

    if cancelled {
        events.push(PointerEvent::Cancel);
    }
    if touches > *last_touches {
        events.push(PointerEvent::PointerDown);
    } else if touches < *last_touches {
        // The finger left behind keeps dragging from where it is now.
        if let Some(pos) = response.interact_pointer_pos().map(local) {
            events.push(PointerEvent::PointerUp { x: pos.0, y: pos.1 });
        }
    }
    *last_touches = touches;

    if response.hovered() && zoom != 1.0 {
        if !*pinching {
            *pinching = true;
            events.push(PointerEvent::PinchStart);
        }
        let focus = response
            .hover_pos()
            .map(local)
            .unwrap_or((rect.width() * ppp / 2.0, rect.height() * ppp / 2.0));
        events.push(PointerEvent::Pinch {
            factor: zoom,
            focus_x: focus.0,
            focus_y: focus.1,
        });
    } else if *pinching {
        *pinching = false;
        events.push(PointerEvent::PinchEnd);
    }

    if let Some(pos) = response.interact_pointer_pos().map(local) {
        if response.drag_started() {
            events.push(PointerEvent::Down { x: pos.0, y: pos.1 });
        }
        if response.dragged() {
            events.push(PointerEvent::Move {
                x: pos.0,
                y: pos.1,
                pointers: touches,
            });
        }
        if response.clicked() {
            events.push(PointerEvent::Tap {
                x: pos.0,
                y: pos.1,
                at: Instant::now(),
            });
        }
    }
    if response.drag_stopped() {
        events.push(PointerEvent::Up);
    }
    events
}

fn media_type_for(path: &Path) -> &'static str {
    image::ImageFormat::from_path(path)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

fn expand_home_prefix(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

impl eframe::App for LumenApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Track window size for saving on exit
        if let Some(rect) = ctx.input(|i| i.viewport().inner_rect) {
            self.config.window_width = Some(rect.width());
            self.config.window_height = Some(rect.height());
        }

        self.session.poll();
        if let Some(notice) = self.session.take_notices().pop() {
            self.show_status(notice.to_string());
        }
        if self.session.is_effect_running() && self.session.tick(Instant::now()) {
            ctx.request_repaint_after(EFFECT_FRAME);
        }

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            self.toolbar(ui);
            self.submenu_bar(ui);
        });

        egui::TopBottomPanel::bottom("status_bar").show(ctx, |ui| {
            match &self.status {
                Some((text, at)) if at.elapsed() < NOTICE_TTL => {
                    ui.label(text);
                    ctx.request_repaint_after(NOTICE_TTL.saturating_sub(at.elapsed()));
                }
                _ => {
                    let mut line = self.session.status();
                    if let Some(image) = self.session.current_image() {
                        line.push_str(&format!(", image: {}×{}", image.width(), image.height()));
                    }
                    ui.label(egui::RichText::new(line).weak());
                }
            }
        });

        egui::CentralPanel::default()
            .frame(egui::Frame::default())
            .show(ctx, |ui| match self.session.mode() {
                Mode::Empty => {
                    ui.centered_and_justified(|ui| {
                        ui.label("Open an image to start editing");
                    });
                }
                Mode::Fallback => {
                    if let Some(viewer) = self.session.fallback_mut() {
                        viewer.show(ui);
                    }
                }
                Mode::Editing => self.canvas(ui),
            });
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        self.session.finish(EXIT_SAVE_WAIT);
        self.config.save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_follows_extension() {
        assert_eq!(media_type_for(Path::new("a/photo.JPG")), "image/jpeg");
        assert_eq!(media_type_for(Path::new("b.png")), "image/png");
        assert_eq!(
            media_type_for(Path::new("notes.txt")),
            "application/octet-stream"
        );
    }

    #[test]
    fn home_prefix_is_expanded() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_home_prefix("~/pics/a.png"), home.join("pics/a.png"));
        assert_eq!(expand_home_prefix("/tmp/a.png"), PathBuf::from("/tmp/a.png"));
    }
}
