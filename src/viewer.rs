use crate::raster::RasterImage;

/// Centered best-fit placement of a bitmap inside a view, in view pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fit {
    pub scale: f32,
    pub offset: (f32, f32),
}

impl Default for Fit {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: (0.0, 0.0),
        }
    }
}

/// Scale to fit both axes, never upscaled past 1:1, then centered.
pub fn best_fit(image: (u32, u32), view: (f32, f32)) -> Fit {
    let (iw, ih) = (image.0 as f32, image.1 as f32);
    if iw <= 0.0 || ih <= 0.0 || view.0 <= 0.0 || view.1 <= 0.0 {
        return Fit::default();
    }
    let scale = (view.0 / iw).min(view.1 / ih).min(1.0);
    Fit {
        scale,
        offset: ((view.0 - iw * scale) / 2.0, (view.1 - ih * scale) / 2.0),
    }
}

/// Non-GPU display path used when an image cannot be edited. Shows a bitmap
/// and nothing else.
#[derive(Default)]
pub struct FallbackViewer {
    image: Option<RasterImage>,
    texture: Option<egui::TextureHandle>,
    view: (f32, f32),
    fit: Fit,
}

impl FallbackViewer {
    pub fn new(image: Option<RasterImage>) -> Self {
        Self {
            image,
            ..Default::default()
        }
    }

    pub fn image(&self) -> Option<&RasterImage> {
        self.image.as_ref()
    }

    pub fn fit(&self) -> Fit {
        self.fit
    }

    pub fn reset_to_fit(&mut self, view: (f32, f32)) -> Fit {
        self.view = view;
        self.fit = match &self.image {
            Some(image) => best_fit(image.dimensions(), view),
            None => Fit::default(),
        };
        self.fit
    }

    pub fn show(&mut self, ui: &mut egui::Ui) {
        let Some(image) = &self.image else {
            ui.centered_and_justified(|ui| {
                ui.label("⚠ Could not open image");
            });
            return;
        };
        let texture = self.texture.get_or_insert_with(|| {
            let color = egui::ColorImage::from_rgba_unmultiplied(
                [image.width() as usize, image.height() as usize],
                image.pixels(),
            );
            ui.ctx()
                .load_texture("fallback_tex", color, egui::TextureOptions::LINEAR)
        });
        let id = texture.id();
        let (width, height) = image.dimensions();

        let (rect, _) = ui.allocate_exact_size(ui.available_size(), egui::Sense::hover());
        let view = (rect.width(), rect.height());
        if view != self.view {
            self.reset_to_fit(view);
        }
        let min = rect.min + egui::vec2(self.fit.offset.0, self.fit.offset.1);
        let size = egui::vec2(width as f32, height as f32) * self.fit.scale;
        ui.painter().image(
            id,
            egui::Rect::from_min_size(min, size),
            egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
            egui::Color32::WHITE,
        );
    }
}
