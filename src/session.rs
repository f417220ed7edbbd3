use std::{
    collections::HashMap,
    fmt,
    io::Read,
    sync::{
        Arc,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::gesture::PointerEvent;
use crate::history::History;
use crate::host::{CaptureId, HostEvent, SurfaceHost};
use crate::persist::PersistenceSink;
use crate::raster::RasterImage;
use crate::state::{FilterMode, FilterState};
use crate::viewer::FallbackViewer;

/// The transient edit mode awaiting confirm or cancel. At most one is open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Submenu {
    #[default]
    None,
    Flip,
    Filter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipAxis {
    Horizontal,
    Vertical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Empty,
    Editing,
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingCapture {
    CommitFlip,
    CommitFilter,
    Save,
}

/// User-facing outcome of a session operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    Loaded { width: u32, height: u32 },
    LoadFailed(String),
    RendererFailed(String),
    NothingToUndo,
    NothingToRedo,
    Undone,
    Redone,
    FlipApplied,
    FlipFailed,
    FlipCancelled,
    FilterCommitted,
    FilterFailed,
    FilterCancelled,
    SelectFilterFirst,
    ConfirmFilterBeforeSave,
    Saving,
    Saved(String),
    SaveFailed(String),
    EffectStarted,
    EffectStopped,
    GesturesEnabled(bool),
    ImageReset,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Loaded { width, height } => write!(f, "Loaded {width}×{height} image"),
            Notice::LoadFailed(err) => write!(f, "Cannot edit this image: {err}"),
            Notice::RendererFailed(err) => write!(f, "Renderer unavailable: {err}"),
            Notice::NothingToUndo => f.write_str("Nothing to undo"),
            Notice::NothingToRedo => f.write_str("Nothing to redo"),
            Notice::Undone => f.write_str("Undone"),
            Notice::Redone => f.write_str("Redone"),
            Notice::FlipApplied => f.write_str("Flip applied"),
            Notice::FlipFailed => f.write_str("Failed to apply flip"),
            Notice::FlipCancelled => f.write_str("Flip cancelled"),
            Notice::FilterCommitted => f.write_str("Filter applied"),
            Notice::FilterFailed => f.write_str("Failed to apply filter"),
            Notice::FilterCancelled => f.write_str("Filter cancelled"),
            Notice::SelectFilterFirst => f.write_str("Select a filter first"),
            Notice::ConfirmFilterBeforeSave => {
                f.write_str("Confirm or cancel the filter before saving")
            }
            Notice::Saving => f.write_str("Saving…"),
            Notice::Saved(id) => write!(f, "Saved to {id}"),
            Notice::SaveFailed(err) => write!(f, "Save failed: {err}"),
            Notice::EffectStarted => f.write_str("Effect started"),
            Notice::EffectStopped => f.write_str("Effect stopped"),
            Notice::GesturesEnabled(true) => f.write_str("Gestures enabled"),
            Notice::GesturesEnabled(false) => f.write_str("Gestures disabled"),
            Notice::ImageReset => f.write_str("Image reset"),
        }
    }
}

type Repaint = Arc<dyn Fn() + Send + Sync>;

/// Owns the current image and its history, and drives the Surface Host
/// through the flip/filter/effect workflows.
pub struct EditSession {
    host: SurfaceHost,
    sink: Arc<dyn PersistenceSink>,
    repaint: Repaint,
    current: Option<RasterImage>,
    history: History,
    submenu: Submenu,
    filter: FilterState,
    fallback: Option<FallbackViewer>,
    pending: HashMap<CaptureId, PendingCapture>,
    saves_tx: Sender<anyhow::Result<String>>,
    saves: Receiver<anyhow::Result<String>>,
    saves_in_flight: usize,
    notices: Vec<Notice>,
    frame: Option<RasterImage>,
    renderer_error: Option<String>,
}

impl EditSession {
    pub fn new(
        host: SurfaceHost,
        sink: Arc<dyn PersistenceSink>,
        history_capacity: usize,
        repaint: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let (saves_tx, saves) = mpsc::channel();
        Self {
            host,
            sink,
            repaint: Arc::new(repaint),
            current: None,
            history: History::new(history_capacity),
            submenu: Submenu::None,
            filter: FilterState::default(),
            fallback: None,
            pending: HashMap::new(),
            saves_tx,
            saves,
            saves_in_flight: 0,
            notices: Vec::new(),
            frame: None,
            renderer_error: None,
        }
    }

    pub fn mode(&self) -> Mode {
        if self.fallback.is_some() {
            Mode::Fallback
        } else if self.current.is_some() {
            Mode::Editing
        } else {
            Mode::Empty
        }
    }

    fn editable(&self) -> bool {
        self.mode() == Mode::Editing
    }

    fn notice(&mut self, notice: Notice) {
        debug!(%notice, "notice");
        self.notices.push(notice);
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn submenu(&self) -> Submenu {
        self.submenu
    }

    pub fn filter(&self) -> FilterState {
        self.filter
    }

    pub fn current_image(&self) -> Option<&RasterImage> {
        self.current.as_ref()
    }

    #[cfg(test)]
    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn undo_available(&self) -> bool {
        self.history_unlocked() && self.history.can_undo()
    }

    pub fn redo_available(&self) -> bool {
        self.history_unlocked() && self.history.can_redo()
    }

    /// A commit in flight will push the image it was rendered from, so the
    /// current image must not move until it lands.
    fn commit_pending(&self) -> bool {
        self.pending.values().any(|p| {
            matches!(p, PendingCapture::CommitFlip | PendingCapture::CommitFilter)
        })
    }

    fn history_unlocked(&self) -> bool {
        self.editable() && !self.commit_pending()
    }

    pub fn is_effect_running(&self) -> bool {
        self.host.is_effect_running()
    }

    pub fn gestures_enabled(&self) -> bool {
        self.host.gestures_enabled()
    }

    pub fn renderer_error(&self) -> Option<&str> {
        self.renderer_error.as_deref()
    }

    pub fn fallback_mut(&mut self) -> Option<&mut FallbackViewer> {
        self.fallback.as_mut()
    }

    /// Latest viewport frame posted by the render thread, if a new one arrived.
    pub fn take_frame(&mut self) -> Option<RasterImage> {
        self.frame.take()
    }

    /// Decodes a new source. Undecodable input switches to the fallback
    /// viewer; the session never renders it.
    pub fn load_image<R: Read>(&mut self, mut reader: R, media_type: &str) {
        self.host.stop_effect();
        self.submenu = Submenu::None;
        self.pending.clear();
        self.history.clear();
        self.frame = None;

        let mut bytes = Vec::new();
        let decoded = reader
            .read_to_end(&mut bytes)
            .map_err(LoadError::from)
            .and_then(|_| RasterImage::decode(bytes.as_slice(), media_type));

        match decoded {
            Ok(image) => {
                let (width, height) = image.dimensions();
                info!(width, height, media_type, "image loaded for editing");
                self.fallback = None;
                self.reset_view();
                self.host.set_image(&image);
                self.current = Some(image);
                self.notice(Notice::Loaded { width, height });
            }
            Err(err) => {
                warn!(%err, media_type, "decode failed; using fallback viewer");
                let shown = RasterImage::sniff(&bytes).ok();
                self.fallback = Some(FallbackViewer::new(shown));
                self.current = None;
                self.notice(Notice::LoadFailed(err.to_string()));
            }
        }
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.host.set_viewport(width, height);
    }

    pub fn on_pointer(&mut self, event: PointerEvent) {
        if self.editable() {
            self.host.on_pointer(event);
        }
    }

    /// Identity transform, no filter, no sweep.
    fn reset_view(&mut self) {
        self.filter.reset();
        self.host.reset_transform();
    }

    fn stop_effect(&mut self) {
        if self.host.is_effect_running() {
            self.host.stop_effect();
            self.notice(Notice::EffectStopped);
        }
    }

    fn cancel_flip(&mut self) {
        self.submenu = Submenu::None;
        self.reset_view();
        info!("flip cancelled");
        self.notice(Notice::FlipCancelled);
    }

    fn cancel_filter(&mut self) {
        self.submenu = Submenu::None;
        self.filter.reset();
        self.host.reset_filter();
        info!("filter cancelled");
        self.notice(Notice::FilterCancelled);
    }

    /// Flip button: opens the flip submenu, or closes whatever is open.
    pub fn open_flip_menu(&mut self) {
        if !self.editable() {
            return;
        }
        if self.submenu == Submenu::Filter {
            self.cancel_filter();
            return;
        }
        self.stop_effect();
        if self.submenu == Submenu::Flip {
            self.cancel_flip();
        } else {
            self.submenu = Submenu::Flip;
            info!("flip submenu opened");
        }
    }

    /// Filter button: rolls back an open flip, then toggles the filter submenu.
    pub fn open_filter_menu(&mut self) {
        if !self.editable() {
            return;
        }
        if self.submenu == Submenu::Flip {
            self.cancel_flip();
        }
        self.stop_effect();
        if self.submenu == Submenu::Filter {
            self.cancel_filter();
        } else {
            self.submenu = Submenu::Filter;
            self.filter.reset();
            self.host.reset_filter();
            info!("filter submenu opened");
        }
    }

    pub fn toggle_flip(&mut self, axis: FlipAxis) {
        if !self.editable() || self.submenu != Submenu::Flip {
            return;
        }
        match axis {
            FlipAxis::Horizontal => self.host.flip_horizontally(),
            FlipAxis::Vertical => self.host.flip_vertically(),
        }
    }

    /// Previews `mode` at its default intensity.
    pub fn select_filter(&mut self, mode: FilterMode) {
        self.set_filter(mode, mode.default_intensity());
    }

    pub fn set_filter(&mut self, mode: FilterMode, intensity: f32) {
        if !self.editable() || self.submenu != Submenu::Filter {
            return;
        }
        self.filter.set_mode(mode);
        self.filter.set_intensity(intensity);
        self.host
            .set_filter(self.filter.mode(), self.filter.intensity());
        debug!(?mode, intensity = self.filter.intensity(), "filter preview");
    }

    /// Ignored until a filter is selected.
    pub fn set_filter_intensity(&mut self, intensity: f32) {
        if !self.editable()
            || self.submenu != Submenu::Filter
            || self.filter.mode() == FilterMode::None
        {
            return;
        }
        self.filter.set_intensity(intensity);
        self.host.set_filter_intensity(self.filter.intensity());
    }

    pub fn confirm_submenu(&mut self) {
        if !self.editable() {
            return;
        }
        match self.submenu {
            Submenu::None => {}
            Submenu::Flip => {
                self.submenu = Submenu::None;
                self.request_capture(PendingCapture::CommitFlip);
            }
            Submenu::Filter => {
                if self.filter.mode() == FilterMode::None {
                    self.notice(Notice::SelectFilterFirst);
                    return;
                }
                self.submenu = Submenu::None;
                self.request_capture(PendingCapture::CommitFilter);
            }
        }
    }

    pub fn cancel_submenu(&mut self) {
        match self.submenu {
            Submenu::None => {}
            Submenu::Flip => self.cancel_flip(),
            Submenu::Filter => self.cancel_filter(),
        }
    }

    fn request_capture(&mut self, purpose: PendingCapture) {
        let id = self.host.capture_frame();
        info!(id, ?purpose, "capture started");
        self.pending.insert(id, purpose);
    }

    pub fn undo(&mut self) {
        if !self.editable() {
            return;
        }
        if self.commit_pending() {
            debug!("undo ignored while a commit is pending");
            return;
        }
        let Some(current) = self.current.take() else {
            return;
        };
        match self.history.undo(current) {
            Ok(previous) => {
                self.swap_in(previous);
                info!(undo = self.history.undo_len(), redo = self.history.redo_len(), "undo");
                self.notice(Notice::Undone);
            }
            Err(current) => {
                self.current = Some(current);
                self.notice(Notice::NothingToUndo);
            }
        }
    }

    pub fn redo(&mut self) {
        if !self.editable() {
            return;
        }
        if self.commit_pending() {
            debug!("redo ignored while a commit is pending");
            return;
        }
        let Some(current) = self.current.take() else {
            return;
        };
        match self.history.redo(current) {
            Ok(next) => {
                self.swap_in(next);
                info!(undo = self.history.undo_len(), redo = self.history.redo_len(), "redo");
                self.notice(Notice::Redone);
            }
            Err(current) => {
                self.current = Some(current);
                self.notice(Notice::NothingToRedo);
            }
        }
    }

    fn swap_in(&mut self, image: RasterImage) {
        self.host.update_texture(&image);
        self.current = Some(image);
        self.reset_view();
    }

    /// Captures the full-resolution result and hands it to the sink off the
    /// UI thread. Refused while a filter is being previewed.
    pub fn save(&mut self) {
        if !self.editable() {
            return;
        }
        self.stop_effect();
        if self.submenu == Submenu::Filter {
            self.submenu = Submenu::None;
            self.filter.reset();
            self.host.reset_filter();
            self.notice(Notice::ConfirmFilterBeforeSave);
            return;
        }
        self.request_capture(PendingCapture::Save);
        self.notice(Notice::Saving);
    }

    /// Stops the effect, rolls back any submenu and reloads the texture.
    pub fn reset(&mut self) {
        if !self.editable() {
            return;
        }
        self.stop_effect();
        if self.submenu == Submenu::Filter {
            self.host.reset_filter();
        }
        self.submenu = Submenu::None;
        self.reset_view();
        self.host.reset_flip_flags();
        if let Some(image) = &self.current {
            self.host.update_texture(image);
        }
        info!("image reset");
        self.notice(Notice::ImageReset);
    }

    /// Effect button: closes any submenu, then starts or stops the sweep.
    pub fn toggle_effect(&mut self) {
        self.toggle_effect_at(Instant::now());
    }

    pub fn toggle_effect_at(&mut self, now: Instant) {
        if !self.editable() {
            return;
        }
        match self.submenu {
            Submenu::Flip => self.cancel_flip(),
            Submenu::Filter => self.cancel_filter(),
            Submenu::None => {}
        }
        if self.host.is_effect_running() {
            self.stop_effect();
        } else {
            self.host.start_effect(now);
            self.notice(Notice::EffectStarted);
        }
    }

    /// Advances the sweep animation. Returns whether it is still running.
    pub fn tick(&mut self, now: Instant) -> bool {
        self.host.tick(now)
    }

    pub fn toggle_gestures(&mut self) {
        let enabled = !self.host.gestures_enabled();
        self.host.set_gesture_enabled(enabled);
        self.notice(Notice::GesturesEnabled(enabled));
    }

    pub fn status(&self) -> String {
        let snapshot = self.host.snapshot();
        let gestures = if self.host.gestures_enabled() { "on" } else { "off" };
        let mode = match self.mode() {
            Mode::Fallback => "fallback".to_string(),
            _ if self.host.is_failed() => "renderer failed".to_string(),
            _ if !self.host.is_initialized() => "starting".to_string(),
            _ => snapshot.backend.clone(),
        };
        format!("{}, gestures: {gestures}, mode: {mode}", snapshot.summary())
    }

    /// Drains render-thread events and finished saves. Call once per UI frame.
    pub fn poll(&mut self) {
        for event in self.host.poll_events() {
            match event {
                HostEvent::Ready { backend } => debug!(%backend, "renderer ready"),
                HostEvent::InitFailed(err) => {
                    self.renderer_error = Some(err.clone());
                    self.notice(Notice::RendererFailed(err));
                }
                HostEvent::Frame(frame) => self.frame = Some(frame),
                HostEvent::Captured { id, result } => self.on_captured(id, result),
            }
        }
        while let Ok(result) = self.saves.try_recv() {
            self.on_saved(result);
        }
    }

    /// Runs everything already queued on the render thread and waits up to
    /// `timeout` for saves that are still being written.
    pub fn finish(&mut self, timeout: Duration) {
        self.host.flush();
        self.poll();
        let deadline = Instant::now() + timeout;
        while self.saves_in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.saves.recv_timeout(remaining) {
                Ok(result) => self.on_saved(result),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(pending = self.saves_in_flight, "gave up waiting for saves");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn on_saved(&mut self, result: anyhow::Result<String>) {
        self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
        match result {
            Ok(id) => self.notice(Notice::Saved(id)),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "save failed");
                self.notice(Notice::SaveFailed(message));
            }
        }
    }

    fn on_captured(&mut self, id: CaptureId, result: Option<RasterImage>) {
        let Some(purpose) = self.pending.remove(&id) else {
            debug!(id, "stale capture ignored");
            return;
        };
        match (purpose, result) {
            (PendingCapture::CommitFlip, Some(image)) => {
                self.commit(image);
                info!(undo = self.history.undo_len(), "flip committed");
                self.notice(Notice::FlipApplied);
            }
            (PendingCapture::CommitFlip, None) => {
                self.reset_view();
                self.notice(Notice::FlipFailed);
            }
            (PendingCapture::CommitFilter, Some(image)) => {
                self.commit(image);
                self.host.reset_flip_flags();
                info!(undo = self.history.undo_len(), "filter committed");
                self.notice(Notice::FilterCommitted);
            }
            (PendingCapture::CommitFilter, None) => {
                self.filter.reset();
                self.host.reset_filter();
                self.notice(Notice::FilterFailed);
            }
            (PendingCapture::Save, Some(image)) => self.persist(image),
            (PendingCapture::Save, None) => {
                self.notice(Notice::SaveFailed("capture failed".into()));
            }
        }
    }

    /// Pushes the pre-edit image and installs the captured one.
    fn commit(&mut self, captured: RasterImage) {
        if let Some(previous) = &self.current {
            self.history.save(previous);
        }
        self.host.update_texture(&captured);
        self.current = Some(captured);
        self.reset_view();
    }

    fn persist(&mut self, image: RasterImage) {
        let sink = Arc::clone(&self.sink);
        let tx = self.saves_tx.clone();
        let repaint = Arc::clone(&self.repaint);
        self.saves_in_flight += 1;
        std::thread::spawn(move || {
            let _ = tx.send(sink.persist(&image));
            repaint();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Mutex};

    use image::{ImageBuffer, ImageFormat, Rgba};

    use super::*;
    use crate::error::RenderError;
    use crate::processing::{Rasterizer, cpu::CpuRasterizer};
    use crate::state::{ScaleBounds, SweepAnimation};

    #[derive(Default)]
    struct MemorySink {
        saved: Mutex<Vec<(u32, u32, [u8; 4])>>,
    }

    impl PersistenceSink for MemorySink {
        fn persist(&self, image: &RasterImage) -> anyhow::Result<String> {
            let mut saved = self.saved.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
            saved.push((image.width(), image.height(), image.pixel(0, 0)));
            Ok(format!("memory://{}", saved.len()))
        }
    }

    fn session_with(
        factory: crate::processing::RasterizerFactory,
        sink: Arc<dyn PersistenceSink>,
    ) -> EditSession {
        let host = SurfaceHost::spawn(
            factory,
            ScaleBounds::default(),
            SweepAnimation::default(),
            || {},
        )
        .expect("spawn render thread");
        let mut session = EditSession::new(host, sink, 10, || {});
        session.set_viewport(200, 200);
        session
    }

    fn cpu_session() -> EditSession {
        session_with(
            Box::new(|| Ok(Box::new(CpuRasterizer::new()) as Box<dyn Rasterizer>)),
            Arc::new(MemorySink::default()),
        )
    }

    fn png(width: u32, height: u32, f: impl Fn(u32, u32) -> Rgba<u8>) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, f);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("encode png");
        out.into_inner()
    }

    fn load_red(session: &mut EditSession, size: u32) {
        let bytes = png(size, size, |_, _| Rgba([255, 0, 0, 255]));
        session.load_image(bytes.as_slice(), "image/png");
        settle(session);
    }

    /// Runs queued work, applies posted results, then runs whatever those
    /// results queued in turn.
    fn settle(session: &mut EditSession) {
        session.host.flush();
        session.poll();
        session.host.flush();
    }

    fn current_id(session: &EditSession) -> Option<u64> {
        session.current_image().map(RasterImage::id)
    }

    #[test]
    fn grayscale_half_commit_blends_and_keeps_red_in_history() {
        let mut s = cpu_session();
        load_red(&mut s, 100);

        s.open_filter_menu();
        s.select_filter(FilterMode::Grayscale);
        s.set_filter_intensity(0.5);
        s.confirm_submenu();
        settle(&mut s);

        let current = s.current_image().expect("current image");
        assert_eq!(current.dimensions(), (100, 100));
        let [r, g, b, a] = current.pixel(50, 50);
        assert!((r as i32 - 166).abs() <= 1, "r = {r}");
        assert!((g as i32 - 38).abs() <= 1, "g = {g}");
        assert_eq!(g, b);
        assert_eq!(a, 255);

        let top = s.history().undo_top().expect("undo entry");
        assert_eq!(top.pixel(0, 0), [255, 0, 0, 255]);
        assert_eq!(s.submenu(), Submenu::None);
        assert_eq!(s.filter().mode(), FilterMode::None);
        assert!(s.take_notices().contains(&Notice::FilterCommitted));
        assert_eq!(s.host.snapshot().filter.mode(), FilterMode::None);
    }

    #[test]
    fn grayscale_full_commit_yields_luma() {
        let mut s = cpu_session();
        let bytes = png(4, 4, |_, _| Rgba([40, 160, 220, 255]));
        s.load_image(bytes.as_slice(), "image/png");
        s.open_filter_menu();
        s.select_filter(FilterMode::Grayscale);
        s.confirm_submenu();
        settle(&mut s);

        let luma = 0.299 * 40.0 + 0.587 * 160.0 + 0.114 * 220.0;
        let [r, g, b, _] = s.current_image().expect("current").pixel(1, 1);
        assert_eq!(r, g);
        assert_eq!(g, b);
        assert!((r as f32 - luma).abs() <= 1.0);
    }

    #[test]
    fn flip_commit_bakes_flip_and_resets_transform() {
        let mut s = cpu_session();
        let bytes = png(2, 1, |x, _| {
            if x == 0 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });
        s.load_image(bytes.as_slice(), "image/png");
        s.open_flip_menu();
        s.toggle_flip(FlipAxis::Horizontal);
        settle(&mut s);
        assert!(s.host.snapshot().flipped_h);

        s.confirm_submenu();
        settle(&mut s);
        let current = s.current_image().expect("current");
        assert_eq!(current.pixel(0, 0), [0, 0, 255, 255]);
        assert_eq!(current.pixel(1, 0), [255, 0, 0, 255]);
        assert!(!s.host.snapshot().flipped_h);
        assert_eq!(s.history().undo_len(), 1);
    }

    #[test]
    fn opening_filter_rolls_back_uncommitted_flip() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.open_flip_menu();
        s.toggle_flip(FlipAxis::Vertical);
        settle(&mut s);
        assert!(s.host.snapshot().flipped_v);

        s.open_filter_menu();
        settle(&mut s);
        assert_eq!(s.submenu(), Submenu::Filter);
        assert!(!s.host.snapshot().flipped_v);
        assert_eq!(s.history().undo_len(), 0);
    }

    #[test]
    fn flip_button_while_filter_open_only_closes_filter() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.open_filter_menu();
        s.select_filter(FilterMode::Sepia);
        s.open_flip_menu();
        settle(&mut s);
        assert_eq!(s.submenu(), Submenu::None);
        assert_eq!(s.host.snapshot().filter.mode(), FilterMode::None);
    }

    #[test]
    fn toggling_an_open_submenu_closes_it() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.open_flip_menu();
        s.open_flip_menu();
        assert_eq!(s.submenu(), Submenu::None);
        s.open_filter_menu();
        s.open_filter_menu();
        assert_eq!(s.submenu(), Submenu::None);
    }

    #[test]
    fn confirm_filter_without_mode_is_refused() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.open_filter_menu();
        s.set_filter_intensity(0.7);
        assert_eq!(s.filter().intensity(), 0.0);
        s.confirm_submenu();
        settle(&mut s);
        assert_eq!(s.submenu(), Submenu::Filter);
        assert!(s.take_notices().contains(&Notice::SelectFilterFirst));
        assert_eq!(s.history().undo_len(), 0);
    }

    #[test]
    fn select_filter_uses_mode_default_intensity() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.open_filter_menu();
        s.select_filter(FilterMode::Saturation);
        assert_eq!(s.filter().intensity(), 0.5);
        s.select_filter(FilterMode::Sepia);
        assert_eq!(s.filter().intensity(), 1.0);
    }

    #[test]
    fn toggle_flip_outside_flip_menu_is_ignored() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.toggle_flip(FlipAxis::Horizontal);
        settle(&mut s);
        assert!(!s.host.snapshot().flipped_h);
    }

    #[test]
    fn undo_then_redo_restores_same_image() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.undo();
        assert!(s.take_notices().contains(&Notice::NothingToUndo));

        s.open_flip_menu();
        s.toggle_flip(FlipAxis::Horizontal);
        s.confirm_submenu();
        settle(&mut s);
        let committed = current_id(&s);

        s.undo();
        assert_eq!(s.current_image().expect("current").pixel(0, 0), [255, 0, 0, 255]);
        assert!(s.redo_available());
        s.redo();
        assert_eq!(current_id(&s), committed);
        assert!(!s.redo_available());
        s.redo();
        assert!(s.take_notices().contains(&Notice::NothingToRedo));
    }

    #[test]
    fn undo_waits_for_pending_commit() {
        let mut s = cpu_session();
        let bytes = png(2, 1, |x, _| {
            if x == 0 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });
        s.load_image(bytes.as_slice(), "image/png");
        s.open_flip_menu();
        s.toggle_flip(FlipAxis::Horizontal);
        s.confirm_submenu();
        settle(&mut s);
        assert_eq!(s.history().undo_len(), 1);

        s.open_filter_menu();
        s.select_filter(FilterMode::Grayscale);
        s.confirm_submenu();
        assert!(!s.undo_available());
        s.undo();
        assert_eq!(s.history().undo_len(), 1);
        settle(&mut s);

        assert_eq!(s.history().undo_len(), 2);
        let top = s.history().undo_top().expect("undo entry");
        assert_eq!(top.pixel(0, 0), [0, 0, 255, 255]);
        let [r, g, b, _] = s.current_image().expect("current").pixel(0, 0);
        assert_eq!((r, g), (g, b));
        assert!(s.undo_available());
        s.undo();
        assert_eq!(
            s.current_image().expect("current").pixel(0, 0),
            [0, 0, 255, 255]
        );
    }

    #[test]
    fn commit_clears_redo_stack() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.open_flip_menu();
        s.toggle_flip(FlipAxis::Horizontal);
        s.confirm_submenu();
        settle(&mut s);
        s.undo();
        assert!(s.redo_available());

        s.open_filter_menu();
        s.select_filter(FilterMode::Sepia);
        s.confirm_submenu();
        settle(&mut s);
        assert!(!s.redo_available());
        assert_eq!(s.history().undo_len(), 1);
    }

    #[test]
    fn history_is_capped_at_ten() {
        let mut s = cpu_session();
        load_red(&mut s, 2);
        for _ in 0..11 {
            s.open_flip_menu();
            s.toggle_flip(FlipAxis::Vertical);
            s.confirm_submenu();
            settle(&mut s);
        }
        assert_eq!(s.history().undo_len(), 10);
    }

    #[test]
    fn save_with_filter_open_is_refused() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.open_filter_menu();
        s.select_filter(FilterMode::Grayscale);
        s.save();
        assert!(s.pending.is_empty());
        assert_eq!(s.submenu(), Submenu::None);
        assert!(s.take_notices().contains(&Notice::ConfirmFilterBeforeSave));
    }

    #[test]
    fn save_persists_full_resolution_capture() {
        let sink = Arc::new(MemorySink::default());
        let mut s = session_with(
            Box::new(|| Ok(Box::new(CpuRasterizer::new()) as Box<dyn Rasterizer>)),
            sink.clone(),
        );
        load_red(&mut s, 30);
        s.save();
        s.finish(Duration::from_secs(10));

        let saved = s.take_notices().into_iter().find_map(|n| match n {
            Notice::Saved(id) => Some(id),
            _ => None,
        });
        assert_eq!(saved.as_deref(), Some("memory://1"));
        let entries = sink.saved.lock().expect("lock");
        assert_eq!(entries[0], (30, 30, [255, 0, 0, 255]));
    }

    #[test]
    fn reset_stops_effect_and_closes_menus() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        let t0 = Instant::now();
        s.toggle_effect_at(t0);
        assert!(s.is_effect_running());
        s.tick(t0 + Duration::from_millis(500));
        s.open_filter_menu();
        assert!(!s.is_effect_running());
        s.select_filter(FilterMode::Sepia);

        s.reset();
        settle(&mut s);
        assert_eq!(s.submenu(), Submenu::None);
        let snap = s.host.snapshot();
        assert_eq!(snap.filter.mode(), FilterMode::None);
        assert_eq!(snap.sweep, 0.0);
        assert_eq!(snap.scale, (1.0, 1.0));
    }

    #[test]
    fn effect_toggle_cancels_open_flip() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.open_flip_menu();
        s.toggle_flip(FlipAxis::Horizontal);
        s.toggle_effect_at(Instant::now());
        settle(&mut s);
        assert_eq!(s.submenu(), Submenu::None);
        assert!(!s.host.snapshot().flipped_h);
        assert!(s.is_effect_running());
        s.toggle_effect();
        assert!(!s.is_effect_running());
    }

    #[test]
    fn undecodable_input_falls_back_and_blocks_editing() {
        let mut s = cpu_session();
        s.load_image(&b"definitely not an image"[..], "image/png");
        assert_eq!(s.mode(), Mode::Fallback);
        assert!(matches!(s.take_notices().last(), Some(Notice::LoadFailed(_))));
        s.open_flip_menu();
        assert_eq!(s.submenu(), Submenu::None);
        s.undo();
        assert!(s.take_notices().is_empty());
    }

    #[test]
    fn gif_is_shown_but_not_edited() {
        let mut s = cpu_session();
        let img = ImageBuffer::from_fn(2, 2, |_, _| Rgba([0u8, 255, 0, 255]));
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Gif).expect("encode gif");
        s.load_image(bytes.into_inner().as_slice(), "image/gif");
        assert_eq!(s.mode(), Mode::Fallback);
        let viewer = s.fallback_mut().expect("fallback viewer");
        assert!(viewer.image().is_some());
    }

    #[test]
    fn failed_renderer_turns_commit_into_rollback() {
        let mut s = session_with(
            Box::new(|| -> Result<Box<dyn Rasterizer>, RenderError> {
                Err(RenderError::NoAdapter)
            }),
            Arc::new(MemorySink::default()),
        );
        load_red(&mut s, 4);
        assert!(s.renderer_error().is_some());
        s.open_flip_menu();
        s.toggle_flip(FlipAxis::Horizontal);
        s.confirm_submenu();
        settle(&mut s);
        let notices = s.take_notices();
        assert!(notices.contains(&Notice::FlipFailed));
        assert_eq!(s.history().undo_len(), 0);
    }

    #[test]
    fn gestures_toggle_and_status_line() {
        let mut s = cpu_session();
        load_red(&mut s, 4);
        s.toggle_gestures();
        assert!(!s.gestures_enabled());
        let status = s.status();
        assert!(status.starts_with("scale: (1.00, 1.00), translation: (0.00, 0.00)"));
        assert!(status.contains("gestures: off"));
    }
}
