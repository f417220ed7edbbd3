use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        mpsc::{self, Receiver, Sender},
    },
    thread::JoinHandle,
    time::Instant,
};

use tracing::{debug, error, info, warn};

use crate::gesture::{GestureInterpreter, GestureSignal, PointerEvent};
use crate::processing::RasterizerFactory;
use crate::processing::engine::{EngineSnapshot, RenderEngine};
use crate::raster::RasterImage;
use crate::state::{FilterMode, ScaleBounds, SweepAnimation};

pub type CaptureId = u64;

type Task = Box<dyn FnOnce(&mut RenderEngine) + Send>;
type Notifier = Arc<dyn Fn() + Send + Sync>;

enum Command {
    Task(Task),
    Invalidate,
    Capture(CaptureId),
    Flush(Sender<()>),
    Shutdown,
}

/// Results posted from the render thread back to the UI context.
#[derive(Debug)]
pub enum HostEvent {
    Ready { backend: String },
    InitFailed(String),
    Frame(RasterImage),
    /// `None` means the capture failed; it is never left unanswered.
    Captured {
        id: CaptureId,
        result: Option<RasterImage>,
    },
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    failed: bool,
    pending_image: Option<RasterImage>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the render thread. Every engine mutation is queued as a task and runs
/// there in submission order; frames are produced only after an invalidation.
pub struct SurfaceHost {
    commands: Sender<Command>,
    events_tx: Sender<HostEvent>,
    events: Receiver<HostEvent>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    snapshot: Arc<Mutex<EngineSnapshot>>,
    gestures: GestureInterpreter,
    gestures_enabled: bool,
    sweep: SweepAnimation,
    next_capture: CaptureId,
    thread: Option<JoinHandle<()>>,
}

impl SurfaceHost {
    pub fn spawn(
        factory: RasterizerFactory,
        bounds: ScaleBounds,
        sweep: SweepAnimation,
        notify: impl Fn() + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        let (commands, command_rx) = mpsc::channel();
        let (events_tx, events) = mpsc::channel();
        let lifecycle = Arc::new(Mutex::new(Lifecycle::default()));
        let snapshot = Arc::new(Mutex::new(EngineSnapshot::default()));
        let notify: Notifier = Arc::new(notify);

        let thread = {
            let events_tx = events_tx.clone();
            let lifecycle = Arc::clone(&lifecycle);
            let snapshot = Arc::clone(&snapshot);
            std::thread::Builder::new()
                .name("lumen-render".into())
                .spawn(move || {
                    render_loop(
                        factory, bounds, command_rx, events_tx, lifecycle, snapshot, notify,
                    )
                })?
        };

        Ok(Self {
            commands,
            events_tx,
            events,
            lifecycle,
            snapshot,
            gestures: GestureInterpreter::new(bounds),
            gestures_enabled: true,
            sweep,
            next_capture: 0,
            thread: Some(thread),
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("render thread is gone; command dropped");
        }
    }

    fn run(&self, task: impl FnOnce(&mut RenderEngine) + Send + 'static) {
        self.send(Command::Task(Box::new(task)));
    }

    /// Queues a mutation followed by exactly one invalidation.
    fn run_and_invalidate(&self, task: impl FnOnce(&mut RenderEngine) + Send + 'static) {
        self.run(task);
        self.send(Command::Invalidate);
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.lifecycle).initialized
    }

    pub fn is_failed(&self) -> bool {
        lock(&self.lifecycle).failed
    }

    /// Replaces the texture. Before the renderer is up the image is parked
    /// and uploaded during setup; only the latest parked image survives.
    pub fn set_image(&self, image: &RasterImage) {
        let copy = image.snapshot();
        {
            let mut state = lock(&self.lifecycle);
            if state.failed {
                debug!("renderer failed; image not uploaded");
                return;
            }
            if !state.initialized {
                debug!(id = copy.id(), "renderer not ready; image buffered");
                state.pending_image = Some(copy);
                return;
            }
        }
        self.run_and_invalidate(move |engine| {
            if let Err(err) = engine.upload_texture(&copy) {
                warn!(%err, "texture upload failed");
            }
        });
    }

    pub fn update_texture(&self, image: &RasterImage) {
        self.set_image(image);
    }

    pub fn set_viewport(&self, width: u32, height: u32) {
        self.run_and_invalidate(move |engine| engine.set_viewport(width, height));
    }

    /// Queues an offscreen capture at texture resolution. The outcome arrives
    /// later as [`HostEvent::Captured`] with the returned id.
    pub fn capture_frame(&mut self) -> CaptureId {
        self.next_capture += 1;
        let id = self.next_capture;
        debug!(id, "capture requested");
        if self.commands.send(Command::Capture(id)).is_err() {
            warn!(id, "render thread is gone; capture fails");
            let _ = self.events_tx.send(HostEvent::Captured { id, result: None });
        }
        id
    }

    /// Blocks until every command queued so far has run and its frame, if
    /// any, has been posted.
    pub fn flush(&self) {
        let (ack, done) = mpsc::channel();
        if self.commands.send(Command::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    pub fn poll_events(&self) -> Vec<HostEvent> {
        self.events.try_iter().collect()
    }

    /// Last state published by the render thread.
    pub fn snapshot(&self) -> EngineSnapshot {
        lock(&self.snapshot).clone()
    }

    pub fn set_gesture_enabled(&mut self, enabled: bool) {
        self.gestures_enabled = enabled;
        info!(enabled, "gestures toggled");
    }

    pub fn gestures_enabled(&self) -> bool {
        self.gestures_enabled
    }

    pub fn on_pointer(&mut self, event: PointerEvent) {
        if !self.gestures_enabled {
            return;
        }
        if let Some(signal) = self.gestures.handle(event) {
            self.handle_gesture(signal);
        }
    }

    pub fn handle_gesture(&mut self, signal: GestureSignal) {
        match signal {
            GestureSignal::Scale {
                factor,
                focus_x,
                focus_y,
            } => self.run_and_invalidate(move |engine| {
                engine.set_scale(factor, focus_x, focus_y);
            }),
            GestureSignal::Translate { dx, dy } => {
                self.run_and_invalidate(move |engine| engine.set_translation(dx, dy))
            }
            GestureSignal::DoubleTap => self.reset_transform(),
        }
    }

    pub fn reset_transform(&mut self) {
        self.gestures.reset_scale();
        self.run_and_invalidate(RenderEngine::reset_transform);
    }

    pub fn flip_horizontally(&self) {
        self.run_and_invalidate(RenderEngine::flip_horizontally);
    }

    pub fn flip_vertically(&self) {
        self.run_and_invalidate(RenderEngine::flip_vertically);
    }

    pub fn reset_flip_flags(&self) {
        self.run_and_invalidate(RenderEngine::reset_flip_flags);
    }

    pub fn set_filter(&self, mode: FilterMode, intensity: f32) {
        self.run_and_invalidate(move |engine| {
            engine.set_filter_mode(mode);
            engine.set_filter_intensity(intensity);
        });
    }

    pub fn set_filter_intensity(&self, intensity: f32) {
        self.run_and_invalidate(move |engine| engine.set_filter_intensity(intensity));
    }

    pub fn reset_filter(&self) {
        self.set_filter(FilterMode::None, 0.0);
    }

    pub fn is_effect_running(&self) -> bool {
        self.sweep.is_active()
    }

    pub fn start_effect(&mut self, now: Instant) {
        self.sweep.start(now);
        info!(period_ms = self.sweep.period().as_millis() as u64, "sweep effect started");
        self.tick(now);
    }

    /// Cancels the animation and queues one final reset of the sweep
    /// uniform. A tick queued earlier may still run; the reset lands after it.
    pub fn stop_effect(&mut self) {
        let was_running = self.sweep.is_active();
        self.sweep.stop();
        if was_running {
            info!("sweep effect stopped");
        }
        self.run_and_invalidate(|engine| engine.set_sweep_position(0.0));
    }

    /// Advances the animation. Returns whether it is still running.
    pub fn tick(&mut self, now: Instant) -> bool {
        let Some(position) = self.sweep.position_at(now) else {
            return false;
        };
        self.run_and_invalidate(move |engine| engine.set_sweep_position(position));
        true
    }
}

impl Drop for SurfaceHost {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("render thread panicked");
            }
        }
    }
}

fn render_loop(
    factory: RasterizerFactory,
    bounds: ScaleBounds,
    commands: Receiver<Command>,
    events: Sender<HostEvent>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    snapshot: Arc<Mutex<EngineSnapshot>>,
    notify: Notifier,
) {
    let rasterizer = match factory() {
        Ok(rasterizer) => rasterizer,
        Err(err) => {
            error!(%err, "renderer initialization failed");
            {
                let mut state = lock(&lifecycle);
                state.failed = true;
                state.pending_image = None;
            }
            let _ = events.send(HostEvent::InitFailed(err.to_string()));
            notify();
            answer_without_renderer(&commands, &events);
            return;
        }
    };

    let mut engine = RenderEngine::new(rasterizer, bounds);
    let pending = {
        let mut state = lock(&lifecycle);
        state.initialized = true;
        state.pending_image.take()
    };
    let backend = engine.snapshot().backend;
    info!(%backend, "renderer ready");
    let _ = events.send(HostEvent::Ready { backend });

    let mut dirty = false;
    if let Some(image) = pending {
        match engine.upload_texture(&image) {
            Ok(()) => dirty = true,
            Err(err) => warn!(%err, "buffered texture upload failed"),
        }
    }
    publish(&engine, &snapshot);
    notify();

    while let Ok(first) = commands.recv() {
        for command in std::iter::once(first).chain(commands.try_iter()) {
            match command {
                Command::Task(task) => task(&mut engine),
                Command::Invalidate => dirty = true,
                Command::Capture(id) => {
                    let result = match engine.capture() {
                        Ok(image) => {
                            debug!(id, width = image.width(), height = image.height(), "capture finished");
                            Some(image)
                        }
                        Err(err) => {
                            warn!(id, %err, "capture failed");
                            None
                        }
                    };
                    let _ = events.send(HostEvent::Captured { id, result });
                }
                Command::Flush(ack) => {
                    if dirty {
                        present(&mut engine, &events);
                        dirty = false;
                    }
                    publish(&engine, &snapshot);
                    let _ = ack.send(());
                }
                Command::Shutdown => {
                    debug!("render thread shutting down");
                    return;
                }
            }
        }
        if dirty {
            present(&mut engine, &events);
            dirty = false;
        }
        publish(&engine, &snapshot);
        notify();
    }
}

/// Keeps the host contract after a failed init: captures resolve to `None`
/// and flushes are acknowledged.
fn answer_without_renderer(commands: &Receiver<Command>, events: &Sender<HostEvent>) {
    for command in commands.iter() {
        match command {
            Command::Capture(id) => {
                let _ = events.send(HostEvent::Captured { id, result: None });
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => return,
            Command::Task(_) | Command::Invalidate => {}
        }
    }
}

fn present(engine: &mut RenderEngine, events: &Sender<HostEvent>) {
    match engine.draw() {
        Some(Ok(frame)) => {
            let _ = events.send(HostEvent::Frame(frame));
        }
        Some(Err(err)) => warn!(%err, "frame draw failed"),
        None => {}
    }
}

fn publish(engine: &RenderEngine, snapshot: &Mutex<EngineSnapshot>) {
    *lock(snapshot) = engine.snapshot();
}
