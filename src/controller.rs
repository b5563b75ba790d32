use std::borrow::Cow;
use std::path::{Path, PathBuf};

use image::{DynamicImage, RgbaImage};

use crate::canvas::{BlendMode, CanvasPos, PixelSurface, TiledImage};
use crate::components::history::{HistoryEntry, HistoryStack};
use crate::components::tools::{
    GesturePhase, PaintTool, PointerButton, PointerButtons, SessionEvent, ToolSession,
};
use crate::error::CanvasError;
use crate::ops::composite;
use crate::settings::CanvasSettings;

/// Notifications delivered to observers, synchronously and in order.
#[derive(Clone, Debug, PartialEq)]
pub enum CanvasEvent {
    ContentChanged,
    ZoomChanged(f32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// What the view should currently show.
enum DisplayFrame {
    /// The committed surface itself.
    Committed,
    /// A tool preview composed over the committed surface.
    Composed(RgbaImage),
}

type Observer = Box<dyn FnMut(&CanvasEvent)>;

/// One editable canvas: the surface, its history, the active tool and the
/// view state around them.
pub struct CanvasController {
    surface: PixelSurface,
    history: HistoryStack,
    session: ToolSession,
    settings: CanvasSettings,
    /// `None` for canvases not opened from a file.
    image_path: Option<PathBuf>,
    /// Displayable region; always equals the surface size.
    scene_rect: (u32, u32),
    display: DisplayFrame,
    /// Bumped on every display refresh so a view can detect staleness.
    display_generation: u64,
    zoom: f32,
    observers: Vec<(ObserverId, Observer)>,
    next_observer_id: u64,
}

impl CanvasController {
    /// Blank canvas filled with the configured background (white by default).
    pub fn new_blank(width: u32, height: u32, settings: CanvasSettings) -> Self {
        let surface = PixelSurface::new_filled(width, height, settings.background_color());
        Self::with_surface(surface, settings, None, "New Canvas")
    }

    pub fn from_image(image: &DynamicImage, settings: CanvasSettings) -> Self {
        Self::with_surface(PixelSurface::from_dynamic(image), settings, None, "Open")
    }

    /// Decode an image file and start editing it.
    pub fn open(path: &Path, settings: CanvasSettings) -> Result<Self, CanvasError> {
        let surface = PixelSurface::from_dynamic(&image::open(path)?);
        log::info!(
            "opened {} ({}x{})",
            path.display(),
            surface.width(),
            surface.height()
        );
        Ok(Self::with_surface(surface, settings, Some(path.to_path_buf()), "Open"))
    }

    fn with_surface(
        surface: PixelSurface,
        settings: CanvasSettings,
        image_path: Option<PathBuf>,
        description: &str,
    ) -> Self {
        let settings = settings.normalized();
        let history = HistoryStack::with_limits(
            HistoryEntry::new(description, surface.snapshot()),
            settings.max_undo_steps,
            settings.max_history_bytes(),
        );
        Self {
            scene_rect: surface.dimensions(),
            surface,
            history,
            session: ToolSession::new(),
            settings,
            image_path,
            display: DisplayFrame::Committed,
            display_generation: 0,
            zoom: 1.0,
            observers: Vec::new(),
            next_observer_id: 0,
        }
    }

    // ========================================================================
    // TOOLS & POINTER INPUT
    // ========================================================================

    /// Install `tool` (or none) and return the previous one.
    ///
    /// Any gesture in progress is abandoned without a commit, and whatever
    /// it already painted is rolled back to the current history entry.  A
    /// failure to detach the previous tool is an internal inconsistency: it
    /// is logged, the canvas is left with no tool, and the error is returned.
    pub fn set_tool(
        &mut self,
        tool: Option<Box<dyn PaintTool>>,
    ) -> Result<Option<Box<dyn PaintTool>>, CanvasError> {
        let abandoned = self.session.is_dirty();
        let installed = self.session.install(tool, self.surface.id());
        if abandoned {
            log::debug!("rolling back uncommitted paint from the previous tool");
            let pixels = self.history.current().pixels().clone();
            self.install_pixels(pixels);
            self.emit(CanvasEvent::ContentChanged);
        } else {
            self.refresh_display();
        }
        installed
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.session.tool_name()
    }

    pub fn gesture_phase(&self) -> GesturePhase {
        self.session.phase()
    }

    pub fn pointer_press(&mut self, pos: CanvasPos, button: PointerButton) {
        let events = self.session.press(&mut self.surface, pos, button);
        self.apply_session_events(events);
    }

    pub fn pointer_move(&mut self, pos: CanvasPos, buttons: PointerButtons) {
        let events = self.session.move_to(&mut self.surface, pos, buttons);
        self.apply_session_events(events);
    }

    pub fn pointer_release(&mut self, pos: CanvasPos) {
        let events = self.session.release(&mut self.surface, pos);
        self.apply_session_events(events);
    }

    /// Handle signals the active tool raised outside a pointer callback.
    pub fn process_tool_signals(&mut self) {
        let events = self.session.process_pending();
        self.apply_session_events(events);
    }

    fn apply_session_events(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Painted => {
                    self.refresh_display();
                    self.emit(CanvasEvent::ContentChanged);
                }
                SessionEvent::Overlay { image, mode } => {
                    self.show_overlay(&image, mode);
                }
                SessionEvent::GestureFinished { description } => {
                    self.commit(description);
                    self.emit(CanvasEvent::ContentChanged);
                }
            }
        }
    }

    // ========================================================================
    // CONTENT & HISTORY
    // ========================================================================

    /// Replace the whole image.  Recorded as its own history entry.
    pub fn set_image(&mut self, image: &DynamicImage) {
        let surface = PixelSurface::from_dynamic(image);
        self.set_pixels(surface.snapshot(), "Set Image");
    }

    /// Replace the whole image with already-premultiplied pixels.
    pub fn set_pixels(&mut self, pixels: TiledImage, description: &str) {
        self.install_pixels(pixels);
        self.commit(description.to_string());
        self.emit(CanvasEvent::ContentChanged);
    }

    pub fn undo(&mut self) -> bool {
        let Some(entry) = self.history.undo() else {
            return false;
        };
        log::debug!("undo -> '{}'", entry.description());
        let pixels = entry.pixels().clone();
        self.restore(pixels);
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(entry) = self.history.redo() else {
            return false;
        };
        log::debug!("redo -> '{}'", entry.description());
        let pixels = entry.pixels().clone();
        self.restore(pixels);
        true
    }

    /// Revert (or re-apply) straight to a history position, as a history
    /// panel click does.  No new entry is recorded.
    pub fn jump_to_history(&mut self, index: usize) {
        if index == self.history.index() {
            return;
        }
        let pixels = self.history.jump_to(index).pixels().clone();
        self.restore(pixels);
    }

    pub fn is_undo_available(&self) -> bool {
        self.history.can_undo()
    }

    pub fn is_redo_available(&self) -> bool {
        self.history.can_redo()
    }

    pub fn history(&self) -> &HistoryStack {
        &self.history
    }

    fn restore(&mut self, pixels: TiledImage) {
        self.install_pixels(pixels);
        debug_assert!(self.history.current().pixels().same_pixels(self.surface.pixels()));
        self.emit(CanvasEvent::ContentChanged);
    }

    fn commit(&mut self, description: String) {
        log::info!("commit '{}'", description);
        self.history
            .commit(HistoryEntry::new(description, self.surface.snapshot()));
        debug_assert!(self.history.current().pixels().same_pixels(self.surface.pixels()));
    }

    /// Swap the surface pixels, resizing the displayable region first when
    /// the size changes.
    fn install_pixels(&mut self, pixels: TiledImage) {
        if pixels.dimensions() != self.scene_rect {
            log::debug!(
                "scene resized {:?} -> {:?}",
                self.scene_rect,
                pixels.dimensions()
            );
            self.scene_rect = pixels.dimensions();
        }
        self.surface.replace(pixels);
        self.refresh_display();
    }

    // ========================================================================
    // DISPLAY
    // ========================================================================

    fn refresh_display(&mut self) {
        self.display = DisplayFrame::Committed;
        self.display_generation = self.display_generation.wrapping_add(1);
    }

    fn show_overlay(&mut self, overlay: &RgbaImage, mode: BlendMode) {
        let composed = composite::compose(self.surface.pixels(), overlay, mode);
        self.display = DisplayFrame::Composed(composed);
        self.display_generation = self.display_generation.wrapping_add(1);
    }

    /// The image the view should draw right now (premultiplied).
    pub fn displayed_image(&self) -> Cow<'_, RgbaImage> {
        match &self.display {
            DisplayFrame::Committed => Cow::Owned(self.surface.to_rgba_image()),
            DisplayFrame::Composed(image) => Cow::Borrowed(image),
        }
    }

    pub fn is_overlay_shown(&self) -> bool {
        matches!(self.display, DisplayFrame::Composed(_))
    }

    pub fn display_generation(&self) -> u64 {
        self.display_generation
    }

    pub fn scene_rect(&self) -> (u32, u32) {
        self.scene_rect
    }

    /// The committed content (premultiplied), never including an overlay.
    pub fn current_image(&self) -> RgbaImage {
        self.surface.to_rgba_image()
    }

    pub fn surface(&self) -> &PixelSurface {
        &self.surface
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.image_path.as_deref()
    }

    pub fn settings(&self) -> &CanvasSettings {
        &self.settings
    }

    // ========================================================================
    // ZOOM (view state only, never recorded in history)
    // ========================================================================

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    /// Shrink to fit a `viewport_w`×`viewport_h` view.  Never enlarges.
    pub fn auto_fit(&mut self, viewport_w: f32, viewport_h: f32) {
        let (w, h) = self.surface.dimensions();
        if w > 0 && h > 0 {
            let scale_x = viewport_w / w as f32;
            let scale_y = viewport_h / h as f32;
            let scale = scale_x.min(scale_y);
            if scale < 1.0 {
                self.zoom = self.settings.clamp_zoom(scale);
            }
        }
        self.emit(CanvasEvent::ZoomChanged(self.zoom));
    }

    /// Set zoom from text such as `"150%"` or `"75"`.  Does not notify
    /// observers; the caller is the one that chose the value.
    pub fn set_zoom_percent(&mut self, rate: &str) -> Result<f32, CanvasError> {
        let number = match rate.rfind('%') {
            Some(idx) => &rate[..idx],
            None => rate,
        };
        let percent: f32 = number
            .trim()
            .parse()
            .map_err(|_| CanvasError::InvalidZoom(rate.to_string()))?;
        if !percent.is_finite() || percent <= 0.0 {
            return Err(CanvasError::InvalidZoom(rate.to_string()));
        }
        self.zoom = self.settings.clamp_zoom(percent / 100.0);
        Ok(self.zoom)
    }

    /// One wheel notch: positive delta zooms out, anything else zooms in.
    pub fn wheel_zoom(&mut self, delta: f32) {
        let step = self.settings.wheel_step;
        self.zoom = if delta > 0.0 {
            (self.zoom / step).max(self.settings.zoom_min)
        } else {
            (self.zoom * step).min(self.settings.zoom_max)
        };
        self.emit(CanvasEvent::ZoomChanged(self.zoom));
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    pub fn subscribe(&mut self, observer: impl FnMut(&CanvasEvent) + 'static) -> ObserverId {
        self.next_observer_id += 1;
        let id = ObserverId(self.next_observer_id);
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    fn emit(&mut self, event: CanvasEvent) {
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
    }
}

impl Drop for CanvasController {
    fn drop(&mut self) {
        if let Err(e) = self.session.install(None, self.surface.id()) {
            log::error!("detaching tool on canvas drop: {}", e);
        }
    }
}
