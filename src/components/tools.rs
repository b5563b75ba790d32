use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::canvas::{BlendMode, CanvasPos, PixelSurface, SurfaceId, premultiply};
use crate::error::CanvasError;

// ============================================================================
// POINTER INPUT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointerButton {
    Primary,
    Secondary,
    Middle,
}

/// Buttons held while the pointer moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PointerButtons {
    pub primary: bool,
    pub secondary: bool,
    pub middle: bool,
}

impl PointerButtons {
    pub const NONE: Self = Self { primary: false, secondary: false, middle: false };
    pub const PRIMARY: Self = Self { primary: true, secondary: false, middle: false };
    pub const SECONDARY: Self = Self { primary: false, secondary: true, middle: false };
    pub const MIDDLE: Self = Self { primary: false, secondary: false, middle: true };

    /// The drawing button, if exactly one of primary/secondary is held and
    /// nothing else.  Chorded or middle-button drags are not drawing drags.
    pub fn drawing_button(&self) -> Option<PointerButton> {
        match (self.primary, self.secondary, self.middle) {
            (true, false, false) => Some(PointerButton::Primary),
            (false, true, false) => Some(PointerButton::Secondary),
            _ => None,
        }
    }
}

impl From<PointerButton> for PointerButtons {
    fn from(button: PointerButton) -> Self {
        match button {
            PointerButton::Primary => Self::PRIMARY,
            PointerButton::Secondary => Self::SECONDARY,
            PointerButton::Middle => Self::MIDDLE,
        }
    }
}

// ============================================================================
// TOOL SIGNALS - subscription bus between the active tool and the canvas
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outbound notifications a bound tool may raise at any time.
#[derive(Clone, Debug)]
pub enum ToolSignal {
    /// The tool wrote pixels into the given surface.
    Painted(SurfaceId),
    /// A preview image (premultiplied, anchored at the canvas origin) to be
    /// shown over the committed surface.
    Overlay { image: RgbaImage, mode: BlendMode },
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    live: Vec<SubscriptionId>,
    queue: VecDeque<(SubscriptionId, ToolSignal)>,
}

/// Queue of tool signals, tagged with the subscription that raised them.
///
/// Signals are delivered in emission order when the owner drains the bus,
/// which the session does right after every tool callback.
#[derive(Clone, Default)]
pub struct SignalBus {
    state: Rc<RefCell<BusState>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription and hand back the emitter a tool uses.
    pub fn connect(&self) -> (SubscriptionId, ToolEmitter) {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.live.push(id);
        let emitter = ToolEmitter {
            id,
            bus: Rc::downgrade(&self.state),
        };
        (id, emitter)
    }

    /// Unregister a subscription and discard anything it still has queued.
    /// Detaching an id that is not live is an error: it means the wiring
    /// no longer matches the installed tool.
    pub fn disconnect(&self, id: SubscriptionId) -> Result<(), CanvasError> {
        let mut state = self.state.borrow_mut();
        let Some(pos) = state.live.iter().position(|live| *live == id) else {
            return Err(CanvasError::StaleSubscription(id));
        };
        state.live.swap_remove(pos);
        state.queue.retain(|(sub, _)| *sub != id);
        Ok(())
    }

    pub fn is_live(&self, id: SubscriptionId) -> bool {
        self.state.borrow().live.contains(&id)
    }

    /// Number of signals waiting to be drained.
    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Take every queued signal, oldest first.
    pub fn drain(&self) -> Vec<(SubscriptionId, ToolSignal)> {
        self.state.borrow_mut().queue.drain(..).collect()
    }
}

/// The sending half of a subscription, owned by a tool.
///
/// Holds only a weak reference to the bus; after the subscription is
/// detached (or the canvas is gone) every emit is silently dropped.
#[derive(Clone)]
pub struct ToolEmitter {
    id: SubscriptionId,
    bus: Weak<RefCell<BusState>>,
}

impl ToolEmitter {
    pub fn subscription(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|state| state.borrow().live.contains(&self.id))
    }

    /// Report that pixels were written into `surface`.
    pub fn painted(&self, surface: SurfaceId) -> bool {
        self.emit(ToolSignal::Painted(surface))
    }

    /// Show `image` over the committed surface using `mode`.
    pub fn overlay(&self, image: RgbaImage, mode: BlendMode) -> bool {
        self.emit(ToolSignal::Overlay { image, mode })
    }

    /// Returns false if the signal was dropped.
    pub fn emit(&self, signal: ToolSignal) -> bool {
        let Some(state) = self.bus.upgrade() else { return false };
        let mut state = state.borrow_mut();
        if !state.live.contains(&self.id) {
            log::trace!("dropping signal from detached subscription {}", self.id);
            return false;
        }
        state.queue.push_back((self.id, signal));
        true
    }
}

// ============================================================================
// TOOL CONTRACT
// ============================================================================

/// What a tool receives when it is installed on a canvas.
#[derive(Clone)]
pub struct ToolBinding {
    pub surface: SurfaceId,
    pub emitter: ToolEmitter,
}

/// A pluggable drawing tool.
///
/// The surface is lent mutably for the duration of each callback only.
/// Tools report what they did through the emitter in their binding.
pub trait PaintTool {
    /// Short name, also used as the history entry description.
    fn name(&self) -> &str;

    /// Called once when the tool is installed.  Replaces any earlier binding.
    fn bind(&mut self, binding: ToolBinding);

    fn on_press(&mut self, surface: &mut PixelSurface, pos: CanvasPos, button: PointerButton);

    fn on_move(&mut self, surface: &mut PixelSurface, pos: CanvasPos);

    fn on_release(&mut self, surface: &mut PixelSurface, pos: CanvasPos);
}

// ============================================================================
// TOOL SESSION - one pointer gesture at a time
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GesturePhase {
    #[default]
    Idle,
    Pressed,
    Dragging,
}

/// What the canvas must do in response to tool activity, in order.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The bound surface was written to: refresh and notify now.
    Painted,
    /// Show a composed preview.
    Overlay { image: RgbaImage, mode: BlendMode },
    /// A gesture that painted has ended: commit one history entry.
    GestureFinished { description: String },
}

/// Routes pointer input to the installed tool and tracks whether the
/// current gesture actually changed the surface.
pub struct ToolSession {
    bus: SignalBus,
    tool: Option<Box<dyn PaintTool>>,
    subscription: Option<SubscriptionId>,
    bound_surface: Option<SurfaceId>,
    phase: GesturePhase,
    dirty: bool,
}

impl Default for ToolSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSession {
    pub fn new() -> Self {
        Self {
            bus: SignalBus::new(),
            tool: None,
            subscription: None,
            bound_surface: None,
            phase: GesturePhase::Idle,
            dirty: false,
        }
    }

    /// Swap the active tool.  The previous tool's subscription is detached
    /// first and any uncommitted gesture state is discarded.  Returns the
    /// previous tool.
    ///
    /// If detaching fails the session is left with no tool and the error is
    /// returned; nothing the old tool did afterwards can reach the canvas.
    pub fn install(
        &mut self,
        tool: Option<Box<dyn PaintTool>>,
        surface: SurfaceId,
    ) -> Result<Option<Box<dyn PaintTool>>, CanvasError> {
        if self.dirty {
            log::debug!("tool swapped mid-gesture; discarding uncommitted paint state");
        }
        self.reset_gesture();

        let detached = self.detach();
        let previous = self.tool.take();
        self.bound_surface = None;
        if let Err(e) = detached {
            log::error!("failed to detach previous tool: {}", e);
            return Err(e);
        }

        if let Some(mut tool) = tool {
            let (id, emitter) = self.bus.connect();
            log::info!("installing tool '{}' (subscription {})", tool.name(), id);
            tool.bind(ToolBinding { surface, emitter });
            self.subscription = Some(id);
            self.bound_surface = Some(surface);
            self.tool = Some(tool);
        }

        Ok(previous)
    }

    /// Detach the current subscription, if any.  Calling this with nothing
    /// attached is a no-op.
    fn detach(&mut self) -> Result<(), CanvasError> {
        match self.subscription.take() {
            Some(id) => self.bus.disconnect(id),
            None => Ok(()),
        }
    }

    pub fn press(
        &mut self,
        surface: &mut PixelSurface,
        pos: CanvasPos,
        button: PointerButton,
    ) -> Vec<SessionEvent> {
        let Some(tool) = self.tool.as_mut() else {
            return Vec::new();
        };
        self.dirty = false;
        tool.on_press(surface, pos, button);
        self.phase = GesturePhase::Pressed;
        self.collect()
    }

    /// Forwarded only while exactly one drawing button is held.
    pub fn move_to(
        &mut self,
        surface: &mut PixelSurface,
        pos: CanvasPos,
        buttons: PointerButtons,
    ) -> Vec<SessionEvent> {
        if buttons.drawing_button().is_none() {
            return Vec::new();
        }
        let Some(tool) = self.tool.as_mut() else {
            return Vec::new();
        };
        tool.on_move(surface, pos);
        if self.phase != GesturePhase::Idle {
            self.phase = GesturePhase::Dragging;
        }
        self.collect()
    }

    pub fn release(&mut self, surface: &mut PixelSurface, pos: CanvasPos) -> Vec<SessionEvent> {
        let mut events = match self.tool.as_mut() {
            Some(tool) => {
                tool.on_release(surface, pos);
                self.collect()
            }
            None => Vec::new(),
        };

        if self.dirty {
            let description = self.tool_name().unwrap_or("Stroke").to_string();
            events.push(SessionEvent::GestureFinished { description });
        }
        self.reset_gesture();
        events
    }

    /// Handle signals a tool raised outside of a pointer callback.
    pub fn process_pending(&mut self) -> Vec<SessionEvent> {
        self.collect()
    }

    fn collect(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for (id, signal) in self.bus.drain() {
            if Some(id) != self.subscription {
                log::warn!("ignoring signal from foreign subscription {}", id);
                continue;
            }
            match signal {
                ToolSignal::Painted(surface) if Some(surface) == self.bound_surface => {
                    self.dirty = true;
                    events.push(SessionEvent::Painted);
                }
                ToolSignal::Painted(surface) => {
                    log::warn!("ignoring paint report for unbound surface {}", surface);
                }
                ToolSignal::Overlay { image, mode } => {
                    events.push(SessionEvent::Overlay { image, mode });
                }
            }
        }
        events
    }

    fn reset_gesture(&mut self) {
        self.phase = GesturePhase::Idle;
        self.dirty = false;
    }

    pub fn phase(&self) -> GesturePhase {
        self.phase
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_tool(&self) -> bool {
        self.tool.is_some()
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.tool.as_deref().map(|t| t.name())
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }
}

// ============================================================================
// PENCIL - hard 1px lines, primary/secondary colour by button
// ============================================================================

pub struct Pencil {
    /// Straight alpha; premultiplied when written.
    pub primary_color: Rgba<u8>,
    pub secondary_color: Rgba<u8>,
    binding: Option<ToolBinding>,
    last_pos: Option<(i64, i64)>,
    using_secondary_color: bool,
}

impl Default for Pencil {
    fn default() -> Self {
        Self::new(Rgba([0, 0, 0, 255]), Rgba([255, 255, 255, 255]))
    }
}

impl Pencil {
    pub fn new(primary_color: Rgba<u8>, secondary_color: Rgba<u8>) -> Self {
        Self {
            primary_color,
            secondary_color,
            binding: None,
            last_pos: None,
            using_secondary_color: false,
        }
    }

    fn color(&self) -> Rgba<u8> {
        premultiply(if self.using_secondary_color {
            self.secondary_color
        } else {
            self.primary_color
        })
    }

    /// Bresenham line; returns how many in-bounds pixels were written.
    fn draw_pixel_line(&self, surface: &mut PixelSurface, start: (i64, i64), end: (i64, i64)) -> usize {
        let (w, h) = (surface.width() as i64, surface.height() as i64);
        let Some(((mut x0, mut y0), (x1, y1))) = clip_segment(start, end, w, h) else {
            return 0;
        };
        let color = self.color();

        let dx = (x1 - x0).abs();
        let dy = (y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx - dy;
        let mut written = 0;

        loop {
            if x0 >= 0 && x0 < w && y0 >= 0 && y0 < h {
                surface.put_pixel(x0 as u32, y0 as u32, color);
                written += 1;
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 > -dy {
                err -= dy;
                x0 += sx;
            }
            if e2 < dx {
                err += dx;
                y0 += sy;
            }
        }
        written
    }

    fn stroke_to(&mut self, surface: &mut PixelSurface, pos: CanvasPos) {
        let end = (pos.x.floor() as i64, pos.y.floor() as i64);
        let start = self.last_pos.unwrap_or(end);
        let written = self.draw_pixel_line(surface, start, end);
        self.last_pos = Some(end);

        if written > 0
            && let Some(binding) = &self.binding
        {
            binding.emitter.painted(binding.surface);
        }
    }
}

/// Clip a segment to a `width`×`height` canvas grown by one pixel on every
/// side (Liang-Barsky).  Pointer positions far off the canvas then cost no
/// more to rasterise than an on-canvas line.
fn clip_segment(
    start: (i64, i64),
    end: (i64, i64),
    width: i64,
    height: i64,
) -> Option<((i64, i64), (i64, i64))> {
    let (x0, y0) = (start.0 as f64, start.1 as f64);
    let dx = end.0 as f64 - x0;
    let dy = end.1 as f64 - y0;
    let (max_x, max_y) = (width as f64, height as f64);

    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for (p, q) in [(-dx, x0 + 1.0), (dx, max_x - x0), (-dy, y0 + 1.0), (dy, max_y - y0)] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else {
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return None;
                }
                t0 = t0.max(r);
            } else {
                if r < t0 {
                    return None;
                }
                t1 = t1.min(r);
            }
        }
    }

    let at = |t: f64| ((x0 + t * dx).round() as i64, (y0 + t * dy).round() as i64);
    let clipped_start = if t0 == 0.0 { start } else { at(t0) };
    let clipped_end = if t1 == 1.0 { end } else { at(t1) };
    Some((clipped_start, clipped_end))
}

impl PaintTool for Pencil {
    fn name(&self) -> &str {
        "Pencil"
    }

    fn bind(&mut self, binding: ToolBinding) {
        self.binding = Some(binding);
        self.last_pos = None;
    }

    fn on_press(&mut self, surface: &mut PixelSurface, pos: CanvasPos, button: PointerButton) {
        self.using_secondary_color = button == PointerButton::Secondary;
        self.last_pos = None;
        self.stroke_to(surface, pos);
    }

    fn on_move(&mut self, surface: &mut PixelSurface, pos: CanvasPos) {
        if self.last_pos.is_some() {
            self.stroke_to(surface, pos);
        }
    }

    fn on_release(&mut self, surface: &mut PixelSurface, pos: CanvasPos) {
        if self.last_pos.is_some() {
            self.stroke_to(surface, pos);
        }
        self.last_pos = None;
    }
}

// ============================================================================
// RECTANGLE MARQUEE - rubber-band preview only, never paints
// ============================================================================

/// Inclusive pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

pub struct RectMarquee {
    /// Premultiplied outline colour.
    pub outline: Rgba<u8>,
    pub mode: BlendMode,
    binding: Option<ToolBinding>,
    anchor: Option<CanvasPos>,
    selection: Option<PixelRect>,
}

impl Default for RectMarquee {
    fn default() -> Self {
        Self {
            outline: Rgba([0, 0, 0, 255]),
            mode: BlendMode::Xor,
            binding: None,
            anchor: None,
            selection: None,
        }
    }
}

impl RectMarquee {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last rectangle dragged out, clamped to the canvas.
    pub fn selection(&self) -> Option<PixelRect> {
        self.selection
    }

    fn clamp_rect(a: CanvasPos, b: CanvasPos, width: u32, height: u32) -> Option<PixelRect> {
        if width == 0 || height == 0 {
            return None;
        }
        let clamp_x = |v: f32| (v.floor().max(0.0) as u32).min(width - 1);
        let clamp_y = |v: f32| (v.floor().max(0.0) as u32).min(height - 1);
        Some(PixelRect {
            min_x: clamp_x(a.x.min(b.x)),
            min_y: clamp_y(a.y.min(b.y)),
            max_x: clamp_x(a.x.max(b.x)),
            max_y: clamp_y(a.y.max(b.y)),
        })
    }

    fn render_outline(&self, rect: PixelRect, width: u32, height: u32) -> RgbaImage {
        let mut img = RgbaImage::new(width, height);
        for x in rect.min_x..=rect.max_x {
            img.put_pixel(x, rect.min_y, self.outline);
            img.put_pixel(x, rect.max_y, self.outline);
        }
        for y in rect.min_y..=rect.max_y {
            img.put_pixel(rect.min_x, y, self.outline);
            img.put_pixel(rect.max_x, y, self.outline);
        }
        img
    }

    fn update_preview(&mut self, surface: &PixelSurface, pos: CanvasPos) {
        let Some(anchor) = self.anchor else { return };
        let (w, h) = surface.dimensions();
        self.selection = Self::clamp_rect(anchor, pos, w, h);
        if let (Some(rect), Some(binding)) = (self.selection, &self.binding) {
            binding.emitter.overlay(self.render_outline(rect, w, h), self.mode);
        }
    }
}

impl PaintTool for RectMarquee {
    fn name(&self) -> &str {
        "Rectangle Select"
    }

    fn bind(&mut self, binding: ToolBinding) {
        self.binding = Some(binding);
        self.anchor = None;
    }

    fn on_press(&mut self, surface: &mut PixelSurface, pos: CanvasPos, _button: PointerButton) {
        self.anchor = Some(pos);
        self.update_preview(surface, pos);
    }

    fn on_move(&mut self, surface: &mut PixelSurface, pos: CanvasPos) {
        self.update_preview(surface, pos);
    }

    fn on_release(&mut self, surface: &mut PixelSurface, pos: CanvasPos) {
        self.update_preview(surface, pos);
        self.anchor = None;
    }
}
