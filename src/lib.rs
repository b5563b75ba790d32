//! Raster canvas core for PaintFE: a tiled premultiplied pixel surface,
//! pluggable paint tools, live overlay previews and snapshot undo/redo.
//!
//! [`CanvasController`] is the entry point.  A host feeds it pointer input
//! and zoom gestures, draws [`CanvasController::displayed_image`], and
//! listens for [`CanvasEvent`]s.

pub mod canvas;
pub mod components;
pub mod controller;
pub mod error;
pub mod logger;
pub mod ops;
pub mod settings;

pub use canvas::{BlendMode, CanvasPos, PixelSurface, SurfaceId, TiledImage};
pub use components::history::{HistoryEntry, HistoryStack};
pub use components::tools::{
    GesturePhase, PaintTool, Pencil, PointerButton, PointerButtons, RectMarquee, ToolBinding,
    ToolEmitter,
};
pub use controller::{CanvasController, CanvasEvent, ObserverId};
pub use error::CanvasError;
pub use settings::CanvasSettings;
