use image::ImageError;

use crate::components::tools::SubscriptionId;

/// Error type for canvas operations
#[derive(Debug)]
pub enum CanvasError {
    Io(std::io::Error),
    Image(ImageError),
    /// Zoom text that is not a number (optionally followed by `%`).
    InvalidZoom(String),
    /// A tool subscription could not be detached because it was not live.
    /// The signal wiring is inconsistent; the previous tool may still be
    /// able to reach the surface.
    StaleSubscription(SubscriptionId),
}

impl std::fmt::Display for CanvasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanvasError::Io(e) => write!(f, "I/O error: {}", e),
            CanvasError::Image(e) => write!(f, "Image error: {}", e),
            CanvasError::InvalidZoom(s) => write!(f, "Invalid zoom value: {:?}", s),
            CanvasError::StaleSubscription(id) => {
                write!(f, "Tool subscription {} was not live when detaching", id)
            }
        }
    }
}

impl std::error::Error for CanvasError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CanvasError::Io(e) => Some(e),
            CanvasError::Image(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CanvasError {
    fn from(e: std::io::Error) -> Self {
        CanvasError::Io(e)
    }
}

impl From<ImageError> for CanvasError {
    fn from(e: ImageError) -> Self {
        CanvasError::Image(e)
    }
}
