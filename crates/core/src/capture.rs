//! Window capture helpers shared by the matchers.

use anyhow::{anyhow, bail, Result};

use crate::platform::WindowHandle;
use crate::types::*;

/// First positive size among client area, restore rectangle and window
/// rectangle. Minimized windows report an empty client area.
pub fn resolve_capture_size(
    client: Option<(i32, i32)>,
    restore: Option<(i32, i32)>,
    window: Option<(i32, i32)>,
) -> Option<(i32, i32)> {
    [client, restore, window]
        .into_iter()
        .flatten()
        .find(|&(w, h)| w > 0 && h > 0)
}

/// What a capture renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePlan {
    pub width: i32,
    pub height: i32,
    /// Render only the client area, so frame pixel (0, 0) is client (0, 0).
    /// Otherwise the whole window, frame and caption included, is drawn.
    pub client_only: bool,
}

/// The client area when it has a size, else the whole window at the first
/// positive fallback size. Crops are only ever computed against a non-empty
/// client area, so they always land on a client-only frame.
pub fn plan_capture(
    client: Option<(i32, i32)>,
    restore: Option<(i32, i32)>,
    window: Option<(i32, i32)>,
) -> Option<CapturePlan> {
    if let Some((width, height)) = resolve_capture_size(client, None, None) {
        return Some(CapturePlan { width, height, client_only: true });
    }
    resolve_capture_size(None, restore, window).map(|(width, height)| CapturePlan {
        width,
        height,
        client_only: false,
    })
}

/// Convert an authored screen rectangle to the window's current client
/// coordinates and clamp it to the client area.
pub fn client_crop(window: &dyn WindowHandle, screen: (i32, i32, i32, i32)) -> Option<CaptureRect> {
    let (x, y, w, h) = screen;
    let (cx, cy) = window.screen_to_client(x, y)?;
    let (cw, ch) = window.client_size().filter(|&(w, h)| w > 0 && h > 0)?;
    CaptureRect::new(cx, cy, w, h).clamp_to(cw, ch)
}

/// Capture the window, or the authored region of it. Any failure here sends
/// the conditional to its false branch.
pub fn capture_region(
    window: &mut dyn WindowHandle,
    screen_rect: Option<(i32, i32, i32, i32)>,
) -> Result<Capture> {
    if !window.is_alive() {
        bail!("window {:#x} is no longer alive", window.id());
    }
    let crop = match screen_rect {
        Some(rect) => Some(
            client_crop(window, rect)
                .ok_or_else(|| anyhow!("crop {:?} does not overlap the client area", rect))?,
        ),
        None => None,
    };
    window.capture(crop)
}
