pub mod stub;
pub mod hotkey;

#[cfg(target_os = "windows")]
pub mod windows;

use std::sync::Arc;

use anyhow::Result;

use crate::keys;
use crate::logger;
use crate::types::*;

/// Handle to one attached OS window. All coordinates are client-relative
/// unless stated otherwise.
pub trait WindowHandle: Send {
    fn id(&self) -> WindowId;
    /// Whether the handle still refers to a live window.
    fn is_alive(&self) -> bool;
    fn client_size(&self) -> Option<(i32, i32)>;
    fn screen_to_client(&self, x: i32, y: i32) -> Option<(i32, i32)>;
    /// Post a move/down/up sequence; `double` adds the native double-click pair.
    fn click(&mut self, x: i32, y: i32, double: bool) -> Result<()>;
    /// Deliver a key transition. `sync` waits for the window to process it.
    fn key(&mut self, vk: u16, down: bool, sync: bool) -> Result<()>;
    /// Off-screen render of the window contents, optionally cropped.
    fn capture(&mut self, crop: Option<CaptureRect>) -> Result<Capture>;
}

/// Platform-level operations (window enumeration, factory, keyboard state).
pub trait Platform: Send + Sync {
    fn get_instances(&self, pattern: &str) -> Vec<(WindowId, String)>;
    fn create_window(&self, window_id: WindowId) -> Box<dyn WindowHandle>;
    /// Whether the key with this code is physically held right now.
    fn is_key_down(&self, vk: u16) -> bool;
    /// Layout-aware code for a printable character.
    fn char_key_code(&self, ch: char) -> Option<u16> {
        keys::ascii_key_code(ch)
    }
}

/// Create the platform appropriate for the current OS.
pub fn create_platform(force_stub: bool) -> Arc<dyn Platform> {
    if force_stub {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        return Arc::new(stub::StubPlatform);
    }
    #[cfg(target_os = "windows")]
    {
        logger::register_prefix("win32", logger::COLOR_GRAY);
        return Arc::new(windows::Win32Platform);
    }
    #[cfg(not(target_os = "windows"))]
    {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        return Arc::new(stub::StubPlatform);
    }
}
