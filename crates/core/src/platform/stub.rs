use anyhow::{bail, Result};

use crate::types::*;
use crate::logger;
use super::{Platform, WindowHandle};

/// Logs every call. Used with `--stub` and on non-Windows hosts.
pub struct StubPlatform;

impl Platform for StubPlatform {
    fn get_instances(&self, pattern: &str) -> Vec<(WindowId, String)> {
        logger::info_p("stub", &format!("get_instances(\"{}\")", pattern));
        vec![(0x10001, format!("Window<{}>", pattern))]
    }

    fn create_window(&self, window_id: WindowId) -> Box<dyn WindowHandle> {
        logger::info_p("stub", &format!("create_window({:#x})", window_id));
        Box::new(StubWindow { window_id, size: (1280, 720) })
    }

    fn is_key_down(&self, _vk: u16) -> bool {
        false
    }
}

struct StubWindow {
    window_id: WindowId,
    size: (i32, i32),
}

impl WindowHandle for StubWindow {
    fn id(&self) -> WindowId { self.window_id }
    fn is_alive(&self) -> bool { true }
    fn client_size(&self) -> Option<(i32, i32)> { Some(self.size) }

    fn screen_to_client(&self, x: i32, y: i32) -> Option<(i32, i32)> {
        Some((x, y))
    }

    fn click(&mut self, x: i32, y: i32, double: bool) -> Result<()> {
        logger::info_p("stub", &format!("win({:#x}).click({}, {}, double={})", self.window_id, x, y, double));
        Ok(())
    }

    fn key(&mut self, vk: u16, down: bool, sync: bool) -> Result<()> {
        logger::info_p("stub", &format!("win({:#x}).key({:#04x}, down={}, sync={})", self.window_id, vk, down, sync));
        Ok(())
    }

    fn capture(&mut self, crop: Option<CaptureRect>) -> Result<Capture> {
        logger::info_p("stub", &format!("win({:#x}).capture({:?})", self.window_id, crop));
        bail!("stub platform cannot capture")
    }
}
