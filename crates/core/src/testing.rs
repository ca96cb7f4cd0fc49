//! Fakes shared by the unit tests.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use image::{GrayImage, RgbImage};

use crate::frames::{FrameSink, NoopSink};
use crate::interpreter::{Engine, Limits};
use crate::matcher::ocr::TextRecognizer;
use crate::platform::{Platform, WindowHandle};
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Click { x: i32, y: i32, double: bool },
    Key { vk: u16, down: bool, sync: bool },
    Capture(Option<CaptureRect>),
}

pub type Log = Arc<Mutex<Vec<Event>>>;

/// Window that records everything sent to it. Its client area starts at
/// `origin` on screen.
pub struct Recorder {
    pub id: WindowId,
    pub origin: (i32, i32),
    pub size: (i32, i32),
    pub alive: bool,
    pub frame: Option<RgbImage>,
    /// Key code whose key-down fails without being recorded.
    pub fail_key: Option<u16>,
    pub log: Log,
}

impl Recorder {
    pub fn new(log: Log) -> Self {
        Self { id: 1, origin: (0, 0), size: (640, 480), alive: true, frame: None, fail_key: None, log }
    }
}

impl WindowHandle for Recorder {
    fn id(&self) -> WindowId { self.id }
    fn is_alive(&self) -> bool { self.alive }
    fn client_size(&self) -> Option<(i32, i32)> { Some(self.size) }

    fn screen_to_client(&self, x: i32, y: i32) -> Option<(i32, i32)> {
        Some((x - self.origin.0, y - self.origin.1))
    }

    fn click(&mut self, x: i32, y: i32, double: bool) -> Result<()> {
        self.log.lock().unwrap().push(Event::Click { x, y, double });
        Ok(())
    }

    fn key(&mut self, vk: u16, down: bool, sync: bool) -> Result<()> {
        if down && self.fail_key == Some(vk) {
            bail!("key {:#04x} rejected", vk);
        }
        self.log.lock().unwrap().push(Event::Key { vk, down, sync });
        Ok(())
    }

    fn capture(&mut self, crop: Option<CaptureRect>) -> Result<Capture> {
        self.log.lock().unwrap().push(Event::Capture(crop));
        let Some(img) = &self.frame else { bail!("no frame") };
        let full = Capture::from_rgb_image(img);
        match crop {
            Some(r) => full.crop(r).ok_or_else(|| anyhow::anyhow!("crop outside frame")),
            None => Ok(full),
        }
    }
}

/// Hands out `Recorder`s that share one log.
pub struct FakePlatform {
    pub log: Log,
}

impl Platform for FakePlatform {
    fn get_instances(&self, pattern: &str) -> Vec<(WindowId, String)> {
        vec![(1, format!("Fake {}", pattern))]
    }

    fn create_window(&self, window_id: WindowId) -> Box<dyn WindowHandle> {
        let mut w = Recorder::new(self.log.clone());
        w.id = window_id;
        Box::new(w)
    }

    fn is_key_down(&self, _vk: u16) -> bool {
        false
    }
}

/// OCR engine that always reads the same text.
pub struct CannedText(pub String);

impl TextRecognizer for CannedText {
    fn recognize(&self, _image: &GrayImage, _psm: u8) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Prefix and size of every frame handed to a sink.
pub type Frames = Arc<Mutex<Vec<(String, u32, u32)>>>;

pub struct FrameLog(pub Frames);

impl FrameSink for FrameLog {
    fn record(&self, prefix: &str, frame: &Capture) {
        self.0.lock().unwrap().push((prefix.to_string(), frame.width, frame.height));
    }
}

pub fn engine(log: &Log, ocr_text: &str) -> Engine {
    Engine {
        platform: Arc::new(FakePlatform { log: log.clone() }),
        frames: Box::new(NoopSink),
        ocr: Box::new(CannedText(ocr_text.to_string())),
        limits: Limits::default(),
    }
}

pub fn clicks(log: &Log) -> Vec<(i32, i32)> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Click { x, y, .. } => Some((*x, *y)),
            _ => None,
        })
        .collect()
}
