//! Debug frame persistence. Best effort: nothing here reports failure.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::logger;
use crate::types::Capture;

pub const IMAGE_PREFIX: &str = "image_matcher";
pub const OCR_PREFIX: &str = "ocr_image";

/// Receives every frame a matcher looks at.
pub trait FrameSink: Send + Sync {
    fn record(&self, prefix: &str, frame: &Capture);
}

pub struct NoopSink;

impl FrameSink for NoopSink {
    fn record(&self, _prefix: &str, _frame: &Capture) {}
}

/// Writes `<prefix>_<timestamp>.png` into `dir` and keeps the newest `keep`
/// files per prefix.
pub struct RollingPngSink {
    dir: PathBuf,
    keep: usize,
}

impl RollingPngSink {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self { dir: dir.into(), keep: keep.max(1) }
    }

    fn frames_of(&self, prefix: &str) -> Vec<PathBuf> {
        let lead = format!("{}_", prefix);
        let Ok(entries) = fs::read_dir(&self.dir) else { return Vec::new() };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                let name = p.file_name().unwrap_or_default().to_string_lossy();
                name.starts_with(&lead) && name.ends_with(".png")
            })
            .collect();
        // timestamps are fixed-width, so name order is age order
        files.sort();
        files
    }

    fn prune(&self, prefix: &str) {
        let files = self.frames_of(prefix);
        let excess = files.len().saturating_sub(self.keep);
        for old in &files[..excess] {
            if let Err(e) = fs::remove_file(old) {
                logger::warn(&format!("could not delete old frame {}: {}", old.display(), e));
            }
        }
    }
}

impl FrameSink for RollingPngSink {
    fn record(&self, prefix: &str, frame: &Capture) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            logger::warn(&format!("could not create {}: {}", self.dir.display(), e));
            return;
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%6f");
        let path = self.dir.join(format!("{}_{}.png", prefix, stamp));
        if let Err(e) = frame.to_rgb_image().save(&path) {
            logger::warn(&format!("could not save frame {}: {}", path.display(), e));
            return;
        }
        self.prune(prefix);
    }
}

/// Sink selected by the `debug_frames` setting.
pub fn from_settings(enabled: bool, dir: &Path, keep: usize) -> Box<dyn FrameSink> {
    if enabled {
        Box::new(RollingPngSink::new(dir, keep))
    } else {
        Box::new(NoopSink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame() -> Capture {
        Capture::from_rgb_image(&RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30])))
    }

    #[test]
    fn keeps_newest_per_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RollingPngSink::new(dir.path(), 3);
        for _ in 0..5 {
            sink.record(IMAGE_PREFIX, &frame());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        sink.record(OCR_PREFIX, &frame());

        assert_eq!(sink.frames_of(IMAGE_PREFIX).len(), 3);
        assert_eq!(sink.frames_of(OCR_PREFIX).len(), 1);

        let saved = image::open(&sink.frames_of(OCR_PREFIX)[0]).unwrap().to_rgb8();
        assert_eq!(saved.get_pixel(3, 2), &image::Rgb([10, 20, 30]));
    }

    #[test]
    fn unwritable_dir_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let sink = RollingPngSink::new(blocker.join("frames"), 5);
        sink.record(IMAGE_PREFIX, &frame());
    }
}
