use image::RgbImage;

/// Window identifier (HWND value on Windows)
pub type WindowId = u64;

/// Sub-region of a window, in client coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRect {
    pub l: i32,
    pub t: i32,
    pub w: i32,
    pub h: i32,
}

impl CaptureRect {
    pub fn new(l: i32, t: i32, w: i32, h: i32) -> Self {
        Self { l, t, w, h }
    }

    /// Intersect with a `width` x `height` area anchored at the origin.
    /// Returns `None` when nothing of the rectangle lies inside it.
    pub fn clamp_to(&self, width: i32, height: i32) -> Option<CaptureRect> {
        let l = self.l.max(0);
        let t = self.t.max(0);
        let r = self.l.saturating_add(self.w).min(width);
        let b = self.t.saturating_add(self.h).min(height);
        if r <= l || b <= t {
            return None;
        }
        Some(CaptureRect { l, t, w: r - l, h: b - t })
    }
}

/// Raw screenshot pixel data (BGRA)
#[derive(Debug, Clone)]
pub struct Capture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
}

impl Capture {
    /// Copy out the part of the capture covered by `rect`, clamped to the
    /// capture bounds. `None` if the rectangle misses the capture entirely.
    pub fn crop(&self, rect: CaptureRect) -> Option<Capture> {
        let r = rect.clamp_to(self.width as i32, self.height as i32)?;
        let (l, t, w, h) = (r.l as u32, r.t as u32, r.w as u32, r.h as u32);
        let row_len = (w * 4) as usize;
        let mut data = Vec::with_capacity(row_len * h as usize);
        for y in t..t + h {
            let start = (y * self.bytes_per_row + l * 4) as usize;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        Some(Capture { data, width: w, height: h, bytes_per_row: w * 4 })
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let idx = (y * self.bytes_per_row + x * 4) as usize;
            image::Rgb([self.data[idx + 2], self.data[idx + 1], self.data[idx]])
        })
    }

    pub fn from_rgb_image(img: &RgbImage) -> Capture {
        let mut data = Vec::with_capacity((img.width() * img.height() * 4) as usize);
        for p in img.pixels() {
            data.extend_from_slice(&[p[2], p[1], p[0], 255]);
        }
        Capture {
            data,
            width: img.width(),
            height: img.height(),
            bytes_per_row: img.width() * 4,
        }
    }
}

/// An attached window being automated.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub window_id: WindowId,
    /// Module base address recorded at attach time. Not read by any action.
    pub base_address: Option<u64>,
}

impl Target {
    pub fn new(name: impl Into<String>, window_id: WindowId) -> Self {
        Self { name: name.into(), window_id, base_address: None }
    }

    /// Log prefix for this target's worker.
    pub fn tag(&self) -> String {
        format!("{}#{:x}", self.name, self.window_id)
    }
}

/// Lifecycle of one target's worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Paused,
}

/// Snapshot of a worker, for display
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub target: Target,
    pub state: WorkerState,
    pub passes: u64,
}

/// Command from TUI to scheduler
pub enum Command {
    Start,
    PauseAll,
    ResumeAll,
    Toggle(usize),
    Quit,
}
