//! Template matching by normalized cross-correlation (mean-subtracted,
//! the `CCOEFF_NORMED` formulation), with overlap suppression.

use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::logger;
use crate::types::Capture;
use super::luma;

/// At or above this fraction every color channel has to correlate.
pub const COLOR_THRESHOLD: f64 = 0.99;
/// At or above this fraction candidates are also compared pixel by pixel.
pub const EXACT_THRESHOLD: f64 = 0.999;
/// Largest per-channel difference a pixel may have in exact mode.
const EXACT_MAX_PIXEL_DIFF: u8 = 10;
/// Exact mode takes correlation candidates this far below the threshold.
const EXACT_CANDIDATE_SLACK: f64 = 0.01;
/// Smallest suppression radius, in pixels.
const MIN_SUPPRESS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Gray,
    Color,
    Exact,
}

impl Strategy {
    pub fn for_threshold(threshold: f64) -> Self {
        if threshold >= EXACT_THRESHOLD {
            Strategy::Exact
        } else if threshold >= COLOR_THRESHOLD {
            Strategy::Color
        } else {
            Strategy::Gray
        }
    }
}

/// A match position (top-left corner) and its confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x: u32,
    pub y: u32,
    pub score: f64,
}

/// One 8-bit channel widened for integer dot products.
struct Plane {
    width: usize,
    height: usize,
    data: Vec<u32>,
}

impl Plane {
    fn gray(img: &RgbImage) -> Self {
        let data = img.pixels().map(|p| luma(p) as u32).collect();
        Self { width: img.width() as usize, height: img.height() as usize, data }
    }

    fn channel(img: &RgbImage, c: usize) -> Self {
        let data = img.pixels().map(|p| p[c] as u32).collect();
        Self { width: img.width() as usize, height: img.height() as usize, data }
    }
}

/// 2-D transforms at one frame size. Spectra stay transposed (column-major)
/// between `forward` and `inverse`.
struct Spectrum2d {
    width: usize,
    height: usize,
    row_fwd: Arc<dyn Fft<f64>>,
    col_fwd: Arc<dyn Fft<f64>>,
    row_inv: Arc<dyn Fft<f64>>,
    col_inv: Arc<dyn Fft<f64>>,
}

impl Spectrum2d {
    fn new(width: usize, height: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            width,
            height,
            row_fwd: planner.plan_fft_forward(width),
            col_fwd: planner.plan_fft_forward(height),
            row_inv: planner.plan_fft_inverse(width),
            col_inv: planner.plan_fft_inverse(height),
        }
    }

    /// Spectrum of `plane` zero-padded to the frame size.
    fn forward(&self, plane: &Plane) -> Vec<Complex<f64>> {
        let mut rows = vec![Complex::new(0.0, 0.0); self.width * self.height];
        for y in 0..plane.height {
            for x in 0..plane.width {
                rows[y * self.width + x].re = plane.data[y * plane.width + x] as f64;
            }
        }
        self.row_fwd.process(&mut rows);
        let mut cols = transpose(&rows, self.width, self.height);
        self.col_fwd.process(&mut cols);
        cols
    }

    fn inverse(&self, mut cols: Vec<Complex<f64>>) -> Vec<f64> {
        self.col_inv.process(&mut cols);
        let mut rows = transpose(&cols, self.height, self.width);
        self.row_inv.process(&mut rows);
        let scale = (self.width * self.height) as f64;
        rows.into_iter().map(|c| c.re / scale).collect()
    }
}

/// `h` rows of `w` into `w` rows of `h`.
fn transpose(src: &[Complex<f64>], w: usize, h: usize) -> Vec<Complex<f64>> {
    let mut out = vec![Complex::new(0.0, 0.0); w * h];
    for y in 0..h {
        for x in 0..w {
            out[x * h + y] = src[y * w + x];
        }
    }
    out
}

/// Dot product of `templ` with the image window at every top-left position,
/// indexed like `image`. Positions where the template fits never wrap.
fn correlate(fft: &Spectrum2d, image: &Plane, templ: &Plane) -> Vec<f64> {
    let mut spectrum = fft.forward(image);
    let t = fft.forward(templ);
    for (a, b) in spectrum.iter_mut().zip(&t) {
        *a *= b.conj();
    }
    drop(t);
    fft.inverse(spectrum)
}

/// Summed-area tables of values and squared values.
struct Integral {
    stride: usize,
    sum: Vec<u64>,
    sq: Vec<u64>,
}

impl Integral {
    fn new(p: &Plane) -> Self {
        let stride = p.width + 1;
        let mut sum = vec![0u64; stride * (p.height + 1)];
        let mut sq = vec![0u64; stride * (p.height + 1)];
        for y in 0..p.height {
            let (mut row_sum, mut row_sq) = (0u64, 0u64);
            for x in 0..p.width {
                let v = p.data[y * p.width + x] as u64;
                row_sum += v;
                row_sq += v * v;
                let i = (y + 1) * stride + x + 1;
                sum[i] = sum[i - stride] + row_sum;
                sq[i] = sq[i - stride] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (u64, u64) {
        let at = |t: &[u64], xx: usize, yy: usize| t[yy * self.stride + xx];
        let area = |t: &[u64]| at(t, x + w, y + h) + at(t, x, y) - at(t, x + w, y) - at(t, x, y + h);
        (area(&self.sum), area(&self.sq))
    }
}

/// Score map of `templ` slid over `image`, row-major, one entry per valid
/// top-left position. Scores are in [-1, 1]; a flat image window scores 0
/// and a flat template scores 1 everywhere.
fn ccoeff_normed(fft: &Spectrum2d, image: &Plane, templ: &Plane) -> Vec<f64> {
    let (tw, th) = (templ.width, templ.height);
    let (rw, rh) = (image.width - tw + 1, image.height - th + 1);
    let n = (tw * th) as i128;

    let t_sum: u64 = templ.data.iter().map(|&v| v as u64).sum();
    let t_sq: u64 = templ.data.iter().map(|&v| (v * v) as u64).sum();
    // n * variance, exact
    let t_var = n * t_sq as i128 - (t_sum as i128) * (t_sum as i128);
    if t_var <= 0 {
        return vec![1.0; rw * rh];
    }

    let cross = correlate(fft, image, templ);
    let integral = Integral::new(image);
    let mut scores = vec![0.0; rw * rh];
    for y in 0..rh {
        for x in 0..rw {
            let (w_sum, w_sq) = integral.window(x, y, tw, th);
            let w_var = n * w_sq as i128 - (w_sum as i128) * (w_sum as i128);
            if w_var <= 0 {
                continue;
            }
            // integer inputs, so rounding recovers the exact sum
            let dot = cross[y * image.width + x].round().max(0.0) as i128;
            let num = n * dot - (t_sum as i128) * (w_sum as i128);
            let score = num as f64 / ((w_var as f64).sqrt() * (t_var as f64).sqrt());
            scores[y * rw + x] = score.clamp(-1.0, 1.0);
        }
    }
    scores
}

fn score_map(screen: &RgbImage, templ: &RgbImage, strategy: Strategy) -> Vec<f64> {
    let fft = Spectrum2d::new(screen.width() as usize, screen.height() as usize);
    match strategy {
        Strategy::Gray => ccoeff_normed(&fft, &Plane::gray(screen), &Plane::gray(templ)),
        Strategy::Color | Strategy::Exact => {
            let mut combined = ccoeff_normed(&fft, &Plane::channel(screen, 0), &Plane::channel(templ, 0));
            for c in 1..3 {
                let other = ccoeff_normed(&fft, &Plane::channel(screen, c), &Plane::channel(templ, c));
                for (a, b) in combined.iter_mut().zip(other) {
                    *a = a.min(b);
                }
            }
            combined
        }
    }
}

/// `(mean similarity, largest channel difference)` of the template placed at `(x, y)`.
fn pixel_similarity(screen: &RgbImage, templ: &RgbImage, x: u32, y: u32) -> (f64, u8) {
    let mut total = 0u64;
    let mut worst = 0u8;
    for (tx, ty, tp) in templ.enumerate_pixels() {
        let sp = screen.get_pixel(x + tx, y + ty);
        for c in 0..3 {
            let d = sp[c].abs_diff(tp[c]);
            total += d as u64;
            worst = worst.max(d);
        }
    }
    let count = (templ.width() * templ.height() * 3) as f64;
    (1.0 - total as f64 / count / 255.0, worst)
}

/// Keep candidates, best first, that are not within the suppression radius
/// of an already kept one on both axes.
pub fn suppress_overlaps(candidates: &[Candidate], tw: u32, th: u32, sw: u32, sh: u32) -> Vec<Candidate> {
    let rx = (tw / 2).max(MIN_SUPPRESS);
    let ry = (th / 2).max(MIN_SUPPRESS);
    let mut kept: Vec<Candidate> = Vec::new();
    for c in candidates {
        let overlaps = kept.iter().any(|k| k.x.abs_diff(c.x) < rx && k.y.abs_diff(c.y) < ry);
        if !overlaps && c.x + tw <= sw && c.y + th <= sh {
            kept.push(*c);
        }
    }
    kept
}

/// All distinct matches of `templ` in `screen` at `threshold` (a fraction),
/// best first.
pub fn find_matches(screen: &RgbImage, templ: &RgbImage, threshold: f64) -> Vec<Candidate> {
    let (sw, sh) = screen.dimensions();
    let (tw, th) = templ.dimensions();
    if tw == 0 || th == 0 || sw < tw || sh < th {
        return Vec::new();
    }

    let strategy = Strategy::for_threshold(threshold);
    let scores = score_map(screen, templ, strategy);
    let rw = (sw - tw + 1) as usize;

    let floor = match strategy {
        Strategy::Exact => threshold - EXACT_CANDIDATE_SLACK,
        _ => threshold,
    };
    let mut candidates: Vec<Candidate> = scores
        .iter()
        .enumerate()
        .filter(|(_, &s)| s >= floor)
        .map(|(i, &s)| Candidate { x: (i % rw) as u32, y: (i / rw) as u32, score: s })
        .collect();

    if strategy == Strategy::Exact {
        candidates = candidates
            .into_iter()
            .filter_map(|c| {
                let (similarity, worst) = pixel_similarity(screen, templ, c.x, c.y);
                (similarity >= threshold && worst <= EXACT_MAX_PIXEL_DIFF)
                    .then_some(Candidate { score: similarity, ..c })
            })
            .collect();
    }

    // stable: equal scores stay in row-major order
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    suppress_overlaps(&candidates, tw, th, sw, sh)
}

/// The `match_number`-th (1-based) match, or `None`.
pub fn locate(screen: &RgbImage, templ: &RgbImage, match_number: u32, threshold: f64) -> Option<Candidate> {
    if match_number == 0 {
        return None;
    }
    find_matches(screen, templ, threshold)
        .get(match_number as usize - 1)
        .copied()
}

/// Load the template from disk and look for it in a captured frame.
pub fn match_file(frame: &Capture, template_path: &Path, match_number: u32, threshold: f64) -> Option<(u32, u32)> {
    let templ = match image::open(template_path) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            logger::warn(&format!("could not load template {}: {}", template_path.display(), e));
            return None;
        }
    };
    if frame.width < templ.width() || frame.height < templ.height() {
        logger::warn(&format!(
            "capture ({}x{}) is smaller than template ({}x{})",
            frame.width, frame.height, templ.width(), templ.height()
        ));
        return None;
    }

    let screen = frame.to_rgb_image();
    let strategy = Strategy::for_threshold(threshold);
    let matches = find_matches(&screen, &templ, threshold);
    match matches.get(match_number.max(1) as usize - 1) {
        Some(m) => {
            logger::info(&format!(
                "image match #{} at ({}, {}), confidence {:.4} ({:?})",
                match_number, m.x, m.y, m.score, strategy
            ));
            Some((m.x, m.y))
        }
        None => {
            logger::info(&format!(
                "image match #{} not found ({} matches, {:?})",
                match_number, matches.len(), strategy
            ));
            None
        }
    }
}
