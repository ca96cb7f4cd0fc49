//! OCR text matching through an external Tesseract install.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use image::codecs::png::PngEncoder;
use image::{ColorType, GrayImage, ImageEncoder, Luma};
use wait_timeout::ChildExt;

use crate::action::MatchMode;
use crate::logger;
use crate::types::Capture;
use super::luma;

/// Smallest width and height worth sending to the engine.
const MIN_SIDE: u32 = 10;
const DARK_MEAN: f64 = 10.0;
const CLAHE_CLIP: f64 = 3.0;
const CLAHE_TILES: usize = 8;
const THRESH_BLOCK: usize = 11;
const THRESH_C: i32 = 2;
const RUN_TIMEOUT: Duration = Duration::from_secs(30);
const INSTALL_URL: &str = "https://github.com/UB-Mannheim/tesseract/wiki";

/// Something that turns an image into text.
pub trait TextRecognizer: Send + Sync {
    /// Whether the engine can run at all. Implementations log how to fix it
    /// when it cannot.
    fn ready(&self) -> bool {
        true
    }

    /// Text in `image` under page segmentation mode `psm`.
    fn recognize(&self, image: &GrayImage, psm: u8) -> Result<String>;
}

// --- preprocessing ---

pub fn grayscale(frame: &Capture) -> GrayImage {
    let rgb = frame.to_rgb_image();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| Luma([luma(rgb.get_pixel(x, y))]))
}

fn mean_brightness(img: &GrayImage) -> f64 {
    let total: u64 = img.pixels().map(|p| p[0] as u64).sum();
    total as f64 / (img.width() as u64 * img.height() as u64).max(1) as f64
}

/// Contrast-limited adaptive histogram equalization over a `tiles` x `tiles`
/// grid, bilinearly blending the per-tile mappings.
pub fn clahe(img: &GrayImage, clip: f64, tiles: usize) -> GrayImage {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let tiles_x = tiles.min(w).max(1);
    let tiles_y = tiles.min(h).max(1);
    let bound = |i: usize, n: usize, len: usize| i * len / n;

    let mut luts = vec![[0u8; 256]; tiles_x * tiles_y];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let (x0, x1) = (bound(tx, tiles_x, w), bound(tx + 1, tiles_x, w));
            let (y0, y1) = (bound(ty, tiles_y, h), bound(ty + 1, tiles_y, h));
            let area = (x1 - x0) * (y1 - y0);

            let mut hist = [0usize; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                }
            }

            let limit = ((clip * area as f64 / 256.0) as usize).max(1);
            let mut excess = 0;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let (batch, residual) = (excess / 256, excess % 256);
            for bin in hist.iter_mut() {
                *bin += batch;
            }
            if residual > 0 {
                let step = (256 / residual).max(1);
                for bin in hist.iter_mut().step_by(step).take(residual) {
                    *bin += 1;
                }
            }

            let scale = 255.0 / area as f64;
            let lut = &mut luts[ty * tiles_x + tx];
            let mut acc = 0;
            for (v, bin) in hist.iter().enumerate() {
                acc += bin;
                lut[v] = (acc as f64 * scale).round().min(255.0) as u8;
            }
        }
    }

    // tile index pair and weight of the far tile along one axis
    let blend = |pos: usize, len: usize, n: usize| -> (usize, usize, f64) {
        let f = (pos as f64 + 0.5) * n as f64 / len as f64 - 0.5;
        let lo = f.floor();
        let weight = f - lo;
        let a = (lo.max(0.0) as usize).min(n - 1);
        let b = ((lo + 1.0).max(0.0) as usize).min(n - 1);
        (a, b, weight)
    };

    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;
        let (x1, x2, xa) = blend(x as usize, w, tiles_x);
        let (y1, y2, ya) = blend(y as usize, h, tiles_y);
        let at = |tx: usize, ty: usize| luts[ty * tiles_x + tx][v] as f64;
        let top = at(x1, y1) * (1.0 - xa) + at(x2, y1) * xa;
        let bottom = at(x1, y2) * (1.0 - xa) + at(x2, y2) * xa;
        Luma([(top * (1.0 - ya) + bottom * ya).round().clamp(0.0, 255.0) as u8])
    })
}

fn gaussian_kernel(size: usize) -> Vec<f64> {
    let sigma = 0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let mid = (size / 2) as f64;
    let raw: Vec<f64> = (0..size)
        .map(|i| (-((i as f64 - mid).powi(2)) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|k| k / total).collect()
}

/// Binarize against a Gaussian-weighted local mean minus `c`, edges replicated.
pub fn adaptive_threshold(img: &GrayImage, block: usize, c: i32) -> GrayImage {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let kernel = gaussian_kernel(block);
    let r = (block / 2) as i64;
    let px = |x: i64, y: i64| img.get_pixel(x.clamp(0, w - 1) as u32, y.clamp(0, h - 1) as u32)[0] as f64;

    let mut horiz = vec![0.0; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            horiz[(y * w + x) as usize] = kernel
                .iter()
                .enumerate()
                .map(|(i, k)| k * px(x + i as i64 - r, y))
                .sum();
        }
    }

    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let mean: f64 = kernel
            .iter()
            .enumerate()
            .map(|(i, k)| k * horiz[((y + i as i64 - r).clamp(0, h - 1) * w + x) as usize])
            .sum();
        let src = img.get_pixel(x as u32, y as u32)[0] as i32;
        Luma([if src > mean.round() as i32 - c { 255 } else { 0 }])
    })
}

// --- text normalization ---

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn alphanumeric_only(s: &str) -> String {
    let kept: String = s
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();
    collapse_whitespace(&kept)
}

/// Match `search` against OCR output. Both the whitespace-collapsed text and
/// its alphanumeric-only copy are tried.
pub fn text_matches(extracted: &str, search: &str, case_sensitive: bool, mode: MatchMode) -> bool {
    let fold = |s: String| if case_sensitive { s } else { s.to_lowercase() };
    let search = fold(search.to_string());
    let forms = [fold(collapse_whitespace(extracted)), fold(alphanumeric_only(extracted))];
    forms.iter().any(|text| match mode {
        MatchMode::Contains => text.contains(&search),
        MatchMode::StartsWith => text.starts_with(&search),
        MatchMode::EndsWith => text.ends_with(&search),
    })
}

// --- matching ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Enhanced,
    Binary,
}

/// Most specific segmentation first: single word, block, then sparse text.
const PASSES: [(Variant, u8); 6] = [
    (Variant::Enhanced, 8),
    (Variant::Enhanced, 6),
    (Variant::Binary, 8),
    (Variant::Binary, 6),
    (Variant::Enhanced, 11),
    (Variant::Binary, 11),
];

/// First non-empty text over the preprocessing passes, or `None`.
pub fn extract_text(recognizer: &dyn TextRecognizer, frame: &Capture) -> Result<Option<String>> {
    let gray = grayscale(frame);
    let brightness = mean_brightness(&gray);
    if brightness < DARK_MEAN {
        logger::warn(&format!(
            "OCR image is mostly black (mean {:.1}), check the crop area",
            brightness
        ));
    }
    let enhanced = clahe(&gray, CLAHE_CLIP, CLAHE_TILES);
    let binary = adaptive_threshold(&enhanced, THRESH_BLOCK, THRESH_C);

    for (variant, psm) in PASSES {
        let input = match variant {
            Variant::Enhanced => &enhanced,
            Variant::Binary => &binary,
        };
        let text = recognizer.recognize(input, psm)?;
        if !text.trim().is_empty() {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

/// Whether the text in `frame` satisfies `search` under `mode`. Every
/// failure is logged and reads as no match.
pub fn match_text(
    recognizer: &dyn TextRecognizer,
    frame: &Capture,
    search: &str,
    case_sensitive: bool,
    mode: MatchMode,
) -> bool {
    if !recognizer.ready() {
        return false;
    }
    if frame.width < MIN_SIDE || frame.height < MIN_SIDE {
        logger::warn(&format!("image too small for OCR: {}x{}", frame.width, frame.height));
        return false;
    }

    let text = match extract_text(recognizer, frame) {
        Ok(Some(t)) => t,
        Ok(None) => {
            logger::info(&format!(
                "OCR returned no text ({}x{}), region may be empty or low contrast",
                frame.width, frame.height
            ));
            return false;
        }
        Err(e) => {
            logger::warn(&format!("OCR failed: {:#}", e));
            return false;
        }
    };

    let found = text_matches(&text, search, case_sensitive, mode);
    let shown: String = collapse_whitespace(&text).chars().take(100).collect();
    logger::info(&format!(
        "OCR \"{}\" ({:?}) {}: \"{}\"",
        search,
        mode,
        if found { "found" } else { "not found" },
        shown
    ));
    found
}

// --- tesseract ---

/// Tesseract CLI, located lazily on first use.
pub struct Tesseract {
    configured: Option<PathBuf>,
    conventional: Vec<PathBuf>,
    resolved: OnceLock<Option<PathBuf>>,
    timeout: Duration,
}

impl Tesseract {
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self {
            configured,
            conventional: Self::conventional_paths(),
            resolved: OnceLock::new(),
            timeout: RUN_TIMEOUT,
        }
    }

    fn conventional_paths() -> Vec<PathBuf> {
        if cfg!(target_os = "windows") {
            let mut paths = vec![
                PathBuf::from(r"C:\Program Files\Tesseract-OCR\tesseract.exe"),
                PathBuf::from(r"C:\Program Files (x86)\Tesseract-OCR\tesseract.exe"),
            ];
            if let Some(local) = std::env::var_os("LOCALAPPDATA") {
                paths.push(Path::new(&local).join(r"Programs\Tesseract-OCR\tesseract.exe"));
            }
            paths.push(PathBuf::from(r"C:\Tesseract-OCR\tesseract.exe"));
            paths
        } else {
            ["/usr/bin/tesseract", "/usr/local/bin/tesseract", "/opt/homebrew/bin/tesseract"]
                .iter()
                .map(PathBuf::from)
                .collect()
        }
    }

    /// Candidates in lookup order: configured path, install locations, `PATH`.
    fn candidates(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.configured.iter().cloned().collect();
        out.extend(self.conventional.iter().filter(|p| p.is_file()).cloned());
        out.push(PathBuf::from("tesseract"));
        out
    }

    fn responds(cmd: &Path) -> bool {
        Command::new(cmd)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn discover(&self, responds: impl Fn(&Path) -> bool) -> Option<PathBuf> {
        let found = self.candidates().into_iter().find(|c| responds(c));
        match &found {
            Some(cmd) => logger::info(&format!("using tesseract at {}", cmd.display())),
            None => {
                logger::error("Tesseract OCR not found, OCR matchers will never match");
                logger::error(&format!("install it from {}", INSTALL_URL));
                logger::error("or set \"tesseract_cmd\" in settings.json to the tesseract executable");
                if let Some(cmd) = &self.configured {
                    logger::error(&format!("configured tesseract_cmd {} did not run", cmd.display()));
                }
            }
        }
        found
    }

    fn command(&self) -> Option<&Path> {
        self.command_with(Self::responds)
    }

    /// Discovery runs once; later calls reuse its answer.
    fn command_with(&self, responds: impl Fn(&Path) -> bool) -> Option<&Path> {
        self.resolved.get_or_init(|| self.discover(responds)).as_deref()
    }
}

/// Write the image, close stdin, and wait. `None` when the run timed out.
fn feed_and_wait(child: &mut Child, png: &[u8], timeout: Duration) -> Result<Option<ExitStatus>> {
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(png).context("writing image to tesseract")?;
    }
    child.wait_timeout(timeout).context("waiting for tesseract")
}

/// Kill the child if it is still running and collect its exit status.
fn reap(child: &mut Child) {
    child.kill().ok();
    child.wait().ok();
}

fn encode_png(img: &GrayImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(img.as_raw(), img.width(), img.height(), ColorType::L8)
        .context("encoding OCR input")?;
    Ok(buf)
}

impl TextRecognizer for Tesseract {
    fn ready(&self) -> bool {
        self.command().is_some()
    }

    fn recognize(&self, image: &GrayImage, psm: u8) -> Result<String> {
        let cmd = self.command().ok_or_else(|| anyhow!("tesseract not available"))?;
        let png = encode_png(image)?;

        let mut child = Command::new(cmd)
            .args(["stdin", "stdout", "--psm", &psm.to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("starting {}", cmd.display()))?;

        let Some(mut stdout) = child.stdout.take() else {
            reap(&mut child);
            bail!("tesseract stdout not piped");
        };
        let reader = thread::spawn(move || {
            let mut out = Vec::new();
            stdout.read_to_end(&mut out).map(|_| out)
        });

        let finished = match feed_and_wait(&mut child, &png, self.timeout) {
            Ok(status) => status.is_some(),
            Err(e) => {
                reap(&mut child);
                reader.join().ok();
                return Err(e);
            }
        };
        if !finished {
            reap(&mut child);
            reader.join().ok();
            logger::warn(&format!("tesseract --psm {} timed out after {:?}", psm, self.timeout));
            return Ok(String::new());
        }

        let out = reader
            .join()
            .map_err(|_| anyhow!("tesseract reader thread panicked"))?
            .context("reading tesseract output")?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
