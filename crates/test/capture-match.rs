//! Checks against a live desktop window.
//!
//! Set `HIDDENCLICK_TARGET` to a title pattern. Trials that need a window are
//! ignored when it is unset or nothing matches; the OCR trial is ignored when
//! no tesseract install can be found.
//!
//!     HIDDENCLICK_TARGET=notepad cargo run -p hiddenclick-test --bin capture-match

use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use image::imageops;
use libtest_mimic::{Arguments, Failed, Trial};

use hiddenclick_core::capture::{capture_region, client_crop};
use hiddenclick_core::matcher::ocr::{extract_text, Tesseract, TextRecognizer};
use hiddenclick_core::matcher::template;
use hiddenclick_core::platform::{create_platform, Platform, WindowHandle};
use hiddenclick_core::types::WindowId;

const PATCH: u32 = 40;

/// First matching window that can actually be captured. The stub platform
/// reports windows it cannot render, so those count as missing.
fn find_target(platform: &dyn Platform) -> Option<WindowId> {
    let pattern = std::env::var("HIDDENCLICK_TARGET").ok()?;
    platform
        .get_instances(&pattern)
        .into_iter()
        .map(|(id, _)| id)
        .find(|&id| platform.create_window(id).capture(None).is_ok())
}

fn open(platform: &dyn Platform, id: WindowId) -> Box<dyn WindowHandle> {
    platform.create_window(id)
}

fn full_capture(platform: &dyn Platform, id: WindowId) -> Result<()> {
    let mut window = open(platform, id);
    let frame = capture_region(window.as_mut(), None)?;
    ensure!(frame.width > 0 && frame.height > 0, "empty capture");
    if let Some((w, h)) = window.client_size() {
        ensure!(
            (frame.width as i32, frame.height as i32) == (w, h),
            "capture is {}x{}, client area is {}x{}",
            frame.width, frame.height, w, h
        );
    }
    Ok(())
}

fn cropped_capture(platform: &dyn Platform, id: WindowId) -> Result<()> {
    let mut window = open(platform, id);
    let full = capture_region(window.as_mut(), None)?;
    ensure!(full.width >= 60 && full.height >= 60, "window too small to crop");

    // screen rect of client pixels (10,10)..(60,60)
    let (cx, cy) = window.screen_to_client(0, 0).ok_or_else(|| anyhow!("no client origin"))?;
    let rect = (10 - cx, 10 - cy, 50, 50);
    let crop = client_crop(window.as_ref(), rect).ok_or_else(|| anyhow!("crop fell outside"))?;
    ensure!((crop.l, crop.t) == (10, 10), "crop mapped to ({}, {})", crop.l, crop.t);

    let frame = capture_region(window.as_mut(), Some(rect))?;
    ensure!((frame.width, frame.height) == (50, 50), "crop captured {}x{}", frame.width, frame.height);

    // the crop must show client pixels (10,10).., not the frame or caption
    let expected = imageops::crop_imm(&full.to_rgb_image(), 10, 10, 50, 50).to_image();
    let got = frame.to_rgb_image();
    let same = expected.pixels().zip(got.pixels()).filter(|(a, b)| a == b).count();
    ensure!(same * 100 >= 95 * 50 * 50, "only {} of 2500 pixels agree with the full capture", same);
    Ok(())
}

fn finds_own_patch(platform: &dyn Platform, id: WindowId) -> Result<()> {
    let mut window = open(platform, id);
    let frame = capture_region(window.as_mut(), None)?;
    ensure!(frame.width > PATCH && frame.height > PATCH, "window too small");

    let screen = frame.to_rgb_image();
    let (x, y) = ((frame.width - PATCH) / 2, (frame.height - PATCH) / 2);
    let patch = imageops::crop_imm(&screen, x, y, PATCH, PATCH).to_image();

    let found = template::find_matches(&screen, &patch, 0.999);
    ensure!(!found.is_empty(), "center patch not found in its own frame");
    ensure!(found.iter().all(|c| c.score >= 0.999), "exact match scored below threshold");
    Ok(())
}

fn reads_text(platform: &dyn Platform, id: WindowId, ocr: &Tesseract) -> Result<()> {
    let mut window = open(platform, id);
    let frame = capture_region(window.as_mut(), None)?;
    match extract_text(ocr, &frame)? {
        Some(text) => println!("read: {:?}", text.trim()),
        None => println!("no text found"),
    }
    Ok(())
}

fn trial(
    name: &'static str,
    platform: &Arc<dyn Platform>,
    target: Option<WindowId>,
    check: fn(&dyn Platform, WindowId) -> Result<()>,
) -> Trial {
    let platform = Arc::clone(platform);
    Trial::test(name, move || {
        let id = target.ok_or_else(|| Failed::from("no target window"))?;
        check(platform.as_ref(), id).map_err(|e| Failed::from(format!("{:#}", e)))
    })
    .with_ignored_flag(target.is_none())
}

fn main() {
    let args = Arguments::from_args();
    let platform = create_platform(false);
    let target = find_target(platform.as_ref());

    let ocr = Tesseract::new(std::env::var_os("HIDDENCLICK_TESSERACT").map(Into::into));
    let ocr_ready = target.is_some() && ocr.ready();
    let ocr_platform = Arc::clone(&platform);

    let trials = vec![
        trial("capture::full_window", &platform, target, full_capture),
        trial("capture::cropped", &platform, target, cropped_capture),
        trial("template::finds_own_patch", &platform, target, finds_own_patch),
        Trial::test("ocr::reads_window", move || {
            let id = target.ok_or_else(|| Failed::from("no target window"))?;
            reads_text(ocr_platform.as_ref(), id, &ocr).map_err(|e| Failed::from(format!("{:#}", e)))
        })
        .with_ignored_flag(!ocr_ready),
    ];

    libtest_mimic::run(&args, trials).exit();
}
