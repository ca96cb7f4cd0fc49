use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::logger;
use super::Platform;

/// Virtual-key codes of the global pause/resume keys.
#[derive(Debug, Clone, Copy)]
pub struct HotkeyBindings {
    pub pause: u16,
    pub resume: u16,
}

/// Start a background thread polling the pause/resume keys.
///
/// Returns `None` without starting anything when either key is already held,
/// so a key still down from launching the program does not fire. Each press
/// fires its callback once; the thread waits for the key to be released
/// before polling again. Exits when `stop` is raised.
pub fn start_hotkey_listener(
    platform: Arc<dyn Platform>,
    keys: HotkeyBindings,
    poll: Duration,
    stop: Arc<AtomicBool>,
    on_pause: impl Fn() + Send + 'static,
    on_resume: impl Fn() + Send + 'static,
) -> Option<JoinHandle<()>> {
    if platform.is_key_down(keys.pause) || platform.is_key_down(keys.resume) {
        logger::warn("pause/resume key held at startup, global hotkeys disabled");
        return None;
    }

    let spawned = thread::Builder::new()
        .name("hotkeys".into())
        .spawn(move || {
            let wait_release = |vk: u16| {
                while platform.is_key_down(vk) && !stop.load(Ordering::Acquire) {
                    thread::sleep(poll);
                }
            };
            while !stop.load(Ordering::Acquire) {
                if platform.is_key_down(keys.pause) {
                    logger::info("pause key pressed");
                    on_pause();
                    wait_release(keys.pause);
                } else if platform.is_key_down(keys.resume) {
                    logger::info("resume key pressed");
                    on_resume();
                    wait_release(keys.resume);
                }
                thread::sleep(poll);
            }
        });

    match spawned {
        Ok(handle) => {
            logger::info(&format!(
                "global hotkeys: pause {:#04x}, resume {:#04x}",
                keys.pause, keys.resume
            ));
            Some(handle)
        }
        Err(e) => {
            logger::error(&format!("failed to start hotkey listener: {}", e));
            None
        }
    }
}
