//! Walks an action tree against one window.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::action::{Action, ActionNode, ImageMatch, OcrMatch};
use crate::capture::capture_region;
use crate::file_reader;
use crate::frames::{FrameSink, IMAGE_PREFIX, OCR_PREFIX};
use crate::keys::{self, VK_CONTROL, VK_MENU, VK_SHIFT};
use crate::logger;
use crate::matcher::{ocr, ocr::TextRecognizer, template};
use crate::platform::{Platform, WindowHandle};

const MODIFIER_DOWN_SETTLE: Duration = Duration::from_millis(30);
const KEY_SETTLE: Duration = Duration::from_millis(20);
const MODIFIER_UP_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Nodes visited per pass, across all branches.
    pub max_node_visits: usize,
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_node_visits: 1000, max_depth: 32 }
    }
}

/// Services every worker shares.
pub struct Engine {
    pub platform: Arc<dyn Platform>,
    pub frames: Box<dyn FrameSink>,
    pub ocr: Box<dyn TextRecognizer>,
    pub limits: Limits,
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    /// The running flag dropped between nodes.
    Paused,
    VisitCapReached,
    TooDeep,
    /// A node failed; the error has been logged.
    Failed,
}

/// Reason for leaving the tree early.
enum Halt {
    Paused,
    VisitCap,
    TooDeep,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for Halt {
    fn from(e: anyhow::Error) -> Self {
        Halt::Failed(e)
    }
}

struct Pass<'a> {
    engine: &'a Engine,
    window: &'a mut dyn WindowHandle,
    running: &'a dyn Fn() -> bool,
    tag: &'a str,
    visits: usize,
}

/// Run `actions` once from the top. `running` is polled before every node.
pub fn run_pass(
    engine: &Engine,
    window: &mut dyn WindowHandle,
    actions: &[ActionNode],
    running: &dyn Fn() -> bool,
    tag: &str,
) -> PassOutcome {
    let mut pass = Pass { engine, window, running, tag, visits: 0 };
    match pass.run_seq(actions, 0) {
        Ok(()) => PassOutcome::Completed,
        Err(Halt::Paused) => PassOutcome::Paused,
        Err(Halt::VisitCap) => {
            logger::warn_p(tag, &format!(
                "pass stopped after {} node visits, restarting next pass",
                engine.limits.max_node_visits
            ));
            PassOutcome::VisitCapReached
        }
        Err(Halt::TooDeep) => {
            logger::warn_p(tag, &format!("branches nested deeper than {}, pass stopped", engine.limits.max_depth));
            PassOutcome::TooDeep
        }
        Err(Halt::Failed(e)) => {
            logger::error_p(tag, &format!("pass aborted: {:#}", e));
            PassOutcome::Failed
        }
    }
}

impl Pass<'_> {
    fn run_seq(&mut self, actions: &[ActionNode], depth: usize) -> Result<(), Halt> {
        if depth > self.engine.limits.max_depth {
            return Err(Halt::TooDeep);
        }
        for node in actions {
            if !(self.running)() {
                return Err(Halt::Paused);
            }
            if self.visits >= self.engine.limits.max_node_visits {
                return Err(Halt::VisitCap);
            }
            self.visits += 1;
            if !node.enabled {
                continue;
            }
            self.run_node(node, depth)?;
        }
        Ok(())
    }

    fn run_node(&mut self, node: &ActionNode, depth: usize) -> Result<(), Halt> {
        match &node.action {
            Action::LeftClick { x, y } => self.click(*x, *y, false)?,
            Action::DoubleClick { x, y } => self.click(*x, *y, true)?,
            Action::Delay { ms } => thread::sleep(Duration::from_millis(*ms)),
            Action::Hotkey { key, ctrl, alt, shift } => self.hotkey(key, *ctrl, *alt, *shift)?,
            Action::EndFileReader { file_path, key_text, true_actions, false_actions } => {
                let hit = file_reader::last_line_contains(file_path, key_text);
                self.branch(node, hit, true_actions, false_actions, depth)?;
            }
            Action::ImageMatcher(m) => {
                let hit = self.image_hit(m);
                self.branch(node, hit, &m.true_actions, &m.false_actions, depth)?;
            }
            Action::OcrMatcher(m) => {
                let hit = self.ocr_hit(m);
                self.branch(node, hit, &m.true_actions, &m.false_actions, depth)?;
            }
        }
        Ok(())
    }

    fn branch(
        &mut self,
        node: &ActionNode,
        hit: bool,
        on_true: &[ActionNode],
        on_false: &[ActionNode],
        depth: usize,
    ) -> Result<(), Halt> {
        logger::info_p(self.tag, &format!("{} -> {}", node.describe(), hit));
        self.run_seq(if hit { on_true } else { on_false }, depth + 1)
    }

    /// `x`, `y` are screen coordinates; the window may have moved since they
    /// were recorded, so they are mapped now.
    fn click(&mut self, x: i32, y: i32, double: bool) -> Result<()> {
        let (cx, cy) = self
            .window
            .screen_to_client(x, y)
            .ok_or_else(|| anyhow!("cannot map ({}, {}) into window {:#x}", x, y, self.window.id()))?;
        self.window.click(cx, cy, double)
    }

    fn hotkey(&mut self, key: &str, ctrl: bool, alt: bool, shift: bool) -> Result<()> {
        let platform = &self.engine.platform;
        let Some(vk) = keys::resolve(key, |c| platform.char_key_code(c)) else {
            logger::warn_p(self.tag, &format!("unknown key '{}', hotkey skipped", key));
            return Ok(());
        };

        let modifiers: Vec<u16> = [(ctrl, VK_CONTROL), (alt, VK_MENU), (shift, VK_SHIFT)]
            .into_iter()
            .filter_map(|(on, vk)| on.then_some(vk))
            .collect();

        // (code, sync) of every key that went down; all of them come back up,
        // in reverse, even when a later step fails
        let mut held: Vec<(u16, bool)> = Vec::new();
        let pressed = self.press_keys(&modifiers, vk, &mut held);
        let mut released = Ok(());
        while let Some((code, sync)) = held.pop() {
            let up = self.window.key(code, false, sync);
            thread::sleep(if sync { KEY_SETTLE } else { MODIFIER_UP_SETTLE });
            released = released.and(up);
        }
        pressed.and(released)
    }

    fn press_keys(&mut self, modifiers: &[u16], vk: u16, held: &mut Vec<(u16, bool)>) -> Result<()> {
        for &m in modifiers {
            self.window.key(m, true, false)?;
            held.push((m, false));
            thread::sleep(MODIFIER_DOWN_SETTLE);
        }
        self.window.key(vk, true, true)?;
        held.push((vk, true));
        thread::sleep(KEY_SETTLE);
        Ok(())
    }

    fn image_hit(&mut self, m: &ImageMatch) -> bool {
        match capture_region(&mut *self.window, m.crop.screen_rect(m.use_full_screen)) {
            Ok(frame) => {
                self.engine.frames.record(IMAGE_PREFIX, &frame);
                template::match_file(&frame, &m.image_path, m.match_number, m.threshold_fraction()).is_some()
            }
            Err(e) => {
                logger::warn_p(self.tag, &format!("capture failed, taking false branch: {:#}", e));
                false
            }
        }
    }

    fn ocr_hit(&mut self, m: &OcrMatch) -> bool {
        match capture_region(&mut *self.window, m.crop.screen_rect(m.use_full_screen)) {
            Ok(frame) => {
                self.engine.frames.record(OCR_PREFIX, &frame);
                ocr::match_text(self.engine.ocr.as_ref(), &frame, &m.text, m.case_sensitive, m.match_mode)
            }
            Err(e) => {
                logger::warn_p(self.tag, &format!("capture failed, taking false branch: {:#}", e));
                false
            }
        }
    }
}
