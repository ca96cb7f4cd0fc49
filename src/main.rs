use std::io;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{bail, Context, Result};
use crossterm::{
    execute,
    event::{EnableMouseCapture, DisableMouseCapture},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{Terminal, backend::CrosstermBackend};

use hiddenclick_core::interpreter::{Engine, Limits};
use hiddenclick_core::matcher::ocr::Tesseract;
use hiddenclick_core::platform::{create_platform, hotkey::HotkeyBindings, Platform};
use hiddenclick_core::scheduler::{Scheduler, Timing};
use hiddenclick_core::types::{Command, Target};
use hiddenclick_core::{action, frames, keys, logger, settings::Settings};

#[derive(Debug)]
struct Args {
    force_stub: bool,
    upgrade: bool,
    settings_path: PathBuf,
}

fn parse_args(mut it: impl Iterator<Item = String>) -> Result<Args> {
    let mut args = Args { force_stub: false, upgrade: false, settings_path: PathBuf::from("settings.json") };
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--stub" => args.force_stub = true,
            "--upgrade" => args.upgrade = true,
            "--settings" => {
                args.settings_path = it.next().map(PathBuf::from).context("--settings needs a path")?;
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(args)
}

/// Attach to every visible window matching one of the title patterns.
fn attach_targets(platform: &dyn Platform, patterns: &[String]) -> Vec<Target> {
    let mut targets: Vec<Target> = Vec::new();
    for pattern in patterns {
        let found = platform.get_instances(pattern);
        if found.is_empty() {
            logger::warn(&format!("no window matches \"{}\"", pattern));
        }
        for (id, title) in found {
            if targets.iter().any(|t| t.window_id == id) {
                continue;
            }
            logger::info(&format!("attached to \"{}\" #{:x}", title, id));
            targets.push(Target::new(title, id));
        }
    }
    targets
}

fn hotkeys(platform: &dyn Platform, settings: &Settings) -> Option<HotkeyBindings> {
    let code = |name: &str| {
        let vk = keys::resolve(name, |c| platform.char_key_code(c));
        if vk.is_none() {
            logger::warn(&format!("unknown hotkey \"{}\", global pause/resume disabled", name));
        }
        vk
    };
    Some(HotkeyBindings { pause: code(&settings.pause_key)?, resume: code(&settings.resume_key)? })
}

/// Rewrite settings and the action document in their current shape.
fn upgrade(args: &Args, settings: &Settings) -> Result<()> {
    settings.save(&args.settings_path)?;
    let count = action::upgrade(&settings.actions_path)
        .with_context(|| format!("upgrading {}", settings.actions_path.display()))?;
    logger::info(&format!(
        "rewrote {} and {} ({} action(s))",
        args.settings_path.display(),
        settings.actions_path.display(),
        count
    ));
    Ok(())
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let settings = Settings::load(&args.settings_path);

    logger::init(&settings.logs_dir)?;

    if args.upgrade {
        return upgrade(&args, &settings);
    }

    let actions = action::load(&settings.actions_path)
        .with_context(|| format!("loading {}", settings.actions_path.display()))?;
    action::validate(&actions, settings.max_depth)?;
    logger::info(&format!("loaded {} action(s) from {}", actions.len(), settings.actions_path.display()));

    let platform = create_platform(args.force_stub);
    let targets = attach_targets(platform.as_ref(), &settings.targets);
    let hotkeys = hotkeys(platform.as_ref(), &settings);

    let engine = Engine {
        platform,
        frames: frames::from_settings(settings.debug_frames, &settings.logs_dir, settings.debug_frames_keep),
        ocr: Box::new(Tesseract::new(settings.tesseract_cmd.clone())),
        limits: Limits { max_node_visits: settings.max_node_visits, max_depth: settings.max_depth },
    };
    let timing = Timing { pass_interval: settings.pass_interval(), idle_poll: settings.idle_poll() };
    let descriptions = actions.iter().map(|a| a.describe()).collect();
    let scheduler = Arc::new(Scheduler::new(Arc::new(engine), actions, targets, timing, hotkeys));

    let (log_tx, log_rx) = mpsc::channel::<String>();
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();

    logger::set_tui_sender(log_tx);
    logger::info("hiddenclick started");

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = hiddenclick_tui::App::new(Arc::clone(&scheduler), descriptions, log_rx, cmd_tx);

    let serving = Arc::clone(&scheduler);
    let dispatcher = thread::spawn(move || serving.serve(cmd_rx));

    let result = hiddenclick_tui::event::run(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    // serve() shuts the scheduler down once the command channel closes
    drop(app);
    dispatcher.join().ok();

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn flags_are_parsed() {
        let a = args(&["--stub", "--upgrade", "--settings", "x.json"]).unwrap();
        assert!(a.force_stub && a.upgrade);
        assert_eq!(a.settings_path, PathBuf::from("x.json"));
        assert!(args(&["--bogus"]).is_err());
        assert!(args(&["--settings"]).is_err());
    }

    #[test]
    fn upgrade_writes_both_documents() {
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("settings.json");
        let actions_path = dir.path().join("actions.json");
        std::fs::write(&actions_path, r#"[{"type": "left_click", "x": 3, "y": 4}]"#).unwrap();
        let settings = Settings { actions_path: actions_path.clone(), ..Settings::default() };
        let a = Args { force_stub: true, upgrade: true, settings_path: settings_path.clone() };

        upgrade(&a, &settings).unwrap();

        assert_eq!(Settings::load(&settings_path).actions_path, actions_path);
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&actions_path).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["actions"][0]["type"], "left_click");
    }
}
