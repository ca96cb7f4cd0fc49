use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Title patterns (case-insensitive regex) of the windows to attach to.
    pub targets: Vec<String>,
    pub actions_path: PathBuf,
    pub pause_key: String,
    pub resume_key: String,
    pub pass_interval_ms: u64,
    pub idle_poll_ms: u64,
    pub max_node_visits: usize,
    pub max_depth: usize,
    pub tesseract_cmd: Option<PathBuf>,
    pub debug_frames: bool,
    pub debug_frames_keep: usize,
    pub logs_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            actions_path: PathBuf::from("actions.json"),
            pause_key: "f7".into(),
            resume_key: "f8".into(),
            pass_interval_ms: 1000,
            idle_poll_ms: 100,
            max_node_visits: 1000,
            max_depth: 32,
            tesseract_cmd: None,
            debug_frames: true,
            debug_frames_keep: 5,
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let s: Settings = serde_json::from_str(r#"{"targets": ["notepad"], "pause_key": "f9"}"#).unwrap();
        assert_eq!(s.targets, vec!["notepad".to_string()]);
        assert_eq!(s.pause_key, "f9");
        assert_eq!(s.resume_key, "f8");
        assert_eq!(s.max_node_visits, 1000);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("nope.json"));
        assert_eq!(s.pass_interval_ms, 1000);
        assert!(s.debug_frames);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = Settings::default();
        s.tesseract_cmd = Some(PathBuf::from("/opt/tess"));
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path).tesseract_cmd, Some(PathBuf::from("/opt/tess")));
    }
}
