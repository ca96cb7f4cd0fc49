//! The action tree: node types, the on-disk document, validation.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys;

/// Current on-disk schema. Version 1 is the legacy bare array.
pub const SCHEMA_VERSION: u32 = 2;

/// One step of a script. Disabled nodes are skipped but keep their slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    LeftClick {
        x: i32,
        y: i32,
    },
    DoubleClick {
        x: i32,
        y: i32,
    },
    Delay {
        ms: u64,
    },
    Hotkey {
        key: String,
        #[serde(default)]
        ctrl: bool,
        #[serde(default)]
        alt: bool,
        #[serde(default)]
        shift: bool,
    },
    EndFileReader {
        file_path: PathBuf,
        key_text: String,
        #[serde(default)]
        true_actions: Vec<ActionNode>,
        #[serde(default)]
        false_actions: Vec<ActionNode>,
    },
    ImageMatcher(ImageMatch),
    OcrMatcher(OcrMatch),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMatch {
    pub image_path: PathBuf,
    #[serde(default = "default_match_number")]
    pub match_number: u32,
    /// Percent, 0-100.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub use_full_screen: bool,
    #[serde(flatten)]
    pub crop: CropFields,
    #[serde(default)]
    pub true_actions: Vec<ActionNode>,
    #[serde(default)]
    pub false_actions: Vec<ActionNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrMatch {
    pub text: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub use_full_screen: bool,
    #[serde(flatten)]
    pub crop: CropFields,
    #[serde(default)]
    pub true_actions: Vec<ActionNode>,
    #[serde(default)]
    pub false_actions: Vec<ActionNode>,
}

/// Authored crop area, in screen coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CropFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_y: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_height: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Contains,
    StartsWith,
    EndsWith,
}

fn default_true() -> bool {
    true
}

fn is_true(b: &bool) -> bool {
    *b
}

fn default_match_number() -> u32 {
    1
}

fn default_threshold() -> f64 {
    99.0
}

impl CropFields {
    /// `(x, y, width, height)` in screen coordinates, when all four are set.
    pub fn screen_rect(&self, use_full_screen: bool) -> Option<(i32, i32, i32, i32)> {
        if use_full_screen {
            return None;
        }
        Some((self.crop_x?, self.crop_y?, self.crop_width?, self.crop_height?))
    }
}

impl ImageMatch {
    /// Threshold as a fraction in `[0, 1]`.
    pub fn threshold_fraction(&self) -> f64 {
        (self.threshold / 100.0).clamp(0.0, 1.0)
    }
}

impl ActionNode {
    pub fn new(action: Action) -> Self {
        Self { enabled: true, action }
    }

    pub fn disabled(action: Action) -> Self {
        Self { enabled: false, action }
    }

    /// Kind name as written in the `type` field.
    pub fn kind(&self) -> &'static str {
        match &self.action {
            Action::LeftClick { .. } => "left_click",
            Action::DoubleClick { .. } => "double_click",
            Action::Delay { .. } => "delay",
            Action::Hotkey { .. } => "hotkey",
            Action::EndFileReader { .. } => "end_file_reader",
            Action::ImageMatcher(_) => "image_matcher",
            Action::OcrMatcher(_) => "ocr_matcher",
        }
    }

    /// `(true_actions, false_actions)` for conditional nodes.
    pub fn branches(&self) -> Option<(&[ActionNode], &[ActionNode])> {
        match &self.action {
            Action::EndFileReader { true_actions, false_actions, .. } => Some((true_actions, false_actions)),
            Action::ImageMatcher(m) => Some((&m.true_actions, &m.false_actions)),
            Action::OcrMatcher(m) => Some((&m.true_actions, &m.false_actions)),
            _ => None,
        }
    }

    /// One-line description for logs and the status panel.
    pub fn describe(&self) -> String {
        let counts = |t: &[ActionNode], f: &[ActionNode]| {
            format!("True: {} actions, False: {} actions", t.len(), f.len())
        };
        let text = match &self.action {
            Action::LeftClick { x, y } => format!("Left Click at ({}, {})", x, y),
            Action::DoubleClick { x, y } => format!("Double Click at ({}, {})", x, y),
            Action::Delay { ms } => format!("Delay {} ms", ms),
            Action::Hotkey { key, ctrl, alt, shift } => {
                format!("Hotkey: {}", hotkey_label(key, *ctrl, *alt, *shift))
            }
            Action::EndFileReader { file_path, key_text, true_actions, false_actions } => format!(
                "End File Reader: {} → '{}' → {}",
                file_name(file_path),
                key_text,
                counts(true_actions, false_actions)
            ),
            Action::ImageMatcher(m) => format!(
                "Image Matcher: {} (match #{}) → {}",
                file_name(&m.image_path),
                m.match_number,
                counts(&m.true_actions, &m.false_actions)
            ),
            Action::OcrMatcher(m) => {
                let shown: String = if m.text.chars().count() > 30 {
                    m.text.chars().take(30).chain("...".chars()).collect()
                } else {
                    m.text.clone()
                };
                let mode = match m.match_mode {
                    MatchMode::Contains => "Contains",
                    MatchMode::StartsWith => "Starts With",
                    MatchMode::EndsWith => "Ends With",
                };
                let case = if m.case_sensitive { " (case sensitive)" } else { "" };
                format!(
                    "OCR Matcher: \"{}\" ({}){} → {}",
                    shown,
                    mode,
                    case,
                    counts(&m.true_actions, &m.false_actions)
                )
            }
        };
        if self.enabled {
            text
        } else {
            format!("[disabled] {}", text)
        }
    }
}

/// `Ctrl+Alt+Shift+KEY` style label.
pub fn hotkey_label(key: &str, ctrl: bool, alt: bool, shift: bool) -> String {
    let mut parts: Vec<String> = Vec::new();
    if ctrl {
        parts.push("Ctrl".into());
    }
    if alt {
        parts.push("Alt".into());
    }
    if shift {
        parts.push("Shift".into());
    }
    parts.push(if key.chars().count() == 1 { key.to_uppercase() } else { title_case(key) });
    parts.join("+")
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|w| {
            let mut c = w.chars();
            match c.next() {
                Some(first) => first.to_uppercase().chain(c.flat_map(|ch| ch.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "No file".into())
}

// --- document I/O ---

#[derive(Serialize, Deserialize)]
struct Document {
    version: u32,
    actions: Vec<ActionNode>,
}

/// Parse an action document: either the legacy bare array or a
/// `{"version", "actions"}` object.
pub fn parse_document(json: &str) -> Result<Vec<ActionNode>> {
    let value: Value = serde_json::from_str(json).context("action document is not valid JSON")?;
    match value {
        Value::Array(mut items) => {
            for item in items.iter_mut() {
                migrate_legacy(item);
            }
            parse_nodes(items, "actions")
        }
        Value::Object(mut map) => {
            let version = map
                .get("version")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("action document has no numeric \"version\""))?;
            if version > SCHEMA_VERSION as u64 {
                bail!("action document version {} is newer than supported {}", version, SCHEMA_VERSION);
            }
            let items = match map.remove("actions") {
                Some(Value::Array(items)) => items,
                Some(_) => bail!("\"actions\" must be an array"),
                None => Vec::new(),
            };
            parse_nodes(items, "actions")
        }
        _ => bail!("action document must be an array or an object"),
    }
}

fn parse_nodes(items: Vec<Value>, path: &str) -> Result<Vec<ActionNode>> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let here = format!("{}[{}]", path, i);
            serde_json::from_value::<ActionNode>(item.clone())
                .map_err(|e| anyhow!("{}: {}", locate_error(&item, &here), e))
        })
        .collect()
}

/// Walk down the branches of a node that failed to parse and return the
/// path of the deepest child that fails on its own.
fn locate_error(node: &Value, path: &str) -> String {
    for branch in ["true_actions", "false_actions"] {
        if let Some(Value::Array(children)) = node.get(branch) {
            for (i, child) in children.iter().enumerate() {
                if serde_json::from_value::<ActionNode>(child.clone()).is_err() {
                    return locate_error(child, &format!("{}.{}[{}]", path, branch, i));
                }
            }
        }
    }
    path.to_string()
}

/// Rewrite legacy fields in place, recursively: a 0.0-1.0 float threshold
/// becomes percent, and a float delay becomes whole milliseconds.
fn migrate_legacy(node: &mut Value) {
    let Some(obj) = node.as_object_mut() else { return };
    if let Some(t) = obj.get_mut("threshold") {
        if t.is_f64() {
            if let Some(f) = t.as_f64().filter(|f| *f <= 1.0) {
                *t = Value::from((f * 100.0).round() as u64);
            }
        }
    }
    if let Some(ms) = obj.get_mut("ms") {
        if ms.is_f64() {
            if let Some(f) = ms.as_f64().filter(|f| *f >= 0.0) {
                *ms = Value::from(f.round() as u64);
            }
        }
    }
    for branch in ["true_actions", "false_actions"] {
        if let Some(Value::Array(children)) = obj.get_mut(branch) {
            children.iter_mut().for_each(migrate_legacy);
        }
    }
}

/// Load a document from disk. A missing file is an empty script.
pub fn load(path: &Path) -> Result<Vec<ActionNode>> {
    let json = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    parse_document(&json).with_context(|| format!("parsing {}", path.display()))
}

pub fn to_json(actions: &[ActionNode]) -> Result<String> {
    let doc = Document { version: SCHEMA_VERSION, actions: actions.to_vec() };
    Ok(serde_json::to_string_pretty(&doc)?)
}

pub fn save(path: &Path, actions: &[ActionNode]) -> Result<()> {
    std::fs::write(path, to_json(actions)?).with_context(|| format!("writing {}", path.display()))
}

/// Rewrite a document in the versioned shape. Returns the node count.
pub fn upgrade(path: &Path) -> Result<usize> {
    let actions = load(path)?;
    save(path, &actions)?;
    Ok(actions.len())
}

// --- validation ---

/// Reject nodes the engine cannot run meaningfully.
pub fn validate(actions: &[ActionNode], max_depth: usize) -> Result<()> {
    validate_seq(actions, "actions", 0, max_depth)
}

fn validate_seq(actions: &[ActionNode], path: &str, depth: usize, max_depth: usize) -> Result<()> {
    if depth > max_depth {
        bail!("{}: nesting deeper than {} levels", path, max_depth);
    }
    for (i, node) in actions.iter().enumerate() {
        let here = format!("{}[{}]", path, i);
        validate_node(node).with_context(|| format!("{} ({})", here, node.kind()))?;
        if let Some((t, f)) = node.branches() {
            validate_seq(t, &format!("{}.true_actions", here), depth + 1, max_depth)?;
            validate_seq(f, &format!("{}.false_actions", here), depth + 1, max_depth)?;
        }
    }
    Ok(())
}

fn validate_node(node: &ActionNode) -> Result<()> {
    match &node.action {
        Action::LeftClick { .. } | Action::DoubleClick { .. } => {}
        Action::Delay { ms } => {
            if *ms == 0 {
                bail!("delay must be at least 1 ms");
            }
        }
        Action::Hotkey { key, .. } => {
            if keys::named_key_code(key).is_none() && key.chars().count() != 1 {
                bail!("unknown key '{}'", key);
            }
        }
        Action::EndFileReader { file_path, key_text, .. } => {
            if file_path.as_os_str().is_empty() {
                bail!("file_path is empty");
            }
            if key_text.is_empty() {
                bail!("key_text is empty");
            }
        }
        Action::ImageMatcher(m) => {
            if m.image_path.as_os_str().is_empty() {
                bail!("image_path is empty");
            }
            if m.match_number < 1 {
                bail!("match_number must be >= 1");
            }
            if !(0.0..=100.0).contains(&m.threshold) {
                bail!("threshold {} outside 0-100", m.threshold);
            }
        }
        Action::OcrMatcher(m) => {
            if m.text.trim().is_empty() {
                bail!("text is empty");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_array() {
        let json = r#"[
            {"type": "left_click", "x": 10, "y": 20},
            {"type": "delay", "ms": 300, "enabled": false},
            {"type": "hotkey", "key": "f5", "ctrl": true}
        ]"#;
        let actions = parse_document(json).unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].action, Action::LeftClick { x: 10, y: 20 });
        assert!(!actions[1].enabled);
        assert_eq!(
            actions[2].action,
            Action::Hotkey { key: "f5".into(), ctrl: true, alt: false, shift: false }
        );
    }

    #[test]
    fn matcher_defaults() {
        let json = r#"[{"type": "image_matcher", "image_path": "a.png"},
                       {"type": "ocr_matcher", "text": "OK"}]"#;
        let actions = parse_document(json).unwrap();
        let Action::ImageMatcher(m) = &actions[0].action else { panic!() };
        assert_eq!(m.match_number, 1);
        assert_eq!(m.threshold, 99.0);
        assert!(m.true_actions.is_empty());
        let Action::OcrMatcher(o) = &actions[1].action else { panic!() };
        assert_eq!(o.match_mode, MatchMode::Contains);
        assert!(!o.case_sensitive);
    }

    #[test]
    fn legacy_float_threshold_becomes_percent() {
        let json = r#"[{"type": "end_file_reader", "file_path": "x.log", "key_text": "k",
            "true_actions": [{"type": "image_matcher", "image_path": "a.png", "threshold": 0.95}],
            "false_actions": [{"type": "image_matcher", "image_path": "b.png", "threshold": 1.0},
                              {"type": "image_matcher", "image_path": "c.png", "threshold": 1}]}]"#;
        let actions = parse_document(json).unwrap();
        let (t, f) = actions[0].branches().unwrap();
        let threshold = |n: &ActionNode| match &n.action {
            Action::ImageMatcher(m) => m.threshold,
            _ => panic!(),
        };
        assert_eq!(threshold(&t[0]), 95.0);
        assert_eq!(threshold(&f[0]), 100.0);
        assert_eq!(threshold(&f[1]), 1.0);
    }

    #[test]
    fn legacy_float_delay_is_whole_ms() {
        let json = r#"[{"type": "delay", "ms": 500.0},
            {"type": "end_file_reader", "file_path": "x.log", "key_text": "k",
             "true_actions": [{"type": "delay", "ms": 12.6}], "false_actions": []}]"#;
        let actions = parse_document(json).unwrap();
        assert!(matches!(actions[0].action, Action::Delay { ms: 500 }));
        let (t, _) = actions[1].branches().unwrap();
        assert!(matches!(t[0].action, Action::Delay { ms: 13 }));
        validate(&actions, 32).unwrap();
    }

    #[test]
    fn versioned_threshold_is_literal() {
        let json = r#"{"version": 2, "actions": [
            {"type": "image_matcher", "image_path": "a.png", "threshold": 0.5}]}"#;
        let actions = parse_document(json).unwrap();
        let Action::ImageMatcher(m) = &actions[0].action else { panic!() };
        assert_eq!(m.threshold, 0.5);
    }

    #[test]
    fn unknown_type_names_nested_path() {
        let json = r#"[{"type": "delay", "ms": 5},
            {"type": "ocr_matcher", "text": "a",
             "false_actions": [{"type": "delay", "ms": 1}, {"type": "teleport"}]}]"#;
        let err = parse_document(json).unwrap_err().to_string();
        assert!(err.starts_with("actions[1].false_actions[1]"), "{}", err);
    }

    #[test]
    fn newer_version_rejected() {
        assert!(parse_document(r#"{"version": 99, "actions": []}"#).is_err());
    }

    #[test]
    fn save_writes_versioned_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");
        let actions = vec![
            ActionNode::new(Action::Delay { ms: 10 }),
            ActionNode::disabled(Action::LeftClick { x: 1, y: 2 }),
        ];
        save(&path, &actions).unwrap();
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["actions"][0]["type"], "delay");
        assert!(raw["actions"][0].get("enabled").is_none());
        assert_eq!(load(&path).unwrap(), actions);
    }

    #[test]
    fn upgrade_rewrites_legacy_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");
        std::fs::write(&path, r#"[{"type": "delay", "ms": 250.0}]"#).unwrap();
        assert_eq!(upgrade(&path).unwrap(), 1);
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["actions"][0]["ms"], 250);
    }

    #[test]
    fn missing_document_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).unwrap().is_empty());
    }

    #[test]
    fn crop_needs_all_fields() {
        let crop = CropFields { crop_x: Some(1), crop_y: Some(2), crop_width: Some(3), crop_height: None };
        assert_eq!(crop.screen_rect(false), None);
        let crop = CropFields { crop_height: Some(4), ..crop };
        assert_eq!(crop.screen_rect(false), Some((1, 2, 3, 4)));
        assert_eq!(crop.screen_rect(true), None);
    }

    #[test]
    fn validation_reports_path() {
        let json = r#"[{"type": "delay", "ms": 5},
            {"type": "image_matcher", "image_path": "a.png",
             "true_actions": [{"type": "image_matcher", "image_path": "b.png", "match_number": 0}]}]"#;
        let actions = parse_document(json).unwrap();
        let err = format!("{:#}", validate(&actions, 8).unwrap_err());
        assert!(err.contains("actions[1].true_actions[0]"), "{}", err);
        assert!(err.contains("match_number"), "{}", err);
    }

    #[test]
    fn validation_limits_depth() {
        let mut node = ActionNode::new(Action::Delay { ms: 1 });
        for _ in 0..4 {
            node = ActionNode::new(Action::EndFileReader {
                file_path: "f".into(),
                key_text: "k".into(),
                true_actions: vec![node],
                false_actions: vec![],
            });
        }
        assert!(validate(std::slice::from_ref(&node), 4).is_ok());
        assert!(validate(std::slice::from_ref(&node), 3).is_err());
    }

    #[test]
    fn describe_matches_authoring_labels() {
        let n = ActionNode::new(Action::Hotkey { key: "page up".into(), ctrl: true, alt: false, shift: true });
        assert_eq!(n.describe(), "Hotkey: Ctrl+Shift+Page Up");
        let n = ActionNode::new(Action::ImageMatcher(ImageMatch {
            image_path: "imgs/button.png".into(),
            match_number: 2,
            threshold: 99.0,
            use_full_screen: true,
            crop: CropFields::default(),
            true_actions: vec![ActionNode::new(Action::Delay { ms: 1 })],
            false_actions: vec![],
        }));
        assert_eq!(n.describe(), "Image Matcher: button.png (match #2) → True: 1 actions, False: 0 actions");
    }
}
