use std::fs;
use std::path::Path;

use crate::logger;

/// Last line of the file that is not blank, trimmed. A file that cannot be
/// read counts as empty.
pub fn last_nonempty_line(path: &Path) -> String {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string(),
        Err(e) => {
            logger::warn(&format!("cannot read {}: {}", path.display(), e));
            String::new()
        }
    }
}

/// Whether `key_text` appears in the last non-empty line of `path`.
pub fn last_line_contains(path: &Path, key_text: &str) -> bool {
    last_nonempty_line(path).contains(key_text)
}
