//! Key names to Win32 virtual-key codes.

pub const VK_BACK: u16 = 0x08;
pub const VK_TAB: u16 = 0x09;
pub const VK_RETURN: u16 = 0x0D;
pub const VK_SHIFT: u16 = 0x10;
pub const VK_CONTROL: u16 = 0x11;
pub const VK_MENU: u16 = 0x12;
pub const VK_ESCAPE: u16 = 0x1B;
pub const VK_SPACE: u16 = 0x20;
pub const VK_PRIOR: u16 = 0x21;
pub const VK_NEXT: u16 = 0x22;
pub const VK_END: u16 = 0x23;
pub const VK_HOME: u16 = 0x24;
pub const VK_LEFT: u16 = 0x25;
pub const VK_UP: u16 = 0x26;
pub const VK_RIGHT: u16 = 0x27;
pub const VK_DOWN: u16 = 0x28;
pub const VK_INSERT: u16 = 0x2D;
pub const VK_DELETE: u16 = 0x2E;
pub const VK_F1: u16 = 0x70;

/// Code for a named key (`f1`, `enter`, `page up`, ...). Case-insensitive.
pub fn named_key_code(name: &str) -> Option<u16> {
    let name = name.trim().to_lowercase();
    if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<u16>().ok()) {
        return (1..=12).contains(&n).then(|| VK_F1 + n - 1);
    }
    let code = match name.as_str() {
        "enter" | "return" => VK_RETURN,
        "tab" => VK_TAB,
        "space" => VK_SPACE,
        "backspace" => VK_BACK,
        "delete" => VK_DELETE,
        "insert" => VK_INSERT,
        "escape" | "esc" => VK_ESCAPE,
        "up" => VK_UP,
        "down" => VK_DOWN,
        "left" => VK_LEFT,
        "right" => VK_RIGHT,
        "home" => VK_HOME,
        "end" => VK_END,
        "page up" | "pageup" => VK_PRIOR,
        "page down" | "pagedown" => VK_NEXT,
        _ => return None,
    };
    Some(code)
}

/// US-layout code for a printable ASCII character.
pub fn ascii_key_code(ch: char) -> Option<u16> {
    let code = match ch.to_ascii_uppercase() {
        c @ ('A'..='Z' | '0'..='9') => c as u16,
        ' ' => VK_SPACE,
        ';' | ':' => 0xBA,
        '=' | '+' => 0xBB,
        ',' | '<' => 0xBC,
        '-' | '_' => 0xBD,
        '.' | '>' => 0xBE,
        '/' | '?' => 0xBF,
        '`' | '~' => 0xC0,
        '[' | '{' => 0xDB,
        '\\' | '|' => 0xDC,
        ']' | '}' => 0xDD,
        '\'' | '"' => 0xDE,
        _ => return None,
    };
    Some(code)
}

/// Resolve a hotkey key name. Named keys first, then a single character
/// through `char_code` (layout-aware on the real platform).
pub fn resolve(name: &str, char_code: impl Fn(char) -> Option<u16>) -> Option<u16> {
    if let Some(code) = named_key_code(name) {
        return Some(code);
    }
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => char_code(ch).or_else(|| char_code(ch.to_ascii_uppercase())),
        _ => None,
    }
}
