use regex::Regex;
use std::sync::LazyLock;

static CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Cc}").expect("valid control-char regex"));

static UNSAFE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Cc}\p{Cf}\p{Co}\x{FFFD}]").expect("valid unsafe-char regex")
});

/// Decode a response body as text without ever failing.
///
/// Tried in order: UTF-8 (optional BOM), UTF-16 with a BOM, then a lossy
/// UTF-8 decode that replaces invalid sequences with U+FFFD.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|c| unit([c[0], c[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Remove every control character.
pub fn strip_control(s: &str) -> String {
    CONTROL.replace_all(s, "").into_owned()
}

/// Narrow text to a safe alphabet: no control, format, private-use or
/// replacement characters. Used before the single parse retry.
pub fn narrow_to_safe(s: &str) -> String {
    UNSAFE.replace_all(s, "").into_owned()
}
