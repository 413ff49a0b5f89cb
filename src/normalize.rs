/// Normalize display text into a canonical node ID.
///
/// Lower-cases the text, turns every whitespace run into a single `_`,
/// drops everything that is not `[a-z0-9_]` and trims `_` from both ends.
/// The result may be empty; an empty ID means "no identity" and must never
/// be used as a key.
pub fn normalize_id(text: impl AsRef<str>) -> String {
    let lowered = text.as_ref().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut in_whitespace = false;

    for c in lowered.chars() {
        if is_separator(c) {
            if !in_whitespace {
                out.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            out.push(c);
        }
    }

    out.trim_matches('_').to_string()
}

/// Unicode whitespace plus the ASCII information separators U+001C..U+001F,
/// which Python's `str.isspace` (and so the stored IDs) also treat as space
fn is_separator(c: char) -> bool {
    c.is_whitespace() || ('\u{1c}'..='\u{1f}').contains(&c)
}

/// First `count` characters of `text` (by char, not byte).
pub fn prefix_chars(text: &str, count: usize) -> &str {
    match text.char_indices().nth(count) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
