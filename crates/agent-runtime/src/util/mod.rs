pub mod editor;

/// Truncates `input` to at most `max_bytes`, never splitting a UTF-8
/// character, and appends `suffix` when anything was removed.
pub fn truncate_safe(input: &str, max_bytes: usize, suffix: &str) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }
    let budget = max_bytes.saturating_sub(suffix.len());
    let mut end = budget.min(input.len());
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &input[..end], suffix)
}
