/// Truncates to at most `max` characters, marking the cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max <= 14 {
        return "…(truncated)".chars().take(max).collect();
    }
    let keep = max - 12;
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("…(truncated)");
    out
}
