use std::borrow::Cow;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Makes server-supplied text safe to print on one terminal line.
///
/// Control characters (including ESC, so no escape sequences survive) become
/// spaces and runs of whitespace collapse to one.
pub fn terminal_line(s: &str) -> Cow<'_, str> {
    let clean = !s.chars().any(|c| c.is_control())
        && !s.contains("  ")
        && s.trim().len() == s.len();
    if clean {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    for word in s
        .split(|c: char| c.is_control() || c.is_whitespace())
        .filter(|w| !w.is_empty())
    {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    Cow::Owned(out)
}

const ELLIPSIS: &str = "...";

/// Display width in terminal columns. Wide (CJK, emoji) characters count two.
pub fn display_width(s: &str) -> usize {
    UnicodeWidthStr::width(s)
}

/// Cuts `s` to at most `max_width` terminal columns, marking the cut with
/// `...`. Below four columns there is no room for the marker, so the text is
/// simply clipped.
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    if display_width(s) <= max_width {
        return Cow::Borrowed(s);
    }

    let marker = if max_width > ELLIPSIS.len() { ELLIPSIS } else { "" };
    let budget = max_width - marker.len();

    let mut used = 0;
    let mut end = 0;
    for (idx, c) in s.char_indices() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        end = idx + c.len_utf8();
    }
    Cow::Owned(format!("{}{}", &s[..end], marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_borrowed() {
        assert!(matches!(terminal_line("Hello world"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_escape_sequences_and_newlines_removed() {
        assert_eq!(terminal_line("Bad\x1b]0;title\x07 headline\nnext"), "Bad ]0;title headline next");
        assert_eq!(terminal_line("  spaced\t\tout  "), "spaced out");
    }

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_to_width("short", 10), "short");
        assert!(matches!(truncate_to_width("short", 5), Cow::Borrowed(_)));
        assert_eq!(truncate_to_width("a long headline", 9), "a long...");
    }

    #[test]
    fn test_truncate_counts_wide_characters_twice() {
        // 8 characters, 16 columns
        let title = "日本語のタイトル";
        assert_eq!(display_width(title), 16);
        let cut = truncate_to_width(title, 9);
        assert_eq!(cut, "日本語...");
        assert!(display_width(&cut) <= 9);

        let long: String = "漢".repeat(72);
        let cut = truncate_to_width(&long, 72);
        assert!(display_width(&cut) <= 72);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_truncate_narrow_widths_clip_without_marker() {
        assert_eq!(truncate_to_width("Test", 0), "");
        assert_eq!(truncate_to_width("Test", 3), "Tes");
        assert_eq!(truncate_to_width("日本", 3), "日");
    }
}
