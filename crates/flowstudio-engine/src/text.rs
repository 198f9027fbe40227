//! Small text helpers shared by handlers and agent tools.

use std::sync::OnceLock;

use regex::Regex;

/// Cut `s` to at most `max` characters, appending `...` when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Short single-line rendering for log fields.
pub fn preview(s: &str) -> String {
    truncate_chars(&s.replace('\n', " "), 100)
}

fn html_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("static regex"),
            Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("static regex"),
            Regex::new(r"<[^>]+>").expect("static regex"),
            Regex::new(r"\n{3,}").expect("static regex"),
        ]
    })
}

/// Strip markup, keeping text content. Script and style blocks are dropped.
pub fn strip_html_tags(html: &str) -> String {
    let [script, style, tags, blank_lines] = html_patterns();
    let cleaned = script.replace_all(html, "");
    let cleaned = style.replace_all(&cleaned, "");
    let text = tags.replace_all(&cleaned, "");

    let text = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");

    blank_lines.replace_all(&text, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("héllo wörld", 4), "héll...");
    }

    #[test]
    fn test_strip_html() {
        let html = "<html><head><style>p{}</style><script>alert(1)</script></head>\
                    <body><p>Fish &amp; chips</p></body></html>";
        assert_eq!(strip_html_tags(html), "Fish & chips");
    }

    #[test]
    fn test_preview_single_line() {
        assert_eq!(preview("a\nb"), "a b");
        assert_eq!(preview(&"x".repeat(150)).len(), 103);
    }
}
