//! Output hygiene applied before marker scanning and delivery.
//!
//! Raw agent output is full of terminal noise: carriage-return overwrite
//! tricks, ANSI styling, and interactive chrome lines that must never leak
//! into replies.

use regex::RegexSet;

/// Cursor-position query some TUIs send at startup, expecting a terminal
/// to answer. Unanswered, wrapped programs can stall or crash.
pub const CURSOR_QUERY: &[u8] = b"\x1b[6n";

/// Synthetic "cursor at 1,1" reply.
pub const CURSOR_REPLY: &[u8] = b"\x1b[1;1R";

/// Whether a raw chunk contains a cursor-position query needing an answer.
pub fn contains_cursor_query(bytes: &[u8]) -> bool {
    bytes.windows(CURSOR_QUERY.len()).any(|w| w == CURSOR_QUERY)
}

/// Per-session output cleaner. Holds the compiled chrome blacklist.
#[derive(Debug)]
pub struct OutputHygiene {
    blacklist: RegexSet,
}

impl OutputHygiene {
    /// `marker_prefix` keeps internal markers themselves out of replies.
    pub fn new(marker_prefix: &str) -> Self {
        let patterns = vec![
            // Interactive status bars / hints.
            r"(?i)press .{1,20} to interrupt".to_string(),
            r"(?i)esc to interrupt".to_string(),
            r"(?i)^\? for shortcuts".to_string(),
            r"(?i)^⏵⏵ ".to_string(),
            // Internal completion markers.
            format!(r"^{}_", regex::escape(marker_prefix)),
        ];
        Self {
            blacklist: RegexSet::new(patterns).expect("blacklist patterns are valid"),
        }
    }

    /// Strip ANSI sequences from one raw chunk. Carriage returns survive:
    /// CR-overwrite collapse runs over the accumulated transcript at
    /// delivery time, so an overwrite split across two PTY reads still
    /// resolves to what the terminal would render.
    pub fn clean_chunk(&self, bytes: &[u8]) -> String {
        let stripped = strip_ansi_escapes::strip(bytes);
        String::from_utf8_lossy(&stripped).into_owned()
    }

    /// Drop blacklisted chrome lines from text about to be delivered.
    pub fn filter_lines(&self, text: &str) -> String {
        let mut kept: Vec<&str> = Vec::new();
        for line in text.split('\n') {
            if !self.blacklist.is_match(line.trim()) {
                kept.push(line);
            }
        }
        kept.join("\n")
    }
}

/// For any line containing a carriage return, keep only the text after the
/// final one, matching what a real terminal would render.
pub fn collapse_cr_overwrites(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut first = true;
    for line in text.split('\n') {
        if !first {
            out.push('\n');
        }
        first = false;

        let line = line.strip_suffix('\r').unwrap_or(line);
        match line.rfind('\r') {
            Some(idx) => out.push_str(&line[idx + 1..]),
            None => out.push_str(line),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_cr_keeps_final_render() {
        assert_eq!(
            collapse_cr_overwrites("loading 10%\rloading 50%\rdone\nnext"),
            "done\nnext"
        );
    }

    #[test]
    fn test_collapse_cr_preserves_crlf_lines() {
        assert_eq!(collapse_cr_overwrites("hello\r\nworld\r\n"), "hello\nworld\n");
    }

    #[test]
    fn test_clean_chunk_strips_ansi() {
        let hygiene = OutputHygiene::new("SWYD");
        let cleaned = hygiene.clean_chunk(b"\x1b[1;32mgreen\x1b[0m text");
        assert_eq!(cleaned, "green text");
    }

    #[test]
    fn test_clean_chunk_keeps_carriage_returns() {
        let hygiene = OutputHygiene::new("SWYD");
        assert_eq!(hygiene.clean_chunk(b"10%\r50%"), "10%\r50%");
    }

    #[test]
    fn test_filter_drops_chrome_lines() {
        let hygiene = OutputHygiene::new("SWYD");
        let text = "real output\nPress Ctrl+C to interrupt\nmore output";
        assert_eq!(hygiene.filter_lines(text), "real output\nmore output");
    }

    #[test]
    fn test_filter_drops_internal_markers() {
        let hygiene = OutputHygiene::new("SWYD");
        let text = "answer\nSWYD_1700000000000_ab12cd34\n";
        assert_eq!(hygiene.filter_lines(text), "answer\n");
    }

    #[test]
    fn test_cursor_query_detection() {
        assert!(contains_cursor_query(b"startup\x1b[6nrest"));
        assert!(!contains_cursor_query(b"plain output"));
    }
}
