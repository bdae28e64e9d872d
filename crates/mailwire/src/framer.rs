//! Incremental CRLF line framing.
//!
//! Mail protocols delimit lines with CRLF. Bytes arrive from the socket in
//! arbitrary chunks, so a line (or the delimiter itself) may be split across
//! reads. [`LineFramer`] keeps the unterminated tail between calls and emits
//! each complete line with the delimiter stripped.
//!
//! # Example
//!
//! ```
//! use mailwire::LineFramer;
//!
//! let mut framer = LineFramer::new();
//! assert!(framer.feed(b"+OK rea").is_empty());
//! assert_eq!(framer.feed(b"dy\r"), Vec::<String>::new());
//! assert_eq!(framer.feed(b"\n"), vec!["+OK ready".to_string()]);
//! ```

use bytes::BytesMut;

/// Line delimiter.
pub const CRLF: &[u8] = b"\r\n";

/// Initial capacity of the residual buffer.
const DEFAULT_CAPACITY: usize = 8192;

/// Splits a byte stream into CRLF-terminated lines.
///
/// No line length limit is applied here.
#[derive(Debug)]
pub struct LineFramer {
    /// Bytes received but not yet part of a complete line.
    residual: BytesMut,
    /// Offset in `residual` from which the next CRLF search starts.
    scanned: usize,
}

impl LineFramer {
    /// Creates an empty framer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            residual: BytesMut::with_capacity(DEFAULT_CAPACITY),
            scanned: 0,
        }
    }

    /// Appends a chunk and returns every line it completes, in order.
    ///
    /// Consecutive delimiters produce empty lines. Bytes that are not valid
    /// UTF-8 are replaced with U+FFFD once their line is complete.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.residual.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = find_crlf(&self.residual[self.scanned..]) {
            let end = self.scanned + pos;
            let line = self.residual.split_to(end + CRLF.len());
            lines.push(String::from_utf8_lossy(&line[..end]).into_owned());
            self.scanned = 0;
        }

        // A trailing CR may pair with an LF from the next chunk.
        self.scanned = self.residual.len().saturating_sub(1);
        lines
    }

    /// Returns the buffered partial line.
    #[must_use]
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }

    /// Returns the number of buffered bytes.
    #[must_use]
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }

    /// Returns true if no partial line is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.residual.is_empty()
    }

    /// Drops any buffered partial line.
    pub fn clear(&mut self) {
        self.residual.clear();
        self.scanned = 0;
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the position of CRLF in a buffer.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut framer = LineFramer::new();
        chunks.iter().flat_map(|chunk| framer.feed(chunk)).collect()
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"hello\r\n"), Some(5));
        assert_eq!(find_crlf(b"\r\n"), Some(0));
        assert_eq!(find_crlf(b"no newline"), None);
        assert_eq!(find_crlf(b"just\n"), None);
        assert_eq!(find_crlf(b"just\r"), None);
    }

    #[test]
    fn test_single_line() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.feed(b"+OK ready\r\n"), vec!["+OK ready"]);
        assert!(framer.is_empty());
    }

    #[test]
    fn test_multiple_lines_one_chunk() {
        let lines = feed_all(&[b"line1\r\nline2\r\nTAG OK done\r\n"]);
        assert_eq!(lines, vec!["line1", "line2", "TAG OK done"]);
    }

    #[test]
    fn test_partial_line_retained() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.feed(b"* OK\r\n* 3 EX"), vec!["* OK"]);
        assert_eq!(framer.residual(), b"* 3 EX");
        assert_eq!(framer.feed(b"ISTS\r\n"), vec!["* 3 EXISTS"]);
        assert_eq!(framer.residual_len(), 0);
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.feed(b"250 OK\r").is_empty());
        assert_eq!(framer.residual(), b"250 OK\r");
        assert_eq!(framer.feed(b"\n250"), vec!["250 OK"]);
        assert_eq!(framer.residual(), b"250");
    }

    #[test]
    fn test_empty_lines() {
        let lines = feed_all(&[b"\r\n\r\nbody\r\n\r\n"]);
        assert_eq!(lines, vec!["", "", "body", ""]);
    }

    #[test]
    fn test_bare_cr_and_lf_are_not_delimiters() {
        let lines = feed_all(&[b"a\rb\nc\r\n"]);
        assert_eq!(lines, vec!["a\rb\nc"]);
    }

    #[test]
    fn test_cr_cr_lf() {
        let lines = feed_all(&[b"x\r", b"\r", b"\n"]);
        assert_eq!(lines, vec!["x\r"]);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let text = "Subject: caf\u{e9}\r\n".as_bytes();
        let (head, tail) = text.split_at(13);
        assert_eq!(feed_all(&[head, tail]), vec!["Subject: caf\u{e9}"]);
    }

    #[test]
    fn test_clear() {
        let mut framer = LineFramer::new();
        framer.feed(b"partial\r");
        framer.clear();
        assert!(framer.is_empty());
        assert!(framer.feed(b"\n").is_empty());
    }

    #[test]
    fn test_long_line_in_small_chunks() {
        let mut framer = LineFramer::new();
        let body = "A".repeat(100_000);
        for chunk in body.as_bytes().chunks(7) {
            assert!(framer.feed(chunk).is_empty());
        }
        assert_eq!(framer.feed(b"\r\n"), vec![body]);
    }

    fn stream_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(
            prop_oneof![
                4 => Just(b'a'),
                2 => Just(b'\r'),
                2 => Just(b'\n'),
                1 => Just(b' '),
            ],
            0..200,
        )
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_matter(
            input in stream_bytes(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
        ) {
            let whole = feed_all(&[&input]);

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(input.len() + 1)).collect();
            points.sort_unstable();
            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for point in points {
                chunks.push(&input[start..point]);
                start = point;
            }
            chunks.push(&input[start..]);

            prop_assert_eq!(feed_all(&chunks), whole);
        }

        #[test]
        fn prop_lines_rejoin_to_input(input in stream_bytes()) {
            let mut framer = LineFramer::new();
            let lines = framer.feed(&input);

            let mut rebuilt = Vec::new();
            for line in &lines {
                rebuilt.extend_from_slice(line.as_bytes());
                rebuilt.extend_from_slice(CRLF);
            }
            rebuilt.extend_from_slice(framer.residual());
            prop_assert_eq!(rebuilt, input);
        }
    }
}
