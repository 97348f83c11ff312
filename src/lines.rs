//! Byte-level line splitting for chunked HTTP bodies.
//!
//! Network reads split a body at arbitrary byte offsets, including in the
//! middle of a multi-byte character. Lines are only decoded once the newline
//! that terminates them has arrived, so a character split across two reads is
//! always reassembled before decoding.

#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, without the line
    /// terminator (`\n` or `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(decode_line)
            .collect()
    }

    /// Returns the trailing line that never received a terminator, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let rest = std::mem::take(&mut self.pending);
            Some(decode_line(&rest))
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines_are_returned_in_order() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"one\ntwo\n\nthree");

        assert_eq!(lines, vec!["one", "two", ""]);
        assert_eq!(buffer.pending_len(), 5);
        assert_eq!(buffer.finish(), Some("three".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_partial_line_is_retained_until_terminated() {
        let mut buffer = LineBuffer::new();

        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert!(buffer.push(b": 1}").is_empty());
        assert_eq!(buffer.push(b"\n"), vec!["data: {\"a\": 1}"]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_crlf_terminators_are_stripped() {
        let mut buffer = LineBuffer::new();

        assert_eq!(buffer.push(b"a\r\nb\r\n"), vec!["a", "b"]);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let text = "héllo wörld\n".as_bytes();
        let mut buffer = LineBuffer::new();

        // split inside the two-byte encoding of 'é'
        assert!(buffer.push(&text[..2]).is_empty());
        assert_eq!(buffer.push(&text[2..]), vec!["héllo wörld"]);
    }
}
