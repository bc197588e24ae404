//! Capped stdout/stderr capture.
//!
//! Output is appended chunk by chunk as the runtime streams it. Each stream
//! keeps at most `cap` bytes; anything beyond is dropped and the stream is
//! flagged as truncated.

use serde::{Deserialize, Serialize};

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Final captured output of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
}

#[derive(Debug, Default)]
struct CappedBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CappedBuffer {
    fn push(&mut self, chunk: &[u8], cap: usize) {
        if self.truncated {
            return;
        }
        let room = cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn into_string(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(s) => s,
            // The cap may split a multi-byte sequence.
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

/// Incremental capture of both output streams.
#[derive(Debug)]
pub struct OutputCapture {
    cap: usize,
    stdout: CappedBuffer,
    stderr: CappedBuffer,
}

impl OutputCapture {
    /// Creates a capture that keeps at most `cap` bytes per stream.
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            stdout: CappedBuffer::default(),
            stderr: CappedBuffer::default(),
        }
    }

    /// Appends a chunk to the given stream.
    pub fn push(&mut self, kind: StreamKind, chunk: &[u8]) {
        match kind {
            StreamKind::Stdout => self.stdout.push(chunk, self.cap),
            StreamKind::Stderr => self.stderr.push(chunk, self.cap),
        }
    }

    /// True once both streams hit the cap; nothing more will be kept.
    pub fn is_full(&self) -> bool {
        self.stdout.truncated && self.stderr.truncated
    }

    pub fn finish(self) -> CapturedOutput {
        let stdout_truncated = self.stdout.truncated;
        let stderr_truncated = self.stderr.truncated;
        CapturedOutput {
            stdout: self.stdout.into_string(),
            stdout_truncated,
            stderr: self.stderr.into_string(),
            stderr_truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_cap_is_not_truncated() {
        let mut capture = OutputCapture::new(16);
        capture.push(StreamKind::Stdout, b"4950\n");
        let out = capture.finish();
        assert_eq!(out.stdout, "4950\n");
        assert!(!out.stdout_truncated);
        assert!(!out.stderr_truncated);
    }

    #[test]
    fn test_exact_cap_is_not_truncated() {
        let mut capture = OutputCapture::new(4);
        capture.push(StreamKind::Stdout, b"ab");
        capture.push(StreamKind::Stdout, b"cd");
        let out = capture.finish();
        assert_eq!(out.stdout, "abcd");
        assert!(!out.stdout_truncated);
    }

    #[test]
    fn test_overflow_sets_flag_and_discards_rest() {
        let mut capture = OutputCapture::new(4);
        capture.push(StreamKind::Stdout, b"abc");
        capture.push(StreamKind::Stdout, b"def");
        capture.push(StreamKind::Stdout, b"ghi");
        let out = capture.finish();
        assert_eq!(out.stdout, "abcd");
        assert!(out.stdout_truncated);
    }

    #[test]
    fn test_streams_capped_independently() {
        let mut capture = OutputCapture::new(3);
        capture.push(StreamKind::Stdout, b"xxxxxx");
        capture.push(StreamKind::Stderr, b"e");
        assert!(!capture.is_full());
        capture.push(StreamKind::Stderr, b"rrrr");
        assert!(capture.is_full());

        let out = capture.finish();
        assert_eq!(out.stdout, "xxx");
        assert_eq!(out.stderr, "err");
        assert!(out.stdout_truncated);
        assert!(out.stderr_truncated);
    }

    #[test]
    fn test_split_utf8_is_lossy_not_error() {
        let mut capture = OutputCapture::new(1);
        capture.push(StreamKind::Stdout, "é".as_bytes());
        let out = capture.finish();
        assert!(out.stdout_truncated);
        assert_eq!(out.stdout, "\u{FFFD}");
    }
}
