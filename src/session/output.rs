use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest run of bytes kept without a newline before it is forced out as a line.
const MAX_PARTIAL_BYTES: usize = 64 * 1024;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub text: String,
    pub stream: Stream,
    pub at: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(text: impl Into<String>, stream: Stream) -> Self {
        Self {
            text: text.into(),
            stream,
            at: Utc::now(),
        }
    }
}

/// Bounded, append-only store of a session's recent output.
///
/// Oldest lines are evicted first once `capacity` is reached. Appends of a
/// batch and snapshots both take the same lock, so a reader sees either all
/// or none of a batch.
#[derive(Debug)]
pub struct OutputBuffer {
    capacity: usize,
    inner: Mutex<BufferInner>,
}

#[derive(Debug, Default)]
struct BufferInner {
    lines: VecDeque<OutputLine>,
    evicted: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(BufferInner {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                evicted: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: OutputLine) {
        self.extend(std::iter::once(line));
    }

    /// Append a batch of lines atomically and return how many were appended.
    pub fn extend(&self, lines: impl IntoIterator<Item = OutputLine>) -> usize {
        let mut inner = self.lock();
        let mut appended = 0;
        for line in lines {
            if inner.lines.len() == self.capacity {
                inner.lines.pop_front();
                inner.evicted += 1;
            }
            inner.lines.push_back(line);
            appended += 1;
        }
        appended
    }

    /// Copy of every retained line, oldest first.
    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lock().lines.iter().cloned().collect()
    }

    /// The most recent `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<OutputLine> {
        let inner = self.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of lines dropped to make room since the buffer was created.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }
}

/// Splits a byte stream into lines, holding back any trailing partial line.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                lines.push(decode(&self.partial));
                self.partial.clear();
            } else {
                self.partial.push(byte);
                if self.partial.len() >= MAX_PARTIAL_BYTES {
                    lines.push(decode(&self.partial));
                    self.partial.clear();
                }
            }
        }
        lines
    }

    /// The current incomplete line, if any.
    pub fn pending(&self) -> Option<String> {
        (!self.partial.is_empty()).then(|| decode(&self.partial))
    }

    /// Flush the trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let line = self.pending();
        self.partial.clear();
        line
    }
}

fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn texts(lines: &[OutputLine]) -> Vec<String> {
        lines.iter().map(|l| l.text.clone()).collect()
    }

    #[test]
    fn test_snapshot_within_capacity() {
        let buffer = OutputBuffer::new(5);
        for i in 0..3 {
            buffer.push(OutputLine::new(format!("line {i}"), Stream::Stdout));
        }
        assert_eq!(texts(&buffer.snapshot()), vec!["line 0", "line 1", "line 2"]);
        assert_eq!(buffer.evicted(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest_first() {
        let buffer = OutputBuffer::new(3);
        let appended = buffer.extend((0..5).map(|i| OutputLine::new(i.to_string(), Stream::Stdout)));
        assert_eq!(appended, 5);
        assert_eq!(texts(&buffer.snapshot()), vec!["2", "3", "4"]);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.evicted(), 2);
    }

    #[test]
    fn test_tail() {
        let buffer = OutputBuffer::new(10);
        buffer.extend((0..4).map(|i| OutputLine::new(i.to_string(), Stream::Stderr)));
        assert_eq!(texts(&buffer.tail(2)), vec!["2", "3"]);
        assert_eq!(buffer.tail(10).len(), 4);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = OutputBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.push(OutputLine::new("a", Stream::Stdout));
        buffer.push(OutputLine::new("b", Stream::Stdout));
        assert_eq!(texts(&buffer.snapshot()), vec!["b"]);
    }

    #[test]
    fn test_snapshots_never_see_half_a_batch() {
        let buffer = Arc::new(OutputBuffer::new(1000));
        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for _ in 0..200 {
                    buffer.extend((0..4).map(|i| OutputLine::new(i.to_string(), Stream::Stdout)));
                }
            })
        };

        for _ in 0..200 {
            let snapshot = buffer.snapshot();
            assert_eq!(snapshot.len() % 4, 0);
        }
        writer.join().unwrap();
        assert_eq!(buffer.len(), 800);
    }

    #[test]
    fn test_assembler_holds_partial_lines() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push(b"hel"), Vec::<String>::new());
        assert_eq!(assembler.pending().as_deref(), Some("hel"));
        assert_eq!(assembler.push(b"lo\r\nwor"), vec!["hello"]);
        assert_eq!(assembler.push(b"ld\n\n"), vec!["world", ""]);
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn test_assembler_flushes_trailing_partial() {
        let mut assembler = LineAssembler::new();
        assembler.push(b"done\nContinue? [y/n] ");
        assert_eq!(assembler.finish().as_deref(), Some("Continue? [y/n] "));
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn test_assembler_keeps_split_utf8_intact() {
        let mut assembler = LineAssembler::new();
        let bytes = "héllo\n".as_bytes();
        let (a, b) = bytes.split_at(2);
        assert!(assembler.push(a).is_empty());
        assert_eq!(assembler.push(b), vec!["héllo"]);
    }

    #[test]
    fn test_assembler_caps_runaway_lines() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.push(&vec![b'x'; MAX_PARTIAL_BYTES + 10]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PARTIAL_BYTES);
        assert_eq!(assembler.pending().map(|p| p.len()), Some(10));
    }
}
