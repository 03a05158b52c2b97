//! Structured log pipeline.
//!
//! Child output bytes are framed into [`LogItem`]s: one item per
//! newline-terminated line, terminator stripped, with a 1-based line
//! number shared across stdout and stderr of the same job. Lines from
//! one stream keep their order; ordering across the two streams
//! follows task scheduling and is deliberately unspecified.
//!
//! Overflow policy: the channel is bounded and the producer never
//! blocks. When the consumer lags, lines are counted but not
//! delivered, and a single `<N lines dropped>` marker is emitted once
//! space frees up. Loss is possible under back-pressure; reordering
//! is not. Bytes that do not decode as UTF-8 are carried through with
//! replacement characters, never discarded, and framing is done on
//! raw bytes so bad sequences cannot desynchronise the numbering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::{LogItem, LogStream};

/// Bound of the per-job log channel.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Soft cap on a single line; longer lines split into consecutive
/// items at this size.
pub(crate) const MAX_LINE_BYTES: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Line framing
// ---------------------------------------------------------------------------

/// Splits an incoming byte stream into lines.
///
/// `\n` terminates a line and is stripped, as is a preceding `\r`.
/// Once the pending buffer exceeds [`MAX_LINE_BYTES`] it is flushed in
/// cap-sized pieces so a silent child cannot grow memory unboundedly.
#[derive(Default)]
pub(crate) struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    /// Feed a chunk, returning the completed lines it produced.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();

        loop {
            match self.buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                    line.pop(); // the \n itself
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    split_capped(&line, &mut lines);
                }
                None => break,
            }
        }

        // Flush an over-long unterminated line piecewise.
        while self.buf.len() >= MAX_LINE_BYTES {
            let cut = floor_char_boundary(&self.buf, MAX_LINE_BYTES);
            let piece: Vec<u8> = self.buf.drain(..cut).collect();
            lines.push(String::from_utf8_lossy(&piece).into_owned());
        }

        lines
    }

    /// Flush the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            split_capped(&rest, &mut lines);
        }
        lines
    }
}

/// Push `line` into `out`, split at [`MAX_LINE_BYTES`] boundaries.
fn split_capped(line: &[u8], out: &mut Vec<String>) {
    let mut rest = line;
    while rest.len() > MAX_LINE_BYTES {
        let cut = floor_char_boundary(rest, MAX_LINE_BYTES);
        out.push(String::from_utf8_lossy(&rest[..cut]).into_owned());
        rest = &rest[cut..];
    }
    out.push(String::from_utf8_lossy(rest).into_owned());
}

/// Largest index `<= idx` that does not land inside a UTF-8 sequence.
/// Falls back to `idx` for degenerate (non-UTF-8) data so progress is
/// always made.
fn floor_char_boundary(bytes: &[u8], idx: usize) -> usize {
    if idx >= bytes.len() {
        return bytes.len();
    }
    let mut cut = idx;
    while cut > 0 && idx - cut < 4 && (bytes[cut] & 0xC0) == 0x80 {
        cut -= 1;
    }
    if cut == 0 || idx - cut >= 4 {
        idx
    } else {
        cut
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Per-job log channel plus the shared numbering state.
pub(crate) struct LogPipeline {
    cmd_id: Arc<str>,
    sender: Mutex<Option<mpsc::Sender<LogItem>>>,
    receiver: Mutex<Option<mpsc::Receiver<LogItem>>>,
    counter: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl LogPipeline {
    pub fn new(cmd_id: &str) -> Self {
        Self::with_capacity(cmd_id, LOG_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(cmd_id: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            cmd_id: Arc::from(cmd_id),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            counter: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter backing `log_size`; shared with the job state so the
    /// terminal transition can freeze the final line number.
    pub fn line_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.counter)
    }

    /// Hand out the single receive end. Subsequent calls return
    /// `None`.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<LogItem>> {
        self.receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// A writer for one child stream. Returns `None` once the
    /// pipeline is closed.
    pub fn writer(&self, stream: LogStream) -> Option<LogWriter> {
        let tx = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()?;
        Some(LogWriter {
            cmd_id: Arc::clone(&self.cmd_id),
            stream,
            tx,
            counter: Arc::clone(&self.counter),
            dropped: Arc::clone(&self.dropped),
            splitter: LineSplitter::default(),
        })
    }

    /// Close the channel. Called exactly once, after the terminal
    /// status is written and all writers have been dropped.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Producer handle for one stream of one job.
pub(crate) struct LogWriter {
    cmd_id: Arc<str>,
    stream: LogStream,
    tx: mpsc::Sender<LogItem>,
    counter: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    splitter: LineSplitter,
}

impl LogWriter {
    /// Frame a chunk of raw child output.
    pub fn push(&mut self, chunk: &[u8]) {
        for line in self.splitter.push(chunk) {
            self.emit(line);
        }
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) {
        for line in self.splitter.finish() {
            self.emit(line);
        }
    }

    /// Emit one pre-framed line (image pull progress and other
    /// engine-sourced messages).
    pub fn emit(&self, content: String) {
        self.flush_dropped();

        let number = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let item = LogItem {
            cmd_id: self.cmd_id.to_string(),
            number,
            content,
            stream: self.stream,
            timestamp: Utc::now(),
        };

        if let Err(TrySendError::Full(_)) = self.tx.try_send(item) {
            self.dropped.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// If lines were lost to back-pressure, surface one marker item
    /// now that there may be room again.
    fn flush_dropped(&self) {
        let pending = self.dropped.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return;
        }

        let number = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let marker = LogItem {
            cmd_id: self.cmd_id.to_string(),
            number,
            content: format!("<{pending} lines dropped>"),
            stream: self.stream,
            timestamp: Utc::now(),
        };

        if let Err(TrySendError::Full(_)) = self.tx.try_send(marker) {
            // Still congested; the marker line is lost as well.
            self.dropped.fetch_add(pending + 1, Ordering::AcqRel);
        }
    }
}

/// Drain an async reader into the pipeline until EOF.
pub(crate) async fn pump_reader<R>(mut reader: R, mut writer: LogWriter)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => writer.push(&buf[..n]),
        }
    }
    writer.finish();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_frames_lines_and_strips_terminators() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"one\r\ntwo\nthr");
        assert_eq!(lines, vec!["one", "two"]);

        let lines = splitter.push(b"ee\n");
        assert_eq!(lines, vec!["three"]);
        assert!(splitter.finish().is_empty());
    }

    #[test]
    fn splitter_flushes_trailing_partial_line() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"no newline").is_empty());
        assert_eq!(splitter.finish(), vec!["no newline"]);
    }

    #[test]
    fn splitter_passes_invalid_utf8_through_lossy() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"ok \xff\xfe bytes\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
        assert!(lines[0].ends_with(" bytes"));
        assert!(lines[0].contains('\u{FFFD}'));
    }

    #[test]
    fn over_long_lines_split_at_the_cap() {
        let mut splitter = LineSplitter::default();
        let mut input = vec![b'a'; MAX_LINE_BYTES + 10];
        input.push(b'\n');

        let lines = splitter.push(&input);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(lines[1].len(), 10);
    }

    #[test]
    fn cap_split_respects_utf8_boundaries() {
        // A 3-byte character straddling the cap must move wholly into
        // the second piece.
        let mut input = vec![b'a'; MAX_LINE_BYTES - 1];
        input.extend_from_slice("€".as_bytes());
        input.push(b'\n');

        let mut splitter = LineSplitter::default();
        let lines = splitter.push(&input);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES - 1);
        assert_eq!(lines[1], "€");
    }

    #[tokio::test]
    async fn numbering_is_shared_across_streams() {
        let pipeline = LogPipeline::new("job");
        let mut rx = pipeline.take_receiver().expect("receiver");
        let mut out = pipeline.writer(LogStream::Stdout).expect("writer");
        let mut err = pipeline.writer(LogStream::Stderr).expect("writer");

        out.push(b"a\n");
        err.push(b"b\n");
        out.push(b"c\n");
        drop((out, err));
        pipeline.close();

        let mut numbers = Vec::new();
        while let Some(item) = rx.recv().await {
            numbers.push(item.number);
        }
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(pipeline.line_counter().load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn overflow_counts_lines_and_emits_one_marker() {
        let pipeline = LogPipeline::with_capacity("job", 4);
        let mut rx = pipeline.take_receiver().expect("receiver");
        let mut writer = pipeline.writer(LogStream::Stdout).expect("writer");

        // Fill the buffer, then overflow it by two lines.
        for i in 1..=4 {
            writer.push(format!("line-{i}\n").as_bytes());
        }
        writer.push(b"lost-1\n");
        writer.push(b"lost-2\n");

        assert_eq!(rx.recv().await.expect("line-1").content, "line-1");
        assert_eq!(rx.recv().await.expect("line-2").content, "line-2");

        // Space is available again: the next emission first delivers
        // the marker, then the line itself.
        writer.push(b"after\n");

        assert_eq!(rx.recv().await.expect("line-3").content, "line-3");
        assert_eq!(rx.recv().await.expect("line-4").content, "line-4");

        let marker = rx.recv().await.expect("marker item");
        assert_eq!(marker.content, "<2 lines dropped>");
        assert_eq!(marker.number, 7);

        let after = rx.recv().await.expect("line after marker");
        assert_eq!(after.content, "after");
        assert_eq!(after.number, 8);

        // Dropped lines and the marker all count towards log_size.
        assert_eq!(pipeline.line_counter().load(Ordering::Acquire), 8);
    }

    #[tokio::test]
    async fn close_ends_the_stream_exactly_once() {
        let pipeline = LogPipeline::new("job");
        let mut rx = pipeline.take_receiver().expect("receiver");
        assert!(pipeline.take_receiver().is_none(), "single consumer contract");

        let writer = pipeline.writer(LogStream::Stdout).expect("writer");
        drop(writer);
        pipeline.close();

        assert!(rx.recv().await.is_none());
        assert!(pipeline.writer(LogStream::Stdout).is_none());
    }
}
