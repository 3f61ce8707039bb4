//! Stream tailer: drains the node's output channels into shared line buffers.
//!
//! Each channel gets one background task that only awaits reads, so the node
//! never blocks on a full pipe. Other tasks read buffered lines by absolute
//! offset while the drain task keeps appending.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Append-only, shareable sequence of text lines.
///
/// Offsets are absolute: line `n` is the `n`-th line ever pushed. With a
/// retention cap the oldest lines are evicted and readers holding stale
/// offsets are told how many lines they missed.
#[derive(Debug, Clone, Default)]
pub struct LineBuffer {
    inner: Arc<RwLock<BufferInner>>,
}

#[derive(Debug, Default)]
struct BufferInner {
    lines: VecDeque<String>,
    /// Absolute offset of `lines[0]`.
    base: usize,
    closed: bool,
    cap: Option<usize>,
}

/// Lines returned by [`LineBuffer::read_from`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineBatch {
    /// Lines from the requested offset to the current end.
    pub lines: Vec<String>,
    /// Offset to pass to the next read.
    pub next_offset: usize,
    /// Lines evicted before they could be read.
    pub dropped: usize,
    /// The producer has finished; nothing will follow `next_offset`.
    pub closed: bool,
}

impl LineBuffer {
    /// Unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that retains at most `cap` lines (`None` = unbounded).
    pub fn with_retention(cap: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BufferInner {
                cap,
                ..Default::default()
            })),
        }
    }

    /// Append one line.
    pub async fn push(&self, line: String) {
        let mut inner = self.inner.write().await;
        inner.lines.push_back(line);
        if let Some(cap) = inner.cap {
            while inner.lines.len() > cap {
                inner.lines.pop_front();
                inner.base += 1;
            }
        }
    }

    /// Mark the producer as finished.
    pub async fn close(&self) {
        self.inner.write().await.closed = true;
    }

    /// Total number of lines ever appended.
    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.base + inner.lines.len()
    }

    /// Every line from `offset` onwards.
    pub async fn read_from(&self, offset: usize) -> LineBatch {
        let inner = self.inner.read().await;
        let start = offset.max(inner.base);
        let lines: Vec<String> = inner.lines.iter().skip(start - inner.base).cloned().collect();
        LineBatch {
            next_offset: start + lines.len(),
            lines,
            dropped: start - offset,
            closed: inner.closed,
        }
    }

    /// Retained lines joined with newlines.
    pub async fn contents(&self) -> String {
        let inner = self.inner.read().await;
        inner.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Outcome of watching the readiness channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The readiness marker was seen.
    Ready,
    /// The channel closed before the marker appeared.
    EndOfStream,
}

/// Drain `reader` into `buffer` until it closes.
pub fn spawn_tailer<R>(reader: R, buffer: LineBuffer, max_line_length: usize) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(drain(reader, buffer, max_line_length, None))
}

/// Drain `reader` into `buffer`, signalling when a line contains `marker`.
///
/// Lines are echoed at `info` until the marker appears.
pub fn spawn_ready_tailer<R>(
    reader: R,
    buffer: LineBuffer,
    marker: String,
    max_line_length: usize,
) -> (JoinHandle<()>, oneshot::Receiver<Readiness>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(drain(reader, buffer, max_line_length, Some((marker, tx))));
    (handle, rx)
}

async fn drain<R>(
    reader: R,
    buffer: LineBuffer,
    max_line_length: usize,
    mut ready: Option<(String, oneshot::Sender<Readiness>)>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        match read_line_bounded(&mut reader, &mut line, max_line_length).await {
            Ok(read) if read.consumed == 0 => break,
            Ok(read) => {
                if read.length > max_line_length {
                    warn!(
                        "Truncated {} byte line to {} bytes",
                        read.length, max_line_length
                    );
                }
                let text = line.trim_end_matches(['\n', '\r']).to_string();

                let marker_seen = match &ready {
                    Some((marker, _)) => {
                        if !text.is_empty() {
                            info!("  {}", text);
                        }
                        text.contains(marker.as_str())
                    }
                    None => false,
                };
                if marker_seen {
                    if let Some((_, tx)) = ready.take() {
                        let _ = tx.send(Readiness::Ready);
                    }
                }

                buffer.push(text).await;
            }
            Err(e) => {
                warn!("Output channel read failed: {}", e);
                break;
            }
        }
    }

    if let Some((_, tx)) = ready.take() {
        let _ = tx.send(Readiness::EndOfStream);
    }
    buffer.close().await;
    debug!("Output channel closed");
}

/// One bounded line read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineRead {
    /// Bytes consumed from the reader, terminator included. 0 at end of stream.
    consumed: usize,
    /// Length of the line without its `\n` or `\r\n` terminator.
    length: usize,
}

/// Read one line, keeping at most `max_len` bytes of it.
///
/// The line was truncated when `length` exceeds `max_len`. Invalid UTF-8 is
/// replaced rather than rejected.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut String, max_len: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut bytes = Vec::new();
    let mut read = LineRead {
        consumed: 0,
        length: 0,
    };
    let mut last = None;
    let mut terminated = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }

        let newline = available.iter().position(|&b| b == b'\n');
        let content = &available[..newline.unwrap_or(available.len())];

        let remaining = max_len.saturating_sub(bytes.len());
        bytes.extend_from_slice(&content[..content.len().min(remaining)]);
        read.length += content.len();
        last = content.last().copied().or(last);

        let used = newline.map_or(available.len(), |pos| pos + 1);
        reader.consume(used);
        read.consumed += used;

        if newline.is_some() {
            terminated = true;
            break;
        }
    }

    if terminated && last == Some(b'\r') {
        read.length -= 1;
    }
    *buf = String::from_utf8_lossy(&bytes).into_owned();
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_from_offsets() {
        let buffer = LineBuffer::new();
        for i in 0..3 {
            buffer.push(format!("line {i}")).await;
        }

        let batch = buffer.read_from(1).await;
        assert_eq!(batch.lines, vec!["line 1", "line 2"]);
        assert_eq!(batch.next_offset, 3);
        assert_eq!(batch.dropped, 0);
        assert!(!batch.closed);

        let empty = buffer.read_from(3).await;
        assert!(empty.lines.is_empty());
        assert_eq!(empty.next_offset, 3);
    }

    #[tokio::test]
    async fn test_retention_cap_reports_dropped_lines() {
        let buffer = LineBuffer::with_retention(Some(2));
        for i in 0..5 {
            buffer.push(format!("line {i}")).await;
        }
        assert_eq!(buffer.len().await, 5);

        let batch = buffer.read_from(1).await;
        assert_eq!(batch.lines, vec!["line 3", "line 4"]);
        assert_eq!(batch.dropped, 2);
        assert_eq!(batch.next_offset, 5);
    }

    #[tokio::test]
    async fn test_tailer_collects_lines_and_closes() {
        let data: &[u8] = b"first\r\nsecond\nthird";
        let buffer = LineBuffer::new();
        spawn_tailer(data, buffer.clone(), 1024).await.unwrap();

        let batch = buffer.read_from(0).await;
        assert_eq!(batch.lines, vec!["first", "second", "third"]);
        assert!(batch.closed);
    }

    #[tokio::test]
    async fn test_overlong_lines_are_truncated() {
        let data: &[u8] = b"abcdefghij\nok\n";
        let buffer = LineBuffer::new();
        spawn_tailer(data, buffer.clone(), 4).await.unwrap();
        assert_eq!(buffer.read_from(0).await.lines, vec!["abcd", "ok"]);
    }

    #[tokio::test]
    async fn test_line_at_the_limit_is_not_truncated() {
        let mut line = String::new();

        let mut data: &[u8] = b"abcd\n";
        let read = read_line_bounded(&mut data, &mut line, 4).await.unwrap();
        assert_eq!(read, LineRead { consumed: 5, length: 4 });
        assert_eq!(line, "abcd");

        let mut data: &[u8] = b"abcd\r\n";
        let read = read_line_bounded(&mut data, &mut line, 4).await.unwrap();
        assert_eq!(read.length, 4);
        assert_eq!(line.trim_end_matches('\r'), "abcd");

        let mut data: &[u8] = b"abcde\n";
        let read = read_line_bounded(&mut data, &mut line, 4).await.unwrap();
        assert!(read.length > 4);
        assert_eq!(line, "abcd");

        let mut data: &[u8] = b"";
        let read = read_line_bounded(&mut data, &mut line, 4).await.unwrap();
        assert_eq!(read.consumed, 0);
    }

    #[tokio::test]
    async fn test_ready_marker_detected() {
        let data: &[u8] = b"Initializing daemon...\nDaemon is ready\nmore output\n";
        let buffer = LineBuffer::new();
        let (handle, ready) =
            spawn_ready_tailer(data, buffer.clone(), "Daemon is ready".to_string(), 1024);

        assert_eq!(ready.await.unwrap(), Readiness::Ready);
        handle.await.unwrap();
        assert_eq!(buffer.len().await, 3);
    }

    #[tokio::test]
    async fn test_end_of_stream_without_marker() {
        let data: &[u8] = b"Error: repo locked\n";
        let (_handle, ready) =
            spawn_ready_tailer(data, LineBuffer::new(), "Daemon is ready".to_string(), 1024);
        assert_eq!(ready.await.unwrap(), Readiness::EndOfStream);
    }
}
