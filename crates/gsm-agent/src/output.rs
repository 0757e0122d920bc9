//! Destinations for captured server console output.

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::{ProvisionError, Result};
use crate::support::{console_file_limits, console_max_lines};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn tag(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Receives one call per captured line, without the trailing newline.
pub trait OutputSink: Send + Sync + 'static {
    fn line(&self, stream: OutputStream, line: &str);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn line(&self, _stream: OutputStream, _line: &str) {}
}

/// Re-emits console lines as tracing events.
#[derive(Debug, Clone)]
pub struct TracingSink {
    server_id: String,
}

impl TracingSink {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn line(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => {
                tracing::info!(target: "gsm_console", server_id = %self.server_id, "{line}")
            }
            OutputStream::Stderr => {
                tracing::warn!(target: "gsm_console", server_id = %self.server_id, "{line}")
            }
        }
    }
}

/// Forwards every line to each inner sink in order.
#[derive(Clone, Default)]
pub struct MultiSink(Vec<Arc<dyn OutputSink>>);

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.0.push(sink);
        self
    }
}

impl OutputSink for MultiSink {
    fn line(&self, stream: OutputStream, line: &str) {
        for s in &self.0 {
            s.line(stream, line);
        }
    }
}

struct LineRing {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LineRing {
    fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Cursor 0 means "most recent lines".
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Bounded in-memory console, polled by cursor.
#[derive(Clone)]
pub struct ConsoleBuffer {
    inner: Arc<Mutex<LineRing>>,
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::with_capacity(console_max_lines())
    }
}

impl ConsoleBuffer {
    pub fn with_capacity(max_lines: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LineRing {
                next_seq: 1,
                max_lines: max_lines.max(1),
                lines: VecDeque::new(),
            })),
        }
    }

    /// Lines after `cursor` (at most `limit`) and the cursor to pass next time.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tail_after(cursor, limit)
    }
}

impl OutputSink for ConsoleBuffer {
    fn line(&self, stream: OutputStream, line: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_line(format!("[{}] {line}", stream.tag()));
    }
}

/// Path of the `n`th older generation of `path` (`console.log.1`, ...).
fn generation(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Console log with at most `keep` older generations beside it.
struct ConsoleLog {
    path: PathBuf,
    limit: u64,
    keep: usize,
    written: u64,
    file: tokio::fs::File,
}

impl ConsoleLog {
    async fn open(path: PathBuf, limit: u64, keep: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        let written = file.metadata().await?.len();
        Ok(Self {
            path,
            limit,
            keep,
            written,
            file,
        })
    }

    /// Shifts every generation up by one, dropping the oldest, and starts
    /// an empty current file.
    async fn roll(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        if self.keep == 0 {
            tokio::fs::remove_file(&self.path).await?;
        } else {
            match tokio::fs::remove_file(generation(&self.path, self.keep)).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
            for n in (1..self.keep).rev() {
                rename_if_present(&generation(&self.path, n), &generation(&self.path, n + 1))
                    .await?;
            }
            tokio::fs::rename(&self.path, generation(&self.path, 1)).await?;
        }
        self.file = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    /// Appends `[stream] line`. A single entry larger than the limit still
    /// lands whole in a fresh file.
    async fn record(&mut self, stream: OutputStream, line: &str) -> io::Result<()> {
        let entry = format!("[{}] {}\n", stream.tag(), line.trim_end_matches(['\r', '\n']));
        let len = entry.len() as u64;
        if self.limit > 0 && self.written > 0 && self.written.saturating_add(len) > self.limit {
            self.roll().await?;
        }
        self.file.write_all(entry.as_bytes()).await?;
        self.written = self.written.saturating_add(len);
        Ok(())
    }
}

/// Appends console lines to a size-rotated file from a background task.
#[derive(Clone)]
pub struct FileSink {
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
}

impl FileSink {
    /// Opens `path` for appending. Limits come from `GSM_CONSOLE_FILE_*`.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let (max_bytes, max_files) = console_file_limits();
        Self::open_with_limits(path, max_bytes, max_files).await
    }

    pub async fn open_with_limits(path: PathBuf, max_bytes: u64, max_files: usize) -> Result<Self> {
        let mut log = ConsoleLog::open(path.clone(), max_bytes, max_files)
            .await
            .map_err(|e| ProvisionError::fs(&path, e))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<(OutputStream, String)>();
        tokio::spawn(async move {
            while let Some((stream, line)) = rx.recv().await {
                if let Err(e) = log.record(stream, &line).await {
                    tracing::warn!(path = %log.path.display(), error = %e, "console log write failed");
                }
            }
            let _ = log.file.flush().await;
        });
        Ok(Self { tx })
    }
}

impl OutputSink for FileSink {
    fn line(&self, stream: OutputStream, line: &str) {
        let _ = self.tx.send((stream, line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_buffer_tails_by_cursor() {
        let buf = ConsoleBuffer::with_capacity(3);
        for i in 0..5 {
            buf.line(OutputStream::Stdout, &format!("line {i}"));
        }
        let (lines, cursor) = buf.tail_after(0, 10);
        assert_eq!(lines, vec!["[stdout] line 2", "[stdout] line 3", "[stdout] line 4"]);
        assert_eq!(cursor, 5);

        buf.line(OutputStream::Stderr, "boom");
        let (lines, cursor) = buf.tail_after(cursor, 10);
        assert_eq!(lines, vec!["[stderr] boom"]);
        assert_eq!(cursor, 6);
    }

    #[test]
    fn multi_sink_fans_out() {
        let a = ConsoleBuffer::with_capacity(10);
        let b = ConsoleBuffer::with_capacity(10);
        let sink = MultiSink::new()
            .with(Arc::new(a.clone()))
            .with(Arc::new(b.clone()));
        sink.line(OutputStream::Stdout, "hello");
        assert_eq!(a.tail_after(0, 10).0, vec!["[stdout] hello"]);
        assert_eq!(b.tail_after(0, 10).0, vec!["[stdout] hello"]);
    }

    #[tokio::test]
    async fn console_log_keeps_bounded_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let mut log = ConsoleLog::open(path.clone(), 30, 2).await.unwrap();
        for word in ["first", "second", "third", "fourth"] {
            log.record(OutputStream::Stdout, word).await.unwrap();
        }
        log.record(OutputStream::Stderr, "tail\r\n").await.unwrap();
        log.file.flush().await.unwrap();

        let read = |p: PathBuf| std::fs::read_to_string(p).unwrap();
        assert_eq!(read(path.clone()), "[stdout] fourth\n[stderr] tail\n");
        assert_eq!(read(generation(&path, 1)), "[stdout] third\n");
        assert_eq!(read(generation(&path, 2)), "[stdout] second\n");
        assert!(!generation(&path, 3).exists());
    }

    #[tokio::test]
    async fn console_log_continues_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/console.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[stdout] earlier run\n").unwrap();

        let mut log = ConsoleLog::open(path.clone(), 30, 1).await.unwrap();
        log.record(OutputStream::Stdout, "next").await.unwrap();
        log.file.flush().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[stdout] next\n");
        assert_eq!(
            std::fs::read_to_string(generation(&path, 1)).unwrap(),
            "[stdout] earlier run\n"
        );
    }

    #[tokio::test]
    async fn file_sink_writes_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let sink = FileSink::open_with_limits(path.clone(), 0, 1).await.unwrap();
        sink.line(OutputStream::Stdout, "Started server on port: 7777");
        sink.line(OutputStream::Stderr, "warning");
        drop(sink);

        let expected = "[stdout] Started server on port: 7777\n[stderr] warning\n";
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let got = std::fs::read_to_string(&path).unwrap_or_default();
            if got == expected {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "console log holds {got:?}");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}
