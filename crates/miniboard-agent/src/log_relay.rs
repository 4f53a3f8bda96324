//! Relays the server's output to whoever drains the supervisor's log queue.
//!
//! Reader tasks own the child's pipes; the supervisor only ever sees chunks
//! arriving on an unbounded channel, so a quiet or stuck server never stalls it.

use std::{path::PathBuf, time::Duration};

use miniboard_process::LogChunk;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};

#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogChunk>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub fn new(tx: mpsc::UnboundedSender<LogChunk>) -> Self {
        Self { tx, file_tx: None }
    }

    /// Mirror everything into a size-rotated file. Must run inside a tokio runtime.
    pub fn with_console_log(mut self, path: PathBuf, max_bytes: u64, max_files: usize) -> Self {
        let (file_tx, mut file_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut writer = match FileLogWriter::open(path.clone(), max_bytes, max_files).await {
                Ok(w) => w,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "console log unavailable");
                    return;
                }
            };
            while let Some(text) = file_rx.recv().await {
                if let Err(err) = writer.write(&text).await {
                    tracing::warn!(%err, "console log write failed");
                }
            }
            let _ = writer.file.flush().await;
        });
        self.file_tx = Some(file_tx);
        self
    }

    pub fn emit(&self, chunk: LogChunk) {
        if let Some(file_tx) = &self.file_tx {
            let text = match &chunk {
                LogChunk::Stdout(s) | LogChunk::Stderr(s) => s.clone(),
                other => format!("{}\n", other.render()),
            };
            let _ = file_tx.send(text);
        }
        // The receiver lives as long as the supervisor; nothing to do if it is gone.
        let _ = self.tx.send(chunk);
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.emit(LogChunk::Notice(text.into()));
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn wrap(self, text: String) -> LogChunk {
        match self {
            Stream::Stdout => LogChunk::Stdout(text),
            Stream::Stderr => LogChunk::Stderr(text),
        }
    }
}

/// Splits `pending` into the longest valid UTF-8 prefix and keeps an
/// incomplete trailing sequence for the next read.
fn take_text(pending: &mut Vec<u8>, at_eof: bool) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() && !at_eof => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(valid);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

async fn pump<R>(mut reader: R, stream: Stream, sink: LogSink, chunk_bytes: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_text(&mut pending, false);
                if !text.is_empty() {
                    sink.emit(stream.wrap(text));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(?stream, %err, "server output read failed");
                break;
            }
        }
    }
    if !pending.is_empty() {
        sink.emit(stream.wrap(take_text(&mut pending, true)));
    }
}

pub struct LogRelay {
    sink: LogSink,
    readers: Vec<JoinHandle<()>>,
}

impl LogRelay {
    pub fn attach<O, E>(
        sink: LogSink,
        stdout: Option<O>,
        stderr: Option<E>,
        chunk_bytes: usize,
    ) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let mut readers = Vec::new();
        if let Some(out) = stdout {
            readers.push(tokio::spawn(pump(out, Stream::Stdout, sink.clone(), chunk_bytes)));
        }
        if let Some(err) = stderr {
            readers.push(tokio::spawn(pump(err, Stream::Stderr, sink.clone(), chunk_bytes)));
        }
        Self { sink, readers }
    }

    /// Wait for the pipes to close, then emit the terminal chunk. Readers still
    /// blocked after `timeout` (a grandchild holding the pipe) are abandoned.
    pub async fn finish(self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        for mut reader in self.readers {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                tracing::warn!("server output still open after exit, dropping remaining output");
                reader.abort();
            }
        }
        self.sink.emit(LogChunk::EndOfStream);
    }
}

struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    fn rotated(&self, n: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.path.display(), n))
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        // .(n-1) -> .n, oldest falls off.
        for i in (1..self.max_files).rev() {
            let from = self.rotated(i);
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(&from, self.rotated(i + 1)).await;
            }
        }
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, self.rotated(1)).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write(&mut self, text: &str) -> std::io::Result<()> {
        let len = text.len() as u64;
        if self.max_bytes > 0 && self.bytes > 0 && self.bytes.saturating_add(len) > self.max_bytes
        {
            self.rotate().await.ok();
        }

        self.file.write_all(text.as_bytes()).await?;
        self.bytes = self.bytes.saturating_add(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<LogChunk>) -> Vec<LogChunk> {
        let mut out = Vec::new();
        while let Ok(c) = rx.try_recv() {
            out.push(c);
        }
        out
    }

    fn stdout_text(chunks: &[LogChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                LogChunk::Stdout(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn take_text_holds_back_split_sequences() {
        let bytes = "é".as_bytes();
        let mut pending = vec![b'a', bytes[0]];
        assert_eq!(take_text(&mut pending, false), "a");
        assert_eq!(pending, vec![bytes[0]]);
        pending.push(bytes[1]);
        assert_eq!(take_text(&mut pending, false), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn take_text_flushes_garbage_at_eof() {
        let mut pending = vec![0xC3];
        assert_eq!(take_text(&mut pending, true), "\u{FFFD}");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn relays_in_order_and_ends_with_marker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut child_out, relay_in) = tokio::io::duplex(64);

        let relay = LogRelay::attach(
            LogSink::new(tx),
            Some(relay_in),
            None::<tokio::io::DuplexStream>,
            8,
        );
        for part in ["Loading mod base\n", "Hosting game at port 34197\n", "é"] {
            child_out.write_all(part.as_bytes()).await.unwrap();
        }
        drop(child_out);

        relay.finish(Duration::from_secs(5)).await;
        let chunks = drain(&mut rx);
        assert_eq!(
            stdout_text(&chunks),
            "Loading mod base\nHosting game at port 34197\né"
        );
        assert_eq!(chunks.last(), Some(&LogChunk::EndOfStream));
        assert_eq!(chunks.iter().filter(|c| c.is_end()).count(), 1);
    }

    #[tokio::test]
    async fn stderr_is_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut child_err, relay_in) = tokio::io::duplex(64);
        let relay = LogRelay::attach(
            LogSink::new(tx),
            None::<tokio::io::DuplexStream>,
            Some(relay_in),
            1024,
        );
        child_err.write_all(b"Error: boom").await.unwrap();
        drop(child_err);
        relay.finish(Duration::from_secs(5)).await;

        let chunks = drain(&mut rx);
        assert_eq!(chunks[0], LogChunk::Stderr("Error: boom".to_string()));
        assert_eq!(chunks[1], LogChunk::EndOfStream);
    }

    #[tokio::test]
    async fn finish_gives_up_on_pipes_that_never_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_held_open, relay_in) = tokio::io::duplex(64);
        let relay = LogRelay::attach(
            LogSink::new(tx),
            Some(relay_in),
            None::<tokio::io::DuplexStream>,
            1024,
        );

        let started = tokio::time::Instant::now();
        relay.finish(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(drain(&mut rx), vec![LogChunk::EndOfStream]);
    }

    #[tokio::test]
    async fn notices_and_output_reach_console_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("console.log");
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = LogSink::new(tx).with_console_log(path.clone(), 1024 * 1024, 3);

        sink.notice("starting");
        sink.emit(LogChunk::Stdout("line one\n".to_string()));
        drop(sink);

        let mut text = String::new();
        for _ in 0..100 {
            text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if text.contains("line one") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(text, "[miniboard-agent] starting\nline one\n");
    }

    #[tokio::test]
    async fn file_writer_rotates_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let mut w = FileLogWriter::open(path.clone(), 10, 2).await.unwrap();
        w.write("aaaaaaaa\n").await.unwrap();
        w.write("bbbbbbbb\n").await.unwrap();
        w.write("cccccccc\n").await.unwrap();
        w.file.flush().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "cccccccc\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("console.log.1")).unwrap(),
            "bbbbbbbb\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("console.log.2")).unwrap(),
            "aaaaaaaa\n"
        );
    }
}
