//! stdio transport.
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - By default messages are delimited by newlines and must not contain
//!   embedded newlines
//! - A frame starting with a `Content-Length:` header is read as a
//!   length-delimited message; once a client has used that framing, replies
//!   are framed the same way
//! - stdin receives messages from the client, stdout carries replies
//! - stderr is left for logging
//!
//! The adapter serves exactly one session. Reading and writing run on
//! separate tasks so a slow handler never blocks the reader.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::mcp::manager::{SessionHandle, SessionManager};
use crate::mcp::protocol::OutgoingMessage;
use crate::mcp::session::DrainReport;
use crate::mcp::transport::{Outbound, TransportKind};

/// Upper bound on a `Content-Length` frame.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Framing negotiated with the client, shared by both halves.
#[derive(Debug, Default)]
struct Framing {
    content_length: AtomicBool,
}

/// A stdio-style MCP transport over any reader/writer pair.
#[derive(Debug)]
pub struct StdioTransport<R, W> {
    reader: StdioReader<R>,
    writer: StdioWriter<W>,
}

impl StdioTransport<tokio::io::Stdin, tokio::io::Stdout> {
    /// Creates a transport over the process's stdin and stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_streams(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport<tokio::io::Stdin, tokio::io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a transport over arbitrary streams.
    #[must_use]
    pub fn with_streams(reader: R, writer: W) -> Self {
        let framing = Arc::new(Framing::default());
        Self {
            reader: StdioReader {
                inner: BufReader::new(reader),
                framing: Arc::clone(&framing),
            },
            writer: StdioWriter { inner: writer, framing },
        }
    }

    /// Splits the transport so reading and writing can run concurrently.
    #[must_use]
    pub fn split(self) -> (StdioReader<R>, StdioWriter<W>) {
        (self.reader, self.writer)
    }

    /// Reads the next frame. See [`StdioReader::read_message`].
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_message(&mut self) -> io::Result<Option<Frame>> {
        self.reader.read_message().await
    }

    /// Writes one message. See [`StdioWriter::write_message`].
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_message(&mut self, message: &OutgoingMessage) -> io::Result<()> {
        self.writer.write_message(message).await
    }
}

/// One frame read from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete message, not yet parsed as JSON-RPC.
    Message(String),
    /// A frame that could not be decoded. The reason is for logging only.
    Malformed(String),
}

/// Read half of a [`StdioTransport`].
#[derive(Debug)]
pub struct StdioReader<R> {
    inner: BufReader<R>,
    framing: Arc<Framing>,
}

impl<R: AsyncRead + Unpin> StdioReader<R> {
    /// Reads the next frame.
    ///
    /// Blank lines are skipped. Returns `None` on EOF. Frames that are not
    /// UTF-8, carry an unusable `Content-Length` or exceed [`MAX_FRAME_LEN`]
    /// are consumed whole and returned as [`Frame::Malformed`], so the
    /// stream stays in sync.
    ///
    /// # Errors
    ///
    /// Returns an error only if reading from the underlying stream fails.
    pub async fn read_message(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let Some(bytes) = self.read_line().await? else {
                return Ok(None);
            };
            let line = match String::from_utf8(bytes) {
                Ok(line) => line,
                Err(e) => return Ok(Some(Frame::Malformed(format!("frame is not UTF-8: {e}")))),
            };
            if line.trim().is_empty() {
                continue;
            }

            let Some(value) = content_length(&line) else {
                return Ok(Some(Frame::Message(line)));
            };
            let length = value.parse::<usize>();

            // Skip any further headers up to the blank separator line.
            loop {
                match self.read_line().await? {
                    None => return Ok(None),
                    Some(header) if header.is_empty() => break,
                    Some(_) => {}
                }
            }
            self.framing.content_length.store(true, Ordering::Release);

            let length = match length {
                Ok(length) => length,
                Err(e) => {
                    return Ok(Some(Frame::Malformed(format!(
                        "invalid Content-Length '{value}': {e}"
                    ))));
                }
            };
            if length > MAX_FRAME_LEN {
                if !self.skip(length).await? {
                    return Ok(None);
                }
                return Ok(Some(Frame::Malformed(format!(
                    "frame of {length} bytes exceeds the {MAX_FRAME_LEN} byte limit"
                ))));
            }

            let mut body = vec![0; length];
            match self.inner.read_exact(&mut body).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }
            return Ok(Some(match String::from_utf8(body) {
                Ok(body) => Frame::Message(body),
                Err(e) => Frame::Malformed(format!("frame body is not UTF-8: {e}")),
            }));
        }
    }

    /// Reads one line without its terminator. Returns `None` on EOF.
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let bytes_read = self.inner.read_until(b'\n', &mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }

    /// Discards `length` bytes of body. Returns false if EOF came first.
    async fn skip(&mut self, length: usize) -> io::Result<bool> {
        let length = length as u64;
        let mut body = (&mut self.inner).take(length);
        let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        Ok(skipped == length)
    }
}

/// Write half of a [`StdioTransport`].
#[derive(Debug)]
pub struct StdioWriter<W> {
    inner: W,
    framing: Arc<Framing>,
}

impl<W: AsyncWrite + Unpin> StdioWriter<W> {
    /// Writes one message using the client's framing, then flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_message(&mut self, message: &OutgoingMessage) -> io::Result<()> {
        let json = message
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write_raw(&json).await
    }

    async fn write_raw(&mut self, json: &str) -> io::Result<()> {
        if self.framing.content_length.load(Ordering::Acquire) {
            let header = format!("Content-Length: {}\r\n\r\n", json.len());
            self.inner.write_all(header.as_bytes()).await?;
            self.inner.write_all(json.as_bytes()).await?;
        } else {
            debug_assert!(
                !json.contains('\n'),
                "JSON message must not contain embedded newlines"
            );
            self.inner.write_all(json.as_bytes()).await?;
            self.inner.write_all(b"\n").await?;
        }
        self.inner.flush().await
    }
}

fn content_length(line: &str) -> Option<&str> {
    let (name, value) = line.split_once(':')?;
    name.trim()
        .eq_ignore_ascii_case("content-length")
        .then(|| value.trim())
}

/// Serves one session over `transport` until EOF or `shutdown`.
///
/// Both end the same way: the session drains and closes, queued replies are
/// written, and the drain report is returned. Read and write failures are
/// logged and also end the session; they are never fatal to the process.
pub async fn serve_stdio<R, W, F>(
    manager: &SessionManager,
    transport: StdioTransport<R, W>,
    shutdown: F,
) -> DrainReport
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (session, rx) = manager.create(TransportKind::Stdio);
    let outbound = Outbound::new(rx, &session);
    let handle = SessionHandle::new(&session);
    drop(session);
    tracing::info!(session_id = handle.id(), "stdio session started");

    let (mut reader, writer) = transport.split();
    let mut writer_task = tokio::spawn(write_loop(writer, outbound));
    let mut writer_result = None;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!(session_id = handle.id(), "Shutdown requested, draining stdio session");
                break;
            }

            joined = &mut writer_task => {
                writer_result = Some(joined);
                break;
            }

            frame = reader.read_message() => match frame {
                Ok(Some(frame)) => {
                    let Some(session) = handle.upgrade() else {
                        break;
                    };
                    match frame {
                        Frame::Message(raw) => session.handle_raw(&raw).await,
                        Frame::Malformed(reason) => session.reject_frame(&reason).await,
                    }
                }
                Ok(None) => {
                    tracing::info!(session_id = handle.id(), "stdin closed, draining session");
                    break;
                }
                Err(e) => {
                    tracing::warn!(session_id = handle.id(), error = %e, "Failed to read from stdin, draining session");
                    break;
                }
            }
        }
    }

    let report = manager.close(handle.id()).await.unwrap_or_default();

    let joined = match writer_result {
        Some(joined) => joined,
        None => writer_task.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(session_id = handle.id(), error = %e, "Failed to write to stdout"),
        Err(e) => tracing::error!(session_id = handle.id(), error = %e, "stdout writer task failed"),
    }

    tracing::info!(
        session_id = handle.id(),
        completed = report.completed,
        abandoned = report.abandoned,
        "stdio session finished"
    );
    report
}

async fn write_loop<W>(mut writer: StdioWriter<W>, mut outbound: Outbound) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.next().await {
        writer.write_message(&envelope.message).await?;
    }
    Ok(())
}
