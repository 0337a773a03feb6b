//! Write-once response handle shared by every pipeline stage.
//!
//! A [`ResponseWriter`] wraps the connection's write half. Any number of
//! clones may race to respond (the timeout timer, a handler, the error
//! boundary); the first terminal write claims the response and every later
//! attempt is a logged no-op.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::{Headers, Response, StatusCode};
use crate::error::AppError;

/// The write half of a connection, boxed so tests can substitute an in-memory pipe.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// A connection sink shared by every request served on that connection.
pub type SharedSink = Arc<tokio::sync::Mutex<Sink>>;

/// The uniform JSON wrapper for API responses.
///
/// ```
/// use handwire::http::Envelope;
///
/// let env = Envelope::<serde_json::Value>::failure("Route not found", None);
/// let json = serde_json::to_string(&env).unwrap();
/// assert_eq!(json, r#"{"success":false,"message":"Route not found"}"#);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T = Value> {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error,
        }
    }
}

#[derive(Debug)]
struct Staged {
    status: StatusCode,
    headers: Headers,
}

struct State {
    sink: SharedSink,
    sent: AtomicBool,
    keep_alive: AtomicBool,
    staged: Mutex<Staged>,
    committed: OnceLock<StatusCode>,
}

/// Write-once handle to one request's response.
///
/// Cloning is cheap; all clones share the same "sent" flag.
#[derive(Clone)]
pub struct ResponseWriter {
    state: Arc<State>,
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("sent", &self.is_sent())
            .field("committed", &self.committed_status())
            .finish()
    }
}

impl ResponseWriter {
    /// Creates a writer for one request over a connection's shared sink.
    pub fn new(sink: SharedSink) -> Self {
        Self {
            state: Arc::new(State {
                sink,
                sent: AtomicBool::new(false),
                keep_alive: AtomicBool::new(true),
                staged: Mutex::new(Staged {
                    status: StatusCode::Ok,
                    headers: Headers::new(),
                }),
                committed: OnceLock::new(),
            }),
        }
    }

    /// Creates a writer that owns `writer` outright.
    pub fn from_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(Arc::new(tokio::sync::Mutex::new(Box::new(writer))))
    }

    /// Returns `true` once a terminal write has been claimed.
    pub fn is_sent(&self) -> bool {
        self.state.sent.load(Ordering::Acquire)
    }

    /// Returns the status of the response that won the write, if any.
    pub fn committed_status(&self) -> Option<StatusCode> {
        self.state.committed.get().copied()
    }

    pub fn keep_alive(&self) -> bool {
        self.state.keep_alive.load(Ordering::Acquire)
    }

    /// Controls the `Connection` header of the eventual response. Ignored after sending.
    pub fn set_keep_alive(&self, keep_alive: bool) {
        if !self.is_sent() {
            self.state.keep_alive.store(keep_alive, Ordering::Release);
        }
    }

    /// Stages the status used by [`json`](Self::json) and [`text`](Self::text).
    /// Ignored after sending.
    pub fn status(&self, status: StatusCode) -> &Self {
        if !self.is_sent() {
            self.staged().status = status;
        }
        self
    }

    /// Stages a header for the eventual response. Ignored after sending.
    ///
    /// Headers set on the [`Response`] passed to [`send`](Self::send) win
    /// over staged ones with the same name.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        if !self.is_sent() {
            self.staged().headers.set(name, value);
        }
        self
    }

    /// Returns a staged header value.
    pub fn staged_header(&self, name: &str) -> Option<String> {
        self.staged().headers.get(name).map(str::to_owned)
    }

    /// Performs the terminal write of `response`.
    ///
    /// Returns `Ok(())` without writing if another path already responded.
    pub async fn send(&self, mut response: Response) -> io::Result<()> {
        if !self.claim(response.status()) {
            return Ok(());
        }
        self.finalize_headers(&mut response);

        let bytes = response.into_bytes();
        let mut sink = self.state.sink.lock().await;
        sink.write_all(&bytes).await?;
        sink.flush().await
    }

    /// Performs the terminal write of `head` followed by `length` bytes
    /// streamed from `reader`.
    pub async fn stream<R>(&self, mut head: Response, length: u64, reader: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        if !self.claim(head.status()) {
            return Ok(());
        }
        self.finalize_headers(&mut head);

        let mut sink = self.state.sink.lock().await;
        sink.write_all(&head.head_bytes(length)).await?;
        let copied = tokio::io::copy(&mut reader.take(length), &mut *sink).await?;
        if copied != length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("streamed {copied} of {length} bytes"),
            ));
        }
        sink.flush().await
    }

    /// Serializes `value` as JSON with the staged status.
    pub async fn json<T: Serialize + ?Sized>(&self, value: &T) -> io::Result<()> {
        let body = serde_json::to_vec(value).map_err(io::Error::other)?;
        let response = Response::new(self.staged_status())
            .header("Content-Type", "application/json")
            .body_bytes(body);
        self.send(response).await
    }

    /// Sends a plain-text body with the staged status.
    pub async fn text(&self, body: impl Into<String>) -> io::Result<()> {
        let response = Response::new(self.staged_status())
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);
        self.send(response).await
    }

    /// Sends a success envelope.
    pub async fn success<T: Serialize>(
        &self,
        data: T,
        message: &str,
        status: StatusCode,
    ) -> io::Result<()> {
        self.status(status).json(&Envelope::ok(data, message)).await
    }

    /// Sends a `201 Created` success envelope.
    pub async fn created<T: Serialize>(&self, data: T, message: &str) -> io::Result<()> {
        self.success(data, message, StatusCode::Created).await
    }

    /// Sends an error envelope (`success: false`).
    pub async fn error(&self, message: &str, status: StatusCode) -> io::Result<()> {
        self.status(status)
            .json(&Envelope::<Value>::failure(message, None))
            .await
    }

    /// Sends an error envelope carrying an `error` detail string.
    pub async fn error_with_detail(
        &self,
        message: &str,
        status: StatusCode,
        detail: impl Into<String>,
    ) -> io::Result<()> {
        self.status(status)
            .json(&Envelope::<Value>::failure(message, Some(detail.into())))
            .await
    }

    /// Sends the error envelope for `err`, with server faults redacted.
    pub async fn fail(&self, err: &AppError) -> io::Result<()> {
        self.error(&err.public_message(), err.status_code()).await
    }

    pub async fn no_content(&self) -> io::Result<()> {
        self.send(Response::new(StatusCode::NoContent)).await
    }

    // Claims the single terminal write. Returns `false` if it was already taken.
    fn claim(&self, status: StatusCode) -> bool {
        if self.state.sent.swap(true, Ordering::AcqRel) {
            warn!(
                attempted = status.as_u16(),
                committed = ?self.committed_status().map(StatusCode::as_u16),
                "response already sent, dropping write"
            );
            return false;
        }
        let _ = self.state.committed.set(status);
        true
    }

    fn finalize_headers(&self, response: &mut Response) {
        let staged = self.staged();
        response.headers_mut().merge_missing(&staged.headers);
        response.set_keep_alive(self.keep_alive());
    }

    fn staged_status(&self) -> StatusCode {
        self.staged().status
    }

    fn staged(&self) -> std::sync::MutexGuard<'_, Staged> {
        self.state
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
