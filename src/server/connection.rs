//! Per-connection read loop.
//!
//! HTTP/1.1 connections are persistent by default: we loop, reading one
//! request per iteration, until the peer closes the connection, a response
//! is marked `Connection: close`, or the connection sits idle for longer than
//! the request timeout or while the server is draining.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};

use super::{Shared, pipeline};
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::http::request::RequestError;
use crate::http::writer::SharedSink;
use crate::http::{RawBody, Request, Response, ResponseWriter, StatusCode};

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Largest request head (request line plus headers) we buffer.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Why a request could not be read off the wire.
#[derive(Debug)]
enum ReadError {
    /// The peer closed the connection before a full request arrived.
    Closed,
    /// The request is unacceptable; answer with this status and close.
    Reject {
        status: StatusCode,
        message: String,
    },
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl ReadError {
    fn reject(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Reject {
            status,
            message: message.into(),
        }
    }
}

pub(crate) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    // A connection may sit idle between requests for one request window.
    let idle_timeout = shared.config.request_timeout;

    loop {
        if buf.is_empty() {
            tokio::select! {
                read = timeout(idle_timeout, reader.read_buf(&mut buf)) => match read {
                    Ok(read) => {
                        if read? == 0 {
                            debug!(peer = %peer, "connection closed by peer");
                            break;
                        }
                    }
                    Err(_) => {
                        debug!(peer = %peer, "closing idle connection");
                        break;
                    }
                },
                _ = shutdown.wait_for(|stopping| *stopping) => {
                    debug!(peer = %peer, "closing idle connection for shutdown");
                    break;
                }
            }
        }

        // The request window opens with the first byte of its head.
        let deadline = Instant::now() + shared.config.request_timeout;
        let res = ResponseWriter::new(Arc::clone(&sink));

        let request = match timeout_at(deadline, read_request(&mut reader, &mut buf, &shared.config)).await {
            Ok(Ok(request)) => request,
            Ok(Err(ReadError::Closed)) => {
                debug!(peer = %peer, "connection closed mid-request");
                break;
            }
            Ok(Err(ReadError::Io(e))) => return Err(e),
            Ok(Err(ReadError::Reject { status, message })) => {
                warn!(peer = %peer, status = status.as_u16(), %message, "rejecting request");
                let response = Response::new(status)
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body(message);
                res.set_keep_alive(false);
                res.send(response).await?;
                break;
            }
            Err(_) => {
                warn!(peer = %peer, "request timed out while reading");
                res.set_keep_alive(false);
                res.fail(&AppError::Timeout).await?;
                break;
            }
        };

        // An unread body leaves the stream unusable for another request.
        if !request.is_keep_alive() || request.body_too_large() {
            res.set_keep_alive(false);
        }

        debug!(
            peer = %peer,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );
        pipeline::handle(&shared, request, res.clone(), deadline).await;

        if !res.keep_alive() {
            debug!(peer = %peer, "Connection: close, shutting down");
            break;
        }
    }

    let mut sink = sink.lock().await;
    let _ = sink.shutdown().await;
    Ok(())
}

/// Reads one request head and, within the body limit, its body.
async fn read_request<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    config: &ServerConfig,
) -> Result<Request, ReadError>
where
    R: AsyncRead + Unpin,
{
    let (mut request, body_offset) = loop {
        match Request::parse(&buf[..]) {
            Ok(parsed) => break parsed,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(ReadError::reject(
                        StatusCode::RequestHeaderFieldsTooLarge,
                        "Request header fields too large",
                    ));
                }
                if reader.read_buf(buf).await? == 0 {
                    return Err(ReadError::Closed);
                }
            }
            Err(e) => {
                return Err(ReadError::reject(
                    StatusCode::BadRequest,
                    format!("Bad Request: {e}"),
                ));
            }
        }
    };

    if body_offset > MAX_HEAD_SIZE {
        return Err(ReadError::reject(
            StatusCode::RequestHeaderFieldsTooLarge,
            "Request header fields too large",
        ));
    }
    if request.is_chunked() {
        return Err(ReadError::reject(
            StatusCode::NotImplemented,
            "Chunked request bodies are not supported",
        ));
    }

    let _ = buf.split_to(body_offset);
    let length = request.content_length().unwrap_or(0);

    if length > config.max_body_bytes {
        buf.clear();
        request.set_raw_body(RawBody::TooLarge {
            declared: length,
            limit: config.max_body_bytes,
        });
        return Ok(request);
    }

    if buf.len() < length {
        buf.reserve(length - buf.len());
    }
    while buf.len() < length {
        if reader.read_buf(buf).await? == 0 {
            return Err(ReadError::Closed);
        }
    }

    if length > 0 {
        request.set_raw_body(RawBody::Buffered(buf.split_to(length).freeze()));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_body_bytes: usize) -> ServerConfig {
        ServerConfig {
            max_body_bytes,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn reads_head_and_body_leaving_pipelined_bytes() {
        let mut wire: &[u8] =
            b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\n\r\n";
        let mut buf = BytesMut::new();

        let request = read_request(&mut wire, &mut buf, &limits(1024)).await.unwrap();
        assert_eq!(request.path(), "/a");
        assert_eq!(&request.raw_body().unwrap()[..], b"hello");

        let next = read_request(&mut wire, &mut buf, &limits(1024)).await.unwrap();
        assert_eq!(next.path(), "/b");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_flagged_not_read() {
        let mut wire: &[u8] = b"POST /a HTTP/1.1\r\nContent-Length: 100\r\n\r\nshort";
        let mut buf = BytesMut::new();

        let request = read_request(&mut wire, &mut buf, &limits(10)).await.unwrap();
        let err = request.raw_body().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PayloadTooLarge);
    }

    #[tokio::test]
    async fn body_at_limit_is_read_one_past_is_flagged() {
        let mut wire: &[u8] = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut buf = BytesMut::new();
        let request = read_request(&mut wire, &mut buf, &limits(5)).await.unwrap();
        assert_eq!(&request.raw_body().unwrap()[..], b"hello");

        let mut wire: &[u8] = b"POST /a HTTP/1.1\r\nContent-Length: 6\r\n\r\nhello!";
        let mut buf = BytesMut::new();
        let request = read_request(&mut wire, &mut buf, &limits(5)).await.unwrap();
        assert!(request.body_too_large());
    }

    #[tokio::test]
    async fn malformed_head_is_rejected() {
        let mut wire: &[u8] = b"NOT A REQUEST\r\n\r\n";
        let mut buf = BytesMut::new();
        let err = read_request(&mut wire, &mut buf, &limits(10)).await.unwrap_err();
        assert!(matches!(err, ReadError::Reject { status: StatusCode::BadRequest, .. }));
    }

    #[tokio::test]
    async fn chunked_bodies_are_refused() {
        let mut wire: &[u8] = b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut buf = BytesMut::new();
        let err = read_request(&mut wire, &mut buf, &limits(10)).await.unwrap_err();
        assert!(matches!(err, ReadError::Reject { status: StatusCode::NotImplemented, .. }));
    }

    #[tokio::test]
    async fn truncated_body_reports_closed() {
        let mut wire: &[u8] = b"POST /a HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        let mut buf = BytesMut::new();
        let err = read_request(&mut wire, &mut buf, &limits(100)).await.unwrap_err();
        assert!(matches!(err, ReadError::Closed));
    }

    #[tokio::test]
    async fn huge_head_is_431() {
        let mut head = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        head.extend(std::iter::repeat_n(b'a', MAX_HEAD_SIZE + 10));
        let mut wire: &[u8] = &head;
        let mut buf = BytesMut::new();
        let err = read_request(&mut wire, &mut buf, &limits(10)).await.unwrap_err();
        assert!(matches!(
            err,
            ReadError::Reject { status: StatusCode::RequestHeaderFieldsTooLarge, .. }
        ));
    }
}
