//! HTTP/1.1 request parsing using the [`httparse`] crate.
//!
//! A [`Request`] starts life as a parsed head; the connection loop then
//! attaches the buffered body, and pipeline stages augment it in place with
//! the decoded body, uploaded files, and route parameters.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use super::{Headers, Method};
use crate::error::AppError;
use crate::multipart::UploadedFile;

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,
}

/// The undecoded request body as it came off the wire.
#[derive(Debug, Clone, Default)]
pub enum RawBody {
    #[default]
    Empty,
    Buffered(Bytes),
    /// The declared length exceeded the configured limit, so the body was
    /// never read.
    TooLarge { declared: usize, limit: usize },
}

/// A parsed HTTP/1.1 request, augmented by the pipeline as it advances.
///
/// # Examples
///
/// ```
/// use handwire::http::Request;
///
/// let raw = b"GET /search?q=hello+world&page=2 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/search");
/// assert_eq!(request.query_param("q"), Some("hello world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query_string: Option<String>,
    query: HashMap<String, String>,
    raw_body: RawBody,
    body: Value,
    params: HashMap<String, String>,
    files: HashMap<String, UploadedFile>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 request head from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator). The
    /// body itself is attached later with [`set_raw_body`](Self::set_raw_body).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req.method {
            Some(m) => m.parse().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query_string) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        if header_map.contains("content-length") && content_length_of(&header_map).is_none() {
            return Err(RequestError::InvalidContentLength);
        }

        let query = query_string
            .as_deref()
            .map(parse_query_string)
            .unwrap_or_default();

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query_string,
                query,
                raw_body: RawBody::Empty,
                body: Value::Null,
                params: HashMap::new(),
                files: HashMap::new(),
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string), still percent-encoded.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Returns the decoded query map. The last occurrence of a key wins.
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// Returns a decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Returns the route parameters bound by the router.
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Returns a single route parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Returns the decoded body: an object, array, or string.
    ///
    /// `Value::Null` until a pipeline stage decodes it.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Returns the files decoded from a multipart body, keyed by field name.
    pub fn files(&self) -> &HashMap<String, UploadedFile> {
        &self.files
    }

    /// Returns the undecoded body bytes.
    ///
    /// # Errors
    ///
    /// [`AppError::PayloadTooLarge`] when the declared length exceeded the
    /// configured limit and the body was never buffered.
    pub fn raw_body(&self) -> Result<Bytes, AppError> {
        match &self.raw_body {
            RawBody::Empty => Ok(Bytes::new()),
            RawBody::Buffered(bytes) => Ok(bytes.clone()),
            RawBody::TooLarge { declared, limit } => Err(AppError::PayloadTooLarge {
                declared: *declared,
                limit: *limit,
            }),
        }
    }

    /// Returns `true` if the declared body exceeded the limit and was not read.
    pub fn body_too_large(&self) -> bool {
        matches!(self.raw_body, RawBody::TooLarge { .. })
    }

    pub fn set_raw_body(&mut self, raw_body: RawBody) {
        self.raw_body = raw_body;
    }

    pub fn set_body(&mut self, body: Value) {
        self.body = body;
    }

    pub fn set_files(&mut self, files: HashMap<String, UploadedFile>) {
        self.files = files;
    }

    pub fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    /// Deserializes the decoded body into `T`.
    pub fn json<T>(&self) -> Result<T, AppError>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.body.clone())
            .map_err(|e| AppError::bad_request(format!("Invalid request body: {e}")))
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        content_length_of(&self.headers)
    }

    /// Returns `true` if the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Returns `true` if the declared content type is `multipart/form-data`.
    pub fn is_multipart(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("multipart/form-data"))
    }
}

fn content_length_of(headers: &Headers) -> Option<usize> {
    headers.get("content-length")?.trim().parse().ok()
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`,
/// decoding `+` and percent escapes.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}
