//! Request routing: map HTTP methods and segment patterns to handler functions.
//!
//! This module provides [`Router`], which resolves a request's method and path
//! against an ordered route table and invokes the bound handler.
//!
//! | Pattern            | Example match        | Captured params              |
//! |--------------------|----------------------|------------------------------|
//! | `/api/health`      | `/api/health/`       | *(none)*                     |
//! | `/api/items/:id`   | `/api/items/42%20x`  | `id → "42 x"`                |
//! | `/a/:x/b/:y`       | `/a/1/b/2`           | `x → "1"`, `y → "2"`         |
//!
//! Patterns and paths are split on `/` with empty segments discarded, so leading,
//! trailing, and doubled slashes are insignificant. Segment counts must be equal;
//! there are no wildcards. Routes are matched in registration order and the first
//! route whose method and pattern both match wins.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use tracing::debug;

use crate::error::AppError;
use crate::http::{Method, Request, ResponseWriter, StatusCode};

/// The future returned by route handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send>>;

/// Type-erased, heap-allocated async handler.
///
/// A handler receives the parsed [`Request`] and a [`ResponseWriter`]. It
/// responds by writing through the writer; returning an error instead lets the
/// pipeline write the error envelope. In practice you never construct this type
/// directly; use [`Router::get`], [`Router::post`], and the other method-specific
/// helpers instead.
pub type Handler = Arc<dyn Fn(Request, ResponseWriter) -> HandlerFuture + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Request, ResponseWriter) -> impl Future<Output = Result<(), AppError>>`
/// that is `Send + Sync + 'static` implements this trait via the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler, boxing the returned future.
    fn call(&self, request: Request, response: ResponseWriter) -> HandlerFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Request, ResponseWriter) -> F + Send + Sync + 'static,
    F: Future<Output = Result<(), AppError>> + Send + 'static,
{
    fn call(&self, request: Request, response: ResponseWriter) -> HandlerFuture {
        Box::pin((self)(request, response))
    }
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        let segments = split_segments(pattern)
            .map(|s| match s.strip_prefix(':') {
                Some(name) => Segment::Parameter(name.to_owned()),
                None => Segment::Static(s.to_owned()),
            })
            .collect();

        Self {
            raw: pattern.to_owned(),
            segments,
        }
    }

    fn matches(&self, path: &str) -> bool {
        let mut path_segments = split_segments(path);
        let all_match = self.segments.iter().all(|seg| match path_segments.next() {
            Some(actual) => match seg {
                Segment::Static(s) => s == actual,
                Segment::Parameter(_) => true,
            },
            None => false,
        });
        all_match && path_segments.next().is_none()
    }

    // Binds each parameter segment to the percent-decoded path segment.
    fn extract(&self, path: &str) -> Result<HashMap<String, String>, AppError> {
        let mut params = HashMap::new();
        for (seg, actual) in self.segments.iter().zip(split_segments(path)) {
            if let Segment::Parameter(name) = seg {
                let decoded = percent_decode_str(actual).decode_utf8().map_err(|_| {
                    AppError::bad_request(format!("Malformed path parameter: {name}"))
                })?;
                params.insert(name.clone(), decoded.into_owned());
            }
        }
        Ok(params)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// A registered route: method, compiled pattern, and handler.
pub struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    fn new(method: Method, pattern: &str, handler: Handler) -> Self {
        Self {
            method,
            pattern: Pattern::parse(pattern),
            handler,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The pattern exactly as registered.
    pub fn pattern(&self) -> &str {
        &self.pattern.raw
    }

    /// Decodes this route's parameters from `path`.
    ///
    /// # Errors
    ///
    /// [`AppError::BadRequest`] when a parameter does not decode to UTF-8.
    pub fn params(&self, path: &str) -> Result<HashMap<String, String>, AppError> {
        self.pattern.extract(path)
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        &self.method == method && self.pattern.matches(path)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.raw)
            .finish()
    }
}

/// Ordered route table.
///
/// Routes are evaluated in registration order; the first route whose HTTP method and
/// pattern both match the request is used. The table is built before the server
/// starts and is read-only afterwards.
///
/// # Examples
///
/// ```rust
/// use handwire::error::AppError;
/// use handwire::http::{Method, Request, ResponseWriter, StatusCode};
/// use handwire::router::Router;
///
/// async fn show_item(req: Request, res: ResponseWriter) -> Result<(), AppError> {
///     let id = req.param("id").unwrap_or_default().to_owned();
///     res.success(id, "Item", StatusCode::Ok).await?;
///     Ok(())
/// }
///
/// let mut router = Router::new();
/// router.get("/api/items/:id", show_item);
///
/// let route = router.find(&Method::Get, "/api/items/42%20x").unwrap();
/// assert_eq!(route.params("/api/items/42%20x").unwrap()["id"], "42 x");
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a handler for `GET` requests matching `pattern`.
    pub fn get(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.register(Method::Get, pattern, handler);
    }

    /// Register a handler for `POST` requests matching `pattern`.
    pub fn post(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.register(Method::Post, pattern, handler);
    }

    /// Register a handler for `PUT` requests matching `pattern`.
    pub fn put(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.register(Method::Put, pattern, handler);
    }

    /// Register a handler for `DELETE` requests matching `pattern`.
    pub fn delete(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.register(Method::Delete, pattern, handler);
    }

    /// Register a handler for `PATCH` requests matching `pattern`.
    pub fn patch(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.register(Method::Patch, pattern, handler);
    }

    /// Appends a route. Registration order is match order.
    pub fn register(&mut self, method: Method, pattern: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |req, res| handler.call(req, res));
        self.routes.push(Route::new(method, pattern, handler));
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Iterates the route table in registration order.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Returns the first route matching `method` and `path`.
    pub fn find(&self, method: &Method, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(method, path))
    }

    /// Resolves `request` and runs the matched handler to completion.
    ///
    /// Binds route parameters onto the request before invoking the handler. When
    /// nothing matches, writes a `404` error envelope.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error, or a parameter decoding error.
    pub async fn dispatch(&self, mut request: Request, response: ResponseWriter) -> Result<(), AppError> {
        let Some(route) = self.find(request.method(), request.path()) else {
            debug!(method = %request.method(), path = %request.path(), "no route matched");
            response.error("Route not found", StatusCode::NotFound).await?;
            return Ok(());
        };

        let params = route.params(request.path())?;
        request.set_params(params);
        (route.handler)(request, response).await
    }
}
