//! Middleware pipeline: ordered interceptors that run before routing.
//!
//! Each middleware receives the request, the shared [`ResponseWriter`], and a
//! [`Next`] continuation. It may:
//!
//! - **Pass through**: `next.run(req, res).await`, optionally after mutating `req`.
//! - **Short-circuit**: write a response and return [`Outcome::Halt`].
//! - **Fail**: return an [`AppError`]; the chain stops and an error envelope
//!   is written unless something already responded.
//!
//! When the last middleware calls `next`, the chain yields
//! [`Outcome::Continue`] with the (possibly augmented) request, and the
//! orchestrator proceeds to body decoding and routing.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: single-use cursor into the remaining chain.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`Chain`]: the frozen, ordered list the server runs per request.
//! - [`ErrorBoundary`] and [`UploadMiddleware`]: installed by default, in that order.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::http::{Request, ResponseWriter};

mod upload;

pub use upload::UploadMiddleware;

/// What the chain decided for this request.
#[derive(Debug)]
pub enum Outcome {
    /// Every middleware passed the request on; routing should proceed.
    Continue(Request),
    /// A middleware responded (or failed); the pipeline stops here.
    Halt,
}

/// The future returned by middleware.
pub type MiddlewareFuture = Pin<Box<dyn Future<Output = Result<Outcome, AppError>> + Send>>;

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the chain is stored as a `MiddlewareHandler`. The [`Arc`]
/// wrapper makes handlers cheap to clone so that [`Next`] can advance through
/// the chain without copying closures.
pub type MiddlewareHandler =
    Arc<dyn Fn(Request, ResponseWriter, Next) -> MiddlewareFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// ```rust
/// use std::sync::Arc;
/// use handwire::middleware::{ErrorBoundary, from_middleware};
///
/// let handler = from_middleware(Arc::new(ErrorBoundary));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |req, res, next| middleware.handle(req, res, next))
}

/// Wraps an async closure as a [`MiddlewareHandler`].
///
/// ```rust
/// use handwire::error::AppError;
/// use handwire::http::{Request, ResponseWriter};
/// use handwire::middleware::{Next, from_fn};
///
/// let tag = from_fn(|mut req: Request, res: ResponseWriter, next: Next| async move {
///     req.set_body(serde_json::json!({"tagged": true}));
///     next.run(req, res).await
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> MiddlewareHandler
where
    F: Fn(Request, ResponseWriter, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, AppError>> + Send + 'static,
{
    Arc::new(move |req, res, next| Box::pin(f(req, res, next)))
}

/// The core trait for all middleware.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `next` is consumed by [`Next::run`], so the continuation can be invoked at
///   most once.
/// - A middleware that writes a response must return [`Outcome::Halt`].
pub trait Middleware: Send + Sync {
    fn handle(&self, req: Request, res: ResponseWriter, next: Next) -> MiddlewareFuture;
}

/// A cursor into the remaining middleware chain for a single request.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    index: usize,
}

impl Next {
    /// Creates a cursor positioned at the start of `middlewares`.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Zero-based position of the middleware this cursor will invoke next.
    pub fn position(&self) -> usize {
        self.index
    }

    /// Invokes the next middleware, or completes the chain when none remain.
    ///
    /// Once a response has been sent nothing further is invoked. A failing
    /// middleware is logged with its position, answered with an error envelope
    /// (if nothing was sent yet), and reported upward as [`Outcome::Halt`].
    pub async fn run(mut self, req: Request, res: ResponseWriter) -> Result<Outcome, AppError> {
        if res.is_sent() {
            return Ok(Outcome::Halt);
        }

        let Some(handler) = self.middlewares.get(self.index).cloned() else {
            return Ok(Outcome::Continue(req));
        };
        let position = self.position();
        self.index += 1;

        let method = req.method().clone();
        let path = req.path().to_owned();

        match handler(req, res.clone(), self).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if err.is_server_fault() {
                    error!(%method, %path, position, error = %err, "middleware failed");
                } else {
                    warn!(%method, %path, position, error = %err, "middleware rejected request");
                }
                if let Err(io) = res.fail(&err).await {
                    debug!(%method, %path, error = %io, "could not write middleware error");
                }
                Ok(Outcome::Halt)
            }
        }
    }
}

/// The ordered middleware list, frozen once the server starts.
#[derive(Clone)]
pub struct Chain {
    middlewares: Arc<[MiddlewareHandler]>,
}

impl Chain {
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares: middlewares.into(),
        }
    }

    /// The default chain: [`ErrorBoundary`] then [`UploadMiddleware`].
    pub fn defaults() -> Vec<MiddlewareHandler> {
        vec![
            from_middleware(Arc::new(ErrorBoundary)),
            from_middleware(Arc::new(UploadMiddleware)),
        ]
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs the chain for one request.
    pub async fn run(&self, req: Request, res: ResponseWriter) -> Result<Outcome, AppError> {
        Next::new(Arc::clone(&self.middlewares)).run(req, res).await
    }
}

/// Normalizes panics raised further down the chain into an [`AppError`].
///
/// Errors returned by later middleware are already answered by [`Next::run`];
/// this boundary covers code that panics instead of returning an error.
pub struct ErrorBoundary;

impl Middleware for ErrorBoundary {
    fn handle(&self, req: Request, res: ResponseWriter, next: Next) -> MiddlewareFuture {
        Box::pin(async move {
            match AssertUnwindSafe(next.run(req, res)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(AppError::internal(format!(
                    "middleware panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        })
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn recorder(log: Arc<Mutex<Vec<usize>>>, id: usize) -> MiddlewareHandler {
        from_fn(move |req: Request, res: ResponseWriter, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(id);
                next.run(req, res).await
            }
        })
    }

    fn failing(err: fn() -> AppError) -> MiddlewareHandler {
        from_fn(move |_req: Request, _res: ResponseWriter, _next: Next| async move {
            Err::<Outcome, AppError>(err())
        })
    }

    async fn wire(res: ResponseWriter, mut client: tokio::io::DuplexStream) -> String {
        drop(res);
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn runs_in_registration_order_then_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            recorder(Arc::clone(&log), 0),
            recorder(Arc::clone(&log), 1),
            recorder(Arc::clone(&log), 2),
        ]);
        let (_client, server) = tokio::io::duplex(1024);
        let outcome = chain
            .run(request("GET /x HTTP/1.1\r\n\r\n"), ResponseWriter::from_writer(server))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Continue(req) if req.path() == "/x"));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn error_halts_and_writes_envelope_with_declared_status() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            recorder(Arc::clone(&log), 0),
            failing(|| AppError::bad_request("Missing boundary in content-type header")),
            recorder(Arc::clone(&log), 2),
        ]);
        let (client, server) = tokio::io::duplex(4096);
        let res = ResponseWriter::from_writer(server);
        let outcome = chain
            .run(request("POST /u HTTP/1.1\r\n\r\n"), res.clone())
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Halt));
        assert_eq!(*log.lock().unwrap(), vec![0]);
        let out = wire(res, client).await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Missing boundary"));
    }

    #[tokio::test]
    async fn unknown_errors_default_to_redacted_500() {
        let chain = Chain::new(vec![failing(|| AppError::internal("secret detail"))]);
        let (client, server) = tokio::io::duplex(4096);
        let res = ResponseWriter::from_writer(server);
        chain
            .run(request("GET / HTTP/1.1\r\n\r\n"), res.clone())
            .await
            .unwrap();
        let out = wire(res, client).await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!out.contains("secret detail"));
    }

    #[tokio::test]
    async fn nothing_runs_after_a_response_was_sent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let responder =
            from_fn(|_req: Request, res: ResponseWriter, _next: Next| async move {
                res.status(StatusCode::Unauthorized).text("nope").await?;
                Ok::<Outcome, AppError>(Outcome::Halt)
            });
        let chain = Chain::new(vec![responder, recorder(Arc::clone(&log), 1)]);
        let (_client, server) = tokio::io::duplex(1024);
        let res = ResponseWriter::from_writer(server);
        let outcome = chain
            .run(request("GET / HTTP/1.1\r\n\r\n"), res.clone())
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Halt));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(res.committed_status(), Some(StatusCode::Unauthorized));
    }

    #[tokio::test]
    async fn error_boundary_converts_panics() {
        let panicking = from_fn(|_req: Request, _res: ResponseWriter, _next: Next| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<Outcome, AppError>(Outcome::Halt)
        });
        let chain = Chain::new(vec![from_middleware(Arc::new(ErrorBoundary)), panicking]);
        let (client, server) = tokio::io::duplex(4096);
        let res = ResponseWriter::from_writer(server);
        let outcome = chain
            .run(request("GET / HTTP/1.1\r\n\r\n"), res.clone())
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Halt));
        let out = wire(res, client).await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!out.contains("kaboom"));
    }

    #[test]
    fn defaults_are_boundary_then_upload() {
        let chain = Chain::new(Chain::defaults());
        assert_eq!(chain.len(), 2);
    }
}
