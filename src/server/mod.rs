//! Async TCP server using Tokio.
//!
//! [`Server`] owns the route table, the middleware list, and the listener.
//! [`listen`](Server::listen) binds with automatic port fallback,
//! [`serve`](Server::serve) runs the accept loop until a [`ServerHandle`]
//! asks it to stop, and then drains every in-flight connection.
//!
//! Lifecycle state is exactly two things: the bound port (unset until
//! `listen` succeeds) and the shutting-down flag (set once, never cleared).

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::middleware::{Chain, MiddlewareHandler};
use crate::router::Router;

mod connection;
mod pipeline;

/// How many ports above the requested one [`Server::listen`] will try.
pub const PORT_SCAN_RANGE: u16 = 100;

/// Errors produced by the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port between {from} and {to}")]
    NoAvailablePort { from: u16, to: u16 },

    #[error("server is already listening on port {0}")]
    AlreadyListening(u16),

    #[error("serve() called before listen()")]
    NotListening,
}

/// State shared by the server, its handles, and every connection task.
struct Lifecycle {
    port: OnceLock<u16>,
    shutting_down: watch::Sender<bool>,
    /// `false` while a listener is bound and its connections are not yet drained.
    finished: watch::Sender<bool>,
}

impl Lifecycle {
    fn is_shutting_down(&self) -> bool {
        *self.shutting_down.borrow()
    }
}

/// Everything a connection needs, frozen when serving starts.
pub(crate) struct Shared {
    router: Router,
    chain: Chain,
    config: ServerConfig,
    lifecycle: Arc<Lifecycle>,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }
}

/// The handwire HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use handwire::config::ServerConfig;
/// use handwire::router::Router;
/// use handwire::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut server = Server::new(Router::new(), ServerConfig::default());
///     let addr = server.listen(9000).await?;
///     println!("listening on {addr}");
///
///     let handle = server.handle();
///     tokio::spawn(async move {
///         let _ = tokio::signal::ctrl_c().await;
///         handle.close().await;
///     });
///     server.serve().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    router: Router,
    middlewares: Vec<MiddlewareHandler>,
    config: ServerConfig,
    listener: Option<TcpListener>,
    lifecycle: Arc<Lifecycle>,
}

impl Server {
    /// Creates a server with the default middleware chain installed.
    pub fn new(router: Router, config: ServerConfig) -> Self {
        Self {
            router,
            middlewares: Chain::defaults(),
            config,
            listener: None,
            lifecycle: Arc::new(Lifecycle {
                port: OnceLock::new(),
                shutting_down: watch::channel(false).0,
                finished: watch::channel(true).0,
            }),
        }
    }

    /// Appends a middleware after those already registered.
    pub fn use_middleware(&mut self, middleware: MiddlewareHandler) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The port actually bound, once [`listen`](Self::listen) has succeeded.
    pub fn port(&self) -> Option<u16> {
        self.lifecycle.port.get().copied()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    /// Binds `requested`, or the first free port among the next
    /// [`PORT_SCAN_RANGE`] ports. Port `0` asks the OS for any free port.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NoAvailablePort`] if every candidate is taken.
    /// - [`ServerError::Bind`] for failures other than the port being taken,
    ///   such as an unresolvable host.
    pub async fn listen(&mut self, requested: u16) -> Result<SocketAddr, ServerError> {
        if let Some(port) = self.port() {
            return Err(ServerError::AlreadyListening(port));
        }

        let last = requested.saturating_add(PORT_SCAN_RANGE);
        for candidate in requested..=last {
            let listener = match TcpListener::bind((self.config.host.as_str(), candidate)).await {
                Ok(listener) => listener,
                Err(e) if is_port_taken(&e) => {
                    debug!(port = candidate, error = %e, "port unavailable");
                    continue;
                }
                Err(e) => {
                    return Err(ServerError::Bind {
                        addr: format!("{}:{candidate}", self.config.host),
                        source: e,
                    });
                }
            };

            let addr = listener.local_addr()?;
            if candidate != requested {
                info!(requested, bound = addr.port(), "requested port in use, fell back");
            }
            let _ = self.lifecycle.port.set(addr.port());
            self.lifecycle.finished.send_replace(false);
            self.listener = Some(listener);
            return Ok(addr);
        }

        Err(ServerError::NoAvailablePort {
            from: requested,
            to: last,
        })
    }

    /// Accepts connections until shutdown is requested, then waits for every
    /// in-flight connection to finish.
    ///
    /// # Errors
    ///
    /// [`ServerError::NotListening`] if [`listen`](Self::listen) was not called.
    pub async fn serve(mut self) -> Result<(), ServerError> {
        let listener = self.listener.take().ok_or(ServerError::NotListening)?;
        let lifecycle = Arc::clone(&self.lifecycle);
        let shared = Arc::new(Shared {
            router: std::mem::take(&mut self.router),
            chain: Chain::new(std::mem::take(&mut self.middlewares)),
            config: self.config.clone(),
            lifecycle: Arc::clone(&lifecycle),
        });

        let addr = listener.local_addr()?;
        info!(address = %addr, routes = shared.router.len(), "handwire listening");

        let mut shutdown = lifecycle.shutting_down.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stopping| *stopping) => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "connection accepted");
                    let shared = Arc::clone(&shared);
                    let conn_shutdown = lifecycle.shutting_down.subscribe();
                    connections.spawn(async move {
                        if let Err(e) = connection::serve(stream, peer, shared, conn_shutdown).await {
                            debug!(peer = %peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    log_connection_exit(done);
                }
            }
        }

        drop(listener);
        info!(in_flight = connections.len(), "shutting down, draining connections");
        while let Some(done) = connections.join_next().await {
            log_connection_exit(done);
        }

        lifecycle.finished.send_replace(true);
        info!("server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // A bound listener that never served has nothing to drain.
        if self.listener.is_some() {
            self.lifecycle.finished.send_replace(true);
        }
    }
}

/// A cloneable handle for stopping a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    lifecycle: Arc<Lifecycle>,
}

impl ServerHandle {
    pub fn port(&self) -> Option<u16> {
        self.lifecycle.port.get().copied()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    /// Enters the draining state and resolves once every in-flight
    /// connection has finished. Resolves immediately if the server never
    /// listened. Requests that arrive while draining are answered with 503.
    pub async fn close(&self) {
        if !self.lifecycle.shutting_down.send_replace(true) {
            info!("shutdown requested");
        }
        if self.port().is_none() {
            return;
        }
        let mut finished = self.lifecycle.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }
}

fn is_port_taken(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
    )
}

fn log_connection_exit(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            error!(error = %e, "connection task panicked");
        } else {
            warn!(error = %e, "connection task cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn port_is_unset_until_listen() {
        let mut server = Server::new(Router::new(), config());
        assert_eq!(server.port(), None);

        let addr = server.listen(0).await.unwrap();
        assert_eq!(server.port(), Some(addr.port()));
        assert_eq!(server.handle().port(), Some(addr.port()));
        assert!(matches!(
            server.listen(0).await,
            Err(ServerError::AlreadyListening(_))
        ));
    }

    #[tokio::test]
    async fn occupied_port_falls_back_to_next_free() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let mut server = Server::new(Router::new(), config());
        let addr = server.listen(taken).await.unwrap();
        assert_ne!(addr.port(), taken);
        assert!(addr.port() > taken && addr.port() <= taken.saturating_add(PORT_SCAN_RANGE));
    }

    #[tokio::test]
    async fn serve_requires_listen() {
        let server = Server::new(Router::new(), config());
        assert!(matches!(server.serve().await, Err(ServerError::NotListening)));
    }

    #[tokio::test]
    async fn close_without_listen_returns_immediately() {
        let server = Server::new(Router::new(), config());
        let handle = server.handle();
        handle.close().await;
        assert!(handle.is_shutting_down());
    }

    #[tokio::test]
    async fn close_stops_serving() {
        let mut server = Server::new(Router::new(), config());
        server.listen(0).await.unwrap();
        let handle = server.handle();
        let serving = tokio::spawn(server.serve());

        handle.close().await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropping_unserved_server_unblocks_close() {
        let mut server = Server::new(Router::new(), config());
        server.listen(0).await.unwrap();
        let handle = server.handle();
        drop(server);
        handle.close().await;
    }
}
