//! # handwire
//!
//! A hand-built async HTTP/1.1 request pipeline: wire parsing, CORS, static
//! files with traversal protection, a middleware chain, multipart decoding,
//! parameterized routing, and a write-once JSON response envelope.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use handwire::config::ServerConfig;
//! use handwire::error::AppError;
//! use handwire::http::{Request, ResponseWriter, StatusCode};
//! use handwire::router::Router;
//! use handwire::server::Server;
//!
//! async fn hello(req: Request, res: ResponseWriter) -> Result<(), AppError> {
//!     let name = req.param("name").unwrap_or("world");
//!     res.success(format!("Hello, {name}!"), "Greeted", StatusCode::Ok).await?;
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/hello/:name", hello);
//!
//!     let mut server = Server::new(router, ServerConfig::default());
//!     let addr = server.listen(8080).await?;
//!     println!("Listening on http://{addr}");
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod multipart;
pub mod router;
pub mod routes;
pub mod security;
pub mod server;
pub mod static_files;
pub mod storage;

pub use error::AppError;
pub use http::{Envelope, Headers, Method, Request, Response, ResponseWriter, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError, ServerHandle};
