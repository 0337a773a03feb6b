//! Cross-cutting HTTP security concerns.
//!
//! Currently this is the CORS policy applied by the request pipeline before
//! any other stage runs. Path confinement for static assets lives with the
//! file server in [`crate::static_files`].

mod cors;

pub use cors::CorsPolicy;
