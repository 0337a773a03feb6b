//! The per-request orchestrator.
//!
//! Stages run in a fixed order, each able to finish the request:
//!
//! 1. draining gate (`503` while shutting down)
//! 2. request timer (`408` once the deadline passes)
//! 3. CORS headers, staged on the writer
//! 4. `OPTIONS` preflight (`204`)
//! 5. static files for `GET`
//! 6. middleware chain
//! 7. body decoding for mutating, non-multipart requests
//! 8. routing
//!
//! Stages 3 to 8 run in their own task raced against the timer. When the
//! timer wins the task is left to finish on its own; every write it attempts
//! afterwards is dropped by the write-once [`ResponseWriter`].

use std::path::Path;
use std::sync::Arc;

use tokio::time::{Instant, sleep_until};
use tracing::{error, info, warn};

use super::Shared;
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::http::{Method, Request, ResponseWriter, StatusCode, body};
use crate::middleware::{Outcome, panic_message};
use crate::static_files;

/// Extensions served from the static root regardless of path prefix.
const STATIC_EXTENSIONS: [&str; 6] = [".html", ".css", ".js", ".png", ".jpg", ".svg"];

pub(crate) async fn handle(
    shared: &Arc<Shared>,
    request: Request,
    res: ResponseWriter,
    deadline: Instant,
) {
    let method = request.method().clone();
    let path = request.path().to_owned();
    let started = std::time::Instant::now();

    if shared.is_shutting_down() {
        res.set_keep_alive(false);
        if let Err(e) = res
            .status(StatusCode::ServiceUnavailable)
            .text("Server is shutting down")
            .await
        {
            warn!(%method, %path, error = %e, "could not write shutdown response");
        }
        return;
    }

    let stages = tokio::spawn(run_stages(Arc::clone(shared), request, res.clone()));

    let failure = tokio::select! {
        joined = stages => match joined {
            Ok(Ok(())) if res.is_sent() => None,
            Ok(Ok(())) => Some(AppError::internal("request finished without a response")),
            Ok(Err(err)) => Some(err),
            Err(join) if join.is_panic() => Some(AppError::internal(format!(
                "handler panicked: {}",
                panic_message(join.into_panic().as_ref())
            ))),
            Err(join) => Some(AppError::internal(join.to_string())),
        },
        () = sleep_until(deadline) => {
            warn!(%method, %path, "request timed out");
            res.set_keep_alive(false);
            Some(AppError::Timeout)
        }
    };

    if let Some(err) = failure {
        if err.is_server_fault() {
            error!(%method, %path, error = %err, "request failed");
        } else if !matches!(err, AppError::Timeout) {
            warn!(%method, %path, error = %err, "request rejected");
        }
        if let Err(e) = res.fail(&err).await {
            warn!(%method, %path, error = %e, "could not write error response");
        }
    }

    info!(
        %method,
        %path,
        status = res.committed_status().map(StatusCode::as_u16),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
}

async fn run_stages(
    shared: Arc<Shared>,
    request: Request,
    res: ResponseWriter,
) -> Result<(), AppError> {
    shared.config.cors.apply(&request, &res);

    if *request.method() == Method::Options {
        res.no_content().await?;
        return Ok(());
    }

    if *request.method() == Method::Get {
        if let Some((relative, root)) = static_target(&shared.config, request.path()).await {
            return static_files::serve(&res, &relative, root).await;
        }
    }

    let mut request = match shared.chain.run(request, res.clone()).await? {
        Outcome::Continue(request) => request,
        Outcome::Halt => return Ok(()),
    };
    if res.is_sent() {
        return Ok(());
    }

    if request.method().is_mutating() && !request.is_multipart() {
        let raw = request.raw_body()?;
        let decoded = body::decode(request.content_type(), &raw)?;
        request.set_body(decoded);
    }

    shared.router.dispatch(request, res).await
}

/// Picks the file and root a `GET` should be served from, if any.
///
/// `/` only maps to `index.html` when that file exists, so the route
/// table can answer the root otherwise.
async fn static_target<'a>(config: &'a ServerConfig, path: &str) -> Option<(String, &'a Path)> {
    if path == "/" {
        return static_files::exists(&config.public_dir, "index.html")
            .await
            .then(|| ("index.html".to_owned(), config.public_dir.as_path()));
    }
    if let Some(rest) = path.strip_prefix("/static/") {
        return Some((rest.to_owned(), config.static_dir.as_path()));
    }
    if STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        let relative = path.strip_prefix('/').unwrap_or(path);
        return Some((relative.to_owned(), config.static_dir.as_path()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_rules() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            public_dir: dir.path().to_path_buf(),
            static_dir: dir.path().join("assets"),
            ..ServerConfig::default()
        };

        assert_eq!(static_target(&config, "/").await, None);
        std::fs::write(dir.path().join("index.html"), "home").unwrap();
        assert_eq!(
            static_target(&config, "/").await,
            Some(("index.html".to_owned(), dir.path()))
        );

        let assets = config.static_dir.as_path();
        assert_eq!(
            static_target(&config, "/static/css/app.css").await,
            Some(("css/app.css".to_owned(), assets))
        );
        assert_eq!(
            static_target(&config, "/img/logo.png").await,
            Some(("img/logo.png".to_owned(), assets))
        );
        assert_eq!(static_target(&config, "/api/uploads").await, None);
        assert_eq!(static_target(&config, "/static").await, None);
    }
}
