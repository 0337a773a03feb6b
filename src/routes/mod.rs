//! The application's route table.
//!
//! | Method   | Path                          | Handler                              |
//! |----------|-------------------------------|--------------------------------------|
//! | `GET`    | `/`                           | endpoint listing                     |
//! | `GET`    | `/api/health`                 | uptime and version                   |
//! | `POST`   | `/api/uploads`                | store every uploaded file            |
//! | `GET`    | `/api/uploads`                | list stored files                    |
//! | `DELETE` | `/api/uploads/bulk-delete`    | delete many, per-item results        |
//! | `DELETE` | `/api/uploads/:name`          | delete one                           |
//! | `GET`    | `/api/uploads/:name/file`     | download a stored file               |

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::http::{Request, ResponseWriter, StatusCode};
use crate::router::Router;
use crate::static_files;
use crate::storage::UploadStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the route table over the directories in `config`.
pub fn router(config: &ServerConfig) -> Router {
    let store = UploadStore::new(config.uploads_dir.clone());
    let started = Instant::now();
    let mut router = Router::new();

    router.get("/api/health", move |_req: Request, res: ResponseWriter| {
        health(started, res)
    });

    let uploads = store.clone();
    router.post("/api/uploads", move |req: Request, res: ResponseWriter| {
        upload_files(uploads.clone(), req, res)
    });
    let uploads = store.clone();
    router.get("/api/uploads", move |_req: Request, res: ResponseWriter| {
        list_files(uploads.clone(), res)
    });
    // Registered before `:name` so the literal segment wins.
    let uploads = store.clone();
    router.delete(
        "/api/uploads/bulk-delete",
        move |req: Request, res: ResponseWriter| bulk_delete(uploads.clone(), req, res),
    );
    let uploads = store.clone();
    router.delete("/api/uploads/:name", move |req: Request, res: ResponseWriter| {
        delete_file(uploads.clone(), req, res)
    });
    router.get("/api/uploads/:name/file", move |req: Request, res: ResponseWriter| {
        download_file(store.clone(), req, res)
    });

    let mut endpoints: Vec<String> = router
        .routes()
        .map(|route| format!("{} {}", route.method(), route.pattern()))
        .collect();
    endpoints.insert(0, "GET /".to_owned());
    router.get("/", move |_req: Request, res: ResponseWriter| {
        home(endpoints.clone(), res)
    });

    router
}

async fn home(endpoints: Vec<String>, res: ResponseWriter) -> Result<(), AppError> {
    let data = json!({
        "name": "handwire",
        "version": VERSION,
        "endpoints": endpoints,
    });
    res.success(data, "Welcome to the handwire API", StatusCode::Ok)
        .await?;
    Ok(())
}

async fn health(started: Instant, res: ResponseWriter) -> Result<(), AppError> {
    let data = json!({
        "status": "ok",
        "uptimeSecs": started.elapsed().as_secs(),
        "version": VERSION,
    });
    res.success(data, "Service is healthy", StatusCode::Ok).await?;
    Ok(())
}

async fn upload_files(
    store: UploadStore,
    req: Request,
    res: ResponseWriter,
) -> Result<(), AppError> {
    if req.files().is_empty() {
        return Err(AppError::bad_request("No files uploaded"));
    }

    // Field-name order keeps the response stable.
    let files: BTreeMap<_, _> = req.files().iter().collect();
    let mut stored = Vec::with_capacity(files.len());
    for (field, file) in files {
        if file.size == 0 {
            return Err(AppError::bad_request(format!("Uploaded file '{field}' is empty")));
        }
        stored.push(store.save(file).await?);
    }

    let data = json!({
        "files": stored,
        "fields": req.body(),
    });
    res.created(data, "Files uploaded successfully").await?;
    Ok(())
}

async fn list_files(store: UploadStore, res: ResponseWriter) -> Result<(), AppError> {
    let files = store.list().await?;
    let count = files.len();
    res.success(
        json!({ "files": files, "count": count }),
        "Files retrieved successfully",
        StatusCode::Ok,
    )
    .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct BulkDeleteBody {
    ids: Vec<String>,
}

async fn bulk_delete(
    store: UploadStore,
    req: Request,
    res: ResponseWriter,
) -> Result<(), AppError> {
    let body: BulkDeleteBody = req.json()?;
    if body.ids.is_empty() {
        return Err(AppError::bad_request("ids must be a non-empty array"));
    }

    let report = store.delete_many(&body.ids).await;
    let message = format!(
        "Deleted {} of {} files",
        report.summary.deleted, report.summary.total
    );
    res.success(report, &message, StatusCode::Ok).await?;
    Ok(())
}

async fn delete_file(store: UploadStore, req: Request, res: ResponseWriter) -> Result<(), AppError> {
    let name = req.param("name").unwrap_or_default();
    store.delete(name).await?;
    res.success(json!({ "id": name }), "File deleted successfully", StatusCode::Ok)
        .await?;
    Ok(())
}

async fn download_file(
    store: UploadStore,
    req: Request,
    res: ResponseWriter,
) -> Result<(), AppError> {
    // The raw path keeps percent escapes, which the file server decodes itself.
    // The trailing `/file` keeps asset extensions away from the static rules.
    let relative = req
        .path()
        .strip_prefix("/api/uploads/")
        .and_then(|rest| rest.strip_suffix("/file"))
        .unwrap_or_default();
    static_files::serve(&res, relative, store.root()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    #[test]
    fn table_lists_every_endpoint() {
        let router = router(&ServerConfig::default());
        assert_eq!(router.len(), 7);
        assert!(router.find(&Method::Get, "/").is_some());
        assert_eq!(
            router
                .find(&Method::Delete, "/api/uploads/bulk-delete")
                .map(|r| r.pattern()),
            Some("/api/uploads/bulk-delete")
        );
        assert_eq!(
            router
                .find(&Method::Delete, "/api/uploads/123-abc.png")
                .map(|r| r.pattern()),
            Some("/api/uploads/:name")
        );
        assert_eq!(
            router
                .find(&Method::Get, "/api/uploads/123-abc.png/file")
                .map(|r| r.pattern()),
            Some("/api/uploads/:name/file")
        );
    }
}
