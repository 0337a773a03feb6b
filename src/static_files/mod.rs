//! Static asset serving confined to an allow-listed root directory.
//!
//! Every request path is percent-decoded, normalized lexically, joined under
//! the root, and then checked twice: once textually against the absolute
//! root, and once more after symlinks are resolved. A path that climbs above
//! the root is refused with `403 Access denied` and never touches the disk.

use std::io;
use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::http::{Response, ResponseWriter, StatusCode};

/// `Cache-Control` value sent with every static asset.
pub const CACHE_CONTROL: &str = "public, max-age=31536000";

/// Maps a file extension to its MIME type, defaulting to `application/octet-stream`.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "ttf" => "font/ttf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "eot" => "application/vnd.ms-fontobject",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Resolves `relative` under `root` without touching the filesystem.
///
/// # Errors
///
/// - [`AppError::Forbidden`] if a `..` component would leave the root.
/// - [`AppError::BadRequest`] if the path is not valid percent-encoded UTF-8
///   or contains a NUL byte.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, AppError> {
    let decoded = percent_decode_str(relative)
        .decode_utf8()
        .map_err(|_| AppError::bad_request("Malformed file path"))?;
    if decoded.contains('\0') {
        return Err(AppError::bad_request("Malformed file path"));
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in decoded.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(access_denied());
                }
            }
            // A drive prefix such as `C:` would reset the join on Windows.
            other if !is_plain(other) => return Err(access_denied()),
            other => parts.push(other),
        }
    }

    let root = std::path::absolute(root)?;
    let mut resolved = root.clone();
    resolved.extend(&parts);

    if !resolved.starts_with(&root) {
        return Err(access_denied());
    }
    Ok(resolved)
}

/// Returns `true` if `relative` names a regular file inside `root`.
pub async fn exists(root: &Path, relative: &str) -> bool {
    match resolve(root, relative) {
        Ok(path) => tokio::fs::metadata(path)
            .await
            .is_ok_and(|meta| meta.is_file()),
        Err(_) => false,
    }
}

/// Streams the file at `relative` under `root` as the response.
///
/// Does nothing if a response was already sent.
///
/// # Errors
///
/// `403` for paths outside the root (including symlink escapes), `404` for
/// missing files and directories, `500` for files that cannot be read.
pub async fn serve(res: &ResponseWriter, relative: &str, root: &Path) -> Result<(), AppError> {
    if res.is_sent() {
        return Ok(());
    }

    let path = resolve(root, relative).inspect_err(|err| {
        if matches!(err, AppError::Forbidden(_)) {
            warn!(relative, root = %root.display(), "path traversal attempt rejected");
        }
    })?;

    let canonical_root = tokio::fs::canonicalize(root).await.map_err(read_error)?;
    let canonical = tokio::fs::canonicalize(&path).await.map_err(read_error)?;
    if !canonical.starts_with(&canonical_root) {
        warn!(relative, target = %canonical.display(), "symlink escapes static root");
        return Err(access_denied());
    }

    let file = tokio::fs::File::open(&canonical).await.map_err(read_error)?;
    let meta = file.metadata().await.map_err(read_error)?;
    if !meta.is_file() {
        return Err(AppError::not_found("File not found"));
    }

    let mut head = Response::new(StatusCode::Ok)
        .header("Content-Type", content_type(&canonical))
        .header("Cache-Control", CACHE_CONTROL);
    if let Ok(modified) = meta.modified() {
        head = head.header("Last-Modified", httpdate::fmt_http_date(modified));
    }

    debug!(file = %canonical.display(), bytes = meta.len(), "serving static file");
    res.stream(head, meta.len(), file).await?;
    Ok(())
}

fn is_plain(part: &str) -> bool {
    Path::new(part)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

fn access_denied() -> AppError {
    AppError::forbidden("Access denied")
}

fn read_error(err: io::Error) -> AppError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
            AppError::not_found("File not found")
        }
        _ => {
            warn!(error = %err, "static file read failed");
            AppError::status(StatusCode::InternalServerError, "Error reading file")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/app.css"), "body{}").unwrap();
        std::fs::write(dir.path().join("my file.txt"), "spaced").unwrap();
        dir
    }

    async fn wire(res: ResponseWriter, mut client: tokio::io::DuplexStream) -> String {
        drop(res);
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[test]
    fn mime_table() {
        assert_eq!(content_type(Path::new("a.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("x/y.woff2")), "font/woff2");
        assert_eq!(content_type(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(content_type(Path::new("blob.bin")), "application/octet-stream");
        assert_eq!(content_type(Path::new("Makefile")), "application/octet-stream");
    }

    #[test]
    fn resolve_collapses_inner_parents() {
        let root = Path::new("/srv/static");
        assert_eq!(
            resolve(root, "css/../index.html").unwrap(),
            Path::new("/srv/static/index.html")
        );
        assert_eq!(
            resolve(root, "/./css//app.css").unwrap(),
            Path::new("/srv/static/css/app.css")
        );
    }

    #[test]
    fn resolve_rejects_escapes() {
        let root = Path::new("/srv/static");
        for attempt in ["../../etc/passwd", "css/../../secret", "..%2F..%2Fetc/passwd", "..\\..\\boot.ini"] {
            let err = resolve(root, attempt).unwrap_err();
            assert_eq!(err.status_code(), StatusCode::Forbidden, "{attempt}");
        }
    }

    #[tokio::test]
    async fn serves_file_with_caching_headers() {
        let dir = site();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let res = ResponseWriter::from_writer(server);

        serve(&res, "css/app.css", dir.path()).await.unwrap();
        let out = wire(res, client).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Type: text/css; charset=utf-8\r\n"));
        assert!(out.contains("Content-Length: 6\r\n"));
        assert!(out.contains("Cache-Control: public, max-age=31536000\r\n"));
        assert!(out.contains("Last-Modified: "));
        assert!(out.ends_with("\r\n\r\nbody{}"));
    }

    #[tokio::test]
    async fn percent_encoded_names_are_decoded() {
        let dir = site();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let res = ResponseWriter::from_writer(server);

        serve(&res, "my%20file.txt", dir.path()).await.unwrap();
        assert!(wire(res, client).await.ends_with("spaced"));
    }

    #[tokio::test]
    async fn missing_files_and_directories_are_404() {
        let dir = site();
        let (_client, server) = tokio::io::duplex(1024);
        let res = ResponseWriter::from_writer(server);

        let err = serve(&res, "nope.css", dir.path()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
        let err = serve(&res, "css", dir.path()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
        assert!(!res.is_sent());
    }

    #[tokio::test]
    async fn traversal_never_reads() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "top secret").unwrap();
        let root = outer.path().join("public");
        std::fs::create_dir(&root).unwrap();

        let (_client, server) = tokio::io::duplex(1024);
        let res = ResponseWriter::from_writer(server);
        let err = serve(&res, "../secret.txt", &root).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Forbidden);
        assert_eq!(err.public_message(), "Access denied");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_forbidden() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "top secret").unwrap();
        let root = outer.path().join("public");
        std::fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("link.txt")).unwrap();

        let (_client, server) = tokio::io::duplex(1024);
        let res = ResponseWriter::from_writer(server);
        let err = serve(&res, "link.txt", &root).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn exists_only_for_regular_files() {
        let dir = site();
        assert!(exists(dir.path(), "index.html").await);
        assert!(!exists(dir.path(), "css").await);
        assert!(!exists(dir.path(), "../index.html").await);
    }
}
