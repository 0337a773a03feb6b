//! Multipart upload decoding as a default middleware.

use serde_json::Value;
use tracing::debug;

use super::{Middleware, MiddlewareFuture, Next};
use crate::error::AppError;
use crate::http::{Request, ResponseWriter};
use crate::multipart;

/// Decodes `multipart/form-data` bodies on mutating requests.
///
/// Text fields become the request's structured body (as a JSON object) and
/// file parts become its uploaded files. Requests that are not multipart, or
/// whose method cannot carry a body, pass through untouched.
pub struct UploadMiddleware;

impl Middleware for UploadMiddleware {
    fn handle(&self, mut req: Request, res: ResponseWriter, next: Next) -> MiddlewareFuture {
        Box::pin(async move {
            if !req.method().is_mutating() || !req.is_multipart() {
                return next.run(req, res).await;
            }

            let boundary = req
                .content_type()
                .and_then(multipart::boundary)
                .map(str::to_owned)
                .ok_or_else(|| AppError::bad_request("Missing boundary in content-type header"))?;

            let raw = req.raw_body()?;
            let form = multipart::decode(&raw, &boundary);
            debug!(
                path = %req.path(),
                fields = form.fields.len(),
                files = form.files.len(),
                "decoded multipart body"
            );

            req.set_body(Value::Object(form.fields));
            req.set_files(form.files);
            next.run(req, res).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RawBody;
    use crate::middleware::{Chain, Outcome, from_middleware};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn multipart_request(content_type: &str, body: &'static [u8]) -> Request {
        let head = format!(
            "POST /api/uploads HTTP/1.1\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut req = Request::parse(head.as_bytes()).unwrap().0;
        req.set_raw_body(RawBody::Buffered(Bytes::from_static(body)));
        req
    }

    fn chain() -> Chain {
        Chain::new(vec![from_middleware(Arc::new(UploadMiddleware))])
    }

    #[tokio::test]
    async fn fields_and_files_are_attached() {
        let body = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"user[name]\"\r\n\r\n\
ada\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"avatar\"; filename=\"a.png\"\r\n\
Content-Type: image/png\r\n\r\n\
PNGDATA\r\n\
--XyZ--\r\n";
        let req = multipart_request("multipart/form-data; boundary=XyZ", body);
        let (_client, server) = tokio::io::duplex(1024);

        let outcome = chain()
            .run(req, ResponseWriter::from_writer(server))
            .await
            .unwrap();
        let Outcome::Continue(req) = outcome else {
            panic!("expected the request to continue");
        };
        assert_eq!(req.body()["user"]["name"], "ada");
        let avatar = &req.files()["avatar"];
        assert_eq!(avatar.filename, "a.png");
        assert_eq!(avatar.mime_type, "image/png");
        assert_eq!(&avatar.data[..], b"PNGDATA");
    }

    #[tokio::test]
    async fn missing_boundary_is_400() {
        let req = multipart_request("multipart/form-data", b"irrelevant");
        let (mut client, server) = tokio::io::duplex(4096);
        let res = ResponseWriter::from_writer(server);

        let outcome = chain().run(req, res.clone()).await.unwrap();
        assert!(matches!(outcome, Outcome::Halt));
        drop(res);

        let mut wire = String::new();
        client.read_to_string(&mut wire).await.unwrap();
        assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(wire.contains("Missing boundary in content-type header"));
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let head = "POST /api/uploads HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b\r\n\r\n";
        let mut req = Request::parse(head.as_bytes()).unwrap().0;
        req.set_raw_body(RawBody::TooLarge {
            declared: 20,
            limit: 10,
        });
        let (mut client, server) = tokio::io::duplex(4096);
        let res = ResponseWriter::from_writer(server);

        chain().run(req, res.clone()).await.unwrap();
        drop(res);

        let mut wire = String::new();
        client.read_to_string(&mut wire).await.unwrap();
        assert!(wire.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(wire.contains("Request entity too large"));
    }

    #[tokio::test]
    async fn get_requests_are_ignored() {
        let head = "GET /x HTTP/1.1\r\nContent-Type: multipart/form-data\r\n\r\n";
        let req = Request::parse(head.as_bytes()).unwrap().0;
        let (_client, server) = tokio::io::duplex(1024);

        let outcome = chain()
            .run(req, ResponseWriter::from_writer(server))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Continue(req) if req.files().is_empty()));
    }
}
