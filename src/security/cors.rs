use crate::http::{Request, ResponseWriter};

/// Cross-Origin Resource Sharing headers staged on every response.
///
/// The pipeline applies the policy before static files, middleware, or
/// routing run, so every response (errors and 404s included) carries the
/// headers. Preflight `OPTIONS` requests are answered by the pipeline with
/// `204 No Content` straight after [`apply`](Self::apply).
///
/// # Behavior
///
/// - With the wildcard origin `"*"` in the allow-list the headers are sent
///   unconditionally, `Origin` header or not.
/// - With specific origins, the request's `Origin` is echoed back only when
///   allowed, together with `Vary: Origin`. Disallowed or absent origins get
///   no `Access-Control-*` headers at all.
///
/// # Examples
///
/// ```rust
/// use handwire::security::CorsPolicy;
///
/// let cors = CorsPolicy::new()
///     .allow_header("X-Request-ID")
///     .max_age(600);
/// ```
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age_secs: u64,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsPolicy {
    /// Permissive defaults:
    ///
    /// | Setting          | Default value                                      |
    /// |------------------|----------------------------------------------------|
    /// | Allowed origins  | `*`                                                |
    /// | Allowed methods  | `GET, POST, PUT, DELETE, PATCH, OPTIONS`           |
    /// | Allowed headers  | `Content-Type, Authorization, X-Requested-With`    |
    /// | Max age          | 86400 seconds                                      |
    pub fn new() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: ["Content-Type", "Authorization", "X-Requested-With"]
                .map(str::to_owned)
                .to_vec(),
            max_age_secs: 86_400,
        }
    }

    /// Restricts the policy to the given origins, replacing the wildcard.
    #[must_use]
    pub fn with_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    #[must_use]
    pub fn max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Stages the CORS headers for `req` on `res`.
    pub fn apply(&self, req: &Request, res: &ResponseWriter) {
        let wildcard = self.allowed_origins.iter().any(|o| o == "*");
        let allow_origin = if wildcard {
            "*".to_owned()
        } else {
            match req.headers().get("origin") {
                Some(origin) if self.allowed_origins.iter().any(|o| o == origin) => {
                    origin.to_owned()
                }
                _ => return,
            }
        };

        res.set_header("Access-Control-Allow-Origin", allow_origin)
            .set_header("Access-Control-Allow-Methods", self.allowed_methods.join(", "))
            .set_header("Access-Control-Allow-Headers", self.allowed_headers.join(", "))
            .set_header("Access-Control-Max-Age", self.max_age_secs.to_string());
        if !wildcard {
            res.set_header("Vary", "Origin");
        }
    }
}
