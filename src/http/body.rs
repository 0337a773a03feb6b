//! Non-multipart request body decoding.
//!
//! Bodies are decoded by declared content type:
//!
//! | Content type                         | Result                                  |
//! |--------------------------------------|-----------------------------------------|
//! | `application/json`                   | strict JSON; malformed → 400            |
//! | `application/x-www-form-urlencoded`  | object of string values                 |
//! | anything else, starting with `{`/`[` | JSON if it parses, empty object otherwise |
//! | anything else                        | raw string                              |
//!
//! An empty (or whitespace-only) body always decodes to an empty object.

use serde_json::{Map, Value};

use crate::error::AppError;

/// Decodes `raw` according to `content_type`.
///
/// # Errors
///
/// [`AppError::BadRequest`] when the content type declares JSON but the body
/// does not parse.
///
/// # Examples
///
/// ```
/// use handwire::http::body::decode;
///
/// let body = decode(Some("application/x-www-form-urlencoded"), b"name=Ada+L&x=1").unwrap();
/// assert_eq!(body["name"], "Ada L");
/// assert_eq!(body["x"], "1");
/// ```
pub fn decode(content_type: Option<&str>, raw: &[u8]) -> Result<Value, AppError> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();

    if content_type.contains("application/json") {
        return serde_json::from_str(&text)
            .map_err(|_| AppError::bad_request("Invalid JSON in request body"));
    }

    if content_type.contains("application/x-www-form-urlencoded") {
        let fields = url::form_urlencoded::parse(raw)
            .into_owned()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Map<_, _>>();
        return Ok(Value::Object(fields));
    }

    // Sniffed JSON is lenient: a body that looks like JSON but does not parse
    // decodes to an empty object.
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::Object(Map::new())));
    }

    Ok(Value::String(text.into_owned()))
}
