//! `multipart/form-data` decoding over raw body bytes.
//!
//! [`decode`] is a pure function: the same bytes and boundary always produce
//! the same [`FormData`]. Parts are split on `--boundary`, headers are parsed
//! by hand, and text fields are merged into a nested JSON object using
//! dotted / bracketed names (`user.tags[0]`).

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

const HEADER_END: &[u8] = b"\r\n\r\n";
const DEFAULT_MIME: &str = "application/octet-stream";

/// Bracket indices above this are ignored rather than allocating a huge array.
const MAX_ARRAY_INDEX: usize = 1024;

/// A file part decoded from a multipart body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadedFile {
    pub filename: String,
    pub mime_type: String,
    pub size: usize,
    #[serde(skip)]
    pub data: Bytes,
}

/// The result of decoding a multipart body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    /// Text fields, nested according to their dotted / bracketed names.
    pub fields: Map<String, Value>,
    /// File parts keyed by field name. A later part with the same name replaces an earlier one.
    pub files: HashMap<String, UploadedFile>,
}

/// Decodes a multipart body delimited by `boundary`.
///
/// Malformed parts (no header terminator, no `form-data` disposition, no
/// field name) are skipped.
///
/// # Examples
///
/// ```
/// use handwire::multipart::decode;
///
/// let body = b"--XyZ\r\n\
/// Content-Disposition: form-data; name=\"name\"\r\n\r\n\
/// John\r\n\
/// --XyZ\r\n\
/// Content-Disposition: form-data; name=\"avatar\"; filename=\"a.png\"\r\n\
/// Content-Type: image/png\r\n\r\n\
/// \x89PNG\r\n\
/// --XyZ--\r\n";
///
/// let form = decode(body, "XyZ");
/// assert_eq!(form.fields["name"], "John");
/// assert_eq!(form.files["avatar"].filename, "a.png");
/// assert_eq!(form.files["avatar"].size, 4);
/// ```
pub fn decode(body: &[u8], boundary: &str) -> FormData {
    let delimiter = format!("--{boundary}");
    let mut form = FormData::default();

    for part in split_parts(body, delimiter.as_bytes()) {
        let Some(header_end) = find(part, HEADER_END) else {
            continue;
        };
        let headers = String::from_utf8_lossy(&part[..header_end]);
        let payload = &part[header_end + HEADER_END.len()..];
        let payload = payload.strip_suffix(b"\r\n").unwrap_or(payload);

        let Some(disposition) = PartHeaders::parse(&headers) else {
            continue;
        };

        match disposition.filename {
            Some(filename) if !payload.is_empty() => {
                form.files.insert(
                    disposition.name,
                    UploadedFile {
                        filename,
                        mime_type: disposition.mime_type,
                        size: payload.len(),
                        data: Bytes::copy_from_slice(payload),
                    },
                );
            }
            // A file input submitted without a file.
            Some(_) => {}
            None => {
                let text = String::from_utf8_lossy(payload);
                set_nested(&mut form.fields, &disposition.name, parse_literal(&text));
            }
        }
    }

    form
}

/// Extracts the boundary token from a `Content-Type` header value.
///
/// ```
/// use handwire::multipart::boundary;
///
/// assert_eq!(boundary("multipart/form-data; boundary=abc123"), Some("abc123"));
/// assert_eq!(boundary("multipart/form-data; boundary=\"q r\"; x=1"), Some("q r"));
/// assert_eq!(boundary("multipart/form-data"), None);
/// ```
pub fn boundary(content_type: &str) -> Option<&str> {
    let lower = content_type.to_ascii_lowercase();
    let start = lower.find("boundary=")? + "boundary=".len();
    let rest = &content_type[start..];
    let value = rest.split(';').next().unwrap_or_default().trim();
    let value = value.trim_matches('"');
    (!value.is_empty()).then_some(value)
}

// Returns the byte ranges strictly between consecutive delimiters, dropping
// the preamble before the first and the epilogue after the last.
fn split_parts<'a>(body: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut positions = Vec::new();
    let mut offset = 0;
    while let Some(pos) = find(&body[offset..], delimiter) {
        positions.push(offset + pos);
        offset += pos + delimiter.len();
    }

    positions
        .windows(2)
        .map(|w| &body[w[0] + delimiter.len()..w[1]])
        .filter(|part| !part.is_empty())
        .collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug)]
struct PartHeaders {
    name: String,
    filename: Option<String>,
    mime_type: String,
}

impl PartHeaders {
    fn parse(block: &str) -> Option<Self> {
        let mut name = None;
        let mut filename = None;
        let mut mime_type = None;

        for line in block.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("content-disposition") {
                let mut params = value.split(';').map(str::trim);
                if !params
                    .next()
                    .is_some_and(|kind| kind.eq_ignore_ascii_case("form-data"))
                {
                    return None;
                }
                for param in params {
                    let Some((k, v)) = param.split_once('=') else {
                        continue;
                    };
                    let v = v.trim().trim_matches('"');
                    match k.trim().to_ascii_lowercase().as_str() {
                        "name" => name = Some(v.to_owned()),
                        "filename" if !v.is_empty() => filename = Some(v.to_owned()),
                        _ => {}
                    }
                }
            } else if key.eq_ignore_ascii_case("content-type") {
                let value = value.trim();
                if !value.is_empty() {
                    mime_type = Some(value.to_owned());
                }
            }
        }

        Some(Self {
            name: name.filter(|n| !n.is_empty())?,
            filename,
            mime_type: mime_type.unwrap_or_else(|| DEFAULT_MIME.to_owned()),
        })
    }
}

// Numbers, booleans, null, and JSON fragments become structured values;
// everything else stays a string.
fn parse_literal(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

fn set_nested(fields: &mut Map<String, Value>, path: &str, value: Value) {
    let keys: Vec<&str> = path
        .split(['.', '[', ']'])
        .filter(|k| !k.is_empty())
        .collect();
    let Some((first, rest)) = keys.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.insert((*first).to_owned(), value);
        return;
    }

    let slot = fields.entry(*first).or_insert(Value::Null);
    reset_if_empty(slot, rest[0]);
    assign(slot, rest, value);
}

fn assign(target: &mut Value, keys: &[&str], value: Value) {
    let Some((key, rest)) = keys.split_first() else {
        return;
    };

    let Some(slot) = child_slot(target, key) else {
        return;
    };

    if rest.is_empty() {
        *slot = value;
    } else {
        reset_if_empty(slot, rest[0]);
        assign(slot, rest, value);
    }
}

// Returns the slot for `key` inside an object or array container, creating
// it as `null` if missing. Scalars cannot hold children.
fn child_slot<'a>(target: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    match target {
        Value::Object(map) => Some(map.entry(key).or_insert(Value::Null)),
        Value::Array(items) => {
            let index = key.parse::<usize>().ok().filter(|i| *i <= MAX_ARRAY_INDEX)?;
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            items.get_mut(index)
        }
        _ => None,
    }
}

// A falsy slot is replaced by a fresh container: an array when the next key
// is an index, an object otherwise.
fn reset_if_empty(slot: &mut Value, next_key: &str) {
    let falsy = match slot {
        Value::Null => true,
        Value::Bool(b) => !*b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Array(_) | Value::Object(_) => false,
    };
    if falsy {
        *slot = if next_key.bytes().all(|b| b.is_ascii_digit()) {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_part(boundary: &str, name: &str, value: &str) -> String {
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        )
    }

    fn body(boundary: &str, parts: &[String]) -> Vec<u8> {
        let mut out = String::from("this is a preamble\r\n");
        for p in parts {
            out.push_str(p);
        }
        out.push_str(&format!("--{boundary}--\r\nepilogue"));
        out.into_bytes()
    }

    #[test]
    fn text_and_file_parts() {
        let b = "----WebKitFormBoundary7MA4YWxkTrZu0gW";
        let file = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"avatar\"; filename=\"a.png\"\r\nContent-Type: image/png\r\n\r\nPNGDATA\r\n"
        );
        let raw = body(b, &[text_part(b, "name", "John"), file]);

        let form = decode(&raw, b);
        assert_eq!(Value::Object(form.fields), json!({"name": "John"}));
        let avatar = &form.files["avatar"];
        assert_eq!(avatar.filename, "a.png");
        assert_eq!(avatar.mime_type, "image/png");
        assert_eq!(avatar.size, 7);
        assert_eq!(&avatar.data[..], b"PNGDATA");
    }

    #[test]
    fn binary_payload_keeps_inner_crlf() {
        let b = "bnd";
        let mut raw = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.bin\"\r\n\r\n"
        )
        .into_bytes();
        raw.extend_from_slice(&[0x00, 0xff, b'\r', b'\n', 0x10]);
        raw.extend_from_slice(format!("\r\n--{b}--\r\n").as_bytes());

        let form = decode(&raw, b);
        let f = &form.files["f"];
        assert_eq!(&f.data[..], &[0x00, 0xff, b'\r', b'\n', 0x10]);
        assert_eq!(f.mime_type, DEFAULT_MIME);
    }

    #[test]
    fn nested_names_build_objects_and_arrays() {
        let b = "B";
        let raw = body(
            b,
            &[
                text_part(b, "user.name", "Ada"),
                text_part(b, "user.tags[0]", "math"),
                text_part(b, "user.tags[1]", "code"),
                text_part(b, "fonts[0][id]", "7"),
                text_part(b, "fonts[0][bold]", "true"),
            ],
        );
        let form = decode(&raw, b);
        assert_eq!(
            Value::Object(form.fields),
            json!({
                "user": {"name": "Ada", "tags": ["math", "code"]},
                "fonts": [{"id": 7, "bold": true}]
            })
        );
    }

    #[test]
    fn sparse_indices_are_null_filled() {
        let b = "B";
        let raw = body(b, &[text_part(b, "list[2]", "x")]);
        let form = decode(&raw, b);
        assert_eq!(form.fields["list"], json!([null, null, "x"]));
    }

    #[test]
    fn literal_values_are_parsed_when_possible() {
        let b = "B";
        let raw = body(
            b,
            &[
                text_part(b, "n", "42"),
                text_part(b, "obj", r#"{"a":1}"#),
                text_part(b, "s", "not json"),
            ],
        );
        let form = decode(&raw, b);
        assert_eq!(form.fields["n"], json!(42));
        assert_eq!(form.fields["obj"], json!({"a": 1}));
        assert_eq!(form.fields["s"], json!("not json"));
    }

    #[test]
    fn malformed_parts_are_skipped() {
        let b = "B";
        let no_name = format!("--{b}\r\nContent-Disposition: form-data\r\n\r\nvalue\r\n");
        let no_headers_end = format!("--{b}\r\nContent-Disposition: form-data; name=\"x\"");
        let raw = body(b, &[no_name, text_part(b, "ok", "yes"), no_headers_end]);
        let form = decode(&raw, b);
        assert_eq!(Value::Object(form.fields), json!({"ok": "yes"}));
    }

    #[test]
    fn empty_file_part_is_dropped() {
        let b = "B";
        let empty = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"e.txt\"\r\n\r\n\r\n"
        );
        let form = decode(&body(b, &[empty]), b);
        assert!(form.files.is_empty());
        assert!(form.fields.is_empty());
    }

    #[test]
    fn decoding_is_deterministic() {
        let b = "B";
        let raw = body(b, &[text_part(b, "a.b[0]", "1"), text_part(b, "c", "d")]);
        assert_eq!(decode(&raw, b), decode(&raw, b));
    }

    #[test]
    fn huge_index_is_ignored() {
        let b = "B";
        let raw = body(b, &[text_part(b, "a[999999999]", "x")]);
        let form = decode(&raw, b);
        assert_eq!(form.fields["a"], json!([]));
    }
}
