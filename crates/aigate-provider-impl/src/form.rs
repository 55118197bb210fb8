//! Reading `application/x-www-form-urlencoded` and `multipart/form-data`
//! request bodies. Bodies are fully buffered before filters run, so parsing
//! works on a byte slice.

use std::ops::Range;

use aigate_provider_core::{ProviderError, ProviderResult};
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone)]
pub struct FormPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormPart {
    pub fn is_file(&self) -> bool {
        self.file_name.is_some()
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

fn mime(content_type: Option<&str>) -> String {
    content_type
        .and_then(|value| value.split(';').next())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_multipart(content_type: Option<&str>) -> bool {
    mime(content_type) == "multipart/form-data"
}

pub fn is_urlencoded(content_type: Option<&str>) -> bool {
    mime(content_type) == "application/x-www-form-urlencoded"
}

fn invalid(msg: &str) -> ProviderError {
    ProviderError::InvalidRequest(format!("multipart: {msg}"))
}

fn boundary(content_type: &str) -> ProviderResult<&str> {
    content_type
        .split(';')
        .map(str::trim)
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim().eq_ignore_ascii_case("boundary").then_some(value.trim())
        })
        .map(|value| {
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
        })
        .find(|value| !value.is_empty())
        .ok_or_else(|| invalid("boundary is missing"))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn skip_newline(bytes: &[u8], cursor: usize) -> usize {
    if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
        cursor + 2
    } else if bytes.get(cursor..cursor + 1) == Some(b"\n") {
        cursor + 1
    } else {
        cursor
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

pub fn parse_multipart(content_type: &str, body: &Bytes) -> ProviderResult<Vec<FormPart>> {
    Ok(multipart_spans(content_type, body)?
        .into_iter()
        .map(|(part, _)| part)
        .collect())
}

/// Parts with the byte range of their data inside `body`.
fn multipart_spans(content_type: &str, body: &Bytes) -> ProviderResult<Vec<(FormPart, Range<usize>)>> {
    let marker = format!("--{}", boundary(content_type)?);
    let delimiter = format!("\r\n{marker}");
    let bytes = body.as_ref();

    let mut cursor = find(bytes, marker.as_bytes(), 0)
        .ok_or_else(|| invalid("body has no boundary marker"))?
        + marker.len();
    let mut parts = Vec::new();

    while bytes.get(cursor..cursor + 2) != Some(b"--") {
        cursor = skip_newline(bytes, cursor);
        let (headers_end, separator) = match find(bytes, b"\r\n\r\n", cursor) {
            Some(idx) => (idx, 4),
            None => (
                find(bytes, b"\n\n", cursor).ok_or_else(|| invalid("part has no header end"))?,
                2,
            ),
        };

        let mut name = None;
        let mut file_name = None;
        let mut part_type = None;
        for line in String::from_utf8_lossy(&bytes[cursor..headers_end]).lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for item in value.split(';').map(str::trim) {
                    if let Some(v) = item.strip_prefix("name=") {
                        name = Some(unquote(v).to_string());
                    } else if let Some(v) = item.strip_prefix("filename=") {
                        file_name = Some(unquote(v).to_string());
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") && !value.is_empty() {
                part_type = Some(value.to_string());
            }
        }

        let data_start = headers_end + separator;
        let data_end = find(bytes, delimiter.as_bytes(), data_start)
            .ok_or_else(|| invalid("part has no closing boundary"))?;
        parts.push((
            FormPart {
                name: name.ok_or_else(|| invalid("part has no name"))?,
                file_name,
                content_type: part_type,
                data: body.slice(data_start..data_end),
            },
            data_start..data_end,
        ));
        cursor = data_end + delimiter.len();
    }

    Ok(parts)
}

/// The first non-file value of field `name` in a form body; `Ok(None)` for
/// other content types.
pub fn form_text_field(
    content_type: Option<&str>,
    body: &Bytes,
    name: &str,
) -> ProviderResult<Option<String>> {
    if is_urlencoded(content_type) {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|err| ProviderError::InvalidRequest(format!("form body: {err}")))?;
        return Ok(pairs.into_iter().find(|(key, _)| key == name).map(|(_, value)| value));
    }
    if let Some(content_type) = content_type.filter(|ct| is_multipart(Some(ct))) {
        let parts = parse_multipart(content_type, body)?;
        return Ok(parts
            .iter()
            .find(|part| part.name == name && !part.is_file())
            .and_then(|part| part.text().map(str::to_string)));
    }
    Ok(None)
}

/// Replaces the value of text field `name`, leaving every other byte of the
/// body as sent. `Ok(None)` when the body is not a form or has no such field.
pub fn replace_form_text_field(
    content_type: Option<&str>,
    body: &Bytes,
    name: &str,
    value: &str,
) -> ProviderResult<Option<Bytes>> {
    if is_urlencoded(content_type) {
        let mut pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|err| ProviderError::InvalidRequest(format!("form body: {err}")))?;
        let Some(pair) = pairs.iter_mut().find(|(key, _)| key == name) else {
            return Ok(None);
        };
        pair.1 = value.to_string();
        let encoded = serde_urlencoded::to_string(&pairs)
            .map_err(|err| ProviderError::InvalidRequest(format!("form body: {err}")))?;
        return Ok(Some(Bytes::from(encoded)));
    }
    let Some(content_type) = content_type.filter(|ct| is_multipart(Some(ct))) else {
        return Ok(None);
    };
    let Some(span) = multipart_spans(content_type, body)?
        .into_iter()
        .find(|(part, _)| part.name == name && !part.is_file())
        .map(|(_, span)| span)
    else {
        return Ok(None);
    };
    let mut out = BytesMut::with_capacity(body.len() + value.len());
    out.extend_from_slice(&body[..span.start]);
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(&body[span.end..]);
    Ok(Some(out.freeze()))
}
