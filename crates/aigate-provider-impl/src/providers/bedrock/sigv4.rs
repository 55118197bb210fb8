//! AWS Signature Version 4 over the final, byte-exact request.

use std::collections::BTreeMap;

use aigate_provider_core::Headers;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("sigv4 {0} is required")]
    MissingField(&'static str),
    #[error("sigv4 invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("sigv4 timestamp: {0}")]
    Timestamp(String),
    #[error("sigv4 invalid hmac key")]
    InvalidKey,
}

#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Result<Self, SigningError> {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self, SigningError> {
        const AMZ_FORMAT: &[FormatItem<'_>] =
            format_description!("[year][month][day]T[hour][minute][second]Z");
        const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

        let amz_date = datetime
            .format(AMZ_FORMAT)
            .map_err(|err| SigningError::Timestamp(err.to_string()))?;
        let date = datetime
            .format(DATE_FORMAT)
            .map_err(|err| SigningError::Timestamp(err.to_string()))?;
        Ok(Self { amz_date, date })
    }

    pub fn from_amz_date(amz_date: &str) -> Result<Self, SigningError> {
        let amz_date = amz_date.trim();
        let date = amz_date
            .get(..8)
            .ok_or_else(|| SigningError::Timestamp("amz date must be at least 8 chars".into()))?;
        Ok(Self {
            amz_date: amz_date.to_string(),
            date: date.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

/// Headers to add to the signed request.
#[derive(Debug, Clone)]
pub struct SigV4Headers {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub host: String,
    pub security_token: Option<String>,
}

impl SigV4Headers {
    pub fn into_pairs(self) -> Headers {
        let mut out = vec![
            ("host".to_string(), self.host),
            ("x-amz-date".to_string(), self.amz_date),
            ("x-amz-content-sha256".to_string(), self.content_sha256),
        ];
        if let Some(token) = self.security_token {
            out.push(("x-amz-security-token".to_string(), token));
        }
        out.push(("authorization".to_string(), self.authorization));
        out
    }
}

#[derive(Debug, Clone)]
pub struct SigV4Output {
    pub headers: SigV4Headers,
    pub signed_headers: String,
    pub canonical_request: String,
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self, SigningError> {
        let signer = Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: session_token.filter(|token| !token.trim().is_empty()),
            region: region.into(),
            service: service.into(),
        };
        for (value, field) in [
            (&signer.access_key, "access_key"),
            (&signer.secret_key, "secret_key"),
            (&signer.region, "region"),
            (&signer.service, "service"),
        ] {
            if value.trim().is_empty() {
                return Err(SigningError::MissingField(field));
            }
        }
        Ok(signer)
    }

    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &Headers,
        payload: &[u8],
        timestamp: SigV4Timestamp,
    ) -> Result<SigV4Output, SigningError> {
        let parsed = Url::parse(url).map_err(|err| SigningError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let host = parsed.host_str().ok_or_else(|| SigningError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let payload_hash = sha256_hex(payload);
        let canonical = prepare_headers(
            headers,
            &host,
            &timestamp.amz_date,
            &payload_hash,
            self.session_token.as_deref(),
        );
        let (canonical_headers, signed_headers) = canonical_headers(&canonical);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.trim().to_ascii_uppercase(),
            canonical_uri(&parsed),
            canonical_query(&parsed),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            timestamp.date, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp.amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = self.signature(&timestamp.date, &string_to_sign)?;
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        Ok(SigV4Output {
            headers: SigV4Headers {
                authorization,
                amz_date: timestamp.amz_date,
                content_sha256: payload_hash,
                host,
                security_token: self.session_token.clone(),
            },
            signed_headers,
            canonical_request,
        })
    }

    fn signature(&self, date: &str, string_to_sign: &str) -> Result<String, SigningError> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date)?;
        let k_region = hmac_sha256(&k_date, &self.region)?;
        let k_service = hmac_sha256(&k_region, &self.service)?;
        let k_signing = hmac_sha256(&k_service, "aws4_request")?;
        Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign)?))
    }
}

fn prepare_headers(
    headers: &Headers,
    host: &str,
    amz_date: &str,
    payload_hash: &str,
    session_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = normalize_header_value(value);
        out.entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                if !existing.is_empty() {
                    existing.push(',');
                }
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    out.entry("host".to_string())
        .or_insert_with(|| host.to_string());
    out.insert("x-amz-date".to_string(), amz_date.to_string());
    out.entry("x-amz-content-sha256".to_string())
        .or_insert_with(|| payload_hash.to_string());
    if let Some(token) = session_token {
        out.insert(
            "x-amz-security-token".to_string(),
            normalize_header_value(token),
        );
    }
    out
}

fn canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let mut canonical = String::new();
    for (name, value) in headers {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(value);
        canonical.push('\n');
    }
    let signed = headers.keys().map(String::as_str).collect::<Vec<_>>().join(";");
    (canonical, signed)
}

/// Encodes the already-encoded path once more, as every service but S3
/// expects.
fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        aws_percent_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs = url
        .query_pairs()
        .map(|(name, value)| (aws_percent_encode(&name, true), aws_percent_encode(&value, true)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn aws_percent_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        let unreserved =
            matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~');
        if unreserved || (!encode_slash && byte == b'/') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SigningError::InvalidKey)?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
