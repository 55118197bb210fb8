use bytes::Bytes;
use serde::Serialize;

use crate::errors::{ProviderError, ProviderResult};
use crate::headers::{Headers, header_get, header_set};

/// The request as it will be sent upstream. Filters mutate it in place.
#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn url(&self) -> ProviderResult<String> {
        if self.host.trim().is_empty() {
            return Err(ProviderError::InvalidConfig(
                "outbound host is empty".to_string(),
            ));
        }
        let scheme = if self.scheme.is_empty() {
            "https"
        } else {
            self.scheme.as_str()
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let mut url = format!("{scheme}://{}{path}", self.host);
        if !self.query.is_empty() {
            let encoded = serde_urlencoded::to_string(&self.query)
                .map_err(|err| ProviderError::InvalidRequest(format!("encode query: {err}")))?;
            url.push('?');
            url.push_str(&encoded);
        }
        Ok(url)
    }

    pub fn content_type(&self) -> Option<&str> {
        header_get(&self.headers, "content-type")
    }

    pub fn set_json_body<T: Serialize>(&mut self, value: &T) -> ProviderResult<()> {
        let body = serde_json::to_vec(value)
            .map_err(|err| ProviderError::InvalidConfig(format!("encode body: {err}")))?;
        self.body = Bytes::from(body);
        header_set(&mut self.headers, "content-type", "application/json");
        Ok(())
    }
}

/// Upstream status and headers as seen by response filters.
#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        header_get(&self.headers, "content-type")
    }
}

/// A response produced by a request filter without calling upstream.
#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl LocalResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> ProviderResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|err| ProviderError::InvalidConfig(format!("encode response: {err}")))?;
        Ok(Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_parts_and_encodes_query() {
        let req = OutboundRequest {
            method: "GET".into(),
            scheme: String::new(),
            host: "api.example.com".into(),
            path: "v1/models".into(),
            query: vec![("a".into(), "b c".into()), ("a".into(), "d".into())],
            ..Default::default()
        };
        assert_eq!(req.url().unwrap(), "https://api.example.com/v1/models?a=b+c&a=d");
    }

    #[test]
    fn empty_host_is_a_config_error() {
        let req = OutboundRequest::default();
        assert_eq!(req.url().unwrap_err().status(), 500);
    }
}
