//! Outbound HTTP used by directors themselves (token exchange, asset
//! download, task status polling), as opposed to the proxied upstream call.

use std::fmt::Display;
use std::net::IpAddr;
use std::time::Duration;

use aigate_provider_core::{ProviderError, ProviderResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use url::{Host, Url};

#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct AuxiliaryResponse {
    pub status: u16,
    pub body: Bytes,
}

#[async_trait]
pub trait AuxiliaryClient: Send + Sync {
    async fn fetch(&self, url: &str) -> ProviderResult<FetchedAsset>;

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> ProviderResult<AuxiliaryResponse>;

    /// A GET against a configured vendor endpoint. Non-2xx is not an error.
    async fn get(&self, url: &str, headers: &[(String, String)]) -> ProviderResult<AuxiliaryResponse>;
}

/// Rejects asset URLs a client must not make the gateway fetch: anything
/// but http(s), and hosts on loopback, private or link-local networks.
pub fn check_asset_url(raw: &str) -> ProviderResult<Url> {
    let url = Url::parse(raw)
        .map_err(|err| ProviderError::InvalidRequest(format!("asset url {raw}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProviderError::InvalidRequest(format!(
            "asset url scheme {} is not allowed",
            url.scheme()
        )));
    }
    let internal = match url.host() {
        None => true,
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => is_internal(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_internal(IpAddr::V6(ip)),
    };
    if internal {
        return Err(ProviderError::InvalidRequest(format!(
            "asset host {} is not allowed",
            url.host_str().unwrap_or_default()
        )));
    }
    Ok(url)
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
                // 100.64.0.0/10
                || (ip.octets()[0] == 100 && ip.octets()[1] & 0xc0 == 64)
        }
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(mapped) => is_internal(IpAddr::V4(mapped)),
            None => {
                let first = ip.segments()[0];
                ip.is_loopback()
                    || ip.is_unspecified()
                    || first & 0xfe00 == 0xfc00
                    || first & 0xffc0 == 0xfe80
            }
        },
    }
}

/// Collects a body, failing once it grows past `limit` bytes.
pub(crate) async fn read_limited<S, E>(mut stream: S, limit: usize, url: &str) -> ProviderResult<Bytes>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut data = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| ProviderError::Upstream(format!("fetch {url}: {err}")))?;
        if data.len() + chunk.len() > limit {
            return Err(too_large(url, limit));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data.freeze())
}

fn too_large(url: &str, limit: usize) -> ProviderError {
    ProviderError::InvalidRequest(format!("asset {url} exceeds {limit} bytes"))
}

#[derive(Clone)]
pub struct WreqAuxiliaryClient {
    client: wreq::Client,
    max_asset_bytes: usize,
}

impl WreqAuxiliaryClient {
    pub fn new(proxy: Option<&str>, timeout: Duration, max_asset_bytes: usize) -> ProviderResult<Self> {
        Ok(Self {
            client: build_client(normalize_proxy(proxy).as_deref(), timeout)?,
            max_asset_bytes,
        })
    }
}

#[async_trait]
impl AuxiliaryClient for WreqAuxiliaryClient {
    async fn fetch(&self, url: &str) -> ProviderResult<FetchedAsset> {
        let target = check_asset_url(url)?;
        let response = self
            .client
            .get(target.as_str())
            .send()
            .await
            .map_err(|err| ProviderError::Upstream(format!("fetch {url}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::InvalidRequest(format!(
                "fetch {url}: status {}",
                status.as_u16()
            )));
        }
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        if response
            .content_length()
            .is_some_and(|length| length > self.max_asset_bytes as u64)
        {
            return Err(too_large(url, self.max_asset_bytes));
        }
        let data = read_limited(response.bytes_stream(), self.max_asset_bytes, url).await?;
        Ok(FetchedAsset { content_type, data })
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> ProviderResult<AuxiliaryResponse> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|err| ProviderError::Upstream(format!("post {url}: {err}")))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Upstream(format!("post {url}: {err}")))?;
        Ok(AuxiliaryResponse { status, body })
    }

    async fn get(&self, url: &str, headers: &[(String, String)]) -> ProviderResult<AuxiliaryResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Upstream(format!("get {url}: {err}")))?;
        let status = response.status().as_u16();
        let body = read_limited(response.bytes_stream(), self.max_asset_bytes, url).await?;
        Ok(AuxiliaryResponse { status, body })
    }
}

fn build_client(proxy: Option<&str>, timeout: Duration) -> ProviderResult<wreq::Client> {
    let mut builder = wreq::Client::builder().timeout(timeout);
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url)
                .map_err(|err| ProviderError::InvalidConfig(format!("proxy: {err}")))?,
        );
    }
    builder
        .build()
        .map_err(|err| ProviderError::InvalidConfig(format!("http client: {err}")))
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn only_public_http_assets_are_allowed() {
        for ok in ["https://img.example.com/cat.png", "http://8.8.8.8/a.png", "https://[2001:db8::1]/x"] {
            assert!(check_asset_url(ok).is_ok(), "{ok}");
        }
        for bad in [
            "file:///etc/passwd",
            "gopher://img.example.com/",
            "http://localhost:8080/admin",
            "http://127.0.0.1/",
            "http://10.0.0.5/",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]/",
            "http://[::ffff:192.168.1.1]/",
            "http://[fd00::1]/",
            "not a url",
        ] {
            let err = check_asset_url(bad).unwrap_err();
            assert!(matches!(err, ProviderError::InvalidRequest(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn body_within_limit_is_collected() {
        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"de")),
        ]);
        let data = read_limited(chunks, 5, "https://a.example/x").await.unwrap();
        assert_eq!(&data[..], b"abcde");
    }

    #[tokio::test]
    async fn oversize_body_is_rejected_midway() {
        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]);
        let err = read_limited(chunks, 5, "https://a.example/x").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
        assert!(err.to_string().contains("exceeds 5 bytes"));
    }
}
