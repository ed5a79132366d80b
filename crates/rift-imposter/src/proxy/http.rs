//! HTTP upstream backed by reqwest.

use super::{ProxyError, Upstream, UpstreamReply};
use crate::message::{HttpResponse, Reply, Request};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Headers that describe the connection rather than the message.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // recorded replies must reflect each request, not a stale pooled connection
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

fn target_url(to: &str, path: &str, query: &BTreeMap<String, String>) -> String {
    let mut url = format!("{}{}", to.trim_end_matches('/'), path);
    if !query.is_empty() {
        let encoded: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        url.push('?');
        url.push_str(&encoded.join("&"));
    }
    url
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, to: &str, request: &Request) -> Result<UpstreamReply, ProxyError> {
        let Request::Http(http) = request else {
            return Err(ProxyError::ProtocolMismatch {
                request: "non-http",
                upstream: "http",
            });
        };

        let url = target_url(to, &http.path, &http.query);
        let method = reqwest::Method::from_bytes(http.method.as_bytes())
            .map_err(|_| ProxyError::InvalidTarget(format!("{} {}", http.method, url)))?;
        debug!("Proxy request to: {} {}", method, url);

        let mut builder = self.client.request(method, &url);
        for (key, value) in &http.headers {
            if !is_hop_by_hop(key) {
                builder = builder.header(key, value);
            }
        }
        if !http.body.is_empty() {
            builder = builder.body(http.body.clone());
        }

        let start = Instant::now();
        let response = builder.send().await?;
        let status_code = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let body_bytes = response.bytes().await?;
        let latency = start.elapsed();

        let response = HttpResponse {
            status_code,
            headers,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        };
        Ok(UpstreamReply {
            payload: serde_json::to_value(&response).unwrap_or_default(),
            reply: Reply::Http(response),
            latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url() {
        let mut query = BTreeMap::new();
        assert_eq!(target_url("http://up:80/", "/a", &query), "http://up:80/a");
        query.insert("q".to_string(), "a b".to_string());
        assert_eq!(target_url("http://up:80", "/a", &query), "http://up:80/a?q=a%20b");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("host"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
