//! HTTP connection handling for imposters.
//!
//! Each accepted connection is served by hyper's http1 server. Requests are
//! collected in full, turned into [`HttpRequest`] and resolved by the
//! imposter; the resulting [`Reply`] becomes the hyper response.

use super::core::Imposter;
use crate::message::{Fault, HttpRequest, HttpResponse, Reply, Request};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Returned to hyper to drop the connection without a response.
#[derive(Debug, thiserror::Error)]
#[error("imposter closed the connection")]
pub struct ConnectionClosed;

/// Serve one HTTP connection until the client leaves or the imposter stops.
pub(crate) async fn serve_connection(imposter: Arc<Imposter>, stream: TcpStream, peer: SocketAddr) {
    let port = imposter.port();
    let io = TokioIo::new(stream);
    let service_imposter = Arc::clone(&imposter);
    let service = service_fn(move |req| {
        let imposter = Arc::clone(&service_imposter);
        async move { handle_imposter_request(req, imposter, peer).await }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = imposter.shutdown_token().cancelled() => {
            // finish the request in flight, then close
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = result {
        debug!("Connection error on port {}: {}", port, e);
    }
}

/// Handle a request to an imposter
pub async fn handle_imposter_request(
    req: hyper::Request<Incoming>,
    imposter: Arc<Imposter>,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, ConnectionClosed> {
    let request = to_http_request(req, client_addr).await;
    let reply = imposter.resolve(Request::Http(request)).await;
    render_reply(reply)
}

async fn to_http_request(req: hyper::Request<Incoming>, client_addr: SocketAddr) -> HttpRequest {
    let (parts, body) = req.into_parts();

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in &parts.headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(header_to_title_case(name.as_str()))
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    // Always collect the body; predicates and the ledger need it
    let body = match body.collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(e) => {
            debug!("Failed to read request body from {}: {}", client_addr, e);
            String::new()
        }
    };

    HttpRequest {
        request_from: client_addr.to_string(),
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parse_query_string(parts.uri.query().unwrap_or("")),
        headers,
        body,
    }
}

/// Parse query string into a map, URL-decoding keys and values.
pub fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let decoded_key = urlencoding::decode(key).unwrap_or_default().into_owned();
            let decoded_value = urlencoding::decode(value).unwrap_or_default().into_owned();
            (decoded_key, decoded_value)
        })
        .collect()
}

/// `content-type` -> `Content-Type`
pub fn header_to_title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn render_reply(reply: Reply) -> Result<Response<Full<Bytes>>, ConnectionClosed> {
    match reply {
        Reply::Http(response) => Ok(build_response(&response)),
        Reply::Fault(fault) => handle_fault_response(fault),
        Reply::Close => Err(ConnectionClosed),
        // stream replies never reach an http imposter; answer with an empty 200
        Reply::Bytes(_) => Ok(build_response(&HttpResponse::default())),
    }
}

/// Build the hyper response for a resolved reply.
pub fn build_response(response: &HttpResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        // hyper frames the body itself
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Full::new(Bytes::from(response.body.clone())))
        .unwrap_or_else(|_| {
            // invalid header name or value in the stub
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from_static(b"invalid response headers")))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
        })
}

/// Faults over http: a reset drops the connection, random data is sent as a
/// garbage 502 before closing.
fn handle_fault_response(fault: Fault) -> Result<Response<Full<Bytes>>, ConnectionClosed> {
    match fault {
        Fault::ConnectionResetByPeer => Err(ConnectionClosed),
        Fault::RandomDataThenClose => {
            let garbage: Vec<u8> = {
                use rand::Rng;
                let mut rng = rand::thread_rng();
                (0..rng.gen_range(16..=64)).map(|_| rng.gen()).collect()
            };
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .header("x-rift-fault", fault.as_str())
                .header("connection", "close")
                .body(Full::new(Bytes::from(garbage)))
                .map_err(|_| ConnectionClosed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_string_decodes() {
        let query = parse_query_string("q=a%2Cb&flag&name=J%C3%B6rg");
        assert_eq!(query["q"], "a,b");
        assert_eq!(query["flag"], "");
        assert_eq!(query["name"], "Jörg");
        assert!(parse_query_string("").is_empty());
    }

    #[test]
    fn test_header_to_title_case() {
        assert_eq!(header_to_title_case("content-type"), "Content-Type");
        assert_eq!(header_to_title_case("x-request-id"), "X-Request-Id");
        assert_eq!(header_to_title_case("host"), "Host");
    }

    #[test]
    fn test_render_reply() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Stub".to_string(), "1".to_string());
        headers.insert("Content-Length".to_string(), "999".to_string());
        let response = render_reply(Reply::Http(HttpResponse {
            status_code: 418,
            headers,
            body: "teapot".to_string(),
        }))
        .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers()["x-stub"], "1");
        assert!(response.headers().get("content-length").is_none());

        assert!(render_reply(Reply::Close).is_err());
        assert!(render_reply(Reply::Fault(Fault::ConnectionResetByPeer)).is_err());
        let garbage = render_reply(Reply::Fault(Fault::RandomDataThenClose)).unwrap();
        assert_eq!(garbage.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(garbage.headers()["x-rift-fault"], "RANDOM_DATA_THEN_CLOSE");
    }
}
