//! HTTP transport used by the probes
//!
//! A transport performs one request, optionally through a proxy, and reports
//! what happens on the wire as a sequence of [`TransportEvent`]s. The probe
//! executor in [`request`](crate::proxy::request) turns those events into a
//! single outcome.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::proxy::models::{Headers, ProbeError, Protocol, ProxyAuth};
use crate::proxy::normalize::ProxyRoute;
use crate::proxy::socks;

/// A fully resolved request handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub proxy: Option<ProxyRoute>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
    pub accept_invalid_certs: bool,
    pub local_address: Option<IpAddr>,
}

/// Something that happened while performing a request
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Status line and headers arrived
    Response { status: u16, headers: Headers },
    /// A chunk of the response body
    Data(Bytes),
    /// The body is complete
    End,
    /// The request failed
    Error(ProbeError),
    /// The underlying connection went away
    Close,
}

/// Where a transport reports events
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Capability to issue HTTP requests, optionally routed through a proxy
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request, reporting events to `events`.
    ///
    /// Implementations may keep reporting after a terminal event (an error
    /// followed by a close, say); consumers must settle on the first one.
    async fn send(&self, request: TransportRequest, events: EventSink);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: TransportRequest, events: EventSink) {
        (**self).send(request, events).await
    }
}

/// Transport backed by reqwest, with HTTP, HTTPS and SOCKS5 proxy support.
///
/// SOCKS4 routes, which reqwest cannot build, go through [`socks`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport;

impl ReqwestTransport {
    pub fn new() -> Self {
        Self
    }

    /// Create a reqwest client for the request's proxy and TLS settings
    fn create_client(&self, request: &TransportRequest) -> Result<Client, ProbeError> {
        let mut builder = Client::builder()
            .danger_accept_invalid_certs(request.accept_invalid_certs)
            .local_address(request.local_address);

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match &request.proxy {
            Some(route) => builder.proxy(create_proxy(route)?),
            None => builder.no_proxy(),
        };

        builder
            .build()
            .map_err(|e| ProbeError::new(e.to_string(), error_code(&e)))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest, events: EventSink) {
        debug!(
            "{} {} via {}",
            request.method,
            request.url,
            request
                .proxy
                .as_ref()
                .map_or_else(|| "direct".to_string(), ProxyRoute::url)
        );

        if let Some(route) = request
            .proxy
            .as_ref()
            .filter(|route| route.protocol == Protocol::Socks4)
        {
            socks::send(&request, route, &events).await;
            return;
        }

        let client = match self.create_client(&request) {
            Ok(client) => client,
            Err(error) => {
                let _ = events.send(TransportEvent::Error(error));
                return;
            }
        };

        let mut builder = client.request(request.method.clone(), request.url.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let mut response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(ProbeError::new(
                    e.to_string(),
                    error_code(&e),
                )));
                let _ = events.send(TransportEvent::Close);
                return;
            }
        };

        let _ = events.send(TransportEvent::Response {
            status: response.status().as_u16(),
            headers: collect_headers(response.headers()),
        });

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    // Receiver gone means the outcome is already settled.
                    if events.send(TransportEvent::Data(chunk)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = events.send(TransportEvent::End);
                    break;
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(ProbeError::new(
                        e.to_string(),
                        error_code(&e),
                    )));
                    break;
                }
            }
        }

        let _ = events.send(TransportEvent::Close);
    }
}

fn create_proxy(route: &ProxyRoute) -> Result<reqwest::Proxy, ProbeError> {
    let url = route.url();
    let proxy = reqwest::Proxy::all(&url).map_err(|e| {
        ProbeError::new(
            format!("Unsupported proxy {}: {}", url, e),
            "UNSUPPORTED_PROTOCOL",
        )
    })?;

    match &route.auth {
        Some(ProxyAuth::Credentials { username, password }) => {
            Ok(proxy.basic_auth(username, password))
        }
        Some(ProxyAuth::Header(raw)) => {
            let value = HeaderValue::from_str(raw)
                .map_err(|e| ProbeError::new(e.to_string(), "INVALID_PROXY_AUTH"))?;
            Ok(proxy.custom_http_auth(value))
        }
        None => Ok(proxy),
    }
}

/// Flatten a header map, joining repeated headers with ", "
pub(crate) fn collect_headers(map: &HeaderMap) -> Headers {
    collect_header_pairs(map.iter().map(|(name, value)| (name.as_str(), value.as_bytes())))
}

/// Flatten raw header pairs, joining repeated headers with ", "
pub(crate) fn collect_header_pairs<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in pairs {
        let value = String::from_utf8_lossy(value).into_owned();
        headers
            .entry(name.to_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}

/// Derive an error code from the innermost I/O error, if any
fn error_code(err: &reqwest::Error) -> String {
    if let Some(code) = source_io_code(err) {
        return code.to_string();
    }

    if err.is_timeout() {
        "ETIMEDOUT".to_string()
    } else if err.is_connect() {
        "ECONNFAILED".to_string()
    } else {
        "EREQUEST".to_string()
    }
}

/// Code of the first I/O error along an error's source chain
pub(crate) fn source_io_code(err: &(dyn std::error::Error + 'static)) -> Option<&'static str> {
    let mut source = Some(err);
    while let Some(inner) = source {
        if let Some(code) = inner
            .downcast_ref::<io::Error>()
            .and_then(|io_err| io_error_code(io_err.kind()))
        {
            return Some(code);
        }
        source = inner.source();
    }
    None
}

pub(crate) fn io_error_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
        io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        io::ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
        io::ErrorKind::NotConnected => Some("ENOTCONN"),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderName;

    #[test]
    fn test_collect_headers_joins_repeats() {
        let mut map = HeaderMap::new();
        map.append(
            HeaderName::from_static("via"),
            HeaderValue::from_static("1.1 first"),
        );
        map.append(
            HeaderName::from_static("via"),
            HeaderValue::from_static("1.1 second"),
        );
        map.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );

        let headers = collect_headers(&map);
        assert_eq!(headers.get("via").unwrap(), "1.1 first, 1.1 second");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_io_error_codes() {
        assert_eq!(
            io_error_code(io::ErrorKind::ConnectionRefused),
            Some("ECONNREFUSED")
        );
        assert_eq!(io_error_code(io::ErrorKind::TimedOut), Some("ETIMEDOUT"));
        assert_eq!(io_error_code(io::ErrorKind::Other), None);
    }

    #[test]
    fn test_create_proxy_with_credentials() {
        let route = ProxyRoute {
            protocol: crate::proxy::models::Protocol::Http,
            host: "127.0.0.1".to_string(),
            port: 3128,
            auth: Some(ProxyAuth::credentials(
                "user".to_string(),
                "pass".to_string(),
            )),
        };
        assert!(create_proxy(&route).is_ok());
    }

    #[test]
    fn test_create_proxy_rejects_bad_auth_header() {
        let route = ProxyRoute {
            protocol: crate::proxy::models::Protocol::Http,
            host: "127.0.0.1".to_string(),
            port: 3128,
            auth: Some(ProxyAuth::Header("Basic\nbroken".to_string())),
        };
        let err = create_proxy(&route).unwrap_err();
        assert_eq!(err.code, "INVALID_PROXY_AUTH");
    }

    #[tokio::test]
    async fn test_unreachable_proxy_reports_error() {
        let route = ProxyRoute {
            protocol: crate::proxy::models::Protocol::Http,
            host: "127.0.0.1".to_string(),
            port: 9,
            auth: None,
        };
        let request = TransportRequest {
            method: Method::GET,
            url: Url::parse("http://127.0.0.1:9/check").unwrap(),
            proxy: Some(route),
            body: None,
            timeout: Some(Duration::from_secs(2)),
            accept_invalid_certs: false,
            local_address: None,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        ReqwestTransport::new().send(request, tx).await;

        match rx.recv().await {
            Some(TransportEvent::Error(error)) => assert!(!error.code.is_empty()),
            other => panic!("expected an error event, got {:?}", other),
        }
    }
}
