//! Single HTTP probe, optionally routed through a proxy

use reqwest::Method;
use serde_json::{Map, Value};
use std::mem;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;

use crate::error::{Result, VerifyError};
use crate::proxy::config::RequestOptions;
use crate::proxy::models::{Headers, ProbeError, ProbeResult};
use crate::proxy::normalize::ProxyRoute;
use crate::proxy::transport::{Transport, TransportEvent, TransportRequest};

/// A decoded response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    /// Parsed JSON for JSON content types, otherwise the body as a string
    pub data: Value,
}

/// A probe request before it is handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    method: Method,
    url: Url,
    proxy: Option<ProxyRoute>,
    data: Option<Map<String, Value>>,
    timeout: Option<Duration>,
    accept_invalid_certs: bool,
    local_address: Option<IpAddr>,
}

impl ProbeRequest {
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| VerifyError::InvalidInput(format!("Invalid URL {}: {}", url, e)))?;

        Ok(Self {
            method,
            url,
            proxy: None,
            data: None,
            timeout: None,
            accept_invalid_certs: false,
            local_address: None,
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    /// Route the request through a proxy
    pub fn via(mut self, route: ProxyRoute) -> Self {
        self.proxy = Some(route);
        self
    }

    pub fn with_options(mut self, options: &RequestOptions) -> Self {
        self.timeout = options.timeout;
        self.accept_invalid_certs = options.accept_invalid_certs;
        self.local_address = options.local_address;
        if options.data.is_some() {
            self.data = options.data.clone();
        }
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    /// Build the transport request, placing `data` in the query string for
    /// GET/DELETE and in a JSON body for POST/PUT
    pub fn to_transport_request(&self) -> TransportRequest {
        let mut url = self.url.clone();
        let mut body = None;

        if let Some(data) = &self.data {
            if self.method == Method::GET || self.method == Method::DELETE {
                let mut pairs = url.query_pairs_mut();
                for (key, value) in data {
                    pairs.append_pair(key, &query_value(value));
                }
            } else if self.method == Method::POST || self.method == Method::PUT {
                body = Some(Value::Object(data.clone()));
            }
        }

        TransportRequest {
            method: self.method.clone(),
            url,
            proxy: self.proxy.clone(),
            body,
            timeout: self.timeout,
            accept_invalid_certs: self.accept_invalid_certs,
            local_address: self.local_address,
        }
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Folds transport events into one outcome.
///
/// The first terminal event (end of body, error or close) settles the
/// outcome; everything after it is ignored.
#[derive(Debug, Default)]
pub(crate) struct ResponseCollector {
    status: Option<u16>,
    headers: Headers,
    body: Vec<u8>,
    settled: bool,
}

impl ResponseCollector {
    /// Feed one event. Returns the outcome exactly once, on the event that
    /// settles it.
    pub(crate) fn handle(
        &mut self,
        event: TransportEvent,
    ) -> Option<std::result::Result<HttpResponse, ProbeError>> {
        if self.settled {
            trace!("Ignoring {:?} after the response settled", event);
            return None;
        }

        let outcome = match event {
            TransportEvent::Response { status, headers } => {
                self.status = Some(status);
                self.headers = headers;
                return None;
            }
            TransportEvent::Data(chunk) => {
                self.body.extend_from_slice(&chunk);
                return None;
            }
            TransportEvent::End => self.finish(),
            TransportEvent::Error(error) => Err(error),
            TransportEvent::Close => Err(ProbeError::new("socket hang up", "ECONNRESET")),
        };

        self.settled = true;
        Some(outcome)
    }

    fn finish(&mut self) -> std::result::Result<HttpResponse, ProbeError> {
        let status = self.status.ok_or_else(|| {
            ProbeError::new("Response ended before its headers arrived", "ECONNRESET")
        })?;

        let text = String::from_utf8_lossy(&self.body).into_owned();
        let is_json = self
            .headers
            .get("content-type")
            .is_some_and(|ct| ct.to_lowercase().contains("application/json"));

        let data = if is_json {
            serde_json::from_str(&text).map_err(|e| ProbeError::json_parse(e.to_string()))?
        } else {
            Value::String(text)
        };

        Ok(HttpResponse {
            status,
            headers: mem::take(&mut self.headers),
            data,
        })
    }
}

/// Perform a request and decode the response.
///
/// Resolves once, with the first outcome the transport settles on.
pub async fn execute<T: Transport + ?Sized>(
    transport: &T,
    request: &ProbeRequest,
) -> std::result::Result<HttpResponse, ProbeError> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let send = transport.send(request.to_transport_request(), tx);
    let collect = async move {
        let mut collector = ResponseCollector::default();
        while let Some(event) = rx.recv().await {
            if let Some(outcome) = collector.handle(event) {
                return outcome;
            }
        }
        Err(ProbeError::new(
            "Connection closed without a response",
            "ECONNRESET",
        ))
    };

    let ((), outcome) = tokio::join!(send, collect);
    outcome
}

/// Perform a request and judge it with `validator`.
///
/// With `include_all` the raw response is kept in the result, whether or not
/// it passed validation.
pub async fn probe<T, V>(
    transport: &T,
    request: &ProbeRequest,
    validator: V,
    include_all: bool,
) -> ProbeResult
where
    T: Transport + ?Sized,
    V: Fn(&HttpResponse) -> std::result::Result<(), ProbeError>,
{
    match execute(transport, request).await {
        Ok(response) => {
            let result = match validator(&response) {
                Ok(()) => ProbeResult::ok(),
                Err(error) => ProbeResult::failed(error),
            };
            if include_all {
                result.with_capture(response.data, response.status, response.headers)
            } else {
                result
            }
        }
        Err(error) => ProbeResult::failed(error),
    }
}

/// Fails responses with a status of 300 or more
pub fn validate_status(response: &HttpResponse) -> std::result::Result<(), ProbeError> {
    if response.status >= 300 {
        return Err(ProbeError::http_status(response.status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::Protocol;
    use crate::proxy::transport::mock::{
        connection_error, json_response, text_response, MockTransport,
    };
    use bytes::Bytes;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_json_body_is_parsed() {
        let transport =
            MockTransport::new(|_| json_response(200, json!({"ip_address": "1.2.3.4"})));
        let request = ProbeRequest::get("http://127.0.0.1:3001/check").unwrap();

        let response = execute(&transport, &request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data, json!({"ip_address": "1.2.3.4"}));
        assert!(response.headers.contains_key("content-type"));
    }

    #[tokio::test]
    async fn test_text_body_stays_text() {
        let transport = MockTransport::new(|_| text_response(200, "<html></html>"));
        let request = ProbeRequest::get("https://www.google.com").unwrap();

        let response = execute(&transport, &request).await.unwrap();
        assert_eq!(response.data, json!("<html></html>"));
    }

    #[tokio::test]
    async fn test_bad_json_is_a_parse_error() {
        let transport = MockTransport::new(|_| {
            let mut headers = Headers::new();
            headers.insert("content-type".to_string(), "application/json".to_string());
            vec![
                TransportEvent::Response { status: 200, headers },
                TransportEvent::Data(Bytes::from_static(b"{not json")),
                TransportEvent::End,
            ]
        });
        let request = ProbeRequest::get("http://127.0.0.1:3001/check").unwrap();

        let error = execute(&transport, &request).await.unwrap_err();
        assert_eq!(error.code, "JSON_PARSE_ERROR");
    }

    #[tokio::test]
    async fn test_chunks_are_joined() {
        let transport = MockTransport::new(|_| {
            vec![
                TransportEvent::Response {
                    status: 200,
                    headers: Headers::new(),
                },
                TransportEvent::Data(Bytes::from_static(b"hello ")),
                TransportEvent::Data(Bytes::from_static(b"world")),
                TransportEvent::End,
            ]
        });
        let request = ProbeRequest::get("http://127.0.0.1/").unwrap();

        let response = execute(&transport, &request).await.unwrap();
        assert_eq!(response.data, json!("hello world"));
    }

    #[test]
    fn test_collector_settles_once() {
        let mut collector = ResponseCollector::default();
        let events = vec![
            TransportEvent::Response {
                status: 200,
                headers: Headers::new(),
            },
            TransportEvent::Data(Bytes::from_static(b"ok")),
            TransportEvent::End,
            TransportEvent::Error(ProbeError::new("read ECONNRESET", "ECONNRESET")),
            TransportEvent::Close,
        ];

        let outcomes: Vec<_> = events
            .into_iter()
            .filter_map(|event| collector.handle(event))
            .collect();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].as_ref().unwrap().data, json!("ok"));
    }

    #[test]
    fn test_collector_error_then_close() {
        let mut collector = ResponseCollector::default();
        let first = collector.handle(TransportEvent::Error(ProbeError::new(
            "connect ECONNREFUSED",
            "ECONNREFUSED",
        )));
        let second = collector.handle(TransportEvent::Close);

        assert_eq!(first.unwrap().unwrap_err().code, "ECONNREFUSED");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_end_followed_by_error_completes_with_response() {
        let transport = MockTransport::new(|_| {
            let mut events = text_response(200, "fine");
            events.push(TransportEvent::Error(ProbeError::new("late", "ECONNRESET")));
            events
        });
        let request = ProbeRequest::get("http://127.0.0.1/").unwrap();

        let response = execute(&transport, &request).await.unwrap();
        assert_eq!(response.data, json!("fine"));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_close_before_end_is_an_error() {
        let transport = MockTransport::new(|_| {
            vec![
                TransportEvent::Response {
                    status: 200,
                    headers: Headers::new(),
                },
                TransportEvent::Close,
            ]
        });
        let request = ProbeRequest::get("http://127.0.0.1/").unwrap();

        let error = execute(&transport, &request).await.unwrap_err();
        assert_eq!(error.code, "ECONNRESET");
    }

    #[tokio::test]
    async fn test_silent_transport_is_an_error() {
        let transport = MockTransport::new(|_| Vec::new());
        let request = ProbeRequest::get("http://127.0.0.1/").unwrap();

        assert!(execute(&transport, &request).await.is_err());
    }

    #[tokio::test]
    async fn test_transport_error_code_is_kept() {
        let transport = MockTransport::new(|_| connection_error("ECONNREFUSED"));
        let request = ProbeRequest::get("http://127.0.0.1/").unwrap();

        let error = execute(&transport, &request).await.unwrap_err();
        assert_eq!(error.code, "ECONNREFUSED");
    }

    #[test]
    fn test_data_goes_to_query_for_get_and_delete() {
        for method in [Method::GET, Method::DELETE] {
            let request = ProbeRequest::new(method, "http://127.0.0.1/check?x=1")
                .unwrap()
                .with_data(data(json!({"a": "b c", "n": 5})));

            let transport_request = request.to_transport_request();
            assert_eq!(
                transport_request.url.as_str(),
                "http://127.0.0.1/check?x=1&a=b+c&n=5"
            );
            assert!(transport_request.body.is_none());
        }
    }

    #[test]
    fn test_data_goes_to_body_for_post_and_put() {
        for method in [Method::POST, Method::PUT] {
            let request = ProbeRequest::new(method, "http://127.0.0.1/check")
                .unwrap()
                .with_data(data(json!({"a": 1})));

            let transport_request = request.to_transport_request();
            assert_eq!(transport_request.url.as_str(), "http://127.0.0.1/check");
            assert_eq!(transport_request.body, Some(json!({"a": 1})));
        }
    }

    #[test]
    fn test_invalid_url_is_invalid_input() {
        assert!(matches!(
            ProbeRequest::get("not a url"),
            Err(VerifyError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_options_and_route_reach_transport() {
        let route = ProxyRoute {
            protocol: Protocol::Socks5,
            host: "10.0.0.1".to_string(),
            port: 1080,
            auth: None,
        };
        let options = RequestOptions::new()
            .with_timeout(Duration::from_millis(250))
            .with_accept_invalid_certs(true);
        let request = ProbeRequest::get("https://127.0.0.1:3002/check")
            .unwrap()
            .via(route.clone())
            .with_options(&options);

        let transport_request = request.to_transport_request();
        assert_eq!(transport_request.proxy, Some(route));
        assert_eq!(transport_request.timeout, Some(Duration::from_millis(250)));
        assert!(transport_request.accept_invalid_certs);
    }

    #[tokio::test]
    async fn test_probe_validation_failure_keeps_capture() {
        let transport = MockTransport::new(|_| text_response(407, "Proxy Authentication Required"));
        let request = ProbeRequest::get("http://127.0.0.1/").unwrap();

        let result = probe(&transport, &request, validate_status, true).await;
        assert!(!result.ok);
        assert_eq!(result.error.as_ref().unwrap().code, "HTTP_ERROR_407");
        assert_eq!(result.status, Some(407));

        let result = probe(&transport, &request, validate_status, false).await;
        assert!(result.status.is_none());
        assert!(result.data.is_none());
    }

    #[tokio::test]
    async fn test_probe_success() {
        let transport = MockTransport::new(|_| text_response(204, ""));
        let request = ProbeRequest::get("http://127.0.0.1/").unwrap();

        let result = probe(&transport, &request, validate_status, false).await;
        assert_eq!(result, ProbeResult::ok());
    }
}
