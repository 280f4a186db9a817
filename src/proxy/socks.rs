//! SOCKS4 routing
//!
//! reqwest only builds HTTP, HTTPS and SOCKS5 proxies, so SOCKS4 requests are
//! tunnelled by hand: a SOCKS4 (or SOCKS4a, for host names) handshake, TLS on
//! top for `https` targets, then a single HTTP/1.1 exchange.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST};
use hyper_util::rt::TokioIo;
use once_cell::sync::OnceCell;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks4Stream;
use tracing::debug;

use crate::proxy::models::{ProbeError, ProxyAuth};
use crate::proxy::normalize::ProxyRoute;
use crate::proxy::transport::{
    collect_header_pairs, io_error_code, source_io_code, EventSink, TransportEvent,
    TransportRequest,
};

static VERIFIED_TLS: OnceCell<Arc<ClientConfig>> = OnceCell::new();

/// Perform `request` through a SOCKS4 proxy, reporting events to `events`
pub(crate) async fn send(request: &TransportRequest, route: &ProxyRoute, events: &EventSink) {
    let exchange = exchange(request, route, events);
    let outcome = match request.timeout {
        Some(timeout) => tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(ProbeError::new(
                    format!("timeout of {}ms exceeded", timeout.as_millis()),
                    "ETIMEDOUT",
                ))
            }),
        None => exchange.await,
    };

    if let Err(error) = outcome {
        let _ = events.send(TransportEvent::Error(error));
    }
    let _ = events.send(TransportEvent::Close);
}

async fn exchange(
    request: &TransportRequest,
    route: &ProxyRoute,
    events: &EventSink,
) -> Result<(), ProbeError> {
    let host = request
        .url
        .host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| ProbeError::new(format!("No host in {}", request.url), "EREQUEST"))?;
    let port = request
        .url
        .port_or_known_default()
        .ok_or_else(|| ProbeError::new(format!("No port for {}", request.url), "EREQUEST"))?;

    let stream = connect(route, host, port, request.local_address).await?;
    debug!("SOCKS4 tunnel to {}:{} via {}", host, port, route.url());

    if request.url.scheme() == "https" {
        let stream = tls_connect(stream, host, request.accept_invalid_certs).await?;
        http_exchange(stream, request, events).await
    } else {
        http_exchange(stream, request, events).await
    }
}

/// Open the SOCKS4 tunnel. Credentials are sent as the SOCKS4 user id.
async fn connect(
    route: &ProxyRoute,
    host: &str,
    port: u16,
    local_address: Option<IpAddr>,
) -> Result<Socks4Stream<TcpStream>, ProbeError> {
    let socket = connect_proxy(route, local_address).await?;

    let stream = match &route.auth {
        Some(ProxyAuth::Credentials { username, .. }) => {
            Socks4Stream::connect_with_userid_and_socket(socket, (host, port), username).await
        }
        Some(ProxyAuth::Header(_)) => {
            debug!("SOCKS4 has no authorization header; connecting without it");
            Socks4Stream::connect_with_socket(socket, (host, port)).await
        }
        None => Socks4Stream::connect_with_socket(socket, (host, port)).await,
    };

    stream.map_err(|e| {
        let code = match &e {
            tokio_socks::Error::Io(io_err) => io_error_code(io_err.kind()),
            _ => None,
        };
        ProbeError::new(
            format!("SOCKS4 connect failed: {}", e),
            code.unwrap_or("ECONNFAILED"),
        )
    })
}

async fn connect_proxy(
    route: &ProxyRoute,
    local_address: Option<IpAddr>,
) -> Result<TcpStream, ProbeError> {
    let Some(local) = local_address else {
        return TcpStream::connect((route.host.as_str(), route.port))
            .await
            .map_err(io_error);
    };

    let addr = lookup_host((route.host.as_str(), route.port))
        .await
        .map_err(io_error)?
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| {
            ProbeError::new(
                format!("No address of {} matches {}", route.host, local),
                "EADDRNOTAVAIL",
            )
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(io_error)?;
    socket.bind(SocketAddr::new(local, 0)).map_err(io_error)?;
    socket.connect(addr).await.map_err(io_error)
}

async fn tls_connect<S>(
    stream: S,
    host: &str,
    accept_invalid_certs: bool,
) -> Result<tokio_rustls::client::TlsStream<S>, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host)
        .map_err(|e| ProbeError::new(format!("Invalid TLS name {}: {}", host, e), "EREQUEST"))?;

    TlsConnector::from(tls_config(accept_invalid_certs)?)
        .connect(server_name, stream)
        .await
        .map_err(io_error)
}

fn tls_config(accept_invalid_certs: bool) -> Result<Arc<ClientConfig>, ProbeError> {
    if accept_invalid_certs {
        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
        return Ok(Arc::new(config));
    }

    VERIFIED_TLS
        .get_or_try_init(|| {
            let certs = rustls_native_certs::load_native_certs().map_err(|e| {
                ProbeError::new(format!("Failed to load root certificates: {}", e), "EREQUEST")
            })?;
            let mut roots = RootCertStore::empty();
            let ders: Vec<Vec<u8>> = certs.into_iter().map(|cert| cert.0).collect();
            let (added, ignored) = roots.add_parsable_certificates(&ders);
            debug!("Loaded {} root certificates ({} ignored)", added, ignored);

            Ok(Arc::new(
                ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            ))
        })
        .cloned()
}

struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// One HTTP/1.1 request over an established tunnel
async fn http_exchange<S>(
    stream: S,
    request: &TransportRequest,
    events: &EventSink,
) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(hyper_error)?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("SOCKS4 connection ended: {}", e);
        }
    });

    let response = sender
        .send_request(build_request(request)?)
        .await
        .map_err(hyper_error)?;

    let headers = collect_header_pairs(
        response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes())),
    );
    let _ = events.send(TransportEvent::Response {
        status: response.status().as_u16(),
        headers,
    });

    let mut body = response.into_body();
    while let Some(frame) = body.frame().await {
        if let Ok(chunk) = frame.map_err(hyper_error)?.into_data() {
            // Receiver gone means the outcome is already settled.
            if events.send(TransportEvent::Data(chunk)).is_err() {
                return Ok(());
            }
        }
    }

    let _ = events.send(TransportEvent::End);
    Ok(())
}

fn build_request(request: &TransportRequest) -> Result<hyper::Request<Full<Bytes>>, ProbeError> {
    let method = hyper::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|e| ProbeError::new(e.to_string(), "EREQUEST"))?;
    let host = match request.url.port() {
        Some(port) => format!("{}:{}", request.url.host_str().unwrap_or_default(), port),
        None => request.url.host_str().unwrap_or_default().to_string(),
    };

    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(&request.url[url::Position::BeforePath..])
        .header(HOST, host)
        .header(CONNECTION, "close");

    let body = match &request.body {
        Some(body) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Bytes::from(body.to_string())
        }
        None => Bytes::new(),
    };

    builder
        .body(Full::new(body))
        .map_err(|e| ProbeError::new(format!("Failed to build request: {}", e), "EREQUEST"))
}

fn io_error(err: std::io::Error) -> ProbeError {
    let code = io_error_code(err.kind()).unwrap_or("ECONNFAILED");
    ProbeError::new(err.to_string(), code)
}

fn hyper_error(err: hyper::Error) -> ProbeError {
    let code = source_io_code(&err).unwrap_or(if err.is_incomplete_message() {
        "ECONNRESET"
    } else if err.is_timeout() {
        "ETIMEDOUT"
    } else {
        "EREQUEST"
    });
    ProbeError::new(err.to_string(), code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::Protocol;
    use crate::proxy::request::{execute, ProbeRequest};
    use crate::proxy::transport::ReqwestTransport;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const GRANTED: u8 = 0x5A;
    const REJECTED: u8 = 0x5B;

    /// What a SOCKS4 server was asked for
    struct Seen {
        ip: Ipv4Addr,
        port: u16,
        user_id: String,
        request: String,
    }

    /// Accept one SOCKS4 client, answer with `reply` and, when granted, serve
    /// `body` as JSON to the tunnelled request
    async fn socks4_server(reply: u8, body: &'static str) -> (u16, JoinHandle<Seen>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut header = [0u8; 8];
            stream.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], 4);
            assert_eq!(header[1], 1);

            let mut user_id = Vec::new();
            loop {
                match stream.read_u8().await.unwrap() {
                    0 => break,
                    byte => user_id.push(byte),
                }
            }

            stream.write_all(&[0, reply, 0, 0, 0, 0, 0, 0]).await.unwrap();

            let mut request = Vec::new();
            if reply == GRANTED {
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nVia: 1.1 socks-test\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }

            Seen {
                ip: Ipv4Addr::new(header[4], header[5], header[6], header[7]),
                port: u16::from_be_bytes([header[2], header[3]]),
                user_id: String::from_utf8(user_id).unwrap(),
                request: String::from_utf8_lossy(&request).into_owned(),
            }
        });

        (port, handle)
    }

    fn socks4_route(port: u16, auth: Option<ProxyAuth>) -> ProxyRoute {
        ProxyRoute {
            protocol: Protocol::Socks4,
            host: "127.0.0.1".to_string(),
            port,
            auth,
        }
    }

    #[tokio::test]
    async fn test_request_through_socks4() {
        let (port, server) =
            socks4_server(GRANTED, r#"{"ip_address":"127.0.0.2","headers":{}}"#).await;
        let route = socks4_route(
            port,
            Some(ProxyAuth::credentials("user".to_string(), "pass".to_string())),
        );
        let request = ProbeRequest::get("http://127.0.0.1:3001/check?x=1")
            .unwrap()
            .via(route);

        let response = execute(&ReqwestTransport::new(), &request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.data,
            json!({"ip_address": "127.0.0.2", "headers": {}})
        );
        assert_eq!(response.headers.get("via").unwrap(), "1.1 socks-test");

        let seen = server.await.unwrap();
        assert_eq!(seen.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(seen.port, 3001);
        assert_eq!(seen.user_id, "user");
        assert!(seen.request.starts_with("GET /check?x=1 HTTP/1.1\r\n"));
        assert!(seen
            .request
            .to_lowercase()
            .contains("host: 127.0.0.1:3001\r\n"));
    }

    #[tokio::test]
    async fn test_socks4_rejection_fails_the_request() {
        let (port, server) = socks4_server(REJECTED, "").await;
        let request = ProbeRequest::get("http://127.0.0.1:3001/check")
            .unwrap()
            .via(socks4_route(port, None));

        let error = execute(&ReqwestTransport::new(), &request)
            .await
            .unwrap_err();
        assert!(error.message.starts_with("SOCKS4 connect failed"));
        assert_ne!(error.code, "UNSUPPORTED_PROTOCOL");

        let seen = server.await.unwrap();
        assert_eq!(seen.user_id, "");
    }

    #[tokio::test]
    async fn test_socks4_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = ProbeRequest::get("http://127.0.0.1:3001/check")
            .unwrap()
            .via(socks4_route(port, None));

        let error = execute(&ReqwestTransport::new(), &request)
            .await
            .unwrap_err();
        assert_eq!(error.code, "ECONNREFUSED");
    }

    #[test]
    fn test_build_request_places_body_and_host() {
        let request = TransportRequest {
            method: reqwest::Method::POST,
            url: url::Url::parse("http://example.com/submit?a=b").unwrap(),
            proxy: None,
            body: Some(json!({"k": "v"})),
            timeout: None,
            accept_invalid_certs: false,
            local_address: None,
        };

        let built = build_request(&request).unwrap();
        assert_eq!(*built.method(), hyper::Method::POST);
        assert_eq!(built.uri(), "/submit?a=b");
        assert_eq!(built.headers()[HOST], "example.com");
        assert_eq!(built.headers()[CONTENT_TYPE], "application/json");
    }
}
