//! Proxy verification data models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::VerifyError;

/// Response headers keyed by lower-cased header name
pub type Headers = BTreeMap<String, String>;

/// Proxy protocol (the dialect used to route a request through the proxy)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks4" => Ok(Protocol::Socks4),
            "socks5" => Ok(Protocol::Socks5),
            _ => Err(VerifyError::InvalidInput(format!(
                "Invalid proxy protocol: {}. Use: http, https, socks4, socks5",
                s
            ))),
        }
    }
}

/// Proxy authentication credentials
///
/// Either a raw `Proxy-Authorization` header value, forwarded verbatim, or a
/// username/password pair sent as basic credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyAuth {
    Header(String),
    Credentials { username: String, password: String },
}

impl ProxyAuth {
    pub fn credentials(username: String, password: String) -> Self {
        ProxyAuth::Credentials { username, password }
    }
}

/// A proxy as supplied by a caller, in any of the accepted shapes.
///
/// Both `ipAddress` and `ip_address` spellings are accepted, as are a
/// singular `protocol` and a plural `protocols`. Use
/// [`normalize_proxy`](crate::proxy::normalize::normalize_proxy) to turn it
/// into a [`ProxyDescriptor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInput {
    #[serde(rename = "ipAddress", default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(rename = "ip_address", default, skip_serializing_if = "Option::is_none")]
    pub ip_address_alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<Protocol>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ProxyAuth>,
}

impl ProxyInput {
    /// Create an input with an address, a port and a protocol list
    pub fn new(ip_address: impl Into<String>, port: u16, protocols: Vec<Protocol>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            port: Some(port),
            protocols: Some(protocols),
            ..Default::default()
        }
    }

    pub fn with_auth(mut self, auth: ProxyAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Parse a JSON object into an input
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json).map_err(|e| VerifyError::InvalidInput(e.to_string()))
    }
}

impl From<&ProxyDescriptor> for ProxyInput {
    fn from(descriptor: &ProxyDescriptor) -> Self {
        Self {
            ip_address: descriptor.ip_address.clone(),
            ip_address_alt: None,
            port: descriptor.port,
            protocols: descriptor.protocols.clone(),
            protocol: None,
            auth: descriptor.auth.clone(),
        }
    }
}

/// Normalized representation of a candidate proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyDescriptor {
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub protocols: Option<Vec<Protocol>>,
    pub auth: Option<ProxyAuth>,
}

impl ProxyDescriptor {
    /// Get the proxy string in IP:PORT format, with placeholders for missing parts
    pub fn address(&self) -> String {
        format!(
            "{}:{}",
            self.ip_address.as_deref().unwrap_or("?"),
            self.port.map_or_else(|| "?".to_string(), |p| p.to_string())
        )
    }

    /// A copy of this descriptor declaring only the given protocols
    pub fn with_protocols(&self, protocols: Vec<Protocol>) -> Self {
        Self {
            protocols: Some(protocols),
            ..self.clone()
        }
    }

    /// Declared protocols in order, without repeats
    pub fn distinct_protocols(&self) -> Vec<Protocol> {
        let mut seen = Vec::new();
        for protocol in self.protocols.iter().flatten() {
            if !seen.contains(protocol) {
                seen.push(*protocol);
            }
        }
        seen
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// Why a probe failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeError {
    pub message: String,
    pub code: String,
}

impl ProbeError {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }

    /// Response status of 300 or more
    pub fn http_status(status: u16) -> Self {
        Self::new(
            format!("HTTP {} error", status),
            format!("HTTP_ERROR_{}", status),
        )
    }

    /// Response arrived but did not look like the expected service
    pub fn failed_to_reach_service() -> Self {
        Self::new(
            "Failed to reach proxy checking service",
            "FAILED_TO_REACH_SERVICE",
        )
    }

    pub fn json_parse(message: impl Into<String>) -> Self {
        Self::new(message, "JSON_PARSE_ERROR")
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Outcome of one network probe
///
/// `data`, `status` and `headers` are only filled in when the caller asked
/// for the full response capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl ProbeResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            data: None,
            status: None,
            headers: None,
        }
    }

    pub fn failed(error: ProbeError) -> Self {
        Self {
            ok: false,
            error: Some(error),
            ..Self::ok()
        }
    }

    /// A failure recorded without running the probe
    pub fn skipped() -> Self {
        Self {
            ok: false,
            ..Self::ok()
        }
    }

    /// Attach the raw response
    pub fn with_capture(mut self, data: Value, status: u16, headers: Headers) -> Self {
        self.data = Some(data);
        self.status = Some(status);
        self.headers = Some(headers);
        self
    }

    /// The same result without the raw response
    pub fn stripped(&self) -> Self {
        Self {
            ok: self.ok,
            error: self.error.clone(),
            data: None,
            status: None,
            headers: None,
        }
    }
}

/// How much a proxy reveals about the client behind it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    /// The client's address leaks through
    Transparent,
    /// The proxy identifies itself but hides the client's address
    Anonymous,
    /// No trace of a proxy
    Elite,
}

impl fmt::Display for AnonymityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnonymityLevel::Transparent => write!(f, "transparent"),
            AnonymityLevel::Anonymous => write!(f, "anonymous"),
            AnonymityLevel::Elite => write!(f, "elite"),
        }
    }
}

/// Everything `test_all` found out about a proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub protocols: BTreeMap<Protocol, ProbeResult>,
    pub anonymity_level: Option<AnonymityLevel>,
    pub tunnel: ProbeResult,
    pub country: Option<String>,
}

impl VerificationReport {
    /// Protocols whose probe succeeded
    pub fn working_protocols(&self) -> Vec<Protocol> {
        self.protocols
            .iter()
            .filter(|(_, result)| result.ok)
            .map(|(protocol, _)| *protocol)
            .collect()
    }
}

/// Verification outcome for one proxy of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyReport {
    pub proxy: ProxyDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<VerificationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyReport {
    pub fn is_working(&self) -> bool {
        self.report
            .as_ref()
            .is_some_and(|report| !report.working_protocols().is_empty())
    }
}
