//! Options for the verifier operations

use serde_json::{Map, Value};
use std::net::IpAddr;
use std::time::Duration;

use crate::proxy::retry::RetryPolicy;

/// Default URL of the proxy check service.
///
/// The service must answer with a JSON object holding the caller's IP address
/// and the request headers it received.
pub const DEFAULT_CHECK_URL: &str = "http://httpbin.org/get";

/// Default CONNECT target for tunnel tests
pub const DEFAULT_TUNNEL_URL: &str = "https://www.google.com";

/// Default number of tunnel attempts
pub const DEFAULT_TUNNEL_ATTEMPTS: u32 = 3;

/// Transport options passed through to every request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Bound on a single request; `None` waits forever
    pub timeout: Option<Duration>,
    /// Skip TLS certificate verification
    pub accept_invalid_certs: bool,
    /// Local address to bind outgoing connections to
    pub local_address: Option<IpAddr>,
    /// Query parameters for GET/DELETE, JSON body for POST/PUT
    pub data: Option<Map<String, Value>>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn with_local_address(mut self, address: IpAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }
}

/// Options for protocol tests
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolOptions {
    /// Check service reached through the proxy
    pub test_url: String,
    pub retry: RetryPolicy,
    /// Keep the raw response (`data`, `status`, `headers`) in the result
    pub include_all: bool,
    pub request: RequestOptions,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            test_url: DEFAULT_CHECK_URL.to_string(),
            retry: RetryPolicy::default(),
            include_all: false,
            request: RequestOptions::default(),
        }
    }
}

impl ProtocolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_include_all(mut self, include_all: bool) -> Self {
        self.include_all = include_all;
        self
    }

    pub fn with_request(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }
}

/// Options for anonymity classification
#[derive(Debug, Clone, PartialEq)]
pub struct AnonymityOptions {
    /// Check service reached through the proxy
    pub test_url: String,
    /// Check service reached directly to learn our own address
    pub ip_address_check_url: String,
    /// Known client address; skips the direct probe when set
    pub my_ip_address: Option<String>,
    pub retry: RetryPolicy,
    pub request: RequestOptions,
}

impl Default for AnonymityOptions {
    fn default() -> Self {
        Self {
            test_url: DEFAULT_CHECK_URL.to_string(),
            ip_address_check_url: DEFAULT_CHECK_URL.to_string(),
            my_ip_address: None,
            retry: RetryPolicy::default(),
            request: RequestOptions::default(),
        }
    }
}

impl AnonymityOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = url.into();
        self
    }

    pub fn with_ip_address_check_url(mut self, url: impl Into<String>) -> Self {
        self.ip_address_check_url = url.into();
        self
    }

    pub fn with_my_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.my_ip_address = Some(ip.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }
}

/// Options for tunnel tests
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelOptions {
    /// HTTPS target reached through a CONNECT tunnel
    pub test_url: String,
    pub retry: RetryPolicy,
    pub request: RequestOptions,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            test_url: DEFAULT_TUNNEL_URL.to_string(),
            retry: RetryPolicy::new(DEFAULT_TUNNEL_ATTEMPTS, Duration::ZERO),
            request: RequestOptions::default(),
        }
    }
}

impl TunnelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }
}

/// Options for a custom test against an arbitrary URL
#[derive(Debug, Clone, PartialEq)]
pub struct CustomTestOptions {
    pub test_url: String,
    pub retry: RetryPolicy,
    pub request: RequestOptions,
}

impl CustomTestOptions {
    pub fn new(test_url: impl Into<String>) -> Self {
        Self {
            test_url: test_url.into(),
            retry: RetryPolicy::default(),
            request: RequestOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }
}

/// Options for `test_all`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestAllOptions {
    pub protocol: ProtocolOptions,
    pub anonymity: AnonymityOptions,
    pub tunnel: TunnelOptions,
}

impl TestAllOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the same transport options for every probe
    pub fn with_request(mut self, request: RequestOptions) -> Self {
        self.protocol.request = request.clone();
        self.anonymity.request = request.clone();
        self.tunnel.request = request;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolOptions) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_anonymity(mut self, anonymity: AnonymityOptions) -> Self {
        self.anonymity = anonymity;
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelOptions) -> Self {
        self.tunnel = tunnel;
        self
    }
}
