//! Proxy descriptor normalization and route resolution

use crate::error::{Result, VerifyError};
use crate::proxy::models::{Protocol, ProxyAuth, ProxyDescriptor, ProxyInput};

/// Canonicalize a proxy input into a [`ProxyDescriptor`].
///
/// Precedence: `ipAddress` over `ip_address`, plural `protocols` over a
/// singular `protocol`. Missing fields stay `None`; whether that is an error
/// depends on the operation using the descriptor.
pub fn normalize_proxy(input: &ProxyInput) -> ProxyDescriptor {
    let ip_address = non_empty(&input.ip_address).or_else(|| non_empty(&input.ip_address_alt));

    let protocols = input
        .protocols
        .clone()
        .or_else(|| input.protocol.map(|protocol| vec![protocol]));

    ProxyDescriptor {
        ip_address,
        port: input.port,
        protocols,
        auth: input.auth.clone(),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// The declared protocol list, failing when there is nothing to test
pub fn require_protocols(proxy: &ProxyDescriptor) -> Result<Vec<Protocol>> {
    let protocols = proxy.distinct_protocols();
    if protocols.is_empty() {
        return Err(VerifyError::InvalidProtocolList);
    }
    Ok(protocols)
}

/// Where and how to reach a proxy for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
}

impl ProxyRoute {
    /// Resolve the route for a descriptor.
    ///
    /// Uses `protocol` when given, otherwise the first declared protocol.
    pub fn resolve(proxy: &ProxyDescriptor, protocol: Option<Protocol>) -> Result<Self> {
        let host = proxy
            .ip_address
            .clone()
            .ok_or_else(|| VerifyError::InvalidInput("Missing proxy \"ipAddress\"".to_string()))?;

        let port = match proxy.port {
            Some(0) | None => {
                return Err(VerifyError::InvalidInput(
                    "Missing or invalid proxy \"port\": expected 1-65535".to_string(),
                ))
            }
            Some(port) => port,
        };

        let protocol = protocol
            .or_else(|| proxy.protocols.as_ref().and_then(|p| p.first().copied()))
            .ok_or_else(|| {
                VerifyError::InvalidInput("Missing proxy \"protocols\"".to_string())
            })?;

        Ok(Self {
            protocol,
            host,
            port,
            auth: proxy.auth.clone(),
        })
    }

    /// Proxy URL without credentials, e.g. `socks5://10.0.0.1:1080`
    pub fn url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }
}
