//! Proxy verification
//!
//! This module provides functionality for:
//! - Normalizing proxy descriptions into one canonical shape
//! - Testing protocols, anonymity and CONNECT tunnels through a proxy
//! - Parsing proxy lists from text, JSON and files
//! - Looking up the country of a proxy address

pub mod anonymity;
pub mod checker;
pub mod config;
pub mod geo;
pub mod models;
pub mod normalize;
pub mod parser;
pub mod request;
pub mod retry;
mod socks;
pub mod transport;

pub use anonymity::{classify, CheckPayload};
pub use checker::{ProxyVerifier, DEFAULT_CONCURRENCY};
pub use config::{
    AnonymityOptions, CustomTestOptions, ProtocolOptions, RequestOptions, TestAllOptions,
    TunnelOptions, DEFAULT_CHECK_URL, DEFAULT_TUNNEL_URL,
};
pub use geo::{is_country_data_loaded, load_country_data, lookup_country, GeoLocation, GeoLocator};
pub use models::{
    AnonymityLevel, Headers, ProbeError, ProbeResult, Protocol, ProxyAuth, ProxyDescriptor,
    ProxyInput, ProxyReport, VerificationReport,
};
pub use normalize::{normalize_proxy, ProxyRoute};
pub use parser::ProxyParser;
pub use retry::RetryPolicy;
pub use transport::{ReqwestTransport, Transport, TransportEvent, TransportRequest};
