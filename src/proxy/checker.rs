//! Proxy verifier: protocol, anonymity and tunnel tests

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, field, info, instrument, warn, Span};

use crate::error::{Result, VerifyError};
use crate::proxy::anonymity::{classify, validate_check_service, CheckPayload};
use crate::proxy::config::{
    AnonymityOptions, CustomTestOptions, ProtocolOptions, TestAllOptions, TunnelOptions,
};
use crate::proxy::geo;
use crate::proxy::models::{
    AnonymityLevel, Headers, ProbeError, ProbeResult, Protocol, ProxyDescriptor, ProxyInput,
    ProxyReport, VerificationReport,
};
use crate::proxy::normalize::{normalize_proxy, require_protocols, ProxyRoute};
use crate::proxy::request::{probe, validate_status, HttpResponse, ProbeRequest};
use crate::proxy::retry::{with_retry, RetryPolicy};
use crate::proxy::transport::{ReqwestTransport, Transport};

/// Default number of proxies verified at once by `check_proxies`
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Runs verification probes against proxies.
///
/// Every public operation normalizes the proxy it is given once and works
/// on the resulting [`ProxyDescriptor`] from then on.
pub struct ProxyVerifier<T: Transport = ReqwestTransport> {
    transport: Arc<T>,
}

impl ProxyVerifier<ReqwestTransport> {
    /// Create a verifier backed by reqwest
    pub fn new() -> Self {
        Self::with_transport(ReqwestTransport::new())
    }
}

impl Default for ProxyVerifier<ReqwestTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Clone for ProxyVerifier<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> ProxyVerifier<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Test whether the proxy forwards requests with one protocol.
    ///
    /// `protocol` defaults to the first declared protocol.
    #[instrument(skip_all, fields(proxy = field::Empty))]
    pub async fn test_protocol(
        &self,
        proxy: &ProxyInput,
        protocol: Option<Protocol>,
        options: &ProtocolOptions,
    ) -> Result<ProbeResult> {
        let proxy = normalize_proxy(proxy);
        Span::current().record("proxy", field::display(&proxy));
        self.protocol_probe(&proxy, protocol, options).await
    }

    /// Test every declared protocol concurrently
    #[instrument(skip_all, fields(proxy = field::Empty))]
    pub async fn test_protocols(
        &self,
        proxy: &ProxyInput,
        options: &ProtocolOptions,
    ) -> Result<BTreeMap<Protocol, ProbeResult>> {
        let proxy = normalize_proxy(proxy);
        Span::current().record("proxy", field::display(&proxy));
        self.protocols_probe(&proxy, options).await
    }

    /// Classify how much the proxy reveals about us
    #[instrument(skip_all, fields(proxy = field::Empty))]
    pub async fn test_anonymity_level(
        &self,
        proxy: &ProxyInput,
        options: &AnonymityOptions,
    ) -> Result<AnonymityLevel> {
        let proxy = normalize_proxy(proxy);
        Span::current().record("proxy", field::display(&proxy));
        self.anonymity_level(&proxy, None, options).await
    }

    /// Test whether the proxy can open a CONNECT tunnel
    #[instrument(skip_all, fields(proxy = field::Empty))]
    pub async fn test_tunnel(
        &self,
        proxy: &ProxyInput,
        options: &TunnelOptions,
    ) -> Result<ProbeResult> {
        let proxy = normalize_proxy(proxy);
        Span::current().record("proxy", field::display(&proxy));
        self.tunnel_probe(&proxy, options).await
    }

    /// Probe an arbitrary URL through the proxy and judge the response with
    /// `validator`. The raw response is always kept in the result.
    #[instrument(skip_all, fields(proxy = field::Empty))]
    pub async fn test_custom<V>(
        &self,
        proxy: &ProxyInput,
        options: &CustomTestOptions,
        validator: V,
    ) -> Result<ProbeResult>
    where
        V: Fn(&Value, u16, &Headers) -> std::result::Result<(), ProbeError>,
    {
        let proxy = normalize_proxy(proxy);
        Span::current().record("proxy", field::display(&proxy));

        let route = ProxyRoute::resolve(&proxy, None)?;
        let request = ProbeRequest::get(&options.test_url)?
            .via(route)
            .with_options(&options.request);
        let validate =
            |response: &HttpResponse| validator(&response.data, response.status, &response.headers);

        self.run_probe(&request, &options.retry, &validate, true)
            .await
    }

    /// Run protocol, anonymity and tunnel tests and fold them into one report.
    ///
    /// Anonymity and tunnel tests only run when at least one protocol works,
    /// and only over the working protocols.
    #[instrument(skip_all, fields(proxy = field::Empty))]
    pub async fn test_all(
        &self,
        proxy: &ProxyInput,
        options: &TestAllOptions,
    ) -> Result<VerificationReport> {
        let proxy = normalize_proxy(proxy);
        Span::current().record("proxy", field::display(&proxy));
        check_urls(options)?;

        let protocol_options = options.protocol.clone().with_include_all(true);
        let results = self.protocols_probe(&proxy, &protocol_options).await?;

        let working: Vec<Protocol> = proxy
            .distinct_protocols()
            .into_iter()
            .filter(|protocol| results.get(protocol).is_some_and(|r| r.ok))
            .collect();

        let (anonymity_level, tunnel) = match working.first() {
            None => {
                debug!("No working protocols, skipping anonymity and tunnel tests");
                (None, ProbeResult::skipped())
            }
            Some(first) => {
                let restricted = proxy.with_protocols(working.clone());
                let (level, tunnel) = tokio::join!(
                    self.anonymity_level(&restricted, results.get(first), &options.anonymity),
                    self.tunnel_probe(&restricted, &options.tunnel),
                );

                let level = match level {
                    Ok(level) => Some(level),
                    Err(VerifyError::UnreachableCheckService(reason)) => {
                        warn!("Anonymity level unknown for {}: {}", proxy, reason);
                        None
                    }
                    Err(e) => return Err(e),
                };
                (level, tunnel?)
            }
        };

        let country = proxy.ip_address.as_deref().and_then(geo::lookup_country);

        let report = VerificationReport {
            protocols: results
                .iter()
                .map(|(protocol, result)| (*protocol, result.stripped()))
                .collect(),
            anonymity_level,
            tunnel,
            country,
        };

        info!(
            "Verified {}: {} of {} protocols working, anonymity {}, tunnel {}",
            proxy,
            working.len(),
            report.protocols.len(),
            report
                .anonymity_level
                .map_or_else(|| "unknown".to_string(), |l| l.to_string()),
            if report.tunnel.ok { "ok" } else { "failed" }
        );

        Ok(report)
    }

    /// Run `test_all` over many proxies, at most `concurrency` at a time.
    ///
    /// Fails only on options no proxy could be tested with; per-proxy errors
    /// land in the reports.
    pub async fn check_proxies(
        &self,
        proxies: Vec<ProxyInput>,
        options: &TestAllOptions,
        concurrency: usize,
    ) -> Result<Vec<ProxyReport>> {
        check_urls(options)?;

        let reports = stream::iter(proxies)
            .map(move |input| async move {
                let descriptor = normalize_proxy(&input);
                match self.test_all(&input, options).await {
                    Ok(report) => ProxyReport {
                        proxy: descriptor,
                        report: Some(report),
                        error: None,
                    },
                    Err(e) => {
                        warn!("Could not verify {}: {}", descriptor, e);
                        ProxyReport {
                            proxy: descriptor,
                            report: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        Ok(reports)
    }

    /// Check proxies and separate into working and failed reports
    pub async fn check_and_separate(
        &self,
        proxies: Vec<ProxyInput>,
        options: &TestAllOptions,
        concurrency: usize,
    ) -> Result<(Vec<ProxyReport>, Vec<ProxyReport>)> {
        let reports = self.check_proxies(proxies, options, concurrency).await?;
        Ok(reports.into_iter().partition(ProxyReport::is_working))
    }

    async fn protocol_probe(
        &self,
        proxy: &ProxyDescriptor,
        protocol: Option<Protocol>,
        options: &ProtocolOptions,
    ) -> Result<ProbeResult> {
        let route = ProxyRoute::resolve(proxy, protocol)?;
        let protocol = route.protocol;
        let request = ProbeRequest::get(&options.test_url)?
            .via(route)
            .with_options(&options.request);

        let result = self
            .run_probe(
                &request,
                &options.retry,
                validate_check_service,
                options.include_all,
            )
            .await?;

        debug!("{} over {}: ok={}", proxy, protocol, result.ok);
        Ok(result)
    }

    async fn protocols_probe(
        &self,
        proxy: &ProxyDescriptor,
        options: &ProtocolOptions,
    ) -> Result<BTreeMap<Protocol, ProbeResult>> {
        let protocols = require_protocols(proxy)?;

        // Reject bad arguments before any request goes out.
        ProxyRoute::resolve(proxy, None)?;
        ProbeRequest::get(&options.test_url)?;

        let probes = protocols.iter().map(|protocol| async move {
            let result = self.protocol_probe(proxy, Some(*protocol), options).await;
            result.map(|result| (*protocol, result))
        });

        join_all(probes).await.into_iter().collect()
    }

    async fn anonymity_level(
        &self,
        proxy: &ProxyDescriptor,
        captured: Option<&ProbeResult>,
        options: &AnonymityOptions,
    ) -> Result<AnonymityLevel> {
        let route = ProxyRoute::resolve(proxy, None)?;
        let with_proxy_request = ProbeRequest::get(&options.test_url)?
            .via(route)
            .with_options(&options.request);
        let direct_request =
            ProbeRequest::get(&options.ip_address_check_url)?.with_options(&options.request);

        let my_ip_address = async {
            if let Some(ip) = &options.my_ip_address {
                return Ok(ip.clone());
            }
            let result = self
                .run_probe(&direct_request, &options.retry, validate_check_service, true)
                .await?;
            CheckPayload::from_result(&result).map(|payload| payload.ip_address)
        };

        let with_proxy = async {
            if let Some(result) = captured {
                return CheckPayload::from_result(result);
            }
            let result = self
                .run_probe(
                    &with_proxy_request,
                    &options.retry,
                    validate_check_service,
                    true,
                )
                .await?;
            CheckPayload::from_result(&result)
        };

        let (my_ip_address, with_proxy) = tokio::join!(my_ip_address, with_proxy);
        let level = classify(&my_ip_address?, &with_proxy?);

        debug!("{} anonymity level: {}", proxy, level);
        Ok(level)
    }

    async fn tunnel_probe(
        &self,
        proxy: &ProxyDescriptor,
        options: &TunnelOptions,
    ) -> Result<ProbeResult> {
        let route = ProxyRoute::resolve(proxy, None)?;
        let request = ProbeRequest::get(&options.test_url)?
            .via(route)
            .with_options(&options.request);

        self.run_probe(&request, &options.retry, validate_status, false)
            .await
    }

    async fn run_probe<V>(
        &self,
        request: &ProbeRequest,
        retry: &RetryPolicy,
        validator: V,
        include_all: bool,
    ) -> Result<ProbeResult>
    where
        V: Fn(&HttpResponse) -> std::result::Result<(), ProbeError> + Copy,
    {
        let transport = self.transport.as_ref();
        with_retry(retry, |_| async move {
            Ok(probe(transport, request, validator, include_all).await)
        })
        .await
    }
}

/// Reject unusable URLs in any stage of `test_all` before the first request
fn check_urls(options: &TestAllOptions) -> Result<()> {
    for url in [
        &options.protocol.test_url,
        &options.anonymity.test_url,
        &options.anonymity.ip_address_check_url,
        &options.tunnel.test_url,
    ] {
        ProbeRequest::get(url)?;
    }
    Ok(())
}
