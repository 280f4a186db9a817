//! Anonymity classification from check service snapshots

use serde_json::Value;

use crate::error::{Result, VerifyError};
use crate::proxy::models::{AnonymityLevel, Headers, ProbeError, ProbeResult};
use crate::proxy::request::{validate_status, HttpResponse};

/// Header keys that identify a proxy when present
pub const PROXY_HEADERS: &[&str] = &["via"];

/// Header key fragments that identify a proxy
pub const PROXY_HEADER_KEYWORDS: &[&str] = &["proxy"];

/// Fields a check service may use for the caller's address
const IP_ADDRESS_FIELDS: &[&str] = &["ip_address", "ipAddress", "origin"];

/// What the check service saw: the caller's address and request headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPayload {
    pub ip_address: String,
    /// Keys are lower-cased
    pub headers: Headers,
}

impl CheckPayload {
    /// Read a check service body; `None` when it lacks either field
    pub fn from_value(data: &Value) -> Option<Self> {
        let object = data.as_object()?;

        let ip_address = IP_ADDRESS_FIELDS
            .iter()
            .find_map(|field| object.get(*field)?.as_str())?
            .trim()
            .to_string();

        let headers = object
            .get("headers")?
            .as_object()?
            .iter()
            .map(|(key, value)| (key.to_lowercase(), header_value(value)))
            .collect();

        Some(Self {
            ip_address,
            headers,
        })
    }

    /// Read the payload captured by a probe.
    ///
    /// The probe must have succeeded with HTTP 200 and a well-formed body.
    pub fn from_result(result: &ProbeResult) -> Result<Self> {
        if !result.ok {
            let reason = result
                .error
                .as_ref()
                .map_or_else(|| "probe failed".to_string(), ProbeError::to_string);
            return Err(VerifyError::UnreachableCheckService(reason));
        }

        match result.status {
            Some(200) => {}
            Some(status) => {
                return Err(VerifyError::UnreachableCheckService(format!(
                    "HTTP status {}",
                    status
                )))
            }
            None => {
                return Err(VerifyError::UnreachableCheckService(
                    "no response captured".to_string(),
                ))
            }
        }

        result
            .data
            .as_ref()
            .and_then(Self::from_value)
            .ok_or_else(|| {
                VerifyError::UnreachableCheckService(
                    "response lacks an IP address or headers".to_string(),
                )
            })
    }
}

fn header_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(header_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Whether `ip` is one of the comma-separated entries of `value`
fn contains_address(value: &str, ip: &str) -> bool {
    !ip.is_empty() && value.split(',').any(|entry| entry.trim() == ip)
}

fn has_proxy_headers(headers: &Headers) -> bool {
    headers.keys().any(|key| {
        PROXY_HEADERS.contains(&key.as_str())
            || PROXY_HEADER_KEYWORDS
                .iter()
                .any(|keyword| key.contains(keyword))
    })
}

/// Classify a proxy from what the check service saw through it.
///
/// Transparent when our own address shows up as the observed address or in
/// any header value; anonymous when a proxy header is present; elite
/// otherwise.
pub fn classify(my_ip_address: &str, with_proxy: &CheckPayload) -> AnonymityLevel {
    let my_ip = my_ip_address.trim();

    let leaked = contains_address(&with_proxy.ip_address, my_ip)
        || with_proxy
            .headers
            .values()
            .any(|value| contains_address(value, my_ip));

    if leaked {
        AnonymityLevel::Transparent
    } else if has_proxy_headers(&with_proxy.headers) {
        AnonymityLevel::Anonymous
    } else {
        AnonymityLevel::Elite
    }
}

/// Fails error statuses and bodies that are not a check service payload
pub fn validate_check_service(response: &HttpResponse) -> std::result::Result<(), ProbeError> {
    validate_status(response)?;
    if CheckPayload::from_value(&response.data).is_none() {
        return Err(ProbeError::failed_to_reach_service());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MY_IP: &str = "203.0.113.7";

    fn payload(ip: &str, headers: &[(&str, &str)]) -> CheckPayload {
        CheckPayload {
            ip_address: ip.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_transparent_when_ip_matches() {
        let observed = payload(MY_IP, &[("host", "127.0.0.1:3001")]);
        assert_eq!(classify(MY_IP, &observed), AnonymityLevel::Transparent);
    }

    #[test]
    fn test_transparent_when_ip_in_headers() {
        let observed = payload(
            "198.51.100.2",
            &[("x-forwarded-for", "203.0.113.7, 198.51.100.2")],
        );
        assert_eq!(classify(MY_IP, &observed), AnonymityLevel::Transparent);

        let observed = payload("198.51.100.2", &[("x-real-ip", MY_IP), ("via", "1.1 squid")]);
        assert_eq!(classify(MY_IP, &observed), AnonymityLevel::Transparent);
    }

    #[test]
    fn test_partial_address_match_is_not_a_leak() {
        let observed = payload("198.51.100.2", &[("x-note", "203.0.113.77")]);
        assert_eq!(classify(MY_IP, &observed), AnonymityLevel::Elite);
    }

    #[test]
    fn test_anonymous_with_via_header() {
        let observed = payload("198.51.100.2", &[("Via", "someproxy")]);
        assert_eq!(classify(MY_IP, &observed), AnonymityLevel::Anonymous);
    }

    #[test]
    fn test_anonymous_with_proxy_keyword_header() {
        let observed = payload("198.51.100.2", &[("X-Proxy-Header", "some-custom-header")]);
        assert_eq!(classify(MY_IP, &observed), AnonymityLevel::Anonymous);

        let observed = payload("198.51.100.2", &[("proxy-connection", "keep-alive")]);
        assert_eq!(classify(MY_IP, &observed), AnonymityLevel::Anonymous);
    }

    #[test]
    fn test_elite_without_traces() {
        let observed = payload(
            "198.51.100.2",
            &[("host", "127.0.0.1:3001"), ("connection", "close")],
        );
        assert_eq!(classify(MY_IP, &observed), AnonymityLevel::Elite);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let observed = payload("198.51.100.2", &[("via", "1.1 a"), ("x-proxy-id", "7")]);
        let first = classify(MY_IP, &observed);
        for _ in 0..10 {
            assert_eq!(classify(MY_IP, &observed), first);
        }
    }

    #[test]
    fn test_payload_field_aliases() {
        for field in ["ip_address", "ipAddress", "origin"] {
            let mut body = serde_json::Map::new();
            body.insert(field.to_string(), json!("198.51.100.2"));
            body.insert("headers".to_string(), json!({"Via": "1.1 x"}));
            let parsed = CheckPayload::from_value(&Value::Object(body)).unwrap();
            assert_eq!(parsed.ip_address, "198.51.100.2");
            assert_eq!(parsed.headers.get("via").unwrap(), "1.1 x");
        }
    }

    #[test]
    fn test_payload_requires_both_fields() {
        assert!(CheckPayload::from_value(&json!({"ip_address": "1.2.3.4"})).is_none());
        assert!(CheckPayload::from_value(&json!({"headers": {}})).is_none());
        assert!(CheckPayload::from_value(&json!("1.2.3.4")).is_none());
        assert!(
            CheckPayload::from_value(&json!({"ip_address": "1.2.3.4", "headers": "x"})).is_none()
        );
    }

    #[test]
    fn test_payload_from_result() {
        let body = json!({"ip_address": "1.2.3.4", "headers": {}});
        let ok = ProbeResult::ok().with_capture(body.clone(), 200, Headers::new());
        assert_eq!(CheckPayload::from_result(&ok).unwrap().ip_address, "1.2.3.4");

        let bad_status = ProbeResult::ok().with_capture(body, 201, Headers::new());
        assert!(matches!(
            CheckPayload::from_result(&bad_status),
            Err(VerifyError::UnreachableCheckService(_))
        ));

        let failed = ProbeResult::failed(ProbeError::new("refused", "ECONNREFUSED"));
        assert!(matches!(
            CheckPayload::from_result(&failed),
            Err(VerifyError::UnreachableCheckService(_))
        ));

        let uncaptured = ProbeResult::ok();
        assert!(CheckPayload::from_result(&uncaptured).is_err());

        let garbage = ProbeResult::ok().with_capture(json!("<html>"), 200, Headers::new());
        assert!(CheckPayload::from_result(&garbage).is_err());
    }

    #[test]
    fn test_validate_check_service() {
        let response = HttpResponse {
            status: 200,
            headers: Headers::new(),
            data: json!({"ip_address": "1.2.3.4", "headers": {}}),
        };
        assert!(validate_check_service(&response).is_ok());

        let response = HttpResponse {
            status: 200,
            headers: Headers::new(),
            data: json!("<html>hello</html>"),
        };
        assert_eq!(
            validate_check_service(&response).unwrap_err().code,
            "FAILED_TO_REACH_SERVICE"
        );

        let response = HttpResponse {
            status: 502,
            headers: Headers::new(),
            data: json!({"ip_address": "1.2.3.4", "headers": {}}),
        };
        assert_eq!(
            validate_check_service(&response).unwrap_err().code,
            "HTTP_ERROR_502"
        );
    }
}
