//! Reads proxy lists from text and files

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::proxy::models::{Protocol, ProxyAuth, ProxyInput};

static URL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks[45])://(?:([^:]+):([^@]+)@)?([^:/]+):(\d+)/?$")
        .expect("valid regex")
});

static AUTH_AT_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:]+):([^@]+)@([^:]+):(\d+)$").expect("valid regex"));

/// Parses proxies from strings and files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line.
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - IP:PORT:USER:PASS
    /// - USER:PASS@IP:PORT
    /// - scheme://IP:PORT
    /// - scheme://USER:PASS@IP:PORT
    /// - a JSON proxy object
    ///
    /// Lines without a scheme get `default_protocols`.
    pub fn parse_line(line: &str, default_protocols: &[Protocol]) -> Option<ProxyInput> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if line.starts_with('{') {
            return ProxyInput::from_json(line).ok();
        }

        Self::parse_url_format(line)
            .or_else(|| Self::parse_auth_at_format(line, default_protocols))
            .or_else(|| Self::parse_colon_format(line, default_protocols))
    }

    /// scheme://[user:pass@]ip:port; the scheme is the only protocol
    fn parse_url_format(line: &str) -> Option<ProxyInput> {
        let caps = URL_FORMAT.captures(line)?;

        let protocol: Protocol = caps[1].parse().ok()?;
        let port: u16 = caps[5].parse().ok()?;
        let proxy = ProxyInput::new(&caps[4], port, vec![protocol]);

        match (caps.get(2), caps.get(3)) {
            (Some(user), Some(pass)) => Some(proxy.with_auth(ProxyAuth::credentials(
                user.as_str().to_string(),
                pass.as_str().to_string(),
            ))),
            _ => Some(proxy),
        }
    }

    /// user:pass@ip:port
    fn parse_auth_at_format(line: &str, default_protocols: &[Protocol]) -> Option<ProxyInput> {
        let caps = AUTH_AT_FORMAT.captures(line)?;
        let port: u16 = caps[4].parse().ok()?;

        Some(
            ProxyInput::new(&caps[3], port, default_protocols.to_vec()).with_auth(
                ProxyAuth::credentials(caps[1].to_string(), caps[2].to_string()),
            ),
        )
    }

    /// ip:port or ip:port:user:pass
    fn parse_colon_format(line: &str, default_protocols: &[Protocol]) -> Option<ProxyInput> {
        let parts: Vec<&str> = line.split(':').collect();

        match parts.as_slice() {
            [host, port] => {
                let port: u16 = port.parse().ok()?;
                Some(ProxyInput::new(*host, port, default_protocols.to_vec()))
            }
            [host, port, username, password] => {
                let port: u16 = port.parse().ok()?;
                Some(
                    ProxyInput::new(*host, port, default_protocols.to_vec()).with_auth(
                        ProxyAuth::credentials(username.to_string(), password.to_string()),
                    ),
                )
            }
            _ => None,
        }
    }

    /// Parse proxies from a string.
    ///
    /// A JSON array of proxy objects is read whole; anything else is read
    /// line by line and unparseable lines are skipped.
    pub fn parse_string(content: &str, default_protocols: &[Protocol]) -> Vec<ProxyInput> {
        if content.trim_start().starts_with('[') {
            match serde_json::from_str::<Vec<ProxyInput>>(content) {
                Ok(proxies) => return proxies,
                Err(e) => debug!("Not a JSON proxy list: {}", e),
            }
        }

        content
            .lines()
            .filter_map(|line| {
                let proxy = Self::parse_line(line, default_protocols);
                if proxy.is_none() && !line.trim().is_empty() && !line.trim().starts_with('#') {
                    debug!("Skipping unparseable line: {}", line.trim());
                }
                proxy
            })
            .collect()
    }

    /// Parse proxies from a file
    pub fn parse_file<P: AsRef<Path>>(
        path: P,
        default_protocols: &[Protocol],
    ) -> Result<Vec<ProxyInput>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read proxy list {}", path.display()))?;
        Ok(Self::parse_string(&content, default_protocols))
    }
}
