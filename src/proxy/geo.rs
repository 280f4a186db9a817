//! Country lookup for proxy addresses using MMDB
//!
//! The database is opened once into a process-wide cache and is read-only
//! afterwards.

use anyhow::Result;
use maxminddb::{geoip2, Reader};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::VerifyError;

static COUNTRY_DATA: OnceCell<GeoLocator> = OnceCell::new();

/// Country information for an IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 country code (e.g., "US", "CN")
    pub country_code: Option<String>,
    /// Country name in English
    pub country_name: Option<String>,
    /// Continent code (e.g., "NA", "EU", "AS")
    pub continent_code: Option<String>,
}

impl GeoLocation {
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none() && self.country_name.is_none() && self.continent_code.is_none()
    }
}

impl std::fmt::Display for GeoLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.country_name, &self.country_code) {
            (Some(name), Some(code)) => write!(f, "{} ({})", name, code),
            (Some(name), None) => write!(f, "{}", name),
            (None, Some(code)) => write!(f, "{}", code),
            (None, None) => write!(f, "Unknown Location"),
        }
    }
}

/// Looks up IP addresses in a MaxMind country or city database
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the location for an IP address string
    pub fn lookup(&self, ip_str: &str) -> Result<GeoLocation> {
        let ip: IpAddr = ip_str.trim().parse()?;
        self.lookup_ip(ip)
    }

    pub fn lookup_ip(&self, ip: IpAddr) -> Result<GeoLocation> {
        let lookup_result = self.reader.lookup(ip)?;

        // City databases decode as Country too; extra fields are skipped.
        let country: Option<geoip2::Country> = lookup_result.decode()?;

        let Some(country) = country else {
            return Ok(GeoLocation::default());
        };

        Ok(GeoLocation {
            country_code: country.country.iso_code.map(String::from),
            country_name: country.country.names.english.map(String::from),
            continent_code: country.continent.code.map(String::from),
        })
    }

    /// Lower-case ISO country code for an address, if known
    pub fn lookup_country(&self, ip_str: &str) -> Option<String> {
        self.lookup(ip_str)
            .ok()
            .and_then(|location| location.country_code)
            .map(|code| code.to_lowercase())
    }
}

impl Clone for GeoLocator {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

/// Open the country database into the shared cache.
///
/// Only the first successful call loads anything; later calls return the
/// cached data.
pub fn load_country_data<P: AsRef<Path>>(path: P) -> crate::error::Result<&'static GeoLocator> {
    COUNTRY_DATA.get_or_try_init(|| {
        let path = path.as_ref();
        let locator = GeoLocator::from_path(path)
            .map_err(|e| VerifyError::Geo(format!("{}: {}", path.display(), e)))?;
        info!("Loaded country data from {}", path.display());
        Ok(locator)
    })
}

pub fn is_country_data_loaded() -> bool {
    COUNTRY_DATA.get().is_some()
}

/// Country of an address from the shared cache; `None` when no data is loaded
pub fn lookup_country(ip_str: &str) -> Option<String> {
    COUNTRY_DATA.get()?.lookup_country(ip_str)
}
