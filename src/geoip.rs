//! GeoIP country lookup using a MaxMind GeoLite2 database

use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

/// Result of a country lookup
#[derive(Debug, Clone)]
pub struct GeoResult {
    /// ISO 3166-1 alpha-2 code, e.g. "US"
    pub country: String,
    /// English display name, e.g. "United States"
    pub country_name: String,
    /// Continent code, e.g. "NA"
    pub continent: String,
}

/// Optional GeoIP resolver. A missing or unreadable database yields a
/// resolver that always returns `None`.
pub struct GeoIp {
    reader: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    pub fn new(database_path: &str) -> Self {
        if database_path.is_empty() {
            info!("No GeoIP database path configured, country lookup disabled");
            return Self { reader: None };
        }

        let path = Path::new(database_path);
        if !path.exists() {
            warn!("GeoIP database not found at: {}", database_path);
            return Self { reader: None };
        }

        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!("GeoIP database loaded: {}", database_path);
                Self {
                    reader: Some(reader),
                }
            }
            Err(e) => {
                warn!("Failed to load GeoIP database: {} (country lookup disabled)", e);
                Self { reader: None }
            }
        }
    }

    /// Resolve an IP string to its country. Returns `None` when the
    /// resolver is disabled, the input is not an IP, or the database
    /// has no record for it.
    pub fn lookup(&self, ip: &str) -> Option<GeoResult> {
        let reader = self.reader.as_ref()?;
        let ip_addr: IpAddr = ip.parse().ok()?;

        let record: geoip2::Country = reader.lookup(ip_addr).ok()?;
        let country = record.country.as_ref()?;

        Some(GeoResult {
            country: country.iso_code.unwrap_or_default().to_string(),
            country_name: country
                .names
                .as_ref()
                .and_then(|names| names.get("en").copied())
                .unwrap_or_default()
                .to_string(),
            continent: record
                .continent
                .as_ref()
                .and_then(|c| c.code)
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub fn is_available(&self) -> bool {
        self.reader.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_disables_lookup() {
        let geoip = GeoIp::new("/nonexistent/GeoLite2-Country.mmdb");
        assert!(!geoip.is_available());
        assert!(geoip.lookup("8.8.8.8").is_none());
    }

    #[test]
    fn empty_path_disables_lookup() {
        let geoip = GeoIp::new("");
        assert!(!geoip.is_available());
    }

    #[test]
    fn garbage_input_yields_none() {
        let geoip = GeoIp::new("");
        assert!(geoip.lookup("not-an-ip").is_none());
    }
}
