use maxminddb::Reader;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{AppError, AppResult};

// ── Types ──────────────────────────────────────────────────────────────────

/// Geolocation data for a single IP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
}

/// IP → location lookup. Lookups are local and synchronous.
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: &str) -> AppResult<GeoInfo>;
}

// ── MaxMind GeoLite2 ───────────────────────────────────────────────────────

/// Reads a local GeoLite2-City database, opened once at startup.
pub struct MaxMindLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl MaxMindLocator {
    pub fn open(path: &str) -> Result<Self, maxminddb::MaxMindDbError> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }
}

impl GeoLocator for MaxMindLocator {
    fn locate(&self, ip: &str) -> AppResult<GeoInfo> {
        if is_private(ip) {
            return Err(AppError::NotFound(format!("{ip} is not a public address")));
        }

        let ip_addr = parse_ip(ip)
            .ok_or_else(|| AppError::InvalidInput(format!("unparseable IP address '{ip}'")))?;

        let result = self
            .reader
            .lookup(ip_addr)
            .map_err(|e| AppError::Unavailable(format!("geo lookup for {ip}: {e}")))?;
        let city: maxminddb::geoip2::City = result
            .decode()
            .map_err(|e| AppError::Unavailable(format!("geo decode for {ip}: {e}")))?
            .ok_or_else(|| AppError::NotFound(format!("no location for {ip}")))?;

        let country = city.country.names.english.map(String::from);
        let city_name = city.city.names.english.map(String::from);

        tracing::trace!(
            "MaxMind lookup for {}: country={:?}, city={:?}",
            ip,
            country,
            city_name
        );

        match (country, city_name) {
            (None, None) => Err(AppError::NotFound(format!("no location for {ip}"))),
            (country, city) => Ok(GeoInfo {
                country: country.unwrap_or_else(|| crate::enrich::UNKNOWN.to_owned()),
                city: city.unwrap_or_else(|| crate::enrich::UNKNOWN.to_owned()),
            }),
        }
    }
}

/// Stand-in used when the GeoLite2 file could not be opened.
pub struct NoGeoDatabase;

impl GeoLocator for NoGeoDatabase {
    fn locate(&self, _ip: &str) -> AppResult<GeoInfo> {
        Err(AppError::Unavailable("no geolocation database loaded".into()))
    }
}

// ── Internal helpers ───────────────────────────────────────────────────────

fn parse_ip(ip_str: &str) -> Option<IpAddr> {
    // Strip IPv6-mapped IPv4 prefix: "::ffff:1.2.3.4" → "1.2.3.4"
    let ip_str = ip_str.strip_prefix("::ffff:").unwrap_or(ip_str);
    IpAddr::from_str(ip_str).ok()
}

/// Return `true` for addresses that can never be geolocated: loopback,
/// link-local, private ranges, IPv6 special addresses, and garbage.
pub fn is_private(ip_str: &str) -> bool {
    match parse_ip(ip_str) {
        Some(IpAddr::V4(addr)) => {
            addr.is_loopback()          // 127.x.x.x
            || addr.is_link_local()     // 169.254.x.x
            || addr.is_unspecified()    // 0.0.0.0
            || addr.is_broadcast()
            || addr.is_private() // 10/8, 172.16/12, 192.168/16
        }
        Some(IpAddr::V6(addr)) => {
            addr.is_loopback()       // ::1
            || addr.is_unspecified() // ::
            // fe80::/10  link-local
            || (addr.segments()[0] & 0xffc0) == 0xfe80
            // fc00::/7   unique-local
            || (addr.segments()[0] & 0xfe00) == 0xfc00
        }
        None => true,
    }
}
