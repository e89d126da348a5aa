use std::sync::Arc;
use woothee::parser::Parser;

use crate::{
    geo::GeoLocator,
    models::{DeviceType, EnrichedStatsEvent, RawStatsEvent},
};

/// Value stored for any field that could not be resolved.
pub const UNKNOWN: &str = "Unknown";

/// Adds geography and device class to raw redirect events.
pub struct EventEnricher {
    locator: Arc<dyn GeoLocator>,
    parser: Parser,
}

impl EventEnricher {
    pub fn new(locator: Arc<dyn GeoLocator>) -> Self {
        Self {
            locator,
            parser: Parser::new(),
        }
    }

    /// Never fails: a geo miss becomes `"Unknown"` for both country and city.
    pub fn enrich(&self, raw: RawStatsEvent) -> EnrichedStatsEvent {
        let (country, city) = match self.locator.locate(&raw.ip) {
            Ok(info) => (info.country, info.city),
            Err(e) => {
                tracing::warn!("Failed to locate IP '{}': {}", raw.ip, e);
                (UNKNOWN.to_owned(), UNKNOWN.to_owned())
            }
        };

        EnrichedStatsEvent {
            event_id: raw.event_id,
            device_type: self.classify_device(&raw.user_agent),
            url_token: raw.url_token,
            timestamp: raw.timestamp,
            country,
            city,
            referrer: raw.referrer,
        }
    }

    /// Classify a User-Agent string using woothee.
    ///
    /// Checked in order mobile, tablet, desktop, bot. Anything else, including
    /// an empty or unparseable agent, is [`DeviceType::Unknown`].
    pub fn classify_device(&self, ua: &str) -> DeviceType {
        let ua = ua.trim();
        if ua.is_empty() {
            return DeviceType::Unknown;
        }

        let Some(result) = self.parser.parse(ua) else {
            return DeviceType::Unknown;
        };

        // woothee files tablets under "smartphone"; Android tablets omit the
        // "Mobile" token from their agent.
        let handheld = matches!(result.category, "smartphone" | "mobilephone");
        let tablet = result.os == "iPad"
            || (handheld && result.os == "Android" && !ua.contains("Mobile"))
            || ua.contains("Tablet");
        let mobile = handheld && !tablet;

        if mobile {
            DeviceType::Mobile
        } else if tablet {
            DeviceType::Tablet
        } else if result.category == "pc" {
            DeviceType::Desktop
        } else if result.category == "crawler" {
            DeviceType::Bot
        } else {
            DeviceType::Unknown
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        error::{AppError, AppResult},
        geo::GeoInfo,
    };

    const ANDROID_CHROME: &str = "Mozilla/5.0 (Linux; Android 10; SM-G973F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/83.0.4103.106 Mobile Safari/537.36";
    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1";
    const ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 13; SM-X710) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const WINDOWS_CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

    /// Resolves every address to one fixed location, or fails for listed IPs.
    pub(crate) struct StaticLocator {
        pub hits: Vec<(&'static str, &'static str, &'static str)>,
    }

    impl GeoLocator for StaticLocator {
        fn locate(&self, ip: &str) -> AppResult<GeoInfo> {
            self.hits
                .iter()
                .find(|(addr, _, _)| *addr == ip)
                .map(|(_, country, city)| GeoInfo {
                    country: (*country).to_owned(),
                    city: (*city).to_owned(),
                })
                .ok_or_else(|| AppError::NotFound(format!("no location for {ip}")))
        }
    }

    fn enricher() -> EventEnricher {
        EventEnricher::new(Arc::new(StaticLocator {
            hits: vec![("81.2.69.142", "United Kingdom", "London")],
        }))
    }

    #[test]
    fn classifies_by_priority() {
        let e = enricher();
        assert_eq!(e.classify_device(ANDROID_CHROME), DeviceType::Mobile);
        assert_eq!(e.classify_device(IPHONE), DeviceType::Mobile);
        assert_eq!(e.classify_device(IPAD), DeviceType::Tablet);
        assert_eq!(e.classify_device(ANDROID_TABLET), DeviceType::Tablet);
        assert_eq!(e.classify_device(WINDOWS_CHROME), DeviceType::Desktop);
        assert_eq!(e.classify_device(GOOGLEBOT), DeviceType::Bot);
    }

    #[test]
    fn empty_or_garbage_agent_is_unknown() {
        let e = enricher();
        assert_eq!(e.classify_device(""), DeviceType::Unknown);
        assert_eq!(e.classify_device("   "), DeviceType::Unknown);
        assert_eq!(e.classify_device("curl-ish/0"), DeviceType::Unknown);
    }

    #[test]
    fn enrich_resolves_location_and_keeps_identity() {
        let raw = RawStatsEvent::new("b", "81.2.69.142", ANDROID_CHROME, "https://ref.example");
        let enriched = enricher().enrich(raw.clone());

        assert_eq!(enriched.event_id, raw.event_id);
        assert_eq!(enriched.url_token, "b");
        assert_eq!(enriched.timestamp, raw.timestamp);
        assert_eq!(enriched.country, "United Kingdom");
        assert_eq!(enriched.city, "London");
        assert_eq!(enriched.device_type, DeviceType::Mobile);
        assert_eq!(enriched.referrer, "https://ref.example");
    }

    #[test]
    fn geo_miss_becomes_unknown() {
        let raw = RawStatsEvent::new("b", "10.0.0.1", GOOGLEBOT, "");
        let enriched = enricher().enrich(raw);

        assert_eq!(enriched.country, UNKNOWN);
        assert_eq!(enriched.city, UNKNOWN);
        assert_eq!(enriched.device_type, DeviceType::Bot);
    }
}
