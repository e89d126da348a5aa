use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A row from the `mappings` table.
///
/// `url_token` is derived from `id` and never changes; only `original_url`
/// (and with it `updated_at`) is mutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct MappingRecord {
    pub id: i64,
    pub original_url: String,
    pub url_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One redirect, as captured on the hot path and published to the stats bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatsEvent {
    /// Assigned once at redirect time; survives redelivery unchanged.
    pub event_id: Uuid,
    pub url_token: String,
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
    pub referrer: String,
}

impl RawStatsEvent {
    pub fn new(
        url_token: impl Into<String>,
        ip: impl Into<String>,
        user_agent: impl Into<String>,
        referrer: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            url_token: url_token.into(),
            timestamp: Utc::now(),
            ip: ip.into(),
            user_agent: user_agent.into(),
            referrer: referrer.into(),
        }
    }
}

/// Device classification of a user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Bot,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "Mobile",
            DeviceType::Tablet => "Tablet",
            DeviceType::Desktop => "Desktop",
            DeviceType::Bot => "Bot",
            DeviceType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw event after geolocation and device classification. Append-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedStatsEvent {
    pub event_id: Uuid,
    pub url_token: String,
    pub timestamp: DateTime<Utc>,
    pub country: String,
    pub city: String,
    pub device_type: DeviceType,
    pub referrer: String,
}

/// Per-token counters, recomputed on every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateStats {
    pub url_token: String,
    pub total_clicks: i64,
    #[serde(rename = "unique_countries")]
    pub count_by_country: HashMap<String, i64>,
    #[serde(rename = "unique_cities")]
    pub count_by_city: HashMap<String, i64>,
    #[serde(rename = "device_types")]
    pub count_by_device_type: HashMap<String, i64>,
    #[serde(rename = "referrer_stats")]
    pub count_by_referrer: HashMap<String, i64>,
}
