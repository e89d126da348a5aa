use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    enrich::EventEnricher,
    error::{AppError, AppResult},
    models::{AggregateStats, RawStatsEvent},
    store::{StatsDimension, StatsStore},
};

/// Decodes a bus payload, enriches it and appends it to the fact table.
pub struct StatsProcessor {
    enricher: EventEnricher,
    store: Arc<dyn StatsStore>,
}

impl StatsProcessor {
    pub fn new(enricher: EventEnricher, store: Arc<dyn StatsStore>) -> Self {
        Self { enricher, store }
    }

    pub async fn process_event(&self, payload: &[u8]) -> AppResult<()> {
        let raw: RawStatsEvent = serde_json::from_slice(payload)?;
        let event = self.enricher.enrich(raw);

        if !self.store.add_stats_event(&event).await? {
            tracing::debug!("Stats event {} already stored, skipping", event.event_id);
        }
        Ok(())
    }
}

/// Computes [`AggregateStats`] for a token by grouping its fact rows.
pub struct StatsAggregator {
    store: Arc<dyn StatsStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self { store }
    }

    /// Fails with `NotFound` when no events exist for `token`, which also
    /// covers a token that exists but was never visited.
    pub async fn calculate_statistics(&self, token: &str) -> AppResult<AggregateStats> {
        let total_clicks = self.store.count_events(token).await?;
        if total_clicks == 0 {
            return Err(AppError::NotFound(format!(
                "no statistics found for token '{token}'"
            )));
        }

        Ok(AggregateStats {
            url_token: token.to_owned(),
            total_clicks,
            count_by_country: self.breakdown(token, StatsDimension::Country).await?,
            count_by_city: self.breakdown(token, StatsDimension::City).await?,
            count_by_device_type: self.breakdown(token, StatsDimension::DeviceType).await?,
            count_by_referrer: self.breakdown(token, StatsDimension::Referrer).await?,
        })
    }

    async fn breakdown(
        &self,
        token: &str,
        dimension: StatsDimension,
    ) -> AppResult<HashMap<String, i64>> {
        Ok(self.store.count_by(token, dimension).await?.into_iter().collect())
    }
}
