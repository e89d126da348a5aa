use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::{
    error::{AppError, AppResult},
    models::{EnrichedStatsEvent, MappingRecord},
    store::{MappingReader, MappingWriter, StatsDimension, StatsStore},
};

// ── Connection ─────────────────────────────────────────────────────────────

/// Open the SQLite pool (creating the file if needed) and apply the embedded
/// migrations from `migrations/`.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(
            database_url
                .parse::<SqliteConnectOptions>()?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal),
        )
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}

/// SQLite-backed mapping store and enriched-event store.
///
/// Both tables live in the same database; the two roles are exposed through
/// separate traits so either can be moved to another backend later.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const MAPPING_COLUMNS: &str = "id, original_url, url_token, created_at, updated_at";

// ── Mappings ───────────────────────────────────────────────────────────────

#[async_trait]
impl MappingReader for SqliteStore {
    async fn get_mapping_by_token(&self, token: &str) -> AppResult<Option<MappingRecord>> {
        let record: Option<MappingRecord> = sqlx::query_as(&format!(
            "SELECT {MAPPING_COLUMNS} FROM mappings WHERE url_token = ?1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to get mapping '{}' from db: {:?}", token, e);
            AppError::from(e)
        })?;

        Ok(record)
    }

    async fn get_last_id(&self) -> AppResult<i64> {
        // sqlite_sequence remembers ids whose rows were deleted since
        let last_id: i64 = sqlx::query_scalar(
            "SELECT MAX(
                 COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'mappings'), 0),
                 COALESCE((SELECT MAX(id) FROM mappings), 0)
             )",
        )
        .fetch_one(&self.pool)
        .await?;

        if last_id == 0 {
            tracing::info!("No existing mappings found in database");
        } else {
            tracing::info!("Last mapping id in database is {}", last_id);
        }

        Ok(last_id)
    }
}

#[async_trait]
impl MappingWriter for SqliteStore {
    async fn add_new_mapping(
        &self,
        id: i64,
        original_url: &str,
        token: &str,
    ) -> AppResult<MappingRecord> {
        let now = Utc::now();

        let result: Result<MappingRecord, sqlx::Error> = sqlx::query_as(&format!(
            "INSERT INTO mappings (id, original_url, url_token, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             RETURNING {MAPPING_COLUMNS}"
        ))
        .bind(id)
        .bind(original_url)
        .bind(token)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(record) => Ok(record),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                AppError::AlreadyExists(format!("mapping with id {id} (token '{token}') exists")),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_original_url(&self, token: &str, new_url: &str) -> AppResult<MappingRecord> {
        let record: Option<MappingRecord> = sqlx::query_as(&format!(
            "UPDATE mappings SET original_url = ?1, updated_at = ?2
             WHERE url_token = ?3
             RETURNING {MAPPING_COLUMNS}"
        ))
        .bind(new_url)
        .bind(Utc::now())
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| AppError::NotFound(format!("no mapping with token '{token}'")))
    }

    async fn delete_mapping_info(&self, token: &str) -> AppResult<()> {
        let affected = sqlx::query("DELETE FROM mappings WHERE url_token = ?1")
            .bind(token)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            return Err(AppError::NotFound(format!("no mapping with token '{token}'")));
        }
        Ok(())
    }
}

// ── Stats events ───────────────────────────────────────────────────────────

#[async_trait]
impl StatsStore for SqliteStore {
    async fn add_stats_event(&self, event: &EnrichedStatsEvent) -> AppResult<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO stats_events
                 (event_id, url_token, timestamp, country, city, device_type, referrer)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(event.event_id.to_string())
        .bind(&event.url_token)
        .bind(event.timestamp)
        .bind(&event.country)
        .bind(&event.city)
        .bind(event.device_type.as_str())
        .bind(&event.referrer)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted > 0)
    }

    async fn count_events(&self, token: &str) -> AppResult<i64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stats_events WHERE url_token = ?1")
            .bind(token)
            .fetch_one(&self.pool)
            .await?;

        Ok(total)
    }

    async fn count_by(&self, token: &str, dimension: StatsDimension) -> AppResult<Vec<(String, i64)>> {
        let column = dimension.column();
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT {column}, COUNT(*) FROM stats_events
             WHERE url_token = ?1
             GROUP BY {column}"
        ))
        .bind(token)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    pool
}
