//! Database access layer with SQLx and PostgreSQL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::{
    AlertIntent, DataSourceReading, ExecutionContext, ExecutionRecord, Indicator, ReadingRequest,
};
use crate::store::{AlertLog, DataSource, ExecutionHistory, IndicatorStore, Notifier};

const INDICATOR_COLUMNS: &str = r#"
    id, code, name, frequency_minutes, last_run, is_active,
    collector_id, item_name, last_minutes,
    threshold_type, threshold_field, threshold_comparison, threshold_value,
    minimum_threshold, cooldown_minutes, priority, owner_contact_id,
    is_currently_running, execution_start_time
"#;

const EXECUTION_COLUMNS: &str = r#"
    id, indicator_id, executed_at, duration_ms, success,
    current_value, historical_value, deviation_percent,
    should_alert, alert_suppressed, error_message, execution_context
"#;

/// Postgres SQLSTATE for `statement_timeout` cancellations
const QUERY_CANCELED: &str = "57014";

/// Database connection pool and operations
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    data_source_function: String,
}

impl Database {
    /// Create a new database connection pool.
    ///
    /// `data_source_function` names the set-returning SQL function the data
    /// source adapter calls; it is interpolated into SQL and must be a plain
    /// (optionally schema-qualified) identifier.
    pub async fn new(connection_string: &str, data_source_function: &str) -> Result<Self> {
        if !is_valid_identifier(data_source_function) {
            return Err(AppError::InvalidRequest(format!(
                "Invalid data source function name: {data_source_function}"
            )));
        }

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(connection_string)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {}", e)))?;

        info!("Database connection pool established");
        Ok(Self {
            pool,
            data_source_function: data_source_function.to_string(),
        })
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {}", e)))?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl IndicatorStore for Database {
    async fn due_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Indicator>> {
        let query = format!(
            r#"
            SELECT {INDICATOR_COLUMNS}
            FROM indicators
            WHERE is_active
              AND NOT is_currently_running
              AND (last_run IS NULL OR last_run <= $1 - make_interval(mins => frequency_minutes))
            ORDER BY last_run ASC NULLS FIRST, id ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(indicator_from_row).collect()
    }

    async fn get_indicator(&self, id: i64) -> Result<Option<Indicator>> {
        let query = format!("SELECT {INDICATOR_COLUMNS} FROM indicators WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(indicator_from_row).transpose()
    }

    async fn try_acquire_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE indicators
            SET is_currently_running = TRUE, execution_start_time = $2
            WHERE id = $1 AND is_currently_running = FALSE
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_running(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE indicators
            SET is_currently_running = FALSE, execution_start_time = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_last_run(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        // GREATEST skips NULLs, so a first run just takes `at`
        let result = sqlx::query("UPDATE indicators SET last_run = GREATEST(last_run, $2) WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("indicator {id}")));
        }
        Ok(())
    }

    async fn running_indicators(&self) -> Result<Vec<Indicator>> {
        let query = format!(
            "SELECT {INDICATOR_COLUMNS} FROM indicators WHERE is_currently_running ORDER BY id"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(indicator_from_row).collect()
    }

    async fn force_release(&self, id: i64, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE indicators
            SET is_currently_running = FALSE, execution_start_time = NULL
            WHERE id = $1 AND is_currently_running AND execution_start_time = $2
            "#,
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionHistory for Database {
    async fn append(&self, record: &ExecutionRecord) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO indicator_executions (
                indicator_id, executed_at, duration_ms, success,
                current_value, historical_value, deviation_percent,
                should_alert, alert_suppressed, error_message, execution_context
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(record.indicator_id)
        .bind(record.executed_at)
        .bind(record.duration_ms)
        .bind(record.success)
        .bind(record.current_value)
        .bind(record.historical_value)
        .bind(record.deviation_percent)
        .bind(record.should_alert)
        .bind(record.alert_suppressed)
        .bind(&record.error_message)
        .bind(record.execution_context.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn recent(&self, indicator_id: i64, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let query = format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM indicator_executions
            WHERE indicator_id = $1
            ORDER BY executed_at DESC, id DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&query)
            .bind(indicator_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(execution_from_row).collect()
    }
}

#[async_trait]
impl AlertLog for Database {
    async fn last_alert_time(&self, indicator_id: i64) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(trigger_time) AS last FROM alert_log WHERE indicator_id = $1")
            .bind(indicator_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("last")?)
    }
}

#[async_trait]
impl Notifier for Database {
    /// Persists the intent to `alert_log`; delivery workers pick it up from there.
    async fn submit(&self, intent: &AlertIntent) -> Result<()> {
        let channels: Vec<String> = intent
            .severity
            .channels()
            .iter()
            .map(|c| c.to_string())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO alert_log (
                intent_id, indicator_id, trigger_time, severity, channels,
                owner_contact_id, current_value, deviation_percent, message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (intent_id) DO NOTHING
            "#,
        )
        .bind(intent.id)
        .bind(intent.indicator_id)
        .bind(intent.triggered_at)
        .bind(intent.severity.as_str())
        .bind(&channels)
        .bind(intent.owner_contact_id)
        .bind(intent.current_value)
        .bind(intent.deviation_percent)
        .bind(intent.summary())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DataSource for Database {
    /// Calls the collector function inside a transaction so the statement
    /// timeout stays local to this call.
    async fn fetch(&self, request: &ReadingRequest) -> Result<DataSourceReading> {
        let mut tx = self.pool.begin().await.map_err(data_source_error)?;

        // SET does not take bind parameters
        let timeout_ms = request.timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .execute(&mut *tx)
            .await
            .map_err(data_source_error)?;

        let query = format!(
            "SELECT current_value, historical_value, volume FROM {}($1, $2, $3, $4, $5)",
            self.data_source_function
        );
        let row = sqlx::query(&query)
            .bind(request.collector_id)
            .bind(&request.item_name)
            .bind(request.window_minutes)
            .bind(&request.threshold_type)
            .bind(&request.threshold_field)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                if is_query_canceled(&e) {
                    AppError::Timeout(timeout_ms as u64)
                } else {
                    data_source_error(e)
                }
            })?;

        tx.commit().await.map_err(data_source_error)?;

        let row = row.ok_or_else(|| {
            AppError::DataSourceError(format!(
                "{} returned no rows for collector {} item {}",
                self.data_source_function, request.collector_id, request.item_name
            ))
        })?;

        let current_value: Option<Decimal> = row.try_get("current_value").map_err(data_source_error)?;
        let current_value = current_value.ok_or_else(|| {
            AppError::DataSourceError(format!("null current value for item {}", request.item_name))
        })?;

        debug!(
            indicator_id = request.indicator_id,
            collector_id = request.collector_id,
            "Reading fetched"
        );

        Ok(DataSourceReading {
            current_value,
            historical_value: row.try_get("historical_value").map_err(data_source_error)?,
            volume: row.try_get("volume").map_err(data_source_error)?,
        })
    }
}

fn indicator_from_row(row: &PgRow) -> Result<Indicator> {
    Ok(Indicator {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        frequency_minutes: row.try_get("frequency_minutes")?,
        last_run: row.try_get("last_run")?,
        is_active: row.try_get("is_active")?,
        collector_id: row.try_get("collector_id")?,
        item_name: row.try_get("item_name")?,
        last_minutes: row.try_get("last_minutes")?,
        threshold_type: row.try_get("threshold_type")?,
        threshold_field: row.try_get("threshold_field")?,
        threshold_comparison: row.try_get("threshold_comparison")?,
        threshold_value: row.try_get("threshold_value")?,
        minimum_threshold: row.try_get("minimum_threshold")?,
        cooldown_minutes: row.try_get("cooldown_minutes")?,
        priority: row.try_get("priority")?,
        owner_contact_id: row.try_get("owner_contact_id")?,
        is_currently_running: row.try_get("is_currently_running")?,
        execution_start_time: row.try_get("execution_start_time")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord> {
    let context: String = row.try_get("execution_context")?;
    let execution_context = context
        .parse::<ExecutionContext>()
        .map_err(AppError::DatabaseError)?;

    Ok(ExecutionRecord {
        id: Some(row.try_get("id")?),
        indicator_id: row.try_get("indicator_id")?,
        executed_at: row.try_get("executed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        success: row.try_get("success")?,
        current_value: row.try_get("current_value")?,
        historical_value: row.try_get("historical_value")?,
        deviation_percent: row.try_get("deviation_percent")?,
        should_alert: row.try_get("should_alert")?,
        alert_suppressed: row.try_get("alert_suppressed")?,
        error_message: row.try_get("error_message")?,
        execution_context,
    })
}

fn data_source_error(err: sqlx::Error) -> AppError {
    AppError::DataSourceError(err.to_string())
}

fn is_query_canceled(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED))
}

/// `name` or `schema.name`, each part a plain lowercase-or-mixed SQL identifier
pub fn is_valid_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("indicator_reading"));
        assert!(is_valid_identifier("collectors.read_item"));
        assert!(is_valid_identifier("_private"));

        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1reading"));
        assert!(!is_valid_identifier("reading; DROP TABLE indicators"));
        assert!(!is_valid_identifier("a.b.c"));
        assert!(!is_valid_identifier("schema."));
        assert!(!is_valid_identifier(&"x".repeat(64)));
    }
}
