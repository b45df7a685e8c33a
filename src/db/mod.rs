//! Statistics store
//!
//! SQLite-backed persistent statistics with upsert-accumulate
//! semantics: re-inserting an existing key adds the incoming counters
//! to the stored ones. All writes from the collector arrive as one
//! transactional batch.

mod schema;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;

use crate::legacy::LegacyUserStats;

/// Canonical minute bucket key, e.g. `2024-05-01T13:37:00`.
pub fn minute_key(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:00").to_string()
}

/// Canonical hour bucket key, e.g. `2024-05-01T13:00:00`.
pub fn hour_key(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:00:00").to_string()
}

/// One aggregated traffic record ready for upsert into the stat tables.
#[derive(Debug, Clone)]
pub struct TrafficRecord {
    pub username: String,
    pub domain: String,
    pub upload: i64,
    pub download: i64,
    pub conn_count: i64,
    pub country: String,
    pub country_name: String,
    pub continent: String,
    pub minute: String,
    pub hour: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StatsDb {
    pool: Pool<Sqlite>,
}

impl StatsDb {
    /// Open (or create) the statistics database and initialise all
    /// tables and indexes.
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // Relaxed fsync is safe under WAL
                    sqlx::query("PRAGMA synchronous = NORMAL")
                        .execute(&mut *conn)
                        .await?;
                    // 16 MB page cache
                    sqlx::query("PRAGMA cache_size = -16000")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA busy_timeout = 5000")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA temp_store = MEMORY")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        // WAL persists at the database level
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;

        for stmt in [
            schema::CREATE_USER_STATS,
            schema::CREATE_DOMAIN_STATS,
            schema::CREATE_MINUTE_STATS,
            schema::CREATE_HOURLY_STATS,
            schema::CREATE_COUNTRY_STATS,
            schema::CREATE_RETENTION_CONFIG,
            schema::CREATE_INDEX_DOMAIN_TRAFFIC,
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ==================== BATCH WRITE ====================

    /// Write a batch of aggregated records into all stat tables inside
    /// a single transaction. The user row is always touched; domain,
    /// minute, hour and country rows only when the record carries a
    /// non-empty key for them.
    pub async fn batch_upsert(&self, records: &[TrafficRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for r in records {
            let ts = r.timestamp.to_rfc3339();

            sqlx::query(
                r#"INSERT INTO user_stats (username, total_upload, total_download, conn_count, first_seen, last_access)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT(username) DO UPDATE SET
                       total_upload   = total_upload   + excluded.total_upload,
                       total_download = total_download + excluded.total_download,
                       conn_count     = conn_count     + excluded.conn_count,
                       last_access    = excluded.last_access"#,
            )
            .bind(&r.username)
            .bind(r.upload)
            .bind(r.download)
            .bind(r.conn_count)
            .bind(&ts)
            .bind(&ts)
            .execute(&mut *tx)
            .await?;

            if !r.domain.is_empty() {
                sqlx::query(
                    r#"INSERT INTO domain_stats (user, domain, upload, download, conn_count, last_seen)
                       VALUES (?, ?, ?, ?, ?, ?)
                       ON CONFLICT(user, domain) DO UPDATE SET
                           upload     = upload     + excluded.upload,
                           download   = download   + excluded.download,
                           conn_count = conn_count + excluded.conn_count,
                           last_seen  = excluded.last_seen"#,
                )
                .bind(&r.username)
                .bind(&r.domain)
                .bind(r.upload)
                .bind(r.download)
                .bind(r.conn_count)
                .bind(&ts)
                .execute(&mut *tx)
                .await?;
            }

            if !r.minute.is_empty() {
                sqlx::query(
                    r#"INSERT INTO minute_stats (user, minute, upload, download, conn_count)
                       VALUES (?, ?, ?, ?, ?)
                       ON CONFLICT(user, minute) DO UPDATE SET
                           upload     = upload     + excluded.upload,
                           download   = download   + excluded.download,
                           conn_count = conn_count + excluded.conn_count"#,
                )
                .bind(&r.username)
                .bind(&r.minute)
                .bind(r.upload)
                .bind(r.download)
                .bind(r.conn_count)
                .execute(&mut *tx)
                .await?;
            }

            if !r.hour.is_empty() {
                sqlx::query(
                    r#"INSERT INTO hourly_stats (user, hour, upload, download, conn_count)
                       VALUES (?, ?, ?, ?, ?)
                       ON CONFLICT(user, hour) DO UPDATE SET
                           upload     = upload     + excluded.upload,
                           download   = download   + excluded.download,
                           conn_count = conn_count + excluded.conn_count"#,
                )
                .bind(&r.username)
                .bind(&r.hour)
                .bind(r.upload)
                .bind(r.download)
                .bind(r.conn_count)
                .execute(&mut *tx)
                .await?;
            }

            if !r.country.is_empty() {
                sqlx::query(
                    r#"INSERT INTO country_stats (user, country, country_name, continent, upload, download, conn_count, last_seen)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                       ON CONFLICT(user, country) DO UPDATE SET
                           country_name = COALESCE(NULLIF(country_stats.country_name, ''), excluded.country_name),
                           continent    = COALESCE(NULLIF(country_stats.continent, ''), excluded.continent),
                           upload       = upload     + excluded.upload,
                           download     = download   + excluded.download,
                           conn_count   = conn_count + excluded.conn_count,
                           last_seen    = excluded.last_seen"#,
                )
                .bind(&r.username)
                .bind(&r.country)
                .bind(&r.country_name)
                .bind(&r.continent)
                .bind(r.upload)
                .bind(r.download)
                .bind(r.conn_count)
                .bind(&ts)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    // ==================== READ QUERIES ====================

    pub async fn get_overview(&self) -> Result<Overview> {
        let (total_upload, total_download, total_connections, user_count): (i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT COALESCE(SUM(total_upload),0), COALESCE(SUM(total_download),0), COALESCE(SUM(conn_count),0), COUNT(*) FROM user_stats",
            )
            .fetch_one(&self.pool)
            .await?;

        let (domain_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT domain) FROM domain_stats")
                .fetch_one(&self.pool)
                .await?;
        let (country_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT country) FROM country_stats")
                .fetch_one(&self.pool)
                .await?;

        Ok(Overview {
            total_upload,
            total_download,
            total_connections,
            domain_count,
            user_count,
            country_count,
        })
    }

    pub async fn get_all_users(&self) -> Result<Vec<UserRow>> {
        let rows: Vec<(String, i64, i64, i64, i64, String, String, i64)> = sqlx::query_as(
            r#"SELECT username, total_upload, total_download, conn_count, request_count,
                      COALESCE(first_seen,''), COALESCE(last_access,''), disabled
               FROM user_stats ORDER BY total_upload + total_download DESC"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UserRow::from_tuple).collect())
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<UserRow>> {
        let row: Option<(String, i64, i64, i64, i64, String, String, i64)> = sqlx::query_as(
            r#"SELECT username, total_upload, total_download, conn_count, request_count,
                      COALESCE(first_seen,''), COALESCE(last_access,''), disabled
               FROM user_stats WHERE username = ?"#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserRow::from_tuple))
    }

    /// Top domains by total traffic, optionally filtered to one user.
    pub async fn get_top_domains(&self, limit: i64, user: &str) -> Result<Vec<DomainRow>> {
        let rows: Vec<(String, String, i64, i64, i64, String)> = if user.is_empty() {
            sqlx::query_as(
                r#"SELECT user, domain, upload, download, conn_count, COALESCE(last_seen,'')
                   FROM domain_stats ORDER BY upload + download DESC LIMIT ?"#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"SELECT user, domain, upload, download, conn_count, COALESCE(last_seen,'')
                   FROM domain_stats WHERE user = ? ORDER BY upload + download DESC LIMIT ?"#,
            )
            .bind(user)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows
            .into_iter()
            .map(
                |(user, domain, upload, download, conn_count, last_seen)| DomainRow {
                    user,
                    domain,
                    upload,
                    download,
                    conn_count,
                    last_seen,
                },
            )
            .collect())
    }

    /// Time-series points for a named range. Minute granularity for
    /// short ranges, hourly for the long ones; unknown ranges fall
    /// back to `1h`.
    pub async fn get_trends(&self, range: &str) -> Result<Vec<TrendPoint>> {
        let now = Utc::now();
        let (table, time_col, since) = match range {
            "30m" => ("minute_stats", "minute", minute_key(&(now - Duration::minutes(30)))),
            "24h" => ("hourly_stats", "hour", hour_key(&(now - Duration::hours(24)))),
            "7d" => ("hourly_stats", "hour", hour_key(&(now - Duration::days(7)))),
            _ => ("minute_stats", "minute", minute_key(&(now - Duration::hours(1)))),
        };

        let query = format!(
            "SELECT {col}, SUM(upload), SUM(download), SUM(conn_count) FROM {table} \
             WHERE {col} >= ? GROUP BY {col} ORDER BY {col}",
            col = time_col,
            table = table,
        );

        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(&query)
            .bind(&since)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(time, upload, download, connections)| TrendPoint {
                time,
                upload,
                download,
                connections,
            })
            .collect())
    }

    /// Per-country totals aggregated across users, busiest first.
    pub async fn get_country_stats(&self) -> Result<Vec<CountryRow>> {
        let rows: Vec<(String, String, String, i64, i64, i64)> = sqlx::query_as(
            r#"SELECT country, COALESCE(country_name,''), COALESCE(continent,''),
                      SUM(upload), SUM(download), SUM(conn_count)
               FROM country_stats GROUP BY country
               ORDER BY SUM(upload) + SUM(download) DESC"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(country, country_name, continent, upload, download, conn_count)| CountryRow {
                    country,
                    country_name,
                    continent,
                    upload,
                    download,
                    conn_count,
                },
            )
            .collect())
    }

    // ==================== USER MANAGEMENT ====================

    /// Flip the disabled flag, creating the user row if it does not
    /// exist yet. Idempotent at the SQL level.
    pub async fn set_user_disabled(&self, username: &str, disabled: bool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO user_stats (username, disabled, first_seen, last_access)
               VALUES (?, ?, datetime('now'), datetime('now'))
               ON CONFLICT(username) DO UPDATE SET disabled = excluded.disabled"#,
        )
        .bind(username)
        .bind(disabled as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unknown users default to enabled.
    pub async fn is_user_disabled(&self, username: &str) -> bool {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT disabled FROM user_stats WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
                .ok()
                .flatten();
        matches!(row, Some((d,)) if d != 0)
    }

    /// Count a non-tunnel HTTP request seen under a valid certificate.
    pub async fn increment_request_count(&self, username: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO user_stats (username, request_count, first_seen, last_access)
               VALUES (?, 1, datetime('now'), datetime('now'))
               ON CONFLICT(username) DO UPDATE SET
                   request_count = request_count + 1,
                   last_access   = datetime('now')"#,
        )
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== RETENTION ====================

    /// Delete minute/hourly rows past their retention window.
    /// Best-effort: failures are logged by the caller's task.
    pub async fn cleanup_old_data(&self, minute_days: i64, hourly_days: i64) -> Result<(u64, u64)> {
        let now = Utc::now();
        let minute_cutoff = minute_key(&(now - Duration::days(minute_days)));
        let hourly_cutoff = hour_key(&(now - Duration::days(hourly_days)));

        let minutes = sqlx::query("DELETE FROM minute_stats WHERE minute < ?")
            .bind(&minute_cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let hours = sqlx::query("DELETE FROM hourly_stats WHERE hour < ?")
            .bind(&hourly_cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if minutes > 0 || hours > 0 {
            info!("Cleanup: deleted {} minute rows, {} hourly rows", minutes, hours);
        }
        Ok((minutes, hours))
    }

    // ==================== LEGACY MIGRATION ====================

    /// Import the legacy JSON statistics map. The old format only
    /// tracked a combined byte total, so it lands in total_download.
    pub async fn migrate_from_json(&self, users: &HashMap<String, LegacyUserStats>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for stats in users.values() {
            sqlx::query(
                r#"INSERT INTO user_stats (username, total_upload, total_download, conn_count, request_count, first_seen, last_access, disabled)
                   VALUES (?, 0, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(username) DO UPDATE SET
                       total_download = total_download + excluded.total_download,
                       conn_count     = conn_count + excluded.conn_count,
                       request_count  = request_count + excluded.request_count,
                       first_seen     = MIN(first_seen, excluded.first_seen),
                       last_access    = MAX(last_access, excluded.last_access),
                       disabled       = excluded.disabled"#,
            )
            .bind(&stats.username)
            .bind(stats.total_bytes as i64)
            .bind(stats.connection_count as i64)
            .bind(stats.requests_count as i64)
            .bind(stats.connected_since.to_rfc3339())
            .bind(stats.last_access.to_rfc3339())
            .bind(stats.disabled as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ==================== RESPONSE TYPES ====================

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub total_upload: i64,
    pub total_download: i64,
    pub total_connections: i64,
    pub domain_count: i64,
    pub user_count: i64,
    pub country_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub username: String,
    pub total_upload: i64,
    pub total_download: i64,
    pub conn_count: i64,
    pub request_count: i64,
    pub first_seen: String,
    pub last_access: String,
    pub disabled: bool,
}

impl UserRow {
    fn from_tuple(
        (username, total_upload, total_download, conn_count, request_count, first_seen, last_access, disabled): (
            String,
            i64,
            i64,
            i64,
            i64,
            String,
            String,
            i64,
        ),
    ) -> Self {
        Self {
            username,
            total_upload,
            total_download,
            conn_count,
            request_count,
            first_seen,
            last_access,
            disabled: disabled != 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainRow {
    pub user: String,
    pub domain: String,
    pub upload: i64,
    pub download: i64,
    pub conn_count: i64,
    pub last_seen: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub time: String,
    pub upload: i64,
    pub download: i64,
    pub connections: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountryRow {
    pub country: String,
    pub country_name: String,
    pub continent: String,
    pub upload: i64,
    pub download: i64,
    pub conn_count: i64,
}
