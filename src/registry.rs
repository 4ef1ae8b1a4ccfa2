// src/registry.rs
//! Source registry: feed definitions, reliability counters, and the
//! blacklist. All mutation of source state goes through this contract;
//! counter updates are single SQL statements, so concurrent results can
//! never lose an update.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::config::SourceConfig;
use crate::store::{ts, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Primary,
    Secondary,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Primary => "primary",
            SourceTier::Secondary => "secondary",
        }
    }

    fn parse(raw: &str) -> SourceTier {
        match raw {
            "primary" => SourceTier::Primary,
            _ => SourceTier::Secondary,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Source {
    pub url: String,
    pub name: String,
    pub tier: SourceTier,
    pub consecutive_failures: i64,
    pub blacklisted: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub ok_count: i64,
    pub err_count: i64,
}

impl Source {
    /// Rolling success rate over everything recorded so far; 1.0 for a
    /// source that has never been fetched.
    pub fn success_rate(&self) -> f32 {
        let total = self.ok_count + self.err_count;
        if total == 0 {
            return 1.0;
        }
        self.ok_count as f32 / total as f32
    }
}

#[derive(Debug, Clone, FromRow)]
struct SourceRow {
    url: String,
    name: String,
    tier: String,
    consecutive_failures: i64,
    blacklisted: i64,
    last_success: Option<String>,
    ok_count: i64,
    err_count: i64,
}

impl From<SourceRow> for Source {
    fn from(row: SourceRow) -> Self {
        Source {
            url: row.url,
            name: row.name,
            tier: SourceTier::parse(&row.tier),
            consecutive_failures: row.consecutive_failures,
            blacklisted: row.blacklisted != 0,
            last_success: row.last_success.as_deref().and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
            ok_count: row.ok_count,
            err_count: row.err_count,
        }
    }
}

/// Result of one completed fetch, after retries. `permanent` only affects
/// how the failure is logged; both failure classes advance the blacklist
/// counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    Failure { permanent: bool },
}

pub struct SourceRegistry {
    pool: SqlitePool,
    blacklist_threshold: i64,
}

impl SourceRegistry {
    pub fn new(store: &Store, blacklist_threshold: u32) -> Self {
        Self {
            pool: store.pool().clone(),
            blacklist_threshold: i64::from(blacklist_threshold.max(1)),
        }
    }

    /// Upsert configured sources, preserving runtime counters of rows that
    /// already exist.
    pub async fn sync_sources(&self, configs: &[SourceConfig]) -> Result<(), StoreError> {
        for cfg in configs {
            sqlx::query(
                r#"
                INSERT INTO sources (url, name, tier)
                VALUES (?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    name = excluded.name,
                    tier = excluded.tier
                "#,
            )
            .bind(&cfg.url)
            .bind(&cfg.name)
            .bind(cfg.tier.as_str())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Non-blacklisted sources, primary tier first. Quick cycles pass
    /// `primary_only`.
    pub async fn list_active_sources(
        &self,
        primary_only: bool,
    ) -> Result<Vec<Source>, StoreError> {
        let sql = if primary_only {
            "SELECT * FROM sources WHERE blacklisted = 0 AND tier = 'primary' \
             ORDER BY name"
        } else {
            "SELECT * FROM sources WHERE blacklisted = 0 \
             ORDER BY CASE tier WHEN 'primary' THEN 0 ELSE 1 END, name"
        };
        let rows: Vec<SourceRow> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Source::from).collect())
    }

    pub async fn all_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows: Vec<SourceRow> = sqlx::query_as(
            "SELECT * FROM sources ORDER BY CASE tier WHEN 'primary' THEN 0 ELSE 1 END, name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Source::from).collect())
    }

    /// Record one completed fetch. Success clears the consecutive-failure
    /// counter; a failure advances it and flips the blacklist flag once the
    /// threshold is reached, all in one statement.
    pub async fn record_result(
        &self,
        url: &str,
        outcome: FetchOutcome,
    ) -> Result<(), StoreError> {
        match outcome {
            FetchOutcome::Success => {
                sqlx::query(
                    r#"
                    UPDATE sources
                    SET consecutive_failures = 0,
                        last_success = ?,
                        ok_count = ok_count + 1
                    WHERE url = ?
                    "#,
                )
                .bind(ts(Utc::now()))
                .bind(url)
                .execute(&self.pool)
                .await?;
            }
            FetchOutcome::Failure { .. } => {
                sqlx::query(
                    r#"
                    UPDATE sources
                    SET consecutive_failures = consecutive_failures + 1,
                        err_count = err_count + 1,
                        blacklisted = CASE
                            WHEN consecutive_failures + 1 >= ? THEN 1
                            ELSE blacklisted
                        END
                    WHERE url = ?
                    "#,
                )
                .bind(self.blacklist_threshold)
                .bind(url)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn is_blacklisted(&self, url: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT blacklisted FROM sources WHERE url = ?")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(b,)| b != 0).unwrap_or(false))
    }

    /// Manual blacklist reset: clears the flag and the failure streak.
    /// Returns false for an unknown URL.
    pub async fn reset_source(&self, url: &str) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "UPDATE sources SET blacklisted = 0, consecutive_failures = 0 WHERE url = ?",
        )
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(configs: &[SourceConfig]) -> (Store, SourceRegistry) {
        let store = Store::new("sqlite::memory:").await.unwrap();
        store.initialize().await.unwrap();
        let registry = SourceRegistry::new(&store, 5);
        registry.sync_sources(configs).await.unwrap();
        (store, registry)
    }

    fn cfg(name: &str, url: &str, tier: SourceTier) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            url: url.to_string(),
            tier,
        }
    }

    #[tokio::test]
    async fn quick_cycles_see_only_primary_sources() {
        let (_store, reg) = registry_with(&[
            cfg("WHO News", "https://who.example/rss", SourceTier::Primary),
            cfg("Niche Blog", "https://blog.example/rss", SourceTier::Secondary),
        ])
        .await;

        let quick = reg.list_active_sources(true).await.unwrap();
        assert_eq!(quick.len(), 1);
        assert_eq!(quick[0].name, "WHO News");

        let full = reg.list_active_sources(false).await.unwrap();
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].tier, SourceTier::Primary);
    }

    #[tokio::test]
    async fn failure_streak_blacklists_at_threshold() {
        let (_store, reg) = registry_with(&[cfg(
            "Flaky",
            "https://flaky.example/rss",
            SourceTier::Primary,
        )])
        .await;
        let url = "https://flaky.example/rss";

        for _ in 0..4 {
            reg.record_result(url, FetchOutcome::Failure { permanent: true })
                .await
                .unwrap();
            assert!(!reg.is_blacklisted(url).await.unwrap());
        }
        reg.record_result(url, FetchOutcome::Failure { permanent: true })
            .await
            .unwrap();
        assert!(reg.is_blacklisted(url).await.unwrap());
        assert!(reg.list_active_sources(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_resets_the_streak() {
        let (_store, reg) = registry_with(&[cfg(
            "Recovers",
            "https://recovers.example/rss",
            SourceTier::Primary,
        )])
        .await;
        let url = "https://recovers.example/rss";

        for _ in 0..4 {
            reg.record_result(url, FetchOutcome::Failure { permanent: false })
                .await
                .unwrap();
        }
        reg.record_result(url, FetchOutcome::Success).await.unwrap();
        for _ in 0..4 {
            reg.record_result(url, FetchOutcome::Failure { permanent: false })
                .await
                .unwrap();
        }
        // Streak restarted after the success; still below threshold.
        assert!(!reg.is_blacklisted(url).await.unwrap());

        let src = &reg.all_sources().await.unwrap()[0];
        assert_eq!(src.ok_count, 1);
        assert_eq!(src.err_count, 8);
        assert!(src.last_success.is_some());
        assert!((src.success_rate() - 1.0 / 9.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn manual_reset_clears_blacklist_until_then_source_stays_excluded() {
        let (_store, reg) = registry_with(&[cfg(
            "Gone",
            "https://gone.example/rss",
            SourceTier::Secondary,
        )])
        .await;
        let url = "https://gone.example/rss";

        for _ in 0..5 {
            reg.record_result(url, FetchOutcome::Failure { permanent: true })
                .await
                .unwrap();
        }
        assert!(reg.is_blacklisted(url).await.unwrap());

        assert!(reg.reset_source(url).await.unwrap());
        assert!(!reg.is_blacklisted(url).await.unwrap());
        assert_eq!(reg.list_active_sources(false).await.unwrap().len(), 1);

        assert!(!reg.reset_source("https://unknown.example/rss").await.unwrap());
    }

    #[tokio::test]
    async fn sync_preserves_counters_for_existing_rows() {
        let (_store, reg) = registry_with(&[cfg(
            "Feed",
            "https://feed.example/rss",
            SourceTier::Secondary,
        )])
        .await;
        let url = "https://feed.example/rss";
        reg.record_result(url, FetchOutcome::Success).await.unwrap();

        // Re-sync with a renamed, re-tiered entry.
        reg.sync_sources(&[cfg("Feed Renamed", url, SourceTier::Primary)])
            .await
            .unwrap();
        let src = &reg.all_sources().await.unwrap()[0];
        assert_eq!(src.name, "Feed Renamed");
        assert_eq!(src.tier, SourceTier::Primary);
        assert_eq!(src.ok_count, 1);
    }
}
