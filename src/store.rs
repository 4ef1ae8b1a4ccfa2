// src/store.rs
//! SQLite persistence for articles.
//!
//! The `UNIQUE(content_hash)` constraint is the authoritative duplicate
//! guard; the dedup pre-check in the pipeline only avoids wasted work.
//! Readers never take the writers' lock beyond SQLite's bounded window, so
//! search and browse run concurrently with ingestion.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::classify::Category;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate content hash")]
    DuplicateKey,
    #[error(transparent)]
    Io(#[from] sqlx::Error),
}

/// Render a timestamp in the single canonical column format, so that
/// lexicographic SQL comparisons equal chronological ones.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub summary: String,
    pub url: String,
    pub source: String,
    pub published: DateTime<Utc>,
    pub category: Category,
    pub subcategory: Option<String>,
    pub tags: Vec<String>,
    pub content_hash: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub summary: String,
    pub url: String,
    pub source: String,
    pub published: DateTime<Utc>,
    pub category: Category,
    pub subcategory: Option<String>,
    pub tags: Vec<String>,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct ArticleRow {
    id: i64,
    title: String,
    summary: String,
    url: String,
    source: String,
    published: String,
    category: String,
    subcategory: Option<String>,
    tags: String,
    content_hash: String,
    ingested_at: String,
}

impl From<ArticleRow> for Article {
    fn from(row: ArticleRow) -> Self {
        Article {
            id: row.id,
            title: row.title,
            summary: row.summary,
            url: row.url,
            source: row.source,
            published: parse_ts(&row.published),
            // Legacy rows may carry a bracketed category; flatten here and
            // never let that shape escape the store boundary.
            category: Category::parse(&row.category).unwrap_or(Category::FALLBACK),
            subcategory: row.subcategory.filter(|s| !s.is_empty()),
            tags: serde_json::from_str(&row.tags).unwrap_or_default(),
            content_hash: row.content_hash,
            ingested_at: parse_ts(&row.ingested_at),
        }
    }
}

/// Pagination envelope returned to the API layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, limit: i64) -> Self {
        let total_pages = if limit > 0 { (total + limit - 1) / limit } else { 0 };
        Self {
            has_next: page < total_pages,
            has_previous: page > 1,
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: i64,
    pub limit: i64,
    pub sort: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            sort: SortOrder::Desc,
        }
    }
}

impl PageRequest {
    fn clamped(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, 100),
            sort: self.sort,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    pub category: Option<Category>,
    pub tag: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub total_articles: i64,
    pub by_category: Vec<CategoryCount>,
    pub by_source: Vec<SourceCount>,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        // In-memory SQLite gives every pooled connection its own database;
        // collapse the pool to one connection there.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL,
                source TEXT NOT NULL,
                published TEXT NOT NULL,
                category TEXT NOT NULL,
                subcategory TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                content_hash TEXT NOT NULL UNIQUE,
                ingested_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_category ON articles(category)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                url TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tier TEXT NOT NULL DEFAULT 'secondary',
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                blacklisted INTEGER NOT NULL DEFAULT 0,
                last_success TEXT,
                ok_count INTEGER NOT NULL DEFAULT 0,
                err_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert one article. A unique-constraint hit on the content hash maps
    /// to [`StoreError::DuplicateKey`]; callers count it, they don't log it
    /// as an error.
    pub async fn insert(&self, article: &NewArticle) -> Result<i64, StoreError> {
        let tags_json =
            serde_json::to_string(&article.tags).unwrap_or_else(|_| "[]".to_string());
        let res = sqlx::query(
            r#"
            INSERT INTO articles
                (title, summary, url, source, published, category, subcategory, tags,
                 content_hash, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&article.title)
        .bind(&article.summary)
        .bind(&article.url)
        .bind(&article.source)
        .bind(ts(article.published))
        .bind(article.category.as_str())
        .bind(&article.subcategory)
        .bind(tags_json)
        .bind(&article.content_hash)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await;

        match res {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateKey)
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    pub async fn contains_hash(&self, content_hash: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM articles WHERE content_hash = ?")
                .bind(content_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ArticleFilter) {
        if let Some(cat) = filter.category {
            qb.push(" AND category = ").push_bind(cat.as_str());
        }
        if let Some(tag) = &filter.tag {
            let needle = format!("%\"{}\"%", tag.to_ascii_lowercase());
            qb.push(" AND tags LIKE ").push_bind(needle);
        }
        if let Some(start) = filter.start_date {
            qb.push(" AND published >= ").push_bind(ts(start));
        }
        if let Some(end) = filter.end_date {
            qb.push(" AND published <= ").push_bind(ts(end));
        }
    }

    /// Filtered, paginated listing ordered by publish date. The total (and
    /// derived page count) always covers the full match set.
    pub async fn query(
        &self,
        filter: &ArticleFilter,
        page: PageRequest,
    ) -> Result<Page<Article>, StoreError> {
        let page = page.clamped();

        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM articles WHERE 1=1");
        Self::push_filters(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::new("SELECT * FROM articles WHERE 1=1");
        Self::push_filters(&mut qb, filter);
        qb.push(format!(
            " ORDER BY published {}, id {} LIMIT ",
            page.sort.sql(),
            page.sort.sql()
        ));
        qb.push_bind(page.limit);
        qb.push(" OFFSET ");
        qb.push_bind((page.page - 1) * page.limit);

        let rows: Vec<ArticleRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let items = rows.into_iter().map(Article::from).collect();
        Ok(Page::new(items, total, page.page, page.limit))
    }

    /// Token lookup for the search engine: every article where any token
    /// appears in title, summary or tags, intersected with the explicit
    /// filter. Ranking happens in the search engine, not here.
    pub async fn search_candidates(
        &self,
        tokens: &[String],
        filter: &ArticleFilter,
    ) -> Result<Vec<Article>, StoreError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::new("SELECT * FROM articles WHERE 1=1");
        Self::push_filters(&mut qb, filter);
        qb.push(" AND (");
        for (i, token) in tokens.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            let needle = format!("%{}%", token.to_ascii_lowercase());
            qb.push("lower(title) LIKE ")
                .push_bind(needle.clone())
                .push(" OR lower(summary) LIKE ")
                .push_bind(needle.clone())
                .push(" OR lower(tags) LIKE ")
                .push_bind(needle);
        }
        qb.push(")");

        let rows: Vec<ArticleRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Article::from).collect())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_since(&self, cutoff: DateTime<Utc>) -> Result<i64, StoreError> {
        let (n,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM articles WHERE published >= ?")
                .bind(ts(cutoff))
                .fetch_one(&self.pool)
                .await?;
        Ok(n)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let total_articles = self.count().await?;
        let by_category = sqlx::query_as::<_, (String, i64)>(
            "SELECT category, COUNT(*) FROM articles GROUP BY category ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(category, count)| CategoryCount { category, count })
        .collect();
        let by_source = sqlx::query_as::<_, (String, i64)>(
            "SELECT source, COUNT(*) FROM articles GROUP BY source ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(source, count)| SourceCount { source, count })
        .collect();
        Ok(StoreStats {
            total_articles,
            by_category,
            by_source,
        })
    }

    pub async fn distinct_categories(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT category FROM articles ORDER BY category",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    /// All distinct tags across stored articles. Tags live in a JSON column,
    /// so the merge happens here rather than in SQL.
    pub async fn distinct_tags(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT tags FROM articles")
            .fetch_all(&self.pool)
            .await?;
        let mut set = std::collections::BTreeSet::new();
        for (raw,) in rows {
            if let Ok(tags) = serde_json::from_str::<Vec<String>>(&raw) {
                set.extend(tags);
            }
        }
        Ok(set.into_iter().collect())
    }

    /// Retention maintenance: the only path that deletes articles.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM articles WHERE published < ?")
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let store = Store::new("sqlite::memory:").await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn article(hash: &str, title: &str, category: Category) -> NewArticle {
        NewArticle {
            title: title.to_string(),
            summary: format!("{title} summary"),
            url: format!("https://example.com/{hash}"),
            source: "Test Source".to_string(),
            published: Utc::now(),
            category,
            subcategory: None,
            tags: vec!["prevention".to_string()],
            content_hash: hash.to_string(),
        }
    }

    mod insert_tests {
        use super::*;

        #[tokio::test]
        async fn insert_then_lookup_roundtrips() {
            let store = test_store().await;
            let id = store
                .insert(&article("h1", "First", Category::Diseases))
                .await
                .unwrap();
            assert!(id > 0);
            assert!(store.contains_hash("h1").await.unwrap());
            assert!(!store.contains_hash("h2").await.unwrap());
        }

        #[tokio::test]
        async fn duplicate_hash_is_rejected_by_the_constraint() {
            let store = test_store().await;
            store
                .insert(&article("h1", "First", Category::News))
                .await
                .unwrap();
            let err = store
                .insert(&article("h1", "Different title, same identity", Category::News))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::DuplicateKey));
            assert_eq!(store.count().await.unwrap(), 1);
        }

        #[tokio::test]
        async fn category_is_stored_as_a_plain_scalar() {
            let store = test_store().await;
            store
                .insert(&article("h1", "First", Category::MentalHealth))
                .await
                .unwrap();
            let cats = store.distinct_categories().await.unwrap();
            assert_eq!(cats, vec!["mental_health".to_string()]);
        }
    }

    mod query_tests {
        use super::*;
        use chrono::Duration;

        async fn seed(store: &Store, n: i64) {
            for i in 0..n {
                let mut a = article(&format!("h{i}"), &format!("Title {i}"), Category::News);
                a.published = Utc::now() - Duration::hours(n - i);
                store.insert(&a).await.unwrap();
            }
        }

        #[tokio::test]
        async fn pagination_covers_the_full_match_set() {
            let store = test_store().await;
            seed(&store, 25).await;

            let page = store
                .query(&ArticleFilter::default(), PageRequest { page: 1, limit: 10, sort: SortOrder::Desc })
                .await
                .unwrap();
            assert_eq!(page.total, 25);
            assert_eq!(page.total_pages, 3);
            assert!(page.has_next);
            assert!(!page.has_previous);
            assert_eq!(page.items.len(), 10);

            // Concatenating all pages reproduces the full set, no dupes.
            let mut seen = std::collections::HashSet::new();
            for p in 1..=3 {
                let pg = store
                    .query(&ArticleFilter::default(), PageRequest { page: p, limit: 10, sort: SortOrder::Desc })
                    .await
                    .unwrap();
                for item in pg.items {
                    assert!(seen.insert(item.id));
                }
            }
            assert_eq!(seen.len(), 25);
        }

        #[tokio::test]
        async fn newest_first_by_default() {
            let store = test_store().await;
            seed(&store, 5).await;
            let page = store
                .query(&ArticleFilter::default(), PageRequest::default())
                .await
                .unwrap();
            assert_eq!(page.items[0].title, "Title 4");
            assert_eq!(page.items[4].title, "Title 0");
        }

        #[tokio::test]
        async fn category_filter_is_equality() {
            let store = test_store().await;
            store.insert(&article("h1", "A", Category::Nutrition)).await.unwrap();
            store.insert(&article("h2", "B", Category::News)).await.unwrap();
            let page = store
                .query(
                    &ArticleFilter { category: Some(Category::Nutrition), ..Default::default() },
                    PageRequest::default(),
                )
                .await
                .unwrap();
            assert_eq!(page.total, 1);
            assert_eq!(page.items[0].title, "A");
        }

        #[tokio::test]
        async fn date_range_filter_bounds_both_ends() {
            let store = test_store().await;
            seed(&store, 10).await;
            let start = Utc::now() - Duration::hours(5);
            let page = store
                .query(
                    &ArticleFilter { start_date: Some(start), ..Default::default() },
                    PageRequest { page: 1, limit: 50, sort: SortOrder::Desc },
                )
                .await
                .unwrap();
            assert_eq!(page.total, 5);
        }

        #[tokio::test]
        async fn legacy_bracketed_category_rows_flatten_on_read() {
            let store = test_store().await;
            // Simulate a row written by an older importer that stored the
            // category as a JSON array.
            sqlx::query(
                r#"
                INSERT INTO articles
                    (title, summary, url, source, published, category,
                     subcategory, tags, content_hash, ingested_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind("Legacy row")
            .bind("")
            .bind("https://example.com/legacy")
            .bind("Old Importer")
            .bind(ts(Utc::now()))
            .bind(r#"["food", "news"]"#)
            .bind(None::<String>)
            .bind("[]")
            .bind("legacy-1")
            .bind(ts(Utc::now()))
            .execute(store.pool())
            .await
            .unwrap();

            let page = store
                .query(&ArticleFilter::default(), PageRequest::default())
                .await
                .unwrap();
            assert_eq!(page.items[0].category, Category::Food);
        }

        #[tokio::test]
        async fn search_candidates_match_title_summary_and_tags() {
            let store = test_store().await;
            let mut a = article("h1", "Gut microbiome study", Category::Trending);
            a.tags = vec!["microbiome".to_string()];
            store.insert(&a).await.unwrap();
            store.insert(&article("h2", "Unrelated", Category::News)).await.unwrap();

            let hits = store
                .search_candidates(&["microbiome".to_string()], &ArticleFilter::default())
                .await
                .unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].content_hash, "h1");
        }
    }

    mod maintenance_tests {
        use super::*;
        use chrono::Duration;

        #[tokio::test]
        async fn purge_removes_only_rows_older_than_cutoff() {
            let store = test_store().await;
            let mut old = article("h1", "Old", Category::News);
            old.published = Utc::now() - Duration::days(200);
            let fresh = article("h2", "Fresh", Category::News);
            store.insert(&old).await.unwrap();
            store.insert(&fresh).await.unwrap();

            let removed = store
                .purge_older_than(Utc::now() - Duration::days(180))
                .await
                .unwrap();
            assert_eq!(removed, 1);
            assert_eq!(store.count().await.unwrap(), 1);
            assert!(store.contains_hash("h2").await.unwrap());
        }

        #[tokio::test]
        async fn stats_aggregate_per_category_and_source() {
            let store = test_store().await;
            store.insert(&article("h1", "A", Category::Diseases)).await.unwrap();
            store.insert(&article("h2", "B", Category::Diseases)).await.unwrap();
            store.insert(&article("h3", "C", Category::News)).await.unwrap();

            let stats = store.stats().await.unwrap();
            assert_eq!(stats.total_articles, 3);
            assert_eq!(stats.by_category[0].category, "diseases");
            assert_eq!(stats.by_category[0].count, 2);
            assert_eq!(stats.by_source[0].source, "Test Source");
            assert_eq!(stats.by_source[0].count, 3);
        }
    }
}
