// src/search.rs
//! Search/ranking engine.
//!
//! Queries resolve onto categories through the rule aliases before scoring:
//! a query that *means* a category boosts that category's articles instead
//! of merely substring-matching them. The boost set widens ranking, never
//! narrows candidates; an explicit caller category filter intersects.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::classify::{tokenize, Category, ClassifierHandle};
use crate::store::{Article, ArticleFilter, Page, PageRequest, Store, StoreError};

const TITLE_WEIGHT: f64 = 5.0;
const SUMMARY_WEIGHT: f64 = 2.0;
const TAG_WEIGHT: f64 = 3.0;
const CATEGORY_BOOST: f64 = 10.0;
/// Recency never outweighs the category boost, so the boost ordering
/// guarantee holds between articles of any age.
const RECENCY_CAP: f64 = 8.0;
const RECENCY_WINDOW_SECS: f64 = 7.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    /// Explicit filter; intersects with candidates (never overridden by the
    /// alias boost set).
    pub category: Option<Category>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub page: PageRequest,
}

pub struct SearchEngine {
    store: Arc<Store>,
    classifier: ClassifierHandle,
}

impl SearchEngine {
    pub fn new(store: Arc<Store>, classifier: ClassifierHandle) -> Self {
        Self { store, classifier }
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<Page<Article>, StoreError> {
        let tokens = tokenize(&req.query);
        let filter = ArticleFilter {
            category: req.category,
            tag: None,
            start_date: req.start_date,
            end_date: req.end_date,
        };

        // Blank query: most recent articles, unscored.
        if tokens.is_empty() {
            return self.store.query(&filter, req.page).await;
        }

        let boost = self.classifier.alias_categories(&req.query, &tokens);
        let candidates = self.store.search_candidates(&tokens, &filter).await?;

        let now = Utc::now();
        let mut scored: Vec<(f64, Article)> = candidates
            .into_iter()
            .map(|a| (score_article(&a, &tokens, &boost, now), a))
            .collect();

        // Score desc, publish date desc, id asc. Fully deterministic.
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.published.cmp(&a.published))
                .then_with(|| a.id.cmp(&b.id))
        });

        // Pagination only after full ordering; totals cover the whole set.
        let page = req.page.page.max(1);
        let limit = req.page.limit.clamp(1, 100);
        let total = scored.len() as i64;
        let offset = ((page - 1) * limit) as usize;
        let items: Vec<Article> = scored
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .map(|(_, a)| a)
            .collect();

        Ok(Page::new(items, total, page, limit))
    }
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

/// Weighted token score plus category boost plus capped recency bonus.
pub(crate) fn score_article(
    article: &Article,
    tokens: &[String],
    boost: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> f64 {
    let title_lc = article.title.to_ascii_lowercase();
    let summary_lc = article.summary.to_ascii_lowercase();

    let mut title_hits = 0usize;
    let mut summary_hits = 0usize;
    let mut tag_hits = 0usize;
    for token in tokens {
        title_hits += count_occurrences(&title_lc, token);
        summary_hits += count_occurrences(&summary_lc, token);
        tag_hits += article
            .tags
            .iter()
            .filter(|t| t.to_ascii_lowercase().contains(token.as_str()))
            .count();
    }

    let mut score = title_hits as f64 * TITLE_WEIGHT
        + summary_hits as f64 * SUMMARY_WEIGHT
        + tag_hits as f64 * TAG_WEIGHT;
    if boost.contains(article.category.as_str()) {
        score += CATEGORY_BOOST;
    }
    score + recency_bonus(article.published, now)
}

/// Linear decay from the cap at age zero down to nothing at the window
/// edge. Monotonically non-increasing with age.
fn recency_bonus(published: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age = (now - published).num_seconds();
    if age <= 0 {
        return RECENCY_CAP;
    }
    let age = age as f64;
    if age >= RECENCY_WINDOW_SECS {
        return 0.0;
    }
    RECENCY_CAP * (1.0 - age / RECENCY_WINDOW_SECS)
}
