// src/ingest/fetch.rs
//! Feed fetching: one HTTP GET per attempt with rotating client headers,
//! exponential backoff on transient failures, and RSS parsing.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::ingest::normalize_text;
use crate::ingest::types::{FetchError, RawItem};
use crate::registry::Source;

/// Rotating set of realistic client identifiers; one per attempt, so a feed
/// that rejects one identifier sees a different one on retry.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
];

const FEED_ACCEPT: &str = "application/rss+xml, application/xml, text/xml, */*";

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of a single attempt. The fetch loop below is the only place that
/// decides whether a retry actually happens.
enum Attempt {
    Success(Vec<RawItem>),
    Retry { reason: String },
    Failed(FetchError),
}

pub struct Fetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(policy: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client, policy })
    }

    /// Fetch and parse one source's feed.
    ///
    /// Transient failures (transport errors, 429, 5xx) retry with
    /// exponential backoff up to the policy ceiling; permanent failures
    /// (other 4xx, unparseable body) surface immediately.
    pub async fn fetch(&self, source: &Source) -> Result<Vec<RawItem>, FetchError> {
        let mut attempt: u32 = 1;
        loop {
            match self.attempt(source, attempt).await {
                Attempt::Success(items) => return Ok(items),
                Attempt::Failed(err) => return Err(err),
                Attempt::Retry { reason } => {
                    if attempt >= self.policy.max_attempts {
                        return Err(FetchError::Transient {
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        target: "ingest",
                        source = %source.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(&self, source: &Source, attempt: u32) -> Attempt {
        let ua = USER_AGENTS[((attempt - 1) as usize) % USER_AGENTS.len()];
        let resp = self
            .client
            .get(&source.url)
            .header(USER_AGENT, ua)
            .header(ACCEPT, FEED_ACCEPT)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                return Attempt::Retry {
                    reason: e.to_string(),
                }
            }
        };

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Attempt::Retry {
                reason: format!("http {}", status.as_u16()),
            };
        }
        if !status.is_success() {
            return Attempt::Failed(FetchError::Permanent(format!(
                "http {}",
                status.as_u16()
            )));
        }

        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                return Attempt::Retry {
                    reason: format!("body read: {e}"),
                }
            }
        };

        match parse_feed(&body, &source.name, Utc::now()) {
            Ok(items) => Attempt::Success(items),
            Err(e) => Attempt::Failed(e),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .policy
            .base_delay
            .saturating_mul(1u32 << (attempt - 1).min(16));
        exp.min(self.policy.max_delay)
    }
}

/* ----------------------------
RSS parsing
---------------------------- */

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "category", default)]
    category: Vec<String>,
}

fn parse_rfc2822_to_utc(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Parse an RSS body into raw items. Entries without a title or link are
/// skipped; missing/unparsable publish dates default to `fetched_at`.
pub fn parse_feed(
    body: &str,
    source_name: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawItem>, FetchError> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(body);
    let rss: Rss =
        from_str(&xml_clean).map_err(|e| FetchError::Parse(format!("rss: {e}")))?;

    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let title = normalize_text(it.title.as_deref().unwrap_or_default());
        let link = it.link.as_deref().unwrap_or_default().trim().to_string();
        if title.is_empty() || link.is_empty() {
            continue;
        }
        let summary = normalize_text(it.description.as_deref().unwrap_or_default());
        let published = it
            .pub_date
            .as_deref()
            .and_then(parse_rfc2822_to_utc)
            .unwrap_or(fetched_at);
        let source_terms = it
            .category
            .iter()
            .map(|c| normalize_text(c).to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        out.push(RawItem {
            title,
            summary,
            link,
            published,
            source: source_name.to_string(),
            source_terms,
        });
    }

    let ms = t0.elapsed().as_secs_f64() * 1_000.0;
    histogram!("ingest_parse_ms").record(ms);
    counter!("ingest_events_total").increment(out.len() as u64);
    Ok(out)
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
