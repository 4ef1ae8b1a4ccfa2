// src/dedup.rs
//! Content-hash identity for fetched items.
//!
//! The hash is SHA-256 over the normalized URL and the normalized title.
//! URL-only identity misses re-syndicated content under different URLs;
//! title-only identity collides across unrelated short titles. Hash
//! collisions count as duplicates (precision over recall).

use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters that never change the identity of an article.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "igshid", "ref"];

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k == "utm" || k.starts_with("utm_") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Lower-case the URL, drop tracking parameters and the fragment, and trim
/// a trailing slash. Unparseable URLs fall back to trimmed lower-case.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_ascii_lowercase();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut qs = parsed.query_pairs_mut();
        qs.clear();
        for (k, v) in &kept {
            qs.append_pair(k, v);
        }
    }
    parsed.set_fragment(None);

    let mut out = parsed.to_string().to_ascii_lowercase();
    while out.ends_with('/') {
        out.pop();
    }
    out
}

/// Lower-case the title, strip punctuation, collapse whitespace.
pub fn normalize_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if ch.is_whitespace() || ch.is_ascii_punctuation() {
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable dedup key over (normalized URL, normalized title).
pub fn content_hash(url: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(url).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_title(title).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_params_do_not_change_identity() {
        let a = content_hash("https://x.com/a?utm=1", "Same Title");
        let b = content_hash("https://x.com/a?utm=2", "Same Title");
        assert_eq!(a, b);
        let c = content_hash("https://x.com/a?utm_source=rss", "Same Title");
        assert_eq!(a, c);
        // Non-tracking params still distinguish URLs.
        let d = content_hash("https://x.com/a?id=2", "Same Title");
        assert_ne!(a, d);
    }

    #[test]
    fn utm_and_fbclid_are_stripped() {
        assert_eq!(
            normalize_url("https://X.com/a?utm_source=feed&fbclid=abc&id=7"),
            "https://x.com/a?id=7"
        );
        assert_eq!(normalize_url("https://x.com/a?utm_medium=rss"), "https://x.com/a");
    }

    #[test]
    fn fragment_and_trailing_slash_are_dropped() {
        assert_eq!(normalize_url("https://x.com/a/#section"), "https://x.com/a");
        assert_eq!(normalize_url("https://x.com/a/"), "https://x.com/a");
    }

    #[test]
    fn case_and_punctuation_insensitive_titles() {
        assert_eq!(normalize_title("  New Study:  Finds, Things!  "), "new study finds things");
        assert_eq!(
            content_hash("https://x.com/a", "New Study: Finds Things"),
            content_hash("https://X.com/a/", "new study finds things!")
        );
    }

    #[test]
    fn different_titles_produce_different_hashes() {
        assert_ne!(
            content_hash("https://x.com/a", "first"),
            content_hash("https://x.com/a", "second")
        );
    }

    #[test]
    fn unparseable_url_falls_back_to_lowercase() {
        assert_eq!(normalize_url("not a url"), "not a url");
    }
}
