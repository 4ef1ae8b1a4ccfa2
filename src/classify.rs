// src/classify.rs
//! Category rule engine: the fixed category set, the TOML rule schema,
//! rule compilation, and weighted keyword scoring for incoming items.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ingest::types::RawItem;

// --- env defaults & names ---
pub const DEFAULT_CATEGORIES_CONFIG_PATH: &str = "config/categories.toml";
pub const ENV_CATEGORIES_CONFIG_PATH: &str = "CATEGORIES_CONFIG_PATH";
pub const ENV_CLASSIFIER_MIN_SCORE: &str = "CLASSIFIER_MIN_SCORE";

/// Compiled-in rule file, used when no override path is configured.
const DEFAULT_RULES_TOML: &str = include_str!("../config/categories.toml");

/// The fixed category set. Listing order is the tie-break priority order
/// used when two rules score equally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Diseases,
    News,
    Solutions,
    Audience,
    Trending,
    Food,
    Blogs,
    Fitness,
    MentalHealth,
    Nutrition,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Diseases,
        Category::News,
        Category::Solutions,
        Category::Audience,
        Category::Trending,
        Category::Food,
        Category::Blogs,
        Category::Fitness,
        Category::MentalHealth,
        Category::Nutrition,
    ];

    /// Assigned when no rule clears the minimum score.
    pub const FALLBACK: Category = Category::News;

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Diseases => "diseases",
            Category::News => "news",
            Category::Solutions => "solutions",
            Category::Audience => "audience",
            Category::Trending => "trending",
            Category::Food => "food",
            Category::Blogs => "blogs",
            Category::Fitness => "fitness",
            Category::MentalHealth => "mental_health",
            Category::Nutrition => "nutrition",
        }
    }

    /// Parse a stored or inbound category value.
    ///
    /// Legacy rows sometimes carry a JSON-array shape (`["news"]`) instead of
    /// a plain scalar; those flatten to their first element here, so the
    /// bracketed form never propagates past this boundary.
    pub fn parse(raw: &str) -> Option<Category> {
        let flat = flatten_category_value(raw);
        match flat.as_str() {
            "diseases" => Some(Category::Diseases),
            "news" => Some(Category::News),
            "solutions" => Some(Category::Solutions),
            "audience" => Some(Category::Audience),
            "trending" => Some(Category::Trending),
            "food" => Some(Category::Food),
            "blogs" | "blogs_and_opinions" => Some(Category::Blogs),
            "fitness" => Some(Category::Fitness),
            "mental_health" => Some(Category::MentalHealth),
            "nutrition" => Some(Category::Nutrition),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reduce a possibly bracketed/quoted legacy value to its first scalar
/// element, lower-cased. `["Food", "news"]` → `food`, `news` → `news`.
fn flatten_category_value(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let first = inner.split(',').next().unwrap_or(inner);
    first
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_ascii_lowercase()
}

/* ----------------------------
Config schema (from TOML)
---------------------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct RulesRoot {
    pub classifier: ClassifierSection,
    pub rules: Vec<RuleCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierSection {
    /// Minimum winning score; below this the fallback category applies.
    pub min_score: f32,
    #[serde(default = "default_title_weight")]
    pub title_weight: f32,
    #[serde(default = "default_summary_weight")]
    pub summary_weight: f32,
    #[serde(default = "default_source_term_weight")]
    pub source_term_weight: f32,
    /// Upper bound on emitted tags per article.
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
}

fn default_title_weight() -> f32 {
    3.0
}
fn default_summary_weight() -> f32 {
    2.0
}
fn default_source_term_weight() -> f32 {
    1.0
}
fn default_max_tags() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleCfg {
    pub category: Category,
    /// Query terms the search engine maps onto this category.
    #[serde(default)]
    pub aliases: Vec<String>,
    pub keywords: Vec<KeywordCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordCfg {
    pub term: String,
    #[serde(default = "default_keyword_weight")]
    pub weight: f32,
}

fn default_keyword_weight() -> f32 {
    1.0
}

/* ----------------------------
Compiled engine structures
---------------------------- */

#[derive(Debug)]
struct CompiledKeyword {
    term: String,
    stem: String,
    weight: f32,
}

#[derive(Debug)]
struct CompiledRule {
    category: Category,
    aliases: Vec<String>,
    keywords: Vec<CompiledKeyword>,
}

/// Result of classifying one raw item.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub subcategory: Option<String>,
    pub tags: Vec<String>,
    /// True when no rule cleared the threshold and the fallback applied.
    pub fallback: bool,
}

/// Holds compiled rules. Built once at startup; swapped only through the
/// explicit admin reload.
#[derive(Debug)]
pub struct ClassifierEngine {
    cfg: ClassifierSection,
    rules: Vec<CompiledRule>,
}

/// Lower-case word tokenizer shared with the search engine.
pub(crate) fn tokenize(input: &str) -> Vec<String> {
    static RE: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"(?u)\b\w+\b").expect("tokenizer regex"));
    re.find_iter(input)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect()
}

/// Naive stemmer: enough to let "vitamins" hit "vitamin" and
/// "training" hit "train" without a stemming dependency.
fn stem(word: &str) -> String {
    let w = word.to_ascii_lowercase();
    if w.len() > 5 && w.ends_with("ing") {
        return w[..w.len() - 3].to_string();
    }
    if w.len() > 4 && w.ends_with("es") && !w.ends_with("ses") {
        return w[..w.len() - 2].to_string();
    }
    if w.len() > 3 && w.ends_with('s') && !w.ends_with("ss") {
        return w[..w.len() - 1].to_string();
    }
    w
}

/// A keyword matches a field as a case-insensitive substring, or when any
/// field token shares its stem (single-word keywords only).
fn keyword_hits(kw: &CompiledKeyword, field_lc: &str, field_stems: &[String]) -> bool {
    if field_lc.contains(&kw.term) {
        return true;
    }
    !kw.term.contains(' ') && field_stems.iter().any(|s| *s == kw.stem)
}

impl ClassifierEngine {
    /// Load rules from `$CATEGORIES_CONFIG_PATH` or fall back to the
    /// compiled-in `config/categories.toml`. `$CLASSIFIER_MIN_SCORE`
    /// overrides the file's threshold.
    pub fn from_toml() -> anyhow::Result<Self> {
        let content = match std::env::var(ENV_CATEGORIES_CONFIG_PATH) {
            Ok(p) => fs::read_to_string(PathBuf::from(&p)).map_err(|e| {
                anyhow::anyhow!("Failed to read category rules at {}: {}", p, e)
            })?,
            Err(_) => DEFAULT_RULES_TOML.to_string(),
        };

        let mut eng = Self::from_toml_str(&content)?;

        if let Some(t) = std::env::var(ENV_CLASSIFIER_MIN_SCORE)
            .ok()
            .and_then(|s| s.trim().parse::<f32>().ok())
        {
            eng.cfg.min_score = t.max(0.0);
        } else if !eng.cfg.min_score.is_finite() {
            eng.cfg.min_score = 3.0;
        }

        Ok(eng)
    }

    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let root: RulesRoot = toml::from_str(toml_str)?;
        if root.rules.is_empty() {
            anyhow::bail!("category rule file defines no rules");
        }

        let rules = root
            .rules
            .into_iter()
            .map(|r| CompiledRule {
                category: r.category,
                aliases: r
                    .aliases
                    .iter()
                    .map(|a| a.trim().to_ascii_lowercase())
                    .filter(|a| !a.is_empty())
                    .collect(),
                keywords: r
                    .keywords
                    .into_iter()
                    .map(|k| {
                        let term = k.term.trim().to_ascii_lowercase();
                        CompiledKeyword {
                            stem: stem(&term),
                            term,
                            weight: k.weight,
                        }
                    })
                    .collect(),
            })
            .collect();

        Ok(Self {
            cfg: root.classifier,
            rules,
        })
    }

    pub fn min_score(&self) -> f32 {
        self.cfg.min_score
    }

    /// Categories whose rule claims `token` (or the whole query phrase) as
    /// an alias. Category names count as aliases of themselves.
    pub fn alias_categories(&self, query: &str, tokens: &[String]) -> BTreeSet<String> {
        let phrase = query.trim().to_ascii_lowercase();
        let mut out = BTreeSet::new();
        for rule in &self.rules {
            let claimed = rule.category.as_str() == phrase
                || tokens.iter().any(|t| *t == rule.category.as_str())
                || rule
                    .aliases
                    .iter()
                    .any(|a| *a == phrase || tokens.iter().any(|t| t == a));
            if claimed {
                out.insert(rule.category.as_str().to_string());
            }
        }
        out
    }

    /// Score every rule against the item and pick the winner.
    ///
    /// Field weights follow the config (title 3, summary 2, source terms 1 by
    /// default); a keyword's own weight multiplies the field weight. Ties
    /// break by rule order, which the default file keeps in the fixed
    /// priority order. This never fails: anything below the threshold lands
    /// in the fallback category.
    pub fn classify(&self, item: &RawItem) -> Classification {
        let title_lc = item.title.to_ascii_lowercase();
        let summary_lc = item.summary.to_ascii_lowercase();
        let title_stems: Vec<String> = tokenize(&item.title).iter().map(|t| stem(t)).collect();
        let summary_stems: Vec<String> =
            tokenize(&item.summary).iter().map(|t| stem(t)).collect();
        let source_terms_lc: Vec<String> = item
            .source_terms
            .iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        let mut best: Option<(usize, f32)> = None; // (rule index, score)
        let mut best_keyword: Option<(String, f32)> = None;
        let mut matched: Vec<(String, f32)> = Vec::new();

        for (idx, rule) in self.rules.iter().enumerate() {
            let mut rule_score = 0.0f32;
            let mut rule_best: Option<(String, f32)> = None;

            for kw in &rule.keywords {
                let mut contribution = 0.0f32;
                if keyword_hits(kw, &title_lc, &title_stems) {
                    contribution += kw.weight * self.cfg.title_weight;
                }
                if keyword_hits(kw, &summary_lc, &summary_stems) {
                    contribution += kw.weight * self.cfg.summary_weight;
                }
                if source_terms_lc
                    .iter()
                    .any(|t| t.contains(&kw.term) || stem(t) == kw.stem)
                {
                    contribution += kw.weight * self.cfg.source_term_weight;
                }
                if contribution > 0.0 {
                    rule_score += contribution;
                    matched.push((kw.term.clone(), contribution));
                    let better = rule_best
                        .as_ref()
                        .map(|(_, c)| contribution > *c)
                        .unwrap_or(true);
                    if better {
                        rule_best = Some((kw.term.clone(), contribution));
                    }
                }
            }

            // Strict > keeps the earlier (higher-priority) rule on ties.
            if rule_score > 0.0 && best.map(|(_, s)| rule_score > s).unwrap_or(true) {
                best = Some((idx, rule_score));
                best_keyword = rule_best;
            }
        }

        // Tags: matched terms across all rules, strongest first.
        matched.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let mut tags: Vec<String> = Vec::new();
        for (term, _) in &matched {
            if !tags.iter().any(|t| t == term) {
                tags.push(term.clone());
            }
            if tags.len() >= self.cfg.max_tags {
                break;
            }
        }

        match best {
            Some((idx, score)) if score >= self.cfg.min_score => Classification {
                category: self.rules[idx].category,
                subcategory: best_keyword.map(|(term, _)| term),
                tags,
                fallback: false,
            },
            _ => Classification {
                category: Category::FALLBACK,
                subcategory: None,
                tags,
                fallback: true,
            },
        }
    }
}

/* ----------------------------
Thread-safe handle + admin reload
---------------------------- */

/// Shared handle over the engine. Rules are immutable for the process
/// lifetime except through [`ClassifierHandle::reload`], which the admin
/// endpoint calls.
#[derive(Clone)]
pub struct ClassifierHandle {
    inner: Arc<RwLock<ClassifierEngine>>,
}

impl ClassifierHandle {
    pub fn new(engine: ClassifierEngine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    pub fn classify(&self, item: &RawItem) -> Classification {
        match self.inner.read() {
            Ok(eng) => eng.classify(item),
            // Poisoned lock: degrade to the fallback rather than fail ingest.
            Err(_) => Classification {
                category: Category::FALLBACK,
                subcategory: None,
                tags: Vec::new(),
                fallback: true,
            },
        }
    }

    pub fn alias_categories(&self, query: &str, tokens: &[String]) -> BTreeSet<String> {
        match self.inner.read() {
            Ok(eng) => eng.alias_categories(query, tokens),
            Err(_) => BTreeSet::new(),
        }
    }

    /// Re-read the rule file and swap the engine atomically.
    pub fn reload(&self) -> anyhow::Result<()> {
        let fresh = ClassifierEngine::from_toml()?;
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("classifier lock poisoned"))?;
        *guard = fresh;
        Ok(())
    }
}

/* ----------------------------
Tests
---------------------------- */
