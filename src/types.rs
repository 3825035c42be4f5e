use std::fmt;

use serde::Deserialize;

// ── Fit rating ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rating {
    High,
    Mid,
    Low,
}

impl Rating {
    /// Label used in prompts and record-store fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "高",
            Self::Mid => "中",
            Self::Low => "低",
        }
    }

    /// Accepts the Chinese labels the persona prompts use and the English names.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "高" | "high" => Some(Self::High),
            "中" | "mid" | "medium" => Some(Self::Mid),
            "低" | "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Wordplay ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordplayKind {
    PunAdaptation,
    Homophone,
    LiteralReinterpretation,
    Reversal,
    #[default]
    None,
}

impl WordplayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PunAdaptation => "成语改编",
            Self::Homophone => "谐音梗",
            Self::LiteralReinterpretation => "字面理解",
            Self::Reversal => "反转",
            Self::None => "无",
        }
    }

    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "成语改编" | "pun-adaptation" | "pun_adaptation" | "pun" => Self::PunAdaptation,
            "谐音梗" | "谐音" | "homophone" => Self::Homophone,
            "字面理解" | "literal-reinterpretation" | "literal_reinterpretation" | "literal" => {
                Self::LiteralReinterpretation
            }
            "反转" | "reversal" => Self::Reversal,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wordplay {
    pub hint: String,
    pub kind: WordplayKind,
}

impl Wordplay {
    pub fn none() -> Self {
        Self {
            hint: "none".to_string(),
            kind: WordplayKind::None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.kind != WordplayKind::None && !self.hint.trim().is_empty() && self.hint != "none"
    }
}

// ── Platform ──────────────────────────────────────────────────────────────────

/// A hot-search source and the table its scrapes land in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Display name, also written to the pool's source-platform column.
    pub name: String,
    /// Short id used on the command line, e.g. `weibo`.
    pub route: String,
    pub table_id: String,
}

// ── Topic ─────────────────────────────────────────────────────────────────────

/// A scraped hot-search item. `title` is the natural key within a platform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topic {
    pub record_id: Option<String>,
    pub title: String,
    pub platform: String,
    pub popularity: f64,
    pub growth: f64,
    pub status: String,
    pub link: Option<String>,
    /// Ingestion timestamp, ms since epoch.
    pub fetched_at: Option<i64>,
    pub rating: Option<Rating>,
    pub reason: Option<String>,
    pub quote: Option<String>,
    pub wordplay: Option<Wordplay>,
    pub script: Option<String>,
    pub estimated_duration: Option<String>,
}

impl Topic {
    pub fn new(platform: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(&self.platform, &self.title)
    }

    pub fn has_quote(&self) -> bool {
        self.quote.as_deref().is_some_and(|q| !q.trim().is_empty())
    }
}

/// Dedup key of the destination pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub platform: String,
    pub title: String,
}

impl PoolKey {
    pub fn new(platform: &str, title: &str) -> Self {
        Self {
            platform: platform.trim().to_string(),
            title: title.trim().to_string(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.platform, self.title)
    }
}

/// A pool-bound topic on its way through wordplay mining, scripting and review.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolRecord {
    pub topic: Topic,
    /// ms since epoch.
    pub recommended_at: i64,
}

// ── Review ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewIssue {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub problem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Approved { feedback: String },
    Rejected { feedback: String, issues: Vec<ReviewIssue> },
    Unparseable,
}

// ── Completion usage ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionText {
    pub text: String,
    pub usage: Usage,
}
