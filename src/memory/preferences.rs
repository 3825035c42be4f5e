use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, LazyLock},
};

use chrono::Local;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    memory::store::{KvStore, load_as, save_as},
    types::Topic,
};

pub const PREFERENCES_KEY: &str = "preferences";

const UNKNOWN_PLATFORM: &str = "未知";
const MIN_KEYWORD_CHARS: usize = 2;
const MIN_KEYWORD_COUNT: u64 = 2;
const MAX_TOP_KEYWORDS: usize = 10;
const DOMINANT_PLATFORM_SHARE: f64 = 0.4;
const POPULAR_KEYWORD_COUNT: u64 = 3;
const SMALL_SAMPLE: usize = 20;

static TOKEN_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{P}\p{S}\s]+").expect("static pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordCount {
    pub keyword: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreferenceState {
    /// Only ever raised, and only by `analyze`.
    pub total_confirmed_count: usize,
    pub platform_counts: BTreeMap<String, u64>,
    pub top_keywords: Vec<KeywordCount>,
    /// Context block injected into the rating prompt; reused verbatim until
    /// new confirmations arrive.
    pub context: String,
    pub last_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceAnalysis {
    pub summary: String,
    pub suggestions: Vec<String>,
    pub context: String,
}

/// Learns platform and keyword preferences from human-confirmed pool topics.
pub struct PreferenceLearner {
    memory: Arc<dyn KvStore>,
    state: PreferenceState,
}

impl PreferenceLearner {
    pub fn load(memory: Arc<dyn KvStore>) -> Self {
        let state = match load_as::<PreferenceState>(memory.as_ref(), PREFERENCES_KEY) {
            Ok(state) => state.unwrap_or_default(),
            Err(err) => {
                warn!("failed to load preferences, starting fresh: {err:#}");
                PreferenceState::default()
            }
        };
        Self { memory, state }
    }

    pub fn state(&self) -> &PreferenceState {
        &self.state
    }

    pub fn context(&self) -> &str {
        &self.state.context
    }

    pub fn has_new_confirmations(&self, current_total: usize) -> bool {
        let last_total = self.state.total_confirmed_count;
        let has_new = current_total > last_total;
        if has_new {
            info!(
                "[preferences] {} new confirmations ({current_total} total)",
                current_total - last_total
            );
        } else {
            info!("[preferences] no new confirmations, reusing stored context");
        }
        has_new
    }

    pub fn analyze(&mut self, confirmed: &[Topic]) -> PreferenceAnalysis {
        if confirmed.is_empty() {
            info!("[preferences] no confirmed topics yet");
            return PreferenceAnalysis {
                summary: "暂无用户反馈数据".to_string(),
                suggestions: Vec::new(),
                context: String::new(),
            };
        }

        let total = confirmed.len();
        let platform_counts = tally_platforms(confirmed);
        let keyword_freq = tally_keywords(confirmed);
        let top_keywords: Vec<KeywordCount> = keyword_freq
            .iter()
            .filter(|k| k.count >= MIN_KEYWORD_COUNT)
            .take(MAX_TOP_KEYWORDS)
            .cloned()
            .collect();

        let platform_rank = rank_platforms(&platform_counts);
        let summary = [
            format!("用户已确认 {total} 条选题"),
            format!(
                "平台偏好: {}",
                platform_rank
                    .iter()
                    .map(|(p, c)| format!("{p}({c})"))
                    .collect::<Vec<_>>()
                    .join(" > ")
            ),
            if top_keywords.is_empty() {
                "关键词数据不足".to_string()
            } else {
                format!(
                    "高频关键词: {}",
                    top_keywords
                        .iter()
                        .map(|k| format!("{}({})", k.keyword, k.count))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            },
        ]
        .join("\n");

        let suggestions = suggest(&platform_rank, &keyword_freq, total);
        let context = format!(
            "【用户偏好参考】\n{summary}\n\n【策略建议】\n{}\n\n请在评估时参考用户历史偏好，但不要过度依赖（新话题也可能受欢迎）。",
            suggestions.join("\n")
        );

        self.state = PreferenceState {
            total_confirmed_count: total,
            platform_counts,
            top_keywords,
            context: context.clone(),
            last_update: Some(Local::now().to_rfc3339()),
        };
        if let Err(err) = save_as(self.memory.as_ref(), PREFERENCES_KEY, &self.state) {
            warn!("failed to save preferences: {err:#}");
        }

        info!(
            "[preferences] analysis done, {} suggestions\n{summary}",
            suggestions.len()
        );
        PreferenceAnalysis {
            summary,
            suggestions,
            context,
        }
    }
}

fn tally_platforms(confirmed: &[Topic]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for topic in confirmed {
        let platform = match topic.platform.trim() {
            "" => UNKNOWN_PLATFORM,
            p => p,
        };
        *counts.entry(platform.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Highest count first; equal counts keep the order the keyword first appeared.
fn tally_keywords(confirmed: &[Topic]) -> Vec<KeywordCount> {
    let mut order: Vec<KeywordCount> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for topic in confirmed {
        for token in tokenize(&topic.title) {
            match index.get(token) {
                Some(&i) => order[i].count += 1,
                None => {
                    index.insert(token.to_string(), order.len());
                    order.push(KeywordCount {
                        keyword: token.to_string(),
                        count: 1,
                    });
                }
            }
        }
    }
    order.sort_by(|a, b| b.count.cmp(&a.count));
    order
}

fn tokenize(title: &str) -> impl Iterator<Item = &str> {
    TOKEN_SPLIT
        .split(title)
        .filter(|t| t.chars().count() >= MIN_KEYWORD_CHARS)
}

fn rank_platforms(counts: &BTreeMap<String, u64>) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> = counts.iter().map(|(p, c)| (p.clone(), *c)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

fn suggest(platform_rank: &[(String, u64)], keywords: &[KeywordCount], total: usize) -> Vec<String> {
    let mut suggestions = Vec::new();

    if let Some((platform, count)) = platform_rank.first() {
        let share = *count as f64 / total as f64;
        if share >= DOMINANT_PLATFORM_SHARE {
            suggestions.push(format!(
                "- {platform}平台确认率高（{:.0}%），可适当提高该平台评分",
                share * 100.0
            ));
        }
    }

    let popular: Vec<String> = keywords
        .iter()
        .take(3)
        .filter(|k| k.count >= POPULAR_KEYWORD_COUNT)
        .map(|k| format!("\"{}\"", k.keyword))
        .collect();
    if !popular.is_empty() {
        suggestions.push(format!("- 包含 {} 等关键词的选题受欢迎度高", popular.join("、")));
    }

    if total < SMALL_SAMPLE {
        suggestions.push(format!("- 样本数据较少（{total}条），建议保持多样性探索"));
    }

    if suggestions.is_empty() {
        suggestions.push("- 暂无明显偏好模式，继续收集数据".to_string());
    }
    suggestions
}
