use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tracing::{info, warn};

use crate::{
    agent::{
        parse::parse_lenient,
        provider::{Completion, LlmError, ask},
    },
    types::{Rating, Topic},
};

const RATING_MAX_TOKENS: u32 = 4096;

/// Quick triage of a platform batch into high/mid/low persona fit.
pub struct RatingStage {
    llm: Arc<dyn Completion>,
    prompt: String,
}

impl RatingStage {
    pub fn new(llm: Arc<dyn Completion>, prompt: impl Into<String>) -> Self {
        Self {
            llm,
            prompt: prompt.into(),
        }
    }

    /// Every returned topic carries a rating; titles the model skipped are low.
    pub async fn rate(
        &self,
        topics: Vec<Topic>,
        platform: &str,
        preference_context: &str,
    ) -> Result<Vec<Topic>, LlmError> {
        info!("[rating] {platform} 快速筛选 {} 条", topics.len());
        let user = build_request(&topics, platform, preference_context);
        let raw = ask(self.llm.as_ref(), "rating", &self.prompt, &user, RATING_MAX_TOKENS).await?;

        let ratings = match parse_lenient(&raw) {
            Ok(value) => rating_map(&value),
            Err(err) => {
                warn!("[rating] {platform} reply unparseable, rating all low: {err}");
                HashMap::new()
            }
        };

        let rated: Vec<Topic> = topics
            .into_iter()
            .map(|mut topic| {
                topic.rating = Some(ratings.get(topic.title.as_str()).copied().unwrap_or(Rating::Low));
                topic
            })
            .collect();

        let count = |r: Rating| rated.iter().filter(|t| t.rating == Some(r)).count();
        info!(
            "[rating] {platform} 筛选结果: 高{} 中{} 低{}",
            count(Rating::High),
            count(Rating::Mid),
            count(Rating::Low)
        );
        Ok(rated)
    }
}

fn build_request(topics: &[Topic], platform: &str, preference_context: &str) -> String {
    let list = topics
        .iter()
        .enumerate()
        .map(|(i, t)| {
            format!(
                "{}. {} | 热度:{} 增长:{} 状态:{}",
                i + 1,
                t.title,
                t.popularity,
                t.growth,
                t.status
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let body = format!("评估{platform}热搜 {} 条：\n\n{list}", topics.len());
    if preference_context.trim().is_empty() {
        body
    } else {
        format!("{preference_context}\n\n{body}")
    }
}

fn rating_map(value: &Value) -> HashMap<String, Rating> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let title = entry.get("title")?.as_str()?;
            let rating = Rating::parse(entry.get("rating")?.as_str()?)?;
            Some((title.to_string(), rating))
        })
        .collect()
}
