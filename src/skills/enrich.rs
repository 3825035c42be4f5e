use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    agent::{
        parse::parse_lenient,
        provider::{Completion, LlmError, ask},
    },
    skills::{format_issues, review::Regenerator},
    types::{ReviewIssue, Topic},
};

const ENRICH_MAX_TOKENS: u32 = 8192;

pub const MISSING_REASON: &str = "未生成";

/// Writes the recommendation reason and persona quote for high-fit topics.
pub struct EnrichmentStage {
    llm: Arc<dyn Completion>,
    prompt: String,
}

impl EnrichmentStage {
    pub fn new(llm: Arc<dyn Completion>, prompt: impl Into<String>) -> Self {
        Self {
            llm,
            prompt: prompt.into(),
        }
    }

    pub async fn generate_quotes(
        &self,
        high: Vec<Topic>,
        platform: &str,
    ) -> Result<Vec<Topic>, LlmError> {
        if high.is_empty() {
            info!("[enrich] {platform} 无高适配话题");
            return Ok(high);
        }
        info!("[enrich] {platform} 深度生成 {} 条金句", high.len());
        self.enrich(high, platform, &[]).await
    }

    async fn enrich(
        &self,
        topics: Vec<Topic>,
        platform: &str,
        issues: &[ReviewIssue],
    ) -> Result<Vec<Topic>, LlmError> {
        let list = topics
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {} | 热度:{} 增长:{}", i + 1, t.title, t.popularity, t.growth))
            .collect::<Vec<_>>()
            .join("\n");
        let mut user = format!("为{platform}高适配选题生成理由和金句：\n\n{list}");
        if !issues.is_empty() {
            user.push_str(&format_issues(issues));
        }

        let raw = ask(self.llm.as_ref(), "enrich", &self.prompt, &user, ENRICH_MAX_TOKENS).await?;
        let generated = match parse_lenient(&raw) {
            Ok(value) => by_title(&value),
            Err(err) => {
                warn!("[enrich] {platform} reply unparseable, using placeholders: {err}");
                HashMap::new()
            }
        };

        Ok(topics
            .into_iter()
            .map(|mut topic| {
                let (reason, quote) = generated.get(topic.title.as_str()).cloned().unwrap_or_default();
                topic.reason = Some(reason.unwrap_or_else(|| MISSING_REASON.to_string()));
                topic.quote = Some(quote.unwrap_or_default());
                topic
            })
            .collect())
    }
}

#[async_trait]
impl Regenerator<Topic> for EnrichmentStage {
    async fn regenerate(
        &self,
        platform: &str,
        subset: Vec<Topic>,
        issues: &[ReviewIssue],
    ) -> Result<Vec<Topic>> {
        Ok(self.enrich(subset, platform, issues).await?)
    }
}

type Generated = (Option<String>, Option<String>);

fn by_title(value: &Value) -> HashMap<String, Generated> {
    let non_empty = |entry: &Value, key: &str| {
        entry
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let title = entry.get("title")?.as_str()?;
            Some((
                title.to_string(),
                (non_empty(entry, "reason"), non_empty(entry, "quote")),
            ))
        })
        .collect()
}
