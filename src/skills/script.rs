use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    agent::{
        parse::parse_lenient,
        provider::{Completion, LlmError, ask},
    },
    skills::{review::Regenerator, wordplay::WordplayStage},
    types::{PoolRecord, ReviewIssue, Topic, Wordplay},
};

const SCRIPT_MAX_TOKENS: u32 = 2048;

pub const FALLBACK_DURATION: &str = "15秒";

/// Spoken pace used when the model gives a script but no duration.
const CHARS_PER_SECOND: usize = 5;
const MIN_SECONDS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDraft {
    pub full_script: String,
    pub estimated_duration: String,
}

/// Full persona script for a pool-bound topic.
pub struct ScriptStage {
    llm: Arc<dyn Completion>,
    prompt: String,
}

impl ScriptStage {
    pub fn new(llm: Arc<dyn Completion>, prompt: impl Into<String>) -> Self {
        Self {
            llm,
            prompt: prompt.into(),
        }
    }

    pub async fn generate(
        &self,
        topic: &Topic,
        wordplay: &Wordplay,
        feedback: Option<&str>,
    ) -> Result<ScriptDraft, LlmError> {
        info!("[script] 生成完整脚本: {}", topic.title);
        let user = build_request(topic, wordplay, feedback);
        let raw = ask(self.llm.as_ref(), "script", &self.prompt, &user, SCRIPT_MAX_TOKENS).await?;

        let reply = parse_lenient(&raw).unwrap_or_else(|err| {
            warn!("[script] {}: {err}", topic.title);
            Value::Null
        });
        Ok(draft_from(&reply, topic))
    }

    /// Mines wordplay and writes a script for each record. A record whose
    /// calls fail is passed through unchanged.
    pub async fn batch_generate(
        &self,
        miner: &WordplayStage,
        records: Vec<PoolRecord>,
    ) -> Vec<PoolRecord> {
        if records.is_empty() {
            return records;
        }
        info!("[script] 批量生成 {} 个完整脚本", records.len());

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            match self.complete_record(miner, &record).await {
                Ok(done) => out.push(done),
                Err(err) => {
                    error!("[script] 生成失败: {}: {err}", record.topic.title);
                    out.push(record);
                }
            }
        }
        out
    }

    async fn complete_record(
        &self,
        miner: &WordplayStage,
        record: &PoolRecord,
    ) -> Result<PoolRecord, LlmError> {
        let wordplay = miner.mine(&record.topic.title).await?;
        let draft = self.generate(&record.topic, &wordplay, None).await?;
        let mut done = record.clone();
        done.topic.wordplay = Some(wordplay);
        apply(&mut done.topic, draft);
        Ok(done)
    }
}

#[async_trait]
impl Regenerator<PoolRecord> for ScriptStage {
    async fn regenerate(
        &self,
        _platform: &str,
        subset: Vec<PoolRecord>,
        issues: &[ReviewIssue],
    ) -> Result<Vec<PoolRecord>> {
        let mut out = Vec::with_capacity(subset.len());
        for mut record in subset {
            let feedback = issues
                .iter()
                .filter(|issue| issue.title == record.topic.title)
                .map(|issue| issue.problem.as_str())
                .collect::<Vec<_>>()
                .join("；");
            let wordplay = record.topic.wordplay.clone().unwrap_or_else(Wordplay::none);
            match self
                .generate(&record.topic, &wordplay, Some(feedback.as_str()).filter(|f| !f.is_empty()))
                .await
            {
                Ok(draft) => apply(&mut record.topic, draft),
                Err(err) => warn!("[script] rewrite failed, keeping previous script: {}: {err}", record.topic.title),
            }
            out.push(record);
        }
        Ok(out)
    }
}

pub fn apply(topic: &mut Topic, draft: ScriptDraft) {
    topic.script = Some(draft.full_script);
    topic.estimated_duration = Some(draft.estimated_duration);
}

fn build_request(topic: &Topic, wordplay: &Wordplay, feedback: Option<&str>) -> String {
    let platform = match topic.platform.trim() {
        "" => "未知",
        p => p,
    };
    let quote = topic.quote.as_deref().filter(|q| !q.trim().is_empty()).unwrap_or("（无）");
    let hint = if wordplay.is_usable() {
        format!("{}（{}）", wordplay.hint, wordplay.kind.as_str())
    } else {
        "（无）".to_string()
    };

    let mut lines = vec![
        format!("标题：{}", topic.title),
        format!("平台：{platform}"),
        format!("热度：{}", topic.popularity),
        format!("增长：{}", topic.growth),
        format!("原始金句：{quote}"),
        format!("文字梗：{hint}"),
    ];
    if let Some(feedback) = feedback {
        lines.push(format!("修改意见：{feedback}"));
    }
    lines.push(String::new());
    lines.push("请生成完整的老李段子（3-5 句话）。".to_string());
    lines.join("\n")
}

fn draft_from(reply: &Value, topic: &Topic) -> ScriptDraft {
    let text = |key: &str| {
        reply
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match text("fullScript") {
        Some(full_script) => {
            let estimated_duration =
                text("estimatedDuration").unwrap_or_else(|| estimate_duration(&full_script));
            ScriptDraft {
                full_script,
                estimated_duration,
            }
        }
        None => {
            warn!("[script] {} 生成失败，使用金句兜底", topic.title);
            let fallback = topic
                .quote
                .as_deref()
                .filter(|q| !q.trim().is_empty())
                .unwrap_or(topic.title.as_str());
            ScriptDraft {
                full_script: fallback.to_string(),
                estimated_duration: FALLBACK_DURATION.to_string(),
            }
        }
    }
}

fn estimate_duration(script: &str) -> String {
    let seconds = script.chars().count().div_ceil(CHARS_PER_SECOND).max(MIN_SECONDS);
    format!("{seconds}秒")
}
