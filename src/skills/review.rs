//! Automated review gate: approve a batch, or regenerate only the items the
//! reviewer names and try again, for a bounded number of rounds.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    agent::{
        parse::parse_lenient,
        provider::{Completion, LlmError, ask},
    },
    types::{PoolRecord, ReviewIssue, ReviewOutcome, Topic},
};

pub const QUOTE_REGENERATIONS: usize = 2;
pub const SCRIPT_REGENERATIONS: usize = 3;

const REVIEW_MAX_TOKENS: u32 = 4096;
const FEEDBACK_LOG_CHARS: usize = 60;

/// Something a reviewer can look at. `review_view` is `None` for items that
/// are not ready for this review (e.g. a pool record without a script).
pub trait Reviewable {
    fn title(&self) -> &str;
    fn review_view(&self) -> Option<Value>;
}

impl Reviewable for Topic {
    fn title(&self) -> &str {
        &self.title
    }

    fn review_view(&self) -> Option<Value> {
        Some(json!({
            "title": self.title,
            "reason": self.reason.as_deref().unwrap_or_default(),
            "quote": self.quote.as_deref().unwrap_or_default(),
        }))
    }
}

impl Reviewable for PoolRecord {
    fn title(&self) -> &str {
        &self.topic.title
    }

    fn review_view(&self) -> Option<Value> {
        let script = self.topic.script.as_deref().filter(|s| !s.trim().is_empty())?;
        Some(json!({
            "title": self.topic.title,
            "quote": self.topic.quote.as_deref().unwrap_or_default(),
            "script": script,
            "wordplay": self.topic.wordplay.as_ref().map(|w| w.hint.as_str()).unwrap_or_default(),
        }))
    }
}

/// Rewrites the items a reviewer objected to.
#[async_trait]
pub trait Regenerator<T>: Send + Sync {
    async fn regenerate(
        &self,
        platform: &str,
        subset: Vec<T>,
        issues: &[ReviewIssue],
    ) -> Result<Vec<T>>;
}

pub struct Reviewer {
    llm: Arc<dyn Completion>,
    prompt: String,
    /// What is under review, used in the request and in logs.
    label: &'static str,
}

impl Reviewer {
    pub fn new(llm: Arc<dyn Completion>, prompt: impl Into<String>, label: &'static str) -> Self {
        Self {
            llm,
            prompt: prompt.into(),
            label,
        }
    }

    pub async fn review(&self, platform: &str, items: &[Value]) -> Result<ReviewOutcome, LlmError> {
        info!("[review] {platform} 审核{} {} 条", self.label, items.len());
        let payload = serde_json::to_string_pretty(items).unwrap_or_default();
        let user = format!("审核{platform}{} {} 条：\n{payload}", self.label, items.len());
        let raw = ask(self.llm.as_ref(), "review", &self.prompt, &user, REVIEW_MAX_TOKENS).await?;
        Ok(interpret(&raw))
    }
}

fn interpret(raw: &str) -> ReviewOutcome {
    let value = match parse_lenient(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!("[review] {err}");
            return ReviewOutcome::Unparseable;
        }
    };
    let Some(approved) = value.get("approved").and_then(Value::as_bool) else {
        return ReviewOutcome::Unparseable;
    };
    let feedback = value
        .get("feedback")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if approved {
        return ReviewOutcome::Approved { feedback };
    }

    let issues = value
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value::<ReviewIssue>(v.clone()).ok())
                .filter(|issue| !issue.title.trim().is_empty())
                .collect()
        })
        .unwrap_or_default();
    ReviewOutcome::Rejected { feedback, issues }
}

#[derive(Debug)]
pub struct GateReport<T> {
    pub batch: Vec<T>,
    pub regenerations: usize,
    /// False when the batch was accepted without an approval.
    pub approved: bool,
}

/// Reviews `batch`, regenerating only rejected items, at most
/// `max_regenerations` times. Always returns a batch: the last one produced
/// when approval never comes.
pub async fn run_gate<T>(
    reviewer: &Reviewer,
    regenerator: &dyn Regenerator<T>,
    platform: &str,
    mut batch: Vec<T>,
    max_regenerations: usize,
) -> GateReport<T>
where
    T: Reviewable + Clone + Send,
{
    let mut regenerations = 0;

    for round in 0..=max_regenerations {
        let candidates: Vec<Value> = batch.iter().filter_map(Reviewable::review_view).collect();
        if candidates.is_empty() {
            return GateReport {
                batch,
                regenerations,
                approved: true,
            };
        }

        let outcome = match reviewer.review(platform, &candidates).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("[review] {platform} round {round} failed: {err}");
                continue;
            }
        };

        let (feedback, issues) = match outcome {
            ReviewOutcome::Approved { feedback } => {
                info!("[review] {platform} {} approved: {feedback}", reviewer.label);
                return GateReport {
                    batch,
                    regenerations,
                    approved: true,
                };
            }
            // Parse failures never block the pipeline.
            ReviewOutcome::Unparseable => {
                warn!("[review] {platform} reply unparseable, accepting batch");
                return GateReport {
                    batch,
                    regenerations,
                    approved: true,
                };
            }
            ReviewOutcome::Rejected { feedback, issues } => (feedback, issues),
        };

        let excerpt: String = feedback.chars().take(FEEDBACK_LOG_CHARS).collect();
        warn!(
            "[review] {platform} {} rejected ({} issues): {excerpt}",
            reviewer.label,
            issues.len()
        );
        if round == max_regenerations {
            break;
        }

        let present: HashSet<&str> = batch.iter().map(Reviewable::title).collect();
        let issues: Vec<ReviewIssue> = issues
            .into_iter()
            .filter(|issue| present.contains(issue.title.as_str()))
            .collect();
        let named: HashSet<&str> = issues.iter().map(|i| i.title.as_str()).collect();
        let subset: Vec<T> = batch
            .iter()
            .filter(|item| named.contains(item.title()))
            .cloned()
            .collect();
        if subset.is_empty() {
            warn!("[review] {platform} issues name no item in the batch, accepting batch");
            return GateReport {
                batch,
                regenerations,
                approved: false,
            };
        }

        regenerations += 1;
        info!(
            "[review] {platform} regenerating {} item(s), round {regenerations}/{max_regenerations}",
            subset.len()
        );
        match regenerator.regenerate(platform, subset, &issues).await {
            Ok(fresh) => batch = splice(batch, fresh),
            Err(err) => warn!("[review] {platform} regeneration failed, keeping previous items: {err:#}"),
        }
    }

    warn!(
        "[review] {platform} {} not approved after {regenerations} regeneration(s), accepting last batch",
        reviewer.label
    );
    GateReport {
        batch,
        regenerations,
        approved: false,
    }
}

/// Replaces items by title, keeping batch order. Copies sharing a title are
/// matched to regenerated items in order.
fn splice<T: Reviewable>(batch: Vec<T>, fresh: Vec<T>) -> Vec<T> {
    let mut by_title: HashMap<String, VecDeque<T>> = HashMap::new();
    for item in fresh {
        by_title
            .entry(item.title().to_string())
            .or_default()
            .push_back(item);
    }
    batch
        .into_iter()
        .map(|item| {
            by_title
                .get_mut(item.title())
                .and_then(VecDeque::pop_front)
                .unwrap_or(item)
        })
        .collect()
}
