//! Daily recommendation run: per platform, rate the newest scrape batch,
//! enrich and review the best topics, and push new ones into the pool with a
//! reviewed script.

pub mod pool;
pub mod selected;
#[cfg(test)]
mod tests;

use std::{sync::Arc, time::Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::{
    agent::{
        prompts::{self, PromptBook},
        provider::Completion,
    },
    memory::{history::RunLedger, preferences::PreferenceLearner, store::KvStore},
    skills::{
        enrich::EnrichmentStage,
        rating::RatingStage,
        review::{QUOTE_REGENERATIONS, Reviewer, SCRIPT_REGENERATIONS, run_gate},
        script::ScriptStage,
        wordplay::WordplayStage,
    },
    store::{Annotation, RecordStore},
    types::{Platform, PoolRecord, Rating, Topic},
};

use pool::PoolMembership;
use selected::{RefreshSummary, refresh_confirmed_scripts};

pub const MID_REASON: &str = "中适配度话题";
pub const LOW_REASON: &str = "低适配度话题";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCounts {
    pub processed: usize,
    pub high: usize,
    pub mid: usize,
    pub low: usize,
    pub pool_added: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub high: usize,
    pub pool_added: usize,
    pub completed: Vec<String>,
    /// (platform, error) for every platform that failed.
    pub failures: Vec<(String, String)>,
}

pub struct Coordinator {
    records: Arc<dyn RecordStore>,
    rating: RatingStage,
    enrichment: EnrichmentStage,
    quote_reviewer: Reviewer,
    wordplay: WordplayStage,
    scripts: ScriptStage,
    script_reviewer: Reviewer,
    learner: PreferenceLearner,
    ledger: RunLedger,
    platforms: Vec<Platform>,
}

impl Coordinator {
    pub fn new(
        llm: Arc<dyn Completion>,
        records: Arc<dyn RecordStore>,
        memory: Arc<dyn KvStore>,
        prompts: &PromptBook,
        platforms: Vec<Platform>,
    ) -> Self {
        Self {
            records,
            rating: RatingStage::new(llm.clone(), prompts.get(prompts::RATING)),
            enrichment: EnrichmentStage::new(llm.clone(), prompts.get(prompts::ENRICH)),
            quote_reviewer: Reviewer::new(llm.clone(), prompts.get(prompts::QUOTE_REVIEW), "高适配选题"),
            wordplay: WordplayStage::new(llm.clone(), prompts.get(prompts::WORDPLAY)),
            scripts: ScriptStage::new(llm.clone(), prompts.get(prompts::SCRIPT)),
            script_reviewer: Reviewer::new(llm, prompts.get(prompts::SCRIPT_REVIEW), "完整脚本"),
            learner: PreferenceLearner::load(memory.clone()),
            ledger: RunLedger::new(memory),
            platforms,
        }
    }

    /// Runs every selected platform. Only an unusable platform list or an
    /// unreadable pool aborts the run; a failing platform is recorded in the
    /// summary and the rest continue.
    pub async fn daily_recommendation(&mut self, routes: &[String]) -> Result<RunSummary> {
        let started = Instant::now();
        info!("====== 老李选题推荐 ======");

        let platforms = self.select_platforms(routes)?;
        let context = self.preference_context().await;

        let keys = self
            .records
            .fetch_pool_membership_keys()
            .await
            .context("failed to load pool membership")?;
        let mut pool = PoolMembership::new(keys);
        info!("选题池已有 {} 条", pool.len());

        let mut summary = RunSummary::default();
        for platform in &platforms {
            match self.process_platform(platform, &mut pool, &context).await {
                Ok(counts) => {
                    summary.processed += counts.processed;
                    summary.high += counts.high;
                    summary.pool_added += counts.pool_added;
                    summary.completed.push(platform.name.clone());
                }
                Err(err) => {
                    error!("[{}] 处理失败: {err:#}", platform.name);
                    summary.failures.push((platform.name.clone(), format!("{err:#}")));
                }
            }
        }

        if let Err(err) = self
            .ledger
            .record_run(summary.processed, summary.high, summary.pool_added)
        {
            warn!("failed to record run history: {err:#}");
        }

        info!(
            "====== 推荐完成 ({:.1}s) processed={} high={} pool_added={} failed={} ======",
            started.elapsed().as_secs_f64(),
            summary.processed,
            summary.high,
            summary.pool_added,
            summary.failures.len()
        );
        Ok(summary)
    }

    pub async fn refresh_confirmed(&self, titles: &[String]) -> Result<RefreshSummary> {
        refresh_confirmed_scripts(self.records.as_ref(), &self.scripts, titles).await
    }

    fn select_platforms(&self, routes: &[String]) -> Result<Vec<Platform>> {
        if self.platforms.is_empty() {
            bail!("no platform table configured");
        }
        if routes.is_empty() {
            return Ok(self.platforms.clone());
        }
        routes
            .iter()
            .map(|route| {
                self.platforms
                    .iter()
                    .find(|p| p.route == *route || p.name == *route)
                    .cloned()
                    .with_context(|| format!("unknown platform route `{route}`"))
            })
            .collect()
    }

    /// Re-learns preferences only when the confirmed count grew; otherwise
    /// the stored context is reused, also when the store cannot be read.
    async fn preference_context(&mut self) -> String {
        let confirmed = self.records.fetch_human_confirmed_topics().await;
        match confirmed {
            Ok(confirmed) if self.learner.has_new_confirmations(confirmed.len()) => {
                self.learner.analyze(&confirmed).context
            }
            Ok(_) => self.learner.context().to_string(),
            Err(err) => {
                warn!("failed to load confirmed topics, reusing stored preferences: {err:#}");
                self.learner.context().to_string()
            }
        }
    }

    pub async fn process_platform(
        &self,
        platform: &Platform,
        pool: &mut PoolMembership,
        preference_context: &str,
    ) -> Result<PlatformCounts> {
        let name = platform.name.as_str();
        info!("[{name}] 开始处理...");

        let mut unrated = self
            .records
            .fetch_latest_unscored_batch(&platform.table_id)
            .await
            .context("failed to fetch latest batch")?;
        if unrated.is_empty() {
            info!("[{name}] 最新批次已全部评分，跳过");
            return Ok(PlatformCounts::default());
        }
        for topic in &mut unrated {
            topic.platform = platform.name.clone();
        }
        let processed = unrated.len();

        let rated = self.rating.rate(unrated, name, preference_context).await?;
        let (high, rest): (Vec<Topic>, Vec<Topic>) =
            rated.into_iter().partition(|t| t.rating == Some(Rating::High));
        let (mid, low): (Vec<Topic>, Vec<Topic>) =
            rest.into_iter().partition(|t| t.rating == Some(Rating::Mid));

        let mut reviewed = self.enrichment.generate_quotes(high, name).await?;
        reviewed.extend(mid.into_iter().map(|t| with_reason(t, MID_REASON, Some(String::new()))));
        let low: Vec<Topic> = low.into_iter().map(|t| with_reason(t, LOW_REASON, None)).collect();

        if !reviewed.is_empty() {
            reviewed = run_gate(
                &self.quote_reviewer,
                &self.enrichment,
                name,
                reviewed,
                QUOTE_REGENERATIONS,
            )
            .await
            .batch;
        }

        let counts = PlatformCounts {
            processed,
            high: count(&reviewed, Rating::High),
            mid: count(&reviewed, Rating::Mid),
            low: low.len(),
            pool_added: 0,
        };

        let annotations: Vec<Annotation> = reviewed
            .iter()
            .chain(&low)
            .filter_map(|t| Some(Annotation::for_rated(t.record_id.as_deref()?, t)))
            .collect();
        if !annotations.is_empty() {
            let updated = self
                .records
                .batch_annotate(&platform.table_id, &annotations)
                .await
                .context("failed to write ratings")?;
            info!(
                "[{name}] 更新 {updated} 条 (高{} 中{} 低{})",
                counts.high, counts.mid, counts.low
            );
        }

        let recommended_at = Utc::now().timestamp_millis();
        let bound: Vec<PoolRecord> = reviewed
            .into_iter()
            .filter(|t| t.rating == Some(Rating::High) && t.has_quote())
            .filter(|t| pool.claim(t.pool_key()))
            .map(|topic| PoolRecord {
                topic,
                recommended_at,
            })
            .collect();
        if bound.is_empty() {
            info!("[{name}] 选题池无新增");
            return Ok(counts);
        }

        let drafted = self.scripts.batch_generate(&self.wordplay, bound).await;
        let report = run_gate(
            &self.script_reviewer,
            &self.scripts,
            name,
            drafted,
            SCRIPT_REGENERATIONS,
        )
        .await;
        let pool_added = self
            .records
            .append_to_pool(&report.batch)
            .await
            .context("failed to append to pool")?;
        info!("[{name}] → 选题池 +{pool_added} 条（含完整脚本）");

        Ok(PlatformCounts {
            pool_added,
            ..counts
        })
    }
}

fn with_reason(mut topic: Topic, reason: &str, quote: Option<String>) -> Topic {
    topic.reason = Some(reason.to_string());
    topic.quote = quote;
    topic
}

fn count(topics: &[Topic], rating: Rating) -> usize {
    topics.iter().filter(|t| t.rating == Some(rating)).count()
}
