use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::{
    skills::script::ScriptStage,
    store::{Annotation, RecordStore},
    types::{Topic, Wordplay},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub matched: usize,
    pub updated: usize,
}

/// Rewrites the full script of every human-confirmed pool topic, or only of
/// those whose title overlaps one of `titles`.
pub async fn refresh_confirmed_scripts(
    records: &dyn RecordStore,
    scripts: &ScriptStage,
    titles: &[String],
) -> Result<RefreshSummary> {
    let confirmed = records
        .fetch_human_confirmed_topics()
        .await
        .context("failed to load confirmed topics")?;
    let targets: Vec<Topic> = confirmed
        .into_iter()
        .filter(|t| titles.is_empty() || matches_any(&t.title, titles))
        .collect();

    if targets.is_empty() {
        warn!("[refresh] no confirmed topic matches");
        return Ok(RefreshSummary::default());
    }
    info!("[refresh] regenerating {} script(s)", targets.len());

    let mut updates = Vec::new();
    for topic in &targets {
        let Some(record_id) = topic.record_id.as_deref() else {
            warn!("[refresh] {} has no record id, skipped", topic.title);
            continue;
        };
        let wordplay = topic.wordplay.clone().unwrap_or_else(Wordplay::none);
        match scripts.generate(topic, &wordplay, None).await {
            Ok(draft) => {
                info!("[refresh] ✓ {} ({} 字)", topic.title, draft.full_script.chars().count());
                updates.push(Annotation::for_script(
                    record_id,
                    &draft.full_script,
                    &draft.estimated_duration,
                ));
            }
            Err(err) => error!("[refresh] 生成失败: {}: {err}", topic.title),
        }
    }

    let updated = if updates.is_empty() {
        0
    } else {
        records.annotate_pool(&updates).await?
    };
    info!("[refresh] 更新完成: {updated}/{}", targets.len());
    Ok(RefreshSummary {
        matched: targets.len(),
        updated,
    })
}

/// Either title contains the other.
fn matches_any(title: &str, wanted: &[String]) -> bool {
    wanted
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .any(|w| title.contains(w) || w.contains(title))
}
