use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::memory::store::{KvStore, load_as, save_as};

pub const STATS_KEY: &str = "skill_stats";
pub const HISTORY_KEY: &str = "daily_history";

/// Oldest entries are evicted past this many runs.
pub const HISTORY_WINDOW: usize = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunStats {
    pub total_runs: u64,
    pub last_run: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHistoryEntry {
    pub date: String,
    pub processed_count: usize,
    pub high_count: usize,
    pub pool_added_count: usize,
}

/// Run statistics and the bounded per-run history.
pub struct RunLedger {
    memory: Arc<dyn KvStore>,
}

impl RunLedger {
    pub fn new(memory: Arc<dyn KvStore>) -> Self {
        Self { memory }
    }

    pub fn stats(&self) -> Result<RunStats> {
        Ok(load_as(self.memory.as_ref(), STATS_KEY)?.unwrap_or_default())
    }

    pub fn history(&self) -> Result<Vec<RunHistoryEntry>> {
        Ok(load_as(self.memory.as_ref(), HISTORY_KEY)?.unwrap_or_default())
    }

    pub fn record_run(&self, processed: usize, high: usize, pool_added: usize) -> Result<RunStats> {
        let now = Local::now();

        let mut stats = self.stats()?;
        stats.total_runs += 1;
        stats.last_run = Some(now.to_rfc3339());
        save_as(self.memory.as_ref(), STATS_KEY, &stats)?;

        let mut history = self.history()?;
        push_bounded(
            &mut history,
            RunHistoryEntry {
                date: now.format("%Y-%m-%d").to_string(),
                processed_count: processed,
                high_count: high,
                pool_added_count: pool_added,
            },
        );
        save_as(self.memory.as_ref(), HISTORY_KEY, &history)?;

        info!(
            "[ledger] run #{} recorded: processed={processed} high={high} pool_added={pool_added}",
            stats.total_runs
        );
        Ok(stats)
    }
}

fn push_bounded(history: &mut Vec<RunHistoryEntry>, entry: RunHistoryEntry) {
    history.push(entry);
    if history.len() > HISTORY_WINDOW {
        let excess = history.len() - HISTORY_WINDOW;
        history.drain(..excess);
    }
}
