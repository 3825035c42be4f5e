use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::{
    agent::provider::LlmError,
    memory::{history::HISTORY_KEY, preferences::PREFERENCES_KEY, store::InMemoryStore},
    types::{CompletionText, PoolKey},
};

// ── Fakes ─────────────────────────────────────────────────────────────────────

type Responder = dyn Fn(&str, &str) -> Result<String, LlmError> + Send + Sync;

/// Completion fake. Every stage prompt is its own key, so the responder can
/// dispatch on `system`.
struct FakeLlm {
    respond: Box<Responder>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeLlm {
    fn new(
        respond: impl Fn(&str, &str) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn requests_to(&self, stage: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(system, _)| system == stage)
            .map(|(_, user)| user.clone())
            .collect()
    }

    fn calls_to(&self, stage: &str) -> usize {
        self.requests_to(stage).len()
    }
}

#[async_trait]
impl Completion for FakeLlm {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        _max_tokens: u32,
    ) -> Result<CompletionText, LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        (self.respond)(system, user).map(|text| CompletionText {
            text,
            usage: Default::default(),
        })
    }
}

#[derive(Default)]
struct FakeStore {
    tables: HashMap<String, Vec<Topic>>,
    pool: Mutex<HashSet<PoolKey>>,
    confirmed: Vec<Topic>,
    fail_membership: bool,
    fail_confirmed: bool,
    annotated: Mutex<Vec<(String, Annotation)>>,
    appended: Mutex<Vec<PoolRecord>>,
    pool_annotations: Mutex<Vec<Annotation>>,
}

impl FakeStore {
    fn with_table(mut self, table_id: &str, topics: Vec<Topic>) -> Self {
        self.tables.insert(table_id.to_string(), topics);
        self
    }

    fn appended(&self) -> Vec<PoolRecord> {
        self.appended.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for FakeStore {
    async fn fetch_latest_unscored_batch(&self, table_id: &str) -> Result<Vec<Topic>> {
        Ok(self.tables.get(table_id).cloned().unwrap_or_default())
    }

    async fn batch_annotate(&self, table_id: &str, annotations: &[Annotation]) -> Result<usize> {
        let mut annotated = self.annotated.lock().unwrap();
        annotated.extend(annotations.iter().map(|a| (table_id.to_string(), a.clone())));
        Ok(annotations.len())
    }

    async fn fetch_pool_membership_keys(&self) -> Result<HashSet<PoolKey>> {
        if self.fail_membership {
            return Err(anyhow!("pool table unreachable"));
        }
        Ok(self.pool.lock().unwrap().clone())
    }

    async fn append_to_pool(&self, records: &[PoolRecord]) -> Result<usize> {
        let mut pool = self.pool.lock().unwrap();
        pool.extend(records.iter().map(|r| r.topic.pool_key()));
        self.appended.lock().unwrap().extend(records.iter().cloned());
        Ok(records.len())
    }

    async fn fetch_human_confirmed_topics(&self) -> Result<Vec<Topic>> {
        if self.fail_confirmed {
            return Err(anyhow!("search failed"));
        }
        Ok(self.confirmed.clone())
    }

    async fn annotate_pool(&self, annotations: &[Annotation]) -> Result<usize> {
        self.pool_annotations
            .lock()
            .unwrap()
            .extend(annotations.iter().cloned());
        Ok(annotations.len())
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn stage_prompts() -> PromptBook {
    let keys = [
        prompts::RATING,
        prompts::ENRICH,
        prompts::QUOTE_REVIEW,
        prompts::WORDPLAY,
        prompts::SCRIPT,
        prompts::SCRIPT_REVIEW,
    ];
    let overrides: String = keys.iter().map(|k| format!("{k} = \"{k}\"\n")).collect();
    let mut book = PromptBook::default();
    book.apply_overrides(&overrides).unwrap();
    book
}

fn platforms() -> Vec<Platform> {
    vec![
        Platform {
            name: "微博".into(),
            route: "weibo".into(),
            table_id: "tblWeibo".into(),
        },
        Platform {
            name: "抖音".into(),
            route: "douyin".into(),
            table_id: "tblDouyin".into(),
        },
    ]
}

fn scraped(title: &str, record_id: &str) -> Topic {
    Topic {
        record_id: Some(record_id.into()),
        popularity: 1000.0,
        growth: 10.0,
        status: "热".into(),
        ..Topic::new("", title)
    }
}

fn coordinator(llm: &Arc<FakeLlm>, store: &Arc<FakeStore>, memory: &Arc<InMemoryStore>) -> Coordinator {
    Coordinator::new(
        llm.clone(),
        store.clone(),
        memory.clone(),
        &stage_prompts(),
        platforms(),
    )
}

/// Titles from a numbered `N. title | ...` request list.
fn listed_titles(user: &str) -> Vec<String> {
    user.lines()
        .filter_map(|line| {
            let (num, rest) = line.split_once(". ")?;
            num.trim().parse::<usize>().ok()?;
            Some(rest.split(" | ").next()?.to_string())
        })
        .collect()
}

/// Rates everything high, approves every review.
fn happy(system: &str, user: &str) -> Result<String, LlmError> {
    let titles = listed_titles(user);
    let reply = match system {
        "rating" => json!(titles
            .iter()
            .map(|t| json!({"title": t, "rating": "高"}))
            .collect::<Vec<_>>()),
        "enrich" => json!(titles
            .iter()
            .map(|t| json!({"title": t, "reason": "职场共鸣", "quote": format!("{t}？那是啥")}))
            .collect::<Vec<_>>()),
        "quote_review" | "script_review" => json!({"approved": true, "feedback": "好"}),
        "wordplay" => json!({"wordplay": "谐音", "type": "谐音梗"}),
        "script" => json!({"fullScript": "这事儿吧，你看啊……", "estimatedDuration": "30秒"}),
        other => {
            return Err(LlmError::Status {
                status: 400,
                excerpt: format!("unexpected stage {other}"),
            });
        }
    };
    Ok(reply.to_string())
}

fn routes(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn title_missing_from_rating_reply_is_rated_low() {
    let llm = FakeLlm::new(|system, user| match system {
        "rating" => Ok(r#"[{"title":"B","rating":"高"}]"#.to_string()),
        _ => happy(system, user),
    });
    let store = Arc::new(FakeStore::default().with_table("tblWeibo", vec![scraped("A", "recA")]));
    let memory = Arc::new(InMemoryStore::default());

    let summary = coordinator(&llm, &store, &memory)
        .daily_recommendation(&routes(&["weibo"]))
        .await
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.high, 0);
    assert_eq!(summary.pool_added, 0);
    assert_eq!(
        *store.annotated.lock().unwrap(),
        vec![(
            "tblWeibo".to_string(),
            Annotation {
                record_id: "recA".into(),
                rating: Some(Rating::Low),
                ..Annotation::default()
            }
        )]
    );
    assert_eq!(llm.calls_to("enrich"), 0);
    assert_eq!(llm.calls_to("quote_review"), 0);
}

#[tokio::test]
async fn empty_script_reply_falls_back_to_the_quote() {
    let llm = FakeLlm::new(|system, user| match system {
        "enrich" => Ok(
            r#"[{"title":"省钱的秘诀","reason":"打工人共鸣","quote":"钱都没了，还省啥钱"}]"#
                .to_string(),
        ),
        "script" => Ok("{}".to_string()),
        _ => happy(system, user),
    });
    let store = Arc::new(
        FakeStore::default().with_table("tblWeibo", vec![scraped("省钱的秘诀", "rec1")]),
    );
    let memory = Arc::new(InMemoryStore::default());

    let summary = coordinator(&llm, &store, &memory)
        .daily_recommendation(&routes(&["weibo"]))
        .await
        .unwrap();

    assert_eq!(summary.pool_added, 1);
    let appended = store.appended();
    let topic = &appended[0].topic;
    assert_eq!(topic.platform, "微博");
    assert_eq!(topic.script.as_deref(), Some("钱都没了，还省啥钱"));
    assert_eq!(topic.estimated_duration.as_deref(), Some("15秒"));

    let annotated = store.annotated.lock().unwrap();
    assert_eq!(annotated[0].1.quote.as_deref(), Some("钱都没了，还省啥钱"));
    assert_eq!(annotated[0].1.wordplay.as_deref(), Some(""));
}

#[tokio::test]
async fn failing_platform_does_not_abort_the_run() {
    let llm = FakeLlm::new(|system, user| {
        if system == "rating" && user.contains("评估微博") {
            return Err(LlmError::Status {
                status: 500,
                excerpt: "overloaded".into(),
            });
        }
        happy(system, user)
    });
    let store = Arc::new(
        FakeStore::default()
            .with_table("tblWeibo", vec![scraped("A", "recA")])
            .with_table("tblDouyin", vec![scraped("B", "recB")]),
    );
    let memory = Arc::new(InMemoryStore::default());

    let summary = coordinator(&llm, &store, &memory)
        .daily_recommendation(&[])
        .await
        .unwrap();

    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].0, "微博");
    assert!(summary.failures[0].1.contains("500"));
    assert_eq!(summary.completed, vec!["抖音".to_string()]);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.high, 1);
    assert_eq!(summary.pool_added, 1);
    assert_eq!(store.appended()[0].topic.platform, "抖音");
    assert_eq!(memory.save_count(HISTORY_KEY), 1);
}

#[tokio::test]
async fn review_loops_stop_at_their_bounds() {
    let reject = |title: &str| {
        json!({"approved": false, "feedback": "不够好", "issues": [{"title": title, "problem": "太平"}]})
            .to_string()
    };
    let llm = FakeLlm::new(move |system, user| match system {
        "quote_review" | "script_review" => Ok(reject("A")),
        _ => happy(system, user),
    });
    let store = Arc::new(FakeStore::default().with_table("tblWeibo", vec![scraped("A", "recA")]));
    let memory = Arc::new(InMemoryStore::default());

    let summary = coordinator(&llm, &store, &memory)
        .daily_recommendation(&routes(&["weibo"]))
        .await
        .unwrap();

    assert_eq!(llm.calls_to("enrich"), 1 + QUOTE_REGENERATIONS);
    assert_eq!(llm.calls_to("quote_review"), 1 + QUOTE_REGENERATIONS);
    assert_eq!(llm.calls_to("wordplay"), 1);
    assert_eq!(llm.calls_to("script"), 1 + SCRIPT_REGENERATIONS);
    assert_eq!(llm.calls_to("script_review"), 1 + SCRIPT_REGENERATIONS);
    assert!(llm.requests_to("enrich")[1].contains("## 审核意见\n- A: 太平"));
    assert!(llm.requests_to("script")[1].contains("修改意见：太平"));
    // Still unapproved, so the last batch is accepted.
    assert_eq!(summary.pool_added, 1);
}

#[tokio::test]
async fn pool_keys_are_written_at_most_once() {
    let llm = FakeLlm::new(happy);
    let store = Arc::new(FakeStore::default().with_table(
        "tblWeibo",
        vec![scraped("A", "recA"), scraped("B", "recB"), scraped("A", "recA2")],
    ));
    store.pool.lock().unwrap().insert(PoolKey::new("微博", "B"));
    let memory = Arc::new(InMemoryStore::default());
    let mut coordinator = coordinator(&llm, &store, &memory);

    let first = coordinator.daily_recommendation(&routes(&["weibo"])).await.unwrap();
    let second = coordinator.daily_recommendation(&routes(&["weibo"])).await.unwrap();

    assert_eq!(first.pool_added, 1);
    assert_eq!(second.pool_added, 0);
    let appended = store.appended();
    assert_eq!(appended.len(), 1);
    assert_eq!(appended[0].topic.pool_key(), PoolKey::new("微博", "A"));
    assert_eq!(appended[0].topic.record_id.as_deref(), Some("recA"));
}

#[tokio::test]
async fn preferences_are_relearned_only_when_confirmations_grow() {
    let llm = FakeLlm::new(happy);
    let store = Arc::new(FakeStore {
        confirmed: vec![Topic::new("微博", "打工人 加班"), Topic::new("微博", "打工人 工资")],
        ..FakeStore::default().with_table("tblWeibo", vec![scraped("A", "recA")])
    });
    let memory = Arc::new(InMemoryStore::default());
    let mut coordinator = coordinator(&llm, &store, &memory);

    coordinator.daily_recommendation(&[]).await.unwrap();
    coordinator.daily_recommendation(&[]).await.unwrap();

    assert_eq!(memory.save_count(PREFERENCES_KEY), 1);
    let ratings = llm.requests_to("rating");
    assert_eq!(ratings.len(), 2);
    assert!(ratings.iter().all(|r| r.starts_with("【用户偏好参考】")));
    assert!(ratings[1].contains("打工人(2)"));
}

#[tokio::test]
async fn unreadable_confirmations_reuse_the_stored_context() {
    let llm = FakeLlm::new(happy);
    let store = Arc::new(FakeStore {
        fail_confirmed: true,
        ..FakeStore::default().with_table("tblWeibo", vec![scraped("A", "recA")])
    });
    let memory = Arc::new(InMemoryStore::default());

    let summary = coordinator(&llm, &store, &memory)
        .daily_recommendation(&[])
        .await
        .unwrap();

    assert!(summary.failures.is_empty());
    assert!(llm.requests_to("rating")[0].starts_with("评估微博热搜"));
}

#[tokio::test]
async fn enumeration_and_membership_failures_are_fatal() {
    let llm = FakeLlm::new(happy);
    let memory = Arc::new(InMemoryStore::default());

    let store = Arc::new(FakeStore::default());
    let err = coordinator(&llm, &store, &memory)
        .daily_recommendation(&routes(&["zhihu"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown platform route `zhihu`"));

    let mut empty = Coordinator::new(llm.clone(), store.clone(), memory.clone(), &stage_prompts(), vec![]);
    assert!(empty.daily_recommendation(&[]).await.is_err());

    let store = Arc::new(FakeStore {
        fail_membership: true,
        ..FakeStore::default()
    });
    let err = coordinator(&llm, &store, &memory)
        .daily_recommendation(&[])
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("pool table unreachable"));
    assert_eq!(memory.save_count(HISTORY_KEY), 0);
    assert!(llm.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn refresh_rewrites_scripts_of_matching_confirmed_topics() {
    let llm = FakeLlm::new(happy);
    let confirmed = |title: &str, id: &str| Topic {
        record_id: Some(id.into()),
        quote: Some("年终，奖呢？".into()),
        ..Topic::new("微博", title)
    };
    let store = Arc::new(FakeStore {
        confirmed: vec![confirmed("年终奖缩水", "recP1"), confirmed("周末加班", "recP2")],
        ..FakeStore::default()
    });
    let memory = Arc::new(InMemoryStore::default());

    let summary = coordinator(&llm, &store, &memory)
        .refresh_confirmed(&routes(&["年终奖"]))
        .await
        .unwrap();

    assert_eq!(summary, RefreshSummary { matched: 1, updated: 1 });
    let written = store.pool_annotations.lock().unwrap().clone();
    assert_eq!(
        written,
        vec![Annotation::for_script("recP1", "这事儿吧，你看啊……", "30秒")]
    );
    assert!(llm.requests_to("script")[0].contains("原始金句：年终，奖呢？"));
}
