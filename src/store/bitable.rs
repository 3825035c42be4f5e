//! Feishu Bitable implementation of [`RecordStore`].

use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    config::BitableSettings,
    store::{Annotation, RecordStore, latest_batch},
    text::truncate_chars,
    types::{PoolKey, PoolRecord, Rating, Topic, Wordplay, WordplayKind},
};

const SEARCH_PAGE_SIZE: usize = 500;
/// The newest batch is always on the first page of a time-sorted search.
const LATEST_SCAN_LIMIT: usize = 200;
const WRITE_CHUNK: usize = 500;
/// Refresh the tenant token this long before it expires.
const TOKEN_SLACK: Duration = Duration::from_secs(300);
const ERROR_BODY_LIMIT_CHARS: usize = 200;

// Platform hot-search table columns.
const F_TITLE: &str = "标题";
const F_POPULARITY: &str = "热度";
const F_GROWTH: &str = "增长值";
const F_STATUS: &str = "状态";
const F_LINK: &str = "链接";
const F_FETCHED_AT: &str = "抓取时间";
const F_SCRIPT: &str = "完整脚本";
const F_DURATION: &str = "预估时长";

// Pool-only columns.
const F_PLATFORM: &str = "来源平台";
const F_RECOMMENDED_AT: &str = "推荐时间";
const F_CONFIRMED: &str = "是否采用";

/// Rating, reason, quote and wordplay columns differ between the platform
/// tables and the pool.
struct Columns {
    rating: &'static str,
    reason: &'static str,
    quote: &'static str,
    wordplay: &'static str,
}

const PLATFORM_COLUMNS: Columns = Columns {
    rating: "适配度（Claude）",
    reason: "推荐理由（Claude）",
    quote: "老李金句（Claude）",
    wordplay: "文字梗（Claude）",
};

const POOL_COLUMNS: Columns = Columns {
    rating: "适配度",
    reason: "推荐理由",
    quote: "老李金句",
    wordplay: "文字梗",
};

#[derive(Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Deserialize, Default)]
struct SearchPage {
    #[serde(default)]
    items: Vec<RawRecord>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Deserialize)]
struct RawRecord {
    record_id: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Deserialize, Default)]
struct CreatedRecords {
    #[serde(default)]
    records: Vec<Value>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct BitableStore {
    http: reqwest::Client,
    settings: BitableSettings,
    token: Mutex<Option<CachedToken>>,
}

impl BitableStore {
    pub fn new(http: reqwest::Client, settings: BitableSettings) -> Self {
        Self {
            http,
            settings,
            token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }

    fn records_url(&self, table_id: &str, action: &str) -> String {
        self.url(&format!(
            "/open-apis/bitable/v1/apps/{}/tables/{table_id}/records/{action}",
            self.settings.app_token
        ))
    }

    async fn tenant_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.value.clone());
        }

        let resp = self
            .http
            .post(self.url("/open-apis/auth/v3/tenant_access_token/internal"))
            .json(&json!({
                "app_id": self.settings.app_id,
                "app_secret": self.settings.app_secret,
            }))
            .send()
            .await
            .context("tenant token request failed")?;
        let body: TokenResponse = read_json(resp).await?;
        if body.code != 0 || body.tenant_access_token.is_empty() {
            bail!("tenant token rejected: code {}: {}", body.code, body.msg);
        }

        let lifetime = Duration::from_secs(body.expire).saturating_sub(TOKEN_SLACK);
        debug!("[bitable] tenant token refreshed, valid {}s", lifetime.as_secs());
        *cached = Some(CachedToken {
            value: body.tenant_access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(body.tenant_access_token)
    }

    async fn post<T: DeserializeOwned + Default>(
        &self,
        what: &str,
        url: String,
        query: &[(&str, String)],
        body: &Value,
    ) -> Result<T> {
        let token = self.tenant_token().await?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .query(query)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;
        let envelope: Envelope<T> = read_json(resp).await.with_context(|| what.to_string())?;
        if envelope.code != 0 {
            bail!("{what} failed: code {}: {}", envelope.code, envelope.msg);
        }
        Ok(envelope.data.unwrap_or_default())
    }

    /// Pages through a records search until `limit` records are collected.
    async fn search(&self, table_id: &str, body: Value, limit: usize) -> Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("page_size", SEARCH_PAGE_SIZE.min(limit).to_string())];
            if let Some(token) = page_token.take() {
                query.push(("page_token", token));
            }
            let page: SearchPage = self
                .post("records search", self.records_url(table_id, "search"), &query, &body)
                .await?;
            out.extend(page.items);
            if !page.has_more || out.len() >= limit {
                break;
            }
            match page.page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        out.truncate(limit);
        Ok(out)
    }

    async fn batch_update(&self, table_id: &str, records: Vec<Value>) -> Result<usize> {
        let mut updated = 0;
        for chunk in records.chunks(WRITE_CHUNK) {
            let _: Value = self
                .post(
                    "batch update",
                    self.records_url(table_id, "batch_update"),
                    &[],
                    &json!({ "records": chunk }),
                )
                .await?;
            updated += chunk.len();
        }
        Ok(updated)
    }
}

#[async_trait]
impl RecordStore for BitableStore {
    async fn fetch_latest_unscored_batch(&self, table_id: &str) -> Result<Vec<Topic>> {
        let body = json!({
            "sort": [{ "field_name": F_FETCHED_AT, "desc": true }],
            "field_names": [F_TITLE, "排名", F_POPULARITY, F_GROWTH, F_STATUS,
                            PLATFORM_COLUMNS.rating, F_LINK, F_FETCHED_AT],
        });
        let raw = self.search(table_id, body, LATEST_SCAN_LIMIT).await?;
        let batch = latest_batch(raw.into_iter().map(platform_topic).collect());
        let total = batch.len();
        let unrated: Vec<Topic> = batch.into_iter().filter(|t| t.rating.is_none()).collect();
        info!("[bitable] {table_id}: latest batch {total}, unrated {}", unrated.len());
        Ok(unrated)
    }

    async fn batch_annotate(&self, table_id: &str, annotations: &[Annotation]) -> Result<usize> {
        let records = annotations
            .iter()
            .map(|a| update_record(a, &PLATFORM_COLUMNS))
            .collect();
        self.batch_update(table_id, records).await
    }

    async fn fetch_pool_membership_keys(&self) -> Result<HashSet<PoolKey>> {
        let body = json!({ "field_names": [F_TITLE, F_PLATFORM] });
        let raw = self
            .search(&self.settings.pool_table_id, body, usize::MAX)
            .await
            .context("failed to read pool membership")?;
        Ok(raw
            .iter()
            .map(|r| {
                PoolKey::new(
                    &field_text(r.fields.get(F_PLATFORM)),
                    &field_text(r.fields.get(F_TITLE)),
                )
            })
            .collect())
    }

    async fn append_to_pool(&self, records: &[PoolRecord]) -> Result<usize> {
        let records: Vec<Value> = records
            .iter()
            .map(|r| json!({ "fields": pool_fields(r) }))
            .collect();
        let mut inserted = 0;
        for chunk in records.chunks(WRITE_CHUNK) {
            let created: CreatedRecords = self
                .post(
                    "pool batch create",
                    self.records_url(&self.settings.pool_table_id, "batch_create"),
                    &[],
                    &json!({ "records": chunk }),
                )
                .await?;
            inserted += created.records.len();
        }
        Ok(inserted)
    }

    async fn fetch_human_confirmed_topics(&self) -> Result<Vec<Topic>> {
        let body = json!({
            "filter": {
                "conjunction": "and",
                "conditions": [{ "field_name": F_CONFIRMED, "operator": "is", "value": [true] }],
            },
            "field_names": [F_TITLE, F_PLATFORM, F_POPULARITY, F_GROWTH, POOL_COLUMNS.rating,
                            POOL_COLUMNS.reason, POOL_COLUMNS.quote, POOL_COLUMNS.wordplay,
                            F_SCRIPT, F_CONFIRMED, F_RECOMMENDED_AT],
        });
        let raw = self
            .search(&self.settings.pool_table_id, body, usize::MAX)
            .await
            .context("failed to read confirmed topics")?;
        Ok(raw.into_iter().map(pool_topic).collect())
    }

    async fn annotate_pool(&self, annotations: &[Annotation]) -> Result<usize> {
        let records = annotations
            .iter()
            .map(|a| update_record(a, &POOL_COLUMNS))
            .collect();
        self.batch_update(&self.settings.pool_table_id, records).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let text = resp.text().await.context("failed to read response body")?;
    if !status.is_success() {
        bail!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_chars(&text, ERROR_BODY_LIMIT_CHARS)
        );
    }
    serde_json::from_str(&text).with_context(|| {
        format!(
            "unexpected response: {}",
            truncate_chars(&text, ERROR_BODY_LIMIT_CHARS)
        )
    })
}

// ── Field conversion ──────────────────────────────────────────────────────────

/// Text cells come back as plain strings or as rich-text segment arrays.
fn field_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(segments)) => segments
            .iter()
            .map(|s| match s {
                Value::String(text) => text.as_str(),
                other => other.get("text").and_then(Value::as_str).unwrap_or_default(),
            })
            .collect(),
        Some(Value::Object(obj)) => obj
            .get("text")
            .or_else(|| obj.get("link"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(other) => other.to_string(),
    }
}

fn field_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        other => field_text(other).trim().parse().unwrap_or_default(),
    }
}

fn field_link(value: Option<&Value>) -> Option<String> {
    let link = match value? {
        Value::Object(obj) => obj.get("link").and_then(Value::as_str)?.to_string(),
        other => field_text(Some(other)),
    };
    Some(link).filter(|l| !l.trim().is_empty())
}

fn non_empty(text: String) -> Option<String> {
    Some(text).filter(|t| !t.trim().is_empty())
}

/// Wordplay is stored as `类型：提示` so the kind survives a round trip.
fn encode_wordplay(wordplay: &Wordplay) -> String {
    if wordplay.is_usable() {
        format!("{}：{}", wordplay.kind.as_str(), wordplay.hint)
    } else {
        String::new()
    }
}

fn decode_wordplay(text: &str) -> Option<Wordplay> {
    let (kind, hint) = text.split_once('：')?;
    let wordplay = Wordplay {
        hint: hint.trim().to_string(),
        kind: WordplayKind::parse(kind),
    };
    wordplay.is_usable().then_some(wordplay)
}

fn platform_topic(raw: RawRecord) -> Topic {
    let f = &raw.fields;
    Topic {
        record_id: Some(raw.record_id.clone()),
        title: field_text(f.get(F_TITLE)),
        popularity: field_number(f.get(F_POPULARITY)),
        growth: field_number(f.get(F_GROWTH)),
        status: field_text(f.get(F_STATUS)),
        link: field_link(f.get(F_LINK)),
        fetched_at: f.get(F_FETCHED_AT).and_then(Value::as_i64),
        rating: Rating::parse(&field_text(f.get(PLATFORM_COLUMNS.rating))),
        ..Topic::default()
    }
}

fn pool_topic(raw: RawRecord) -> Topic {
    let f = &raw.fields;
    Topic {
        record_id: Some(raw.record_id.clone()),
        title: field_text(f.get(F_TITLE)),
        platform: field_text(f.get(F_PLATFORM)),
        popularity: field_number(f.get(F_POPULARITY)),
        growth: field_number(f.get(F_GROWTH)),
        rating: Rating::parse(&field_text(f.get(POOL_COLUMNS.rating))),
        reason: non_empty(field_text(f.get(POOL_COLUMNS.reason))),
        quote: non_empty(field_text(f.get(POOL_COLUMNS.quote))),
        wordplay: decode_wordplay(&field_text(f.get(POOL_COLUMNS.wordplay))),
        script: non_empty(field_text(f.get(F_SCRIPT))),
        ..Topic::default()
    }
}

fn update_record(annotation: &Annotation, columns: &Columns) -> Value {
    let mut fields = Map::new();
    let mut set = |name: &str, value: Option<&str>| {
        if let Some(value) = value {
            fields.insert(name.to_string(), Value::String(value.to_string()));
        }
    };
    set(columns.rating, annotation.rating.map(Rating::as_str));
    set(columns.reason, annotation.reason.as_deref());
    set(columns.quote, annotation.quote.as_deref());
    set(columns.wordplay, annotation.wordplay.as_deref());
    set(F_SCRIPT, annotation.script.as_deref());
    set(F_DURATION, annotation.estimated_duration.as_deref());
    json!({ "record_id": annotation.record_id, "fields": fields })
}

fn pool_fields(record: &PoolRecord) -> Map<String, Value> {
    let topic = &record.topic;
    let mut fields = Map::new();
    fields.insert(F_PLATFORM.into(), json!(topic.platform));
    fields.insert(F_TITLE.into(), json!(topic.title));
    fields.insert(F_POPULARITY.into(), json!(topic.popularity));
    fields.insert(F_GROWTH.into(), json!(topic.growth));
    fields.insert(POOL_COLUMNS.rating.into(), json!(Rating::High.as_str()));
    fields.insert(
        POOL_COLUMNS.reason.into(),
        json!(topic.reason.as_deref().unwrap_or_default()),
    );
    fields.insert(
        POOL_COLUMNS.quote.into(),
        json!(topic.quote.as_deref().unwrap_or_default()),
    );
    if let Some(wordplay) = topic.wordplay.as_ref().map(encode_wordplay).and_then(non_empty) {
        fields.insert(POOL_COLUMNS.wordplay.into(), json!(wordplay));
    }
    if let Some(script) = &topic.script {
        fields.insert(F_SCRIPT.into(), json!(script));
    }
    if let Some(duration) = &topic.estimated_duration {
        fields.insert(F_DURATION.into(), json!(duration));
    }
    if let Some(link) = &topic.link {
        fields.insert(F_LINK.into(), json!({ "link": link, "text": topic.title }));
    }
    fields.insert(F_RECOMMENDED_AT.into(), json!(record.recommended_at));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(fields: Value) -> RawRecord {
        RawRecord {
            record_id: "rec1".into(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn field_text_reads_every_cell_shape() {
        assert_eq!(field_text(Some(&json!("a"))), "a");
        assert_eq!(
            field_text(Some(&json!([{"text":"打工"},{"text":"人","type":"text"}]))),
            "打工人"
        );
        assert_eq!(field_text(Some(&json!(42))), "42");
        assert_eq!(field_text(None), "");
        assert_eq!(field_number(Some(&json!("12.5"))), 12.5);
    }

    #[test]
    fn platform_record_becomes_a_topic() {
        let topic = platform_topic(raw(json!({
            "标题": [{"text":"年终奖"}],
            "热度": 98000,
            "增长值": 12,
            "状态": "热",
            "链接": {"link":"https://s.weibo.com/x","text":"年终奖"},
            "抓取时间": 1_700_000_000_000i64,
            "适配度（Claude）": "",
        })));
        assert_eq!(topic.record_id.as_deref(), Some("rec1"));
        assert_eq!(topic.title, "年终奖");
        assert_eq!(topic.popularity, 98000.0);
        assert_eq!(topic.link.as_deref(), Some("https://s.weibo.com/x"));
        assert_eq!(topic.fetched_at, Some(1_700_000_000_000));
        assert_eq!(topic.rating, None);
    }

    #[test]
    fn annotations_write_only_present_fields() {
        let update = update_record(
            &Annotation {
                record_id: "rec9".into(),
                rating: Some(Rating::Low),
                ..Annotation::default()
            },
            &PLATFORM_COLUMNS,
        );
        assert_eq!(update["record_id"], "rec9");
        assert_eq!(update["fields"], json!({"适配度（Claude）": "低"}));

        let script = update_record(&Annotation::for_script("rec2", "脚本", "20秒"), &POOL_COLUMNS);
        assert_eq!(script["fields"], json!({"完整脚本": "脚本", "预估时长": "20秒"}));
    }

    #[test]
    fn pool_fields_include_link_and_wordplay() {
        let record = PoolRecord {
            topic: Topic {
                link: Some("https://x".into()),
                quote: Some("年终，奖呢？".into()),
                wordplay: Some(Wordplay {
                    hint: "年终奖拆开读".into(),
                    kind: WordplayKind::LiteralReinterpretation,
                }),
                ..Topic::new("微博", "年终奖")
            },
            recommended_at: 7,
        };
        let fields = pool_fields(&record);
        assert_eq!(fields["链接"], json!({"link":"https://x","text":"年终奖"}));
        assert_eq!(fields["适配度"], "高");
        assert_eq!(fields["文字梗"], "字面理解：年终奖拆开读");
        assert_eq!(fields["推荐时间"], 7);
        assert!(!fields.contains_key("完整脚本"));

        let back = pool_topic(raw(Value::Object(fields)));
        assert_eq!(back.wordplay, record.topic.wordplay);
        assert_eq!(back.platform, "微博");
    }
}
