use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use crate::types::Platform;

const DEFAULT_LLM_BASE_URL: &str = "https://aicoding.api.zeroclover.io";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_FEISHU_BASE_URL: &str = "https://open.feishu.cn";
const DEFAULT_MEMORY_DIR: &str = "memory";

/// (display name, route, env var holding the table id)
const PLATFORM_TABLES: [(&str, &str, &str); 3] = [
    ("微博", "weibo", "WEIBO_TABLE_ID"),
    ("抖音", "douyin", "DOUYIN_TABLE_ID"),
    ("今日头条", "toutiao", "TOUTIAO_TABLE_ID"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitableSettings {
    pub base_url: String,
    pub app_id: String,
    pub app_secret: String,
    pub app_token: String,
    pub pool_table_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmSettings,
    pub bitable: BitableSettings,
    /// Only platforms with a configured table id.
    pub platforms: Vec<Platform>,
    pub memory_dir: PathBuf,
    pub prompts_file: Option<PathBuf>,
    pub http_proxy: Option<String>,
    pub api_timeout_ms: Option<u64>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| get(key).with_context(|| format!("{key} env var not set"));

        let llm = LlmSettings {
            base_url: get("ANTHROPIC_BASE_URL").unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
            api_key: require("ANTHROPIC_AUTH_TOKEN")?,
            model: get("RECOMMEND_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        };

        let bitable = BitableSettings {
            base_url: get("FEISHU_BASE_URL").unwrap_or_else(|| DEFAULT_FEISHU_BASE_URL.to_string()),
            app_id: require("FEISHU_APP_ID")?,
            app_secret: require("FEISHU_APP_SECRET")?,
            app_token: require("BITABLE_APP_TOKEN")?,
            pool_table_id: require("TOPIC_POOL_TABLE_ID")?,
        };

        let platforms: Vec<Platform> = PLATFORM_TABLES
            .iter()
            .filter_map(|(name, route, var)| {
                get(*var).map(|table_id| Platform {
                    name: name.to_string(),
                    route: route.to_string(),
                    table_id,
                })
            })
            .collect();

        let api_timeout_ms = match get("API_TIMEOUT_MS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(ms) => Some(ms),
                Err(_) => bail!("API_TIMEOUT_MS must be a number of milliseconds, got `{raw}`"),
            },
            None => None,
        };

        Ok(Self {
            llm,
            bitable,
            platforms,
            memory_dir: get("HOTPICK_MEMORY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEMORY_DIR)),
            prompts_file: get("HOTPICK_PROMPTS_FILE").map(PathBuf::from),
            http_proxy: get("HTTP_PROXY"),
            api_timeout_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 5] = [
        ("ANTHROPIC_AUTH_TOKEN", "sk-test"),
        ("FEISHU_APP_ID", "cli_x"),
        ("FEISHU_APP_SECRET", "secret"),
        ("BITABLE_APP_TOKEN", "app"),
        ("TOPIC_POOL_TABLE_ID", "tblPool"),
    ];

    #[test]
    fn defaults_apply_and_unconfigured_platforms_are_skipped() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DOUYIN_TABLE_ID", "tblDy"));
        pairs.push(("WEIBO_TABLE_ID", "  "));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.llm.base_url, DEFAULT_LLM_BASE_URL);
        assert_eq!(config.bitable.base_url, DEFAULT_FEISHU_BASE_URL);
        assert_eq!(config.memory_dir, PathBuf::from("memory"));
        assert_eq!(config.platforms.len(), 1);
        assert_eq!(config.platforms[0].name, "抖音");
        assert_eq!(config.platforms[0].route, "douyin");
        assert_eq!(config.platforms[0].table_id, "tblDy");
        assert!(config.api_timeout_ms.is_none());
    }

    #[test]
    fn missing_token_is_reported_by_name() {
        let err = Config::from_lookup(lookup(&REQUIRED[1..])).unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_AUTH_TOKEN"));
    }

    #[test]
    fn timeout_must_be_numeric() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("API_TIMEOUT_MS", "soon"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());

        pairs.pop();
        pairs.push(("API_TIMEOUT_MS", "30000"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.api_timeout_ms, Some(30_000));
    }
}
