use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::{
    agent::{
        parse::parse_lenient,
        provider::{Completion, LlmError, ask},
    },
    types::{Wordplay, WordplayKind},
};

const WORDPLAY_MAX_TOKENS: u32 = 512;

pub struct WordplayStage {
    llm: Arc<dyn Completion>,
    prompt: String,
}

impl WordplayStage {
    pub fn new(llm: Arc<dyn Completion>, prompt: impl Into<String>) -> Self {
        Self {
            llm,
            prompt: prompt.into(),
        }
    }

    pub async fn mine(&self, title: &str) -> Result<Wordplay, LlmError> {
        let user = format!("标题：{title}\n\n找出适合老李的文字梗。");
        let raw = ask(self.llm.as_ref(), "wordplay", &self.prompt, &user, WORDPLAY_MAX_TOKENS).await?;

        let wordplay = match parse_lenient(&raw) {
            Ok(value) => from_reply(&value),
            Err(err) => {
                warn!("[wordplay] {title}: {err}");
                Wordplay::none()
            }
        };
        info!("[wordplay] {title} → {} ({})", wordplay.hint, wordplay.kind.as_str());
        Ok(wordplay)
    }
}

fn from_reply(value: &Value) -> Wordplay {
    let hint = value
        .get("wordplay")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(WordplayKind::parse)
        .unwrap_or_default();
    match hint {
        Some(hint) if kind != WordplayKind::None => Wordplay {
            hint: hint.to_string(),
            kind,
        },
        _ => Wordplay::none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompletionText;
    use async_trait::async_trait;

    struct Fixed(&'static str);

    #[async_trait]
    impl Completion for Fixed {
        async fn complete(&self, _: &str, _: &str, _: u32) -> Result<CompletionText, LlmError> {
            Ok(CompletionText {
                text: self.0.to_string(),
                usage: Default::default(),
            })
        }
    }

    #[tokio::test]
    async fn reply_is_mapped_to_a_typed_hint() {
        let stage = WordplayStage::new(
            Arc::new(Fixed(r#"{"wordplay":"年终奖→年终，奖呢","type":"字面理解"}"#)),
            "p",
        );
        let wordplay = stage.mine("年终奖").await.unwrap();
        assert_eq!(wordplay.kind, WordplayKind::LiteralReinterpretation);
        assert_eq!(wordplay.hint, "年终奖→年终，奖呢");
        assert!(wordplay.is_usable());
    }

    #[tokio::test]
    async fn garbage_or_none_type_defaults_to_none() {
        let stage = WordplayStage::new(Arc::new(Fixed("想不出来")), "p");
        assert_eq!(stage.mine("x").await.unwrap(), Wordplay::none());

        let stage = WordplayStage::new(Arc::new(Fixed(r#"{"wordplay":"随便","type":"无"}"#)), "p");
        assert_eq!(stage.mine("x").await.unwrap(), Wordplay::none());
    }
}
