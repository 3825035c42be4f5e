use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::memory::store::{KvStore, load_as, save_as};

pub const RATING: &str = "rating";
pub const ENRICH: &str = "enrich";
pub const QUOTE_REVIEW: &str = "quote_review";
pub const WORDPLAY: &str = "wordplay";
pub const SCRIPT: &str = "script";
pub const SCRIPT_REVIEW: &str = "script_review";

const FINGERPRINTS_KEY: &str = "prompt_fingerprints";

const RATING_PROMPT: &str = "\
你是「老李动画」选题生成师，负责快速判断热搜话题和「老李」人设的适配度。

## 老李人设
- 30-40岁普通上班族，办公室打工人
- 乐观里带点无奈，犀利里透着温情
- 擅长职场吐槽、社会观察、谐音梗、反转幽默
- 用小人物视角解读大事件，笑中带泪

## 适配度标准
- 高：天然适合老李（职场、民生、中年共鸣、有反转空间、全民热议）
- 中：能用老李视角切入，但需要改编
- 低：离人设较远（纯八卦、专业技术、敏感话题、小众圈层）

## 输出格式
只返回 JSON 数组，每条话题都要评估（包括低适配），不要跳过：
[{\"title\":\"原标题\",\"rating\":\"高\"}]";

const ENRICH_PROMPT: &str = "\
你是「老李动画」选题生成师。为高适配话题写推荐理由和老李金句。

## 金句要求
- 大白话、反问句、接地气的比喻
- 有文字游戏潜力（谐音、成语改编、字面理解）
- 说出打工人心里想说但不好意思说的大实话
- 不要鸡汤式，不要文艺腔，不要段子手炫技

如果附带审核意见，只针对意见里的问题重写。

## 输出格式
只返回 JSON 数组：
[{\"title\":\"原标题\",\"reason\":\"一句话推荐理由\",\"quote\":\"老李金句\"}]";

const QUOTE_REVIEW_PROMPT: &str = "\
你是「老李动画」金句审核官。

## 审核标准（超过 70% 合格即通过）
- 适配度合理，推荐理由具体
- 金句口语化，有文字游戏潜力
- 符合打工人真实痛点（职场、生活、社交）
- 避免鸡汤式、文艺腔、段子手炫技

## 输出格式
只返回 JSON：
{\"approved\":true,\"feedback\":\"整体评价（50字以内）\",\"issues\":[{\"title\":\"标题\",\"problem\":\"问题\"}]}";

const WORDPLAY_PROMPT: &str = "\
你是文字梗挖掘专家，从标题里找适合老李的文字游戏。

## 识别类型
- 成语改编：把成语或固定说法换个意思
- 谐音梗：读音相近的字词互换
- 字面理解：把比喻说法按字面意思理解
- 反转：先顺着说，最后拐个弯
- 无：实在没有就老实说无

## 输出格式
只返回 JSON：
{\"wordplay\":\"改编思路（20字以内）\",\"type\":\"成语改编/谐音梗/字面理解/反转/无\"}";

const SCRIPT_PROMPT: &str = "\
你就是「老李」本人，30-40岁打工人，用大白话吐槽生活。

## 语言风格
- 口语化：\"这事儿吧\"、\"你看啊\"、\"说实话\"
- 多用反问句，结尾自嘲但不丧
- 不要鸡汤式、文艺腔、段子手炫技

## 脚本结构（3-4句话，约30秒）
1. 开场铺垫（日常场景）
2. 误导期待
3. 反转揭晓
4. 老李点评

有文字梗提示时必须用上；有修改意见时按意见重写。

## 输出格式
只返回 JSON：
{\"fullScript\":\"完整脚本\",\"estimatedDuration\":\"30秒\"}";

const SCRIPT_REVIEW_PROMPT: &str = "\
你是「老李动画」脚本终审官。

## 审核标准（80% 以上合格才通过）
- 有铺垫、误导、反转、点评的结构
- 语言口语化，有文字梗
- 有反转笑点，结尾自嘲不丧
- 避免鸡汤式收尾、文艺腔、煽情

## 输出格式
只返回 JSON：
{\"approved\":true,\"feedback\":\"整体评价（80字以内）\",\"issues\":[{\"title\":\"标题\",\"problem\":\"具体问题\"}]}";

/// System prompts for every stage, keyed by stage name.
#[derive(Debug, Clone)]
pub struct PromptBook {
    prompts: BTreeMap<&'static str, String>,
}

impl Default for PromptBook {
    fn default() -> Self {
        let prompts = [
            (RATING, RATING_PROMPT),
            (ENRICH, ENRICH_PROMPT),
            (QUOTE_REVIEW, QUOTE_REVIEW_PROMPT),
            (WORDPLAY, WORDPLAY_PROMPT),
            (SCRIPT, SCRIPT_PROMPT),
            (SCRIPT_REVIEW, SCRIPT_REVIEW_PROMPT),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
        Self { prompts }
    }
}

impl PromptBook {
    /// Built-in prompts, with any keys from the TOML file at `path` replacing them.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut book = Self::default();
        let Some(path) = path else {
            return Ok(book);
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read prompts file `{}`", path.display()))?;
        book.apply_overrides(&text)
            .with_context(|| format!("invalid prompts file `{}`", path.display()))?;
        Ok(book)
    }

    pub(crate) fn apply_overrides(&mut self, text: &str) -> Result<()> {
        let doc: toml::Value = toml::from_str(text).map_err(|e| anyhow!("not valid TOML: {e}"))?;
        let table = doc
            .get("prompts")
            .and_then(|v| v.as_table())
            .or_else(|| doc.as_table())
            .ok_or_else(|| anyhow!("top level must be a table"))?;

        for (name, value) in table {
            let Some(content) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            match self.prompts.keys().find(|k| **k == name.as_str()).copied() {
                Some(key) => {
                    self.prompts.insert(key, content.to_string());
                }
                None => warn!(prompt = %name, "ignoring unknown prompt override"),
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> &str {
        self.prompts.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn fingerprints(&self) -> BTreeMap<String, String> {
        self.prompts
            .iter()
            .map(|(k, v)| (k.to_string(), format!("{:x}", Sha256::digest(v.as_bytes()))))
            .collect()
    }

    /// Compares prompt hashes with the ones saved by the previous run and
    /// records the current set. Returns the keys whose content changed.
    pub fn sync_fingerprints(&self, memory: &dyn KvStore) -> Result<Vec<String>> {
        let previous: BTreeMap<String, String> =
            load_as(memory, FINGERPRINTS_KEY)?.unwrap_or_default();
        let current = self.fingerprints();

        let changed: Vec<String> = current
            .iter()
            .filter(|(k, hash)| previous.get(*k) != Some(*hash))
            .map(|(k, _)| k.clone())
            .collect();

        if changed.is_empty() {
            info!("prompts unchanged since last run");
        } else {
            for key in &changed {
                let old = previous.get(key).map(|h| short_hash(h)).unwrap_or("none");
                let new = current.get(key).map(|h| short_hash(h)).unwrap_or("none");
                info!(prompt = %key, "prompt updated: {old} → {new}");
            }
            save_as(memory, FINGERPRINTS_KEY, &current)?;
        }
        Ok(changed)
    }
}

/// Stored hashes come from disk and may be hand-edited.
fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
