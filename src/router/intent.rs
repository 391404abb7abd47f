//! 请求分类：决定一个请求走哪种执行模式
//!
//! 只做快速规则匹配；识别不出时返回 None，由 Router 兜底升级为多步执行。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::RouterRequest;

/// 执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 单次确定性查询
    DirectLookup,
    /// 单次写入
    DirectInsert,
    /// 单次外部检索
    DirectSearch,
    /// 多步：先规划再经 FlowController 执行
    Escalate,
}

impl ExecutionMode {
    pub fn is_direct(&self) -> bool {
        !matches!(self, Self::Escalate)
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &RouterRequest) -> Option<ExecutionMode>;
}

/// 关键词前缀分类器
#[derive(Debug, Default, Clone)]
pub struct KeywordClassifier;

const LOOKUP_PREFIXES: &[&str] = &["lookup", "get", "查询"];
const INSERT_PREFIXES: &[&str] = &["insert", "add", "save", "添加"];
const SEARCH_PREFIXES: &[&str] = &["search", "find", "搜索"];

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn fast_match(&self, input: &str) -> Option<ExecutionMode> {
        let input_lower = input.trim().to_lowercase();
        if input_lower.is_empty() {
            return None;
        }

        // 含多个子任务的请求一律交给规划器
        if is_compound(&input_lower) {
            return Some(ExecutionMode::Escalate);
        }

        let starts = |prefixes: &[&str]| prefixes.iter().any(|p| keyword_at_start(&input_lower, p));
        if starts(LOOKUP_PREFIXES) {
            return Some(ExecutionMode::DirectLookup);
        }
        if starts(INSERT_PREFIXES) {
            return Some(ExecutionMode::DirectInsert);
        }
        if starts(SEARCH_PREFIXES) {
            return Some(ExecutionMode::DirectSearch);
        }
        None
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, request: &RouterRequest) -> Option<ExecutionMode> {
        self.fast_match(&request.text)
    }
}

pub(crate) fn is_compound(input_lower: &str) -> bool {
    input_lower.contains(';') || input_lower.contains(" then ") || input_lower.contains("然后")
}

/// 英文关键词必须是完整的词（其后为空白或输入结束）；中文关键词按前缀匹配
fn keyword_at_start(input_lower: &str, keyword: &str) -> bool {
    match input_lower.strip_prefix(keyword) {
        Some(rest) if keyword.is_ascii() => rest.chars().next().map_or(true, char::is_whitespace),
        Some(_) => true,
        None => false,
    }
}

/// 去掉开头的模式关键词，得到查询主体
pub(crate) fn strip_keyword(input: &str) -> String {
    let trimmed = input.trim();
    let lower = trimmed.to_lowercase();
    LOOKUP_PREFIXES
        .iter()
        .chain(INSERT_PREFIXES)
        .chain(SEARCH_PREFIXES)
        .find(|p| keyword_at_start(&lower, p))
        .and_then(|p| trimmed.get(p.len()..))
        .map(|rest| rest.trim().to_string())
        .unwrap_or_else(|| trimmed.to_string())
}
