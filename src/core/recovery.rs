//! 错误分类与恢复策略
//!
//! ErrorClassifier 把原始错误文本映射为 ErrorType（有序规则，超时短语先于语法短语检查）；
//! RecoveryPolicy 根据类型、同类错误已重试次数与全局预算给出 FallbackStrategy 及退避时长。

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::core::{ErrorType, FallbackStrategy};

/// 有序分类规则：先匹配先生效
static RULES: OnceLock<Vec<(ErrorType, Regex)>> = OnceLock::new();

fn rules() -> &'static [(ErrorType, Regex)] {
    RULES.get_or_init(|| {
        let table: [(ErrorType, &str); 6] = [
            // "timeout ... connect" 属于连接问题，须排在执行超时之前
            (
                ErrorType::Connection,
                r"connection.*refused|connect.*failed|timeout.*connect|could not connect|connection reset|server closed the connection|pool timed out",
            ),
            (
                ErrorType::ExecutionTimeout,
                r"timeout|timed out|canceling statement",
            ),
            (
                ErrorType::Permission,
                r"permission denied|access denied|must be owner|read-only transaction",
            ),
            (
                ErrorType::SqlSyntax,
                r"syntax error|missing from-clause|aggregate.*nested|unexpected token",
            ),
            (
                ErrorType::Field,
                r"(column|relation|table|function).*does not exist|duplicate column|is ambiguous",
            ),
            (
                ErrorType::DataFormat,
                r"invalid.*json|parse.*error|invalid input syntax",
            ),
        ];
        table
            .into_iter()
            .filter_map(|(ty, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((ty, re)),
                Err(e) => {
                    tracing::error!(pattern, error = %e, "invalid classifier pattern");
                    None
                }
            })
            .collect()
    })
}

static SQLSTATE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static POSITION_RE: OnceLock<Option<Regex>> = OnceLock::new();
static LINE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static COLUMN_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn lazy_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// 根据 PostgreSQL SQLSTATE 分类（存在时优先于文本规则）
pub fn classify_sqlstate(code: &str) -> Option<ErrorType> {
    let code = code.trim().to_ascii_uppercase();
    if code.len() != 5 {
        return None;
    }
    match code.as_str() {
        "42601" | "42803" => Some(ErrorType::SqlSyntax),
        "42703" | "42P01" | "42883" | "42702" | "42701" | "42P10" => Some(ErrorType::Field),
        "57014" => Some(ErrorType::ExecutionTimeout),
        "42501" | "25006" => Some(ErrorType::Permission),
        "22P02" | "22032" | "22023" => Some(ErrorType::DataFormat),
        _ if code.starts_with("08") => Some(ErrorType::Connection),
        _ => None,
    }
}

/// 从原始错误文本中提取的定位信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLocation {
    pub sqlstate: Option<String>,
    pub position: Option<usize>,
    pub line: Option<usize>,
}

/// 尽力从错误文本中解析 SQLSTATE / position / LINE
pub fn extract_location(raw: &str) -> ErrorLocation {
    let sqlstate = lazy_regex(&SQLSTATE_RE, r"(?i)(?:sqlstate|code)\s*[:=]?\s*([0-9A-Z]{5})\b")
        .and_then(|re| re.captures(raw))
        .map(|c| c[1].to_string());
    let position = lazy_regex(&POSITION_RE, r"(?i)position\s*[:=]?\s*(\d+)")
        .and_then(|re| re.captures(raw))
        .and_then(|c| c[1].parse().ok());
    let line = lazy_regex(&LINE_RE, r"LINE (\d+):")
        .and_then(|re| re.captures(raw))
        .and_then(|c| c[1].parse().ok());
    ErrorLocation {
        sqlstate,
        position,
        line,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// 根因分析
#[derive(Debug, Clone, Serialize)]
pub struct RootCause {
    pub primary: String,
    pub factors: Vec<String>,
    pub confidence: f32,
}

/// 错误深度分析结果（用于修复提示与诊断）
#[derive(Debug, Clone, Serialize)]
pub struct ErrorAnalysis {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub recoverable: bool,
    pub root_cause: RootCause,
    pub suggestions: Vec<String>,
}

/// 错误分类器：纯函数，无 I/O
#[derive(Debug, Default, Clone)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 文本规则分类
    pub fn classify(&self, raw: &str) -> ErrorType {
        let lower = raw.to_lowercase();
        rules()
            .iter()
            .find(|(_, re)| re.is_match(&lower))
            .map(|(ty, _)| *ty)
            .unwrap_or(ErrorType::Unknown)
    }

    /// 有 SQLSTATE 时先按错误码分类，否则退回文本规则
    pub fn classify_with_code(&self, raw: &str, sqlstate: Option<&str>) -> ErrorType {
        sqlstate
            .and_then(classify_sqlstate)
            .unwrap_or_else(|| self.classify(raw))
    }

    pub fn analyze(&self, raw: &str, sql: Option<&str>, sqlstate: Option<&str>) -> ErrorAnalysis {
        let error_type = self.classify_with_code(raw, sqlstate);
        let (severity, recoverable) = match error_type {
            ErrorType::Permission => (Severity::Critical, false),
            ErrorType::Connection => (Severity::High, true),
            ErrorType::SqlSyntax | ErrorType::ExecutionTimeout => (Severity::Medium, true),
            ErrorType::Field | ErrorType::DataFormat | ErrorType::Unknown => (Severity::Low, true),
        };
        ErrorAnalysis {
            error_type,
            severity,
            recoverable,
            root_cause: root_cause(raw, sql.unwrap_or_default()),
            suggestions: suggestions(error_type),
        }
    }
}

fn root_cause(raw: &str, sql: &str) -> RootCause {
    let lower = raw.to_lowercase();
    let sql_upper = sql.to_uppercase();
    let mut cause = RootCause {
        primary: "unknown".to_string(),
        factors: Vec::new(),
        confidence: 0.0,
    };

    if lower.contains("missing from-clause") {
        cause.primary = "missing_from_clause".to_string();
        cause.confidence = 0.9;
        if !sql_upper.contains("FROM") {
            cause.factors.push("SQL完全缺少FROM子句".to_string());
        }
        if sql.contains("a.") && !sql.contains("a_sight") {
            cause.factors.push("使用了别名a但没有定义表a_sight".to_string());
        }
        if sql.contains("t.") && !sql.contains("tourist_spot") {
            cause.factors.push("使用了别名t但没有定义表tourist_spot".to_string());
        }
    } else if lower.contains("syntax error") {
        cause.primary = "sql_syntax_error".to_string();
        cause.confidence = 0.8;
        if sql_upper.contains("SELECT *") {
            cause.factors.push("使用了SELECT *，建议明确指定字段".to_string());
        }
    } else if lower.contains("timeout") || lower.contains("timed out") {
        cause.primary = "query_complexity".to_string();
        cause.confidence = 0.7;
        if sql_upper.matches("JOIN").count() > 2 {
            cause.factors.push("多表JOIN可能增加查询复杂度".to_string());
        }
        if !sql_upper.contains("LIMIT") {
            cause.factors.push("缺少LIMIT限制".to_string());
        }
    } else if lower.contains("does not exist") {
        cause.primary = "field_not_exist".to_string();
        cause.confidence = 0.9;
        let column = lazy_regex(&COLUMN_RE, r#"column "?([^"\s]+)"? does not exist"#)
            .and_then(|re| re.captures(raw))
            .map(|c| c[1].to_string());
        if let Some(column) = column {
            cause.factors.push(format!("字段 '{column}' 不存在"));
        }
    }
    cause
}

fn suggestions(error_type: ErrorType) -> Vec<String> {
    let items: &[&str] = match error_type {
        ErrorType::SqlSyntax => &[
            "检查SQL语法，确保所有关键字和标点符号正确",
            "验证FROM子句是否完整定义了所有使用的表别名",
            "避免在json_agg内使用COUNT/SUM等聚合函数",
        ],
        ErrorType::ExecutionTimeout => &["简化查询条件，减少数据量", "添加LIMIT限制返回结果数量"],
        ErrorType::Connection => &["检查数据库连接配置和网络连接"],
        ErrorType::Field => &[
            "检查字段名拼写是否正确",
            "使用数据库Schema信息确认可用字段",
        ],
        ErrorType::Permission => &["检查数据库用户权限"],
        ErrorType::DataFormat => &["确认返回结果为合法 JSON（推荐 json_agg(json_build_object(...))）"],
        ErrorType::Unknown => &["检查生成的SQL是否符合PostgreSQL语法规范"],
    };
    items.iter().map(|s| s.to_string()).collect()
}

/// 恢复决策
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    pub error_type: ErrorType,
    pub strategy: FallbackStrategy,
    /// 仅 RetryExecution 有值，由工作流控制器执行可取消的等待
    pub backoff: Option<Duration>,
    pub reason: String,
}

/// 策略表：类型 → 策略，附带各类型的重试上限
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(8))
    }
}

impl RecoveryPolicy {
    pub fn new(backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            backoff_base,
            backoff_cap,
        }
    }

    /// 各类型独立的重试上限；None 表示只受全局预算约束
    pub fn type_cap(error_type: ErrorType) -> Option<u32> {
        match error_type {
            ErrorType::Connection => Some(2),
            ErrorType::DataFormat | ErrorType::Unknown => Some(1),
            ErrorType::Permission => Some(0),
            ErrorType::SqlSyntax | ErrorType::Field | ErrorType::ExecutionTimeout => None,
        }
    }

    /// 指数退避：base * 2^attempt，封顶 cap
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }

    /// `prior_same_type`：本次运行中此前同类错误的次数；`retry_count`：计入本次后的全局重试数
    pub fn decide(
        &self,
        error_type: ErrorType,
        prior_same_type: u32,
        retry_count: u32,
        max_retries: u32,
    ) -> RecoveryDecision {
        let fail = |reason: String| RecoveryDecision {
            error_type,
            strategy: FallbackStrategy::Fail,
            backoff: None,
            reason,
        };

        if retry_count > max_retries {
            return fail(format!("已达到最大重试次数 ({max_retries})"));
        }
        if let Some(cap) = Self::type_cap(error_type) {
            if prior_same_type >= cap {
                return fail(format!("{error_type} 错误已重试 {prior_same_type} 次（上限 {cap}）"));
            }
        }

        let (strategy, backoff, reason) = match error_type {
            ErrorType::SqlSyntax => (FallbackStrategy::RetrySql, None, "SQL语法错误，重新生成SQL"),
            ErrorType::Field => (FallbackStrategy::RetrySql, None, "字段错误，重新生成SQL"),
            ErrorType::ExecutionTimeout => (
                FallbackStrategy::SimplifyQuery,
                None,
                "查询超时，简化查询条件",
            ),
            ErrorType::Connection => (
                FallbackStrategy::RetryExecution,
                Some(self.backoff_for(prior_same_type)),
                "连接错误，稍后重试执行",
            ),
            ErrorType::DataFormat => (FallbackStrategy::RetrySql, None, "数据格式错误，重新生成SQL"),
            ErrorType::Unknown => (FallbackStrategy::RetrySql, None, "未知错误，尝试重新生成SQL"),
            ErrorType::Permission => return fail("权限不足，错误不可恢复".to_string()),
        };
        RecoveryDecision {
            error_type,
            strategy,
            backoff,
            reason: reason.to_string(),
        }
    }
}

/// 跨运行的错误统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub by_type: HashMap<ErrorType, u64>,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
}

impl ErrorStats {
    pub fn record(&mut self, error_type: ErrorType) {
        self.total_errors += 1;
        *self.by_type.entry(error_type).or_insert(0) += 1;
    }

    pub fn record_recovery(&mut self, success: bool) {
        if success {
            self.successful_recoveries += 1;
        } else {
            self.failed_recoveries += 1;
        }
    }

    /// 恢复成功率（百分比）
    pub fn recovery_rate(&self) -> f64 {
        if self.total_errors == 0 {
            return 0.0;
        }
        self.successful_recoveries as f64 / self.total_errors as f64 * 100.0
    }
}
