//! 提示词模板
//!
//! 每个任务的 system 消息以固定的任务标题开头（[`INTENT_TASK`] 等），便于日志检索与测试脚本按任务匹配。

use schemars::JsonSchema;

use crate::core::{AgentState, ErrorContext, Intent, IntentType, MatchMode, Record};
use crate::llm::Message;

pub const INTENT_TASK: &str = "【查询意图分析】";
pub const GENERATE_TASK: &str = "【SQL生成】";
pub const REPAIR_TASK: &str = "【SQL修复】";
pub const FOLLOWUP_TASK: &str = "【补充查询】";
pub const VALIDATE_TASK: &str = "【结果校验】";
pub const ANSWER_TASK: &str = "【回答生成】";

pub const SPATIAL_HINT: &str = "\
## 空间查询提示
- 距离查询优先使用 ST_DWithin，再用 ST_Distance 计算具体距离
- 范围查询考虑 ST_Intersects / ST_Within
- 几何字段为 WGS84 (EPSG:4326)，按米计算距离时转换为 geography";

pub const SUMMARY_HINT: &str = "\
## 统计查询提示
- 只需要统计结果，使用 COUNT / AVG / SUM 等聚合，可配合 GROUP BY
- 不要返回 json_agg 明细列表";

/// 由 JsonSchema 生成的输出格式说明
pub fn format_instructions<T: JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    let schema = serde_json::to_string_pretty(&schema).unwrap_or_default();
    format!("请只输出一个符合以下 JSON Schema 的 JSON 对象，不要输出其它内容：\n{schema}")
}

fn match_rules(mode: MatchMode) -> &'static str {
    match mode {
        MatchMode::Exact => "\
## 精确匹配策略
- 用户明确要求精确匹配，文本条件使用 `=` 比较，可用 LOWER() 统一大小写
- 多个取值使用 IN 或 OR 组合",
        MatchMode::Fuzzy => "\
## 模糊匹配策略（默认）
- 涉及用户输入的文本条件使用 `column ILIKE '%' || <value> || '%'`
- 仅当用户明确要求“精确匹配/完全一致”时使用 `=`",
    }
}

fn intent_line(intent: &Intent) -> String {
    format!(
        "- 查询类型: {} (query=需要具体记录 / summary=需要统计结果)\n- 空间特征: {}\n- 置信度: {:.2}\n- 相关关键词: {}",
        intent.intent_type.as_str(),
        intent.is_spatial,
        intent.confidence,
        intent.keywords.join(", ")
    )
}

const SQL_RULES: &str = "\
## 必须遵守
- 只生成一条只读的 SELECT（或 WITH ... SELECT）语句
- 表 a_sight 使用别名 a，表 tourist_spot 使用别名 t，所有使用的别名都必须在 FROM/JOIN 中定义
- 明细查询使用 json_agg(json_build_object(...)) AS result 返回 JSON 数组，字段包含 name、level、评分、门票、介绍 与坐标 coordinates
- 统计查询不要在 json_agg 内嵌套 COUNT/SUM 等聚合函数
- 只输出 SQL，不要解释";

/// 初次生成
pub fn generate_sql(state: &AgentState) -> Vec<Message> {
    let mut user = format!(
        "**用户查询**: {}\n\n**查询意图**:\n{}\n\n**数据库Schema**:\n{}",
        state.enhanced_query,
        intent_line(&state.intent),
        state.schema.as_deref().unwrap_or("(未获取)")
    );
    if let Some(feedback) = &state.validation_feedback {
        user.push_str(&format!(
            "\n\n**上一轮结果校验未通过**: {}\n问题: {}\n建议: {}",
            feedback.message,
            feedback.issues.join("；"),
            feedback.suggestions.join("；")
        ));
    }
    vec![
        Message::system(format!(
            "{GENERATE_TASK}\n你是一个精通 PostgreSQL 和 PostGIS 的 SQL 专家，负责把景区问答转换为 SQL。\n\n{}\n\n{SQL_RULES}",
            match_rules(state.intent.match_mode)
        )),
        Message::user(user),
    ]
}

/// 带错误上下文修复上一条 SQL
pub fn repair_sql(state: &AgentState, failed_sql: &str, ctx: &ErrorContext) -> Vec<Message> {
    let mut location = String::new();
    if let Some(code) = &ctx.sqlstate {
        location.push_str(&format!("\n- SQLSTATE: {code}"));
    }
    if let Some(pos) = ctx.position {
        location.push_str(&format!("\n- 出错位置: 第 {pos} 个字符附近"));
    }
    if let Some(line) = ctx.line {
        location.push_str(&format!("\n- 出错行: 第 {line} 行"));
    }
    let suggestions = ctx
        .suggestions
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n");
    vec![
        Message::system(format!(
            "{REPAIR_TASK}\n你是一个 PostgreSQL SQL 调试专家。根据数据库返回的错误修复 SQL。\n\n{}\n\n{SQL_RULES}",
            match_rules(state.intent.match_mode)
        )),
        Message::user(format!(
            "**用户查询**: {}\n\n**执行失败的SQL**:\n{failed_sql}\n\n**错误信息**: {}{location}\n\n**修复建议**:\n{suggestions}\n\n**数据库Schema**:\n{}",
            state.enhanced_query,
            ctx.message,
            state.schema.as_deref().unwrap_or("(未获取)")
        )),
    ]
}

/// 补充查询：已有数据不完整时针对缺失字段 / 遗漏记录再查一次
pub fn followup_sql(state: &AgentState, missing_fields: &[String]) -> Vec<Message> {
    let history = state
        .sql_history
        .iter()
        .enumerate()
        .map(|(i, sql)| {
            let rows = state
                .execution_results
                .get(i)
                .map(|r| r.row_count)
                .unwrap_or(0);
            format!("-- 第{}轮（{} 条记录）\n{}", i + 1, rows, sql)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let names = state
        .final_data
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.as_str()))
        .take(20)
        .collect::<Vec<_>>()
        .join("、");
    let mut user = format!(
        "**用户查询**: {}\n\n**查询意图**:\n{}\n\n**已执行的SQL**:\n{history}\n\n**已获得 {} 条记录**: {names}\n**缺失字段**: {}\n\n**数据库Schema**:\n{}\n\n请生成一条与上述 SQL 不同的补充查询，补齐缺失字段或遗漏的记录。",
        state.enhanced_query,
        intent_line(&state.intent),
        state.final_data.len(),
        if missing_fields.is_empty() {
            "无".to_string()
        } else {
            missing_fields.join(", ")
        },
        state.schema.as_deref().unwrap_or("(未获取)")
    );
    if let Some(feedback) = &state.validation_feedback {
        user.push_str(&format!(
            "\n\n**结果校验反馈**: {}\n建议: {}",
            feedback.message,
            feedback.suggestions.join("；")
        ));
    }
    vec![
        Message::system(format!(
            "{FOLLOWUP_TASK}\n你是一个擅长优化和补充查询的 SQL 专家。\n\n{}\n\n{SQL_RULES}",
            match_rules(state.intent.match_mode)
        )),
        Message::user(user),
    ]
}

pub fn analyze_intent(query: &str, format: &str) -> Vec<Message> {
    vec![
        Message::system(format!(
            "{INTENT_TASK}\n你是一个查询意图分析专家。\n\
             - summary: 用户需要统计数字（数量、平均值、总数、分布等），不需要明细\n\
             - query: 用户需要具体记录列表或详细信息\n\
             - is_spatial: 是否涉及距离、附近、周边、范围等空间概念\n\
             - is_query_clear: 查询是否包含足够的信息（地点、类型、条件）\n\
             - confidence: 0.8-1.0 非常明确，0.5-0.8 较明确，0-0.5 模糊\n\n{format}"
        )),
        Message::user(format!("**用户查询**: {query}")),
    ]
}

fn sample_json(data: &[Record], n: usize) -> String {
    let sample: Vec<&Record> = data.iter().take(n).collect();
    serde_json::to_string_pretty(&sample).unwrap_or_default()
}

pub fn validate_results(state: &AgentState, sample_size: usize, format: &str) -> Vec<Message> {
    vec![
        Message::system(format!(
            "{VALIDATE_TASK}\n你负责检查查询结果是否回答了用户的问题：相关性、完整性、准确性。\n\n{format}"
        )),
        Message::user(format!(
            "**用户查询**: {}\n**查询类型**: {}\n**最后执行的SQL**:\n{}\n\n**结果共 {} 条，样例**:\n{}",
            state.query,
            state.intent.intent_type.as_str(),
            state.sql_history.last().map(String::as_str).unwrap_or(""),
            state.final_data.len(),
            sample_json(&state.final_data, sample_size)
        )),
    ]
}

pub fn answer(state: &AgentState, sample_size: usize) -> Vec<Message> {
    let style = match state.intent.intent_type {
        IntentType::Summary => "直接给出统计结论和关键数字",
        IntentType::Query => "概述结果数量，并挑选代表性记录简要介绍",
    };
    vec![
        Message::system(format!(
            "{ANSWER_TASK}\n你是一个景区旅游助手，根据查询结果用中文回答用户的问题。{style}。不要编造结果中没有的信息。"
        )),
        Message::user(format!(
            "**用户问题**: {}\n\n**查询结果共 {} 条，样例**:\n{}",
            state.query,
            state.final_data.len(),
            sample_json(&state.final_data, sample_size)
        )),
    ]
}

/// 从 LLM 回复中截取 JSON 对象（容忍代码块与前后说明文字）
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), Some("{\"a\": 1}"));
        assert_eq!(extract_json("no json"), None);
    }

    #[test]
    fn test_generate_prompt_carries_task_and_feedback() {
        let mut state = AgentState::new("杭州的5A景区", "c");
        state.validation_feedback = Some(crate::core::ValidationFeedback {
            message: "缺少门票信息".into(),
            issues: vec![],
            suggestions: vec!["关联 tourist_spot".into()],
            confidence: 0.8,
        });
        let messages = generate_sql(&state);
        assert!(messages[0].content.starts_with(GENERATE_TASK));
        assert!(messages[0].content.contains("ILIKE"));
        assert!(messages[1].content.contains("缺少门票信息"));
    }

    #[test]
    fn test_exact_rules() {
        let state = AgentState::new("q", "c").with_match_mode(MatchMode::Exact);
        assert!(generate_sql(&state)[0].content.contains("精确匹配策略"));
    }
}
