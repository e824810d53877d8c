//! SQL 文本处理：去除 markdown 代码块、只读校验、简化（LIMIT）、空白归一化
//!
//! 只读校验与 LIMIT 定位走 sqlparser 的语句解析与词法，不在原始文本上做匹配。

use std::sync::OnceLock;

use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::sql::lexer::lex;

static FENCE_OPEN_SQL: OnceLock<Option<Regex>> = OnceLock::new();
static FENCE_OPEN: OnceLock<Option<Regex>> = OnceLock::new();
static FENCE_CLOSE: OnceLock<Option<Regex>> = OnceLock::new();

fn lazy_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// 去掉 LLM 输出中的 ```sql ... ``` 包裹
pub fn strip_code_fences(raw: &str) -> String {
    let mut sql = raw.trim().to_string();
    if let Some(re) = lazy_regex(&FENCE_OPEN_SQL, r"(?i)^```sql\s*") {
        sql = re.replace(&sql, "").into_owned();
    }
    if let Some(re) = lazy_regex(&FENCE_OPEN, r"^```\s*") {
        sql = re.replace(&sql, "").into_owned();
    }
    if let Some(re) = lazy_regex(&FENCE_CLOSE, r"\s*```$") {
        sql = re.replace(&sql, "").into_owned();
    }
    sql.trim().to_string()
}

/// 合并空白，用于重复 SQL 检测
pub fn normalize_whitespace(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim_end()
        .to_string()
}

/// 是否与历史中的某条 SQL 相同（忽略空白差异）
pub fn is_duplicate(sql: &str, history: &[String]) -> bool {
    let normalized = normalize_whitespace(sql);
    history.iter().any(|h| normalize_whitespace(h) == normalized)
}

/// 出现即拒绝的写操作 / DDL 关键字（含 WITH 中的数据修改子句）
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "ALTER", "UPDATE", "INSERT", "GRANT", "REVOKE", "CREATE", "COPY", "MERGE",
];

fn forbidden_keyword(sql: &str) -> Option<String> {
    lex(sql).ok()?.into_iter().find_map(|l| match l.token {
        Token::Word(w) if w.quote_style.is_none() => {
            let upper = w.value.to_ascii_uppercase();
            FORBIDDEN_KEYWORDS.contains(&upper.as_str()).then_some(upper)
        }
        _ => None,
    })
}

fn forbidden(keyword: String) -> String {
    format!("permission denied: statement contains forbidden keyword {keyword}")
}

/// 只允许查询语句（SELECT / WITH / VALUES）；写操作与 DDL 以权限错误拒绝，无法解析的 SQL 以语法错误拒绝
pub fn guard_read_only(sql: &str) -> Result<(), String> {
    let statements = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            return Err(match forbidden_keyword(sql) {
                Some(keyword) => forbidden(keyword),
                None => format!("syntax error: {e}"),
            })
        }
    };
    if statements.is_empty() {
        return Err("syntax error: empty statement".to_string());
    }
    if statements.iter().any(|s| !matches!(s, Statement::Query(_))) {
        return Err(match forbidden_keyword(sql) {
            Some(keyword) => forbidden(keyword),
            None => "permission denied: only SELECT/WITH statements are allowed".to_string(),
        });
    }
    match forbidden_keyword(sql) {
        Some(keyword) => Err(forbidden(keyword)),
        None => Ok(()),
    }
}

/// 简化查询：收紧顶层 LIMIT 到 `min(原值, max_limit)`，没有时追加；子查询中的 LIMIT 不动
pub fn simplify(sql: &str, max_limit: u32) -> String {
    let sql = sql.trim_end().trim_end_matches(';').trim_end();
    let appended = || format!("{sql}\nLIMIT {max_limit}");
    let Ok(lexemes) = lex(sql) else {
        return appended();
    };
    let value = lexemes
        .iter()
        .rposition(|l| l.depth == 0 && l.is_keyword("limit"))
        .and_then(|i| lexemes.get(i + 1));
    let Some(value) = value else {
        return appended();
    };
    let tighten = match &value.token {
        Token::Number(n, _) => n.parse::<u64>().map_or(true, |existing| existing > u64::from(max_limit)),
        Token::Word(_) => value.is_keyword("all"),
        // LIMIT 后是表达式或参数，保持原样
        _ => false,
    };
    if tighten {
        format!("{}{max_limit}{}", &sql[..value.start], &sql[value.end..])
    } else {
        sql.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_code_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_code_fences("```SQL SELECT 1```"), "SELECT 1");
        assert_eq!(strip_code_fences("```\nSELECT 2\n```  "), "SELECT 2");
        assert_eq!(strip_code_fences("  SELECT 3 "), "SELECT 3");
    }

    #[test]
    fn test_duplicate_ignores_whitespace() {
        let history = vec!["SELECT name\n  FROM a_sight a;".to_string()];
        assert!(is_duplicate("SELECT name FROM   a_sight a", &history));
        assert!(!is_duplicate("SELECT name FROM a_sight a LIMIT 5", &history));
    }

    #[test]
    fn test_guard_read_only() {
        assert!(guard_read_only("SELECT * FROM a_sight").is_ok());
        assert!(guard_read_only("with x as (select 1) select * from x").is_ok());
        assert!(guard_read_only("SELECT name FROM a_sight WHERE name = 'DROP TABLE'").is_ok());
        assert!(guard_read_only("SELECT a.name FROM a_sight a -- delete later\n;").is_ok());

        let err = guard_read_only("DELETE FROM a_sight").unwrap_err();
        assert_eq!(err, "permission denied: statement contains forbidden keyword DELETE");
        let err = guard_read_only("SELECT 1; DROP TABLE a_sight").unwrap_err();
        assert!(err.contains("DROP"));
        let err = guard_read_only("SET search_path TO public").unwrap_err();
        assert_eq!(err, "permission denied: only SELECT/WITH statements are allowed");
    }

    #[test]
    fn test_guard_rejects_modifying_cte() {
        let err = guard_read_only(
            "WITH gone AS (DELETE FROM a_sight RETURNING name) SELECT name FROM gone",
        )
        .unwrap_err();
        assert!(err.starts_with("permission denied"));
        assert!(err.contains("DELETE"));
    }

    #[test]
    fn test_guard_unparsable_is_syntax_error() {
        let err = guard_read_only("SELECT a.name FROM a_sight a WHERE").unwrap_err();
        assert!(err.starts_with("syntax error"), "{err}");
        let err = guard_read_only("DELETE FROM WHERE").unwrap_err();
        assert!(err.starts_with("permission denied"));
    }

    #[test]
    fn test_simplify_appends_or_tightens_limit() {
        assert_eq!(simplify("SELECT * FROM a_sight;", 50), "SELECT * FROM a_sight\nLIMIT 50");
        assert_eq!(
            simplify("SELECT * FROM a_sight limit 1000", 50),
            "SELECT * FROM a_sight limit 50"
        );
        assert_eq!(simplify("SELECT * FROM a_sight LIMIT ALL", 50), "SELECT * FROM a_sight LIMIT 50");
        assert_eq!(
            simplify("SELECT * FROM a_sight LIMIT 1000 OFFSET 20", 50),
            "SELECT * FROM a_sight LIMIT 50 OFFSET 20"
        );
    }

    #[test]
    fn test_simplify_never_raises_or_touches_subqueries() {
        assert_eq!(simplify("SELECT * FROM a_sight LIMIT 10", 50), "SELECT * FROM a_sight LIMIT 10");
        let sql = "SELECT a.name, (SELECT t.name FROM tourist_spot t LIMIT 1) AS spot FROM a_sight a";
        assert_eq!(simplify(sql, 50), format!("{sql}\nLIMIT 50"));
        let sql = "SELECT * FROM (SELECT * FROM a_sight LIMIT 5000) s LIMIT 2000";
        assert_eq!(
            simplify(sql, 50),
            "SELECT * FROM (SELECT * FROM a_sight LIMIT 5000) s LIMIT 50"
        );
    }
}
