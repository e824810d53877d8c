//! 测试与离线运行用的执行器 / Schema 提供方

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::Record;
use crate::db::{DbError, SchemaProvider, SqlExecutor};

type Reply = Result<Vec<Record>, DbError>;

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// 内存执行器：按 SQL 片段匹配预设结果（最后一条重复使用），未匹配时返回空结果集
#[derive(Default)]
pub struct InMemoryExecutor {
    rules: Mutex<Vec<Rule>>,
    executed: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// SQL 包含 needle 时返回 rows
    pub fn on_rows(&self, needle: &str, rows: Vec<Record>) -> &Self {
        self.add_rule(needle, Ok(rows));
        self
    }

    /// SQL 包含 needle 时返回 JSON 数组（每个元素须为对象）
    pub fn on_json(&self, needle: &str, rows: Value) -> &Self {
        let rows = match rows {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            Value::Object(map) => vec![map],
            _ => Vec::new(),
        };
        self.on_rows(needle, rows)
    }

    pub fn on_error(&self, needle: &str, error: DbError) -> &Self {
        self.add_rule(needle, Err(error));
        self
    }

    fn add_rule(&self, needle: &str, reply: Reply) {
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                needle: needle.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
    }

    /// 实际执行过的 SQL（按顺序）
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SqlExecutor for InMemoryExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Record>, DbError> {
        lock(&self.executed).push(sql.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|r| sql.contains(&r.needle)) {
            Some(rule) if rule.replies.len() > 1 => {
                rule.replies.pop_front().unwrap_or_else(|| Ok(Vec::new()))
            }
            Some(rule) => rule.replies.front().cloned().unwrap_or_else(|| Ok(Vec::new())),
            None => Ok(Vec::new()),
        }
    }
}

/// 未配置数据库时使用：每次执行都报告连接失败
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

#[async_trait]
impl SqlExecutor for DryRunExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Record>, DbError> {
        tracing::info!(sql, "dry run, statement not executed");
        Err(DbError::new(
            "could not connect to server: no database configured (dry run)",
        ))
    }
}

/// 固定 Schema 文本
#[derive(Debug, Clone)]
pub struct StaticSchemaProvider {
    schema: Result<String, DbError>,
}

impl StaticSchemaProvider {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: Ok(schema.into()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            schema: Err(DbError::new(message)),
        }
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn fetch_schema(&self) -> Result<String, DbError> {
        self.schema.clone()
    }
}

/// 景区库的默认 Schema 描述（离线模式 / 测试）
pub const SIGHT_SCHEMA: &str = "\
表 a_sight（A级景区）: gid integer, name varchar, level varchar(如 '5A'), \"所属省份\" varchar, \"所属城市\" varchar, \"所属区县\" varchar, \"地址\" varchar, lng_wgs84 double, lat_wgs84 double, geom geometry(Point, 4326)
表 tourist_spot（景点详情）: id integer, name varchar, \"地址\" varchar, \"评分\" varchar, \"门票\" varchar, \"开放时间\" varchar, \"建议游玩时间\" varchar, \"建议季节\" varchar, \"介绍\" text, \"图片链接\" varchar, \"链接\" varchar
关联: tourist_spot.name LIKE a_sight.name || '%'";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_rules() {
        let exec = InMemoryExecutor::new();
        exec.on_json("a_sight", json!([{"name": "西湖"}]))
            .on_error("bad", DbError::new("syntax error"));

        let rows = exec.execute("SELECT * FROM a_sight").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(exec.execute("SELECT bad").await.is_err());
        assert!(exec.execute("SELECT 1").await.unwrap().is_empty());
        assert_eq!(exec.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_reports_connection_failure() {
        let err = DryRunExecutor.execute("SELECT 1").await.unwrap_err();
        assert!(err.message.contains("could not connect"));
    }
}
