//! 结果集解析、按主键合并与完整性评估

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use serde_json::Value;

use crate::core::Record;

/// 把执行器返回的行规整为记录列表；None 表示没有数据
///
/// - 首行带 `result` 键（`json_agg(...) AS result`）：取其值，NULL 视为无数据
/// - 单行单列且值为数组：同上，取该数组
/// - 值为 JSON 字符串时先解析；对象包装为单元素列表；其余标量包装为 `{"result": v}`
/// - 普通行原样返回
pub fn parse_rows(rows: Vec<Record>) -> Option<Vec<Record>> {
    let first = rows.first()?;

    let aggregated = if let Some(v) = first.get("result") {
        Some(v.clone())
    } else if rows.len() == 1 && first.len() == 1 {
        first.values().next().filter(|v| v.is_array()).cloned()
    } else {
        None
    };

    match aggregated {
        Some(value) => unwrap_value(value),
        None => Some(rows),
    }
}

fn unwrap_value(value: Value) -> Option<Vec<Record>> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(items.into_iter().filter_map(into_record).collect()),
        Value::Object(map) => Some(vec![map]),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed @ (Value::Array(_) | Value::Object(_))) => unwrap_value(parsed),
            Ok(_) | Err(_) => Some(vec![scalar_record(Value::String(s))]),
        },
        scalar => Some(vec![scalar_record(scalar)]),
    }
}

fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Null => None,
        Value::Object(map) => Some(map),
        other => Some(scalar_record(other)),
    }
}

fn scalar_record(value: Value) -> Record {
    let mut record = Record::new();
    record.insert("result".to_string(), value);
    record
}

fn merge_key_of(record: &Record, key: &str) -> String {
    match record.get(key) {
        Some(Value::String(s)) if !s.is_empty() => format!("k:{s}"),
        Some(v) if !v.is_null() && !matches!(v, Value::String(_)) => format!("k:{v}"),
        // 没有主键：以整条记录为键
        _ => format!("r:{}", Value::Object(record.clone())),
    }
}

/// 将新结果合并进已有数据：同主键记录只补充缺失或为 null 的字段，不覆盖已有非空值
pub fn merge_records(existing: &[Record], incoming: &[Record], key: &str) -> Vec<Record> {
    let mut merged: Vec<Record> = Vec::with_capacity(existing.len() + incoming.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in existing.iter().chain(incoming.iter()) {
        let k = merge_key_of(record, key);
        match index.get(&k) {
            Some(&pos) => {
                let target = &mut merged[pos];
                for (field, value) in record {
                    let missing = target.get(field).map(Value::is_null).unwrap_or(true);
                    if missing {
                        target.insert(field.clone(), value.clone());
                    }
                }
            }
            None => {
                index.insert(k, merged.len());
                merged.push(record.clone());
            }
        }
    }
    merged
}

/// 完整性评估
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completeness {
    pub score: f64,
    pub missing_fields: BTreeSet<String>,
    pub records_with_missing: usize,
    pub total_records: usize,
}

/// score = 1 - 含缺失必需字段的记录数 / 总记录数
pub fn evaluate_completeness(data: &[Record], required_fields: &[String]) -> Completeness {
    if data.is_empty() {
        return Completeness {
            score: 0.0,
            missing_fields: BTreeSet::new(),
            records_with_missing: 0,
            total_records: 0,
        };
    }
    let mut missing_fields = BTreeSet::new();
    let mut records_with_missing = 0;
    for record in data {
        let mut any = false;
        for field in required_fields {
            if record.get(field).map(Value::is_null).unwrap_or(true) {
                missing_fields.insert(field.clone());
                any = true;
            }
        }
        if any {
            records_with_missing += 1;
        }
    }
    Completeness {
        score: 1.0 - records_with_missing as f64 / data.len() as f64,
        missing_fields,
        records_with_missing,
        total_records: data.len(),
    }
}
