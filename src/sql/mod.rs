//! SQL 处理：词法、别名静态分析与修复、文本清理与只读校验、结果解析与合并

pub mod alias;
pub mod lexer;
pub mod result;
pub mod rewrite;

pub use alias::{analyze_aliases, repair_aliases, AliasError, AliasRepair, AliasReport};
pub use result::{evaluate_completeness, merge_records, parse_rows, Completeness};
pub use rewrite::{guard_read_only, is_duplicate, normalize_whitespace, simplify, strip_code_fences};
