//! 表别名静态检查与修复
//!
//! 在 sqlparser 的 token 流上（字符串字面量与注释已排除）收集 FROM / JOIN / CTE / 子查询中定义的别名，
//! 以及 `x.col` 形式引用的别名。引用了却未定义的别名按静态映射表补齐 FROM 项；
//! 映射表之外的别名不做猜测，直接报错。

use std::collections::BTreeSet;

use sqlparser::tokenizer::Token as SqlToken;
use thiserror::Error;

use crate::sql::lexer::lex;

/// 别名 → 表名
pub const ALIAS_TABLE_MAP: &[(&str, &str)] = &[
    ("a", "a_sight"),
    ("a_sight", "a_sight"),
    ("t", "tourist_spot"),
    ("ts", "tourist_spot"),
    ("tourist_spot", "tourist_spot"),
];

/// 始终允许引用的 CTE 名
pub const SUPPORTED_CTE_ALIASES: &[&str] = &["combined", "combined_data"];

const SCHEMA_NAMES: &[&str] = &["public", "pg_catalog", "information_schema"];

/// 结束 FROM 列表的关键字
const FROM_TERMINATORS: &[&str] = &[
    "where", "group", "order", "having", "limit", "offset", "union", "intersect", "except",
    "window", "fetch", "for", "select", "returning",
];

/// FROM 项之后不能视为别名的关键字
const NON_ALIAS_KEYWORDS: &[&str] = &[
    "where", "join", "left", "right", "inner", "outer", "full", "cross", "natural", "on",
    "using", "group", "order", "having", "limit", "offset", "union", "intersect", "except",
    "window", "fetch", "for", "lateral", "select", "returning", "as", "tablesample",
];

pub fn table_for_alias(alias: &str) -> Option<&'static str> {
    ALIAS_TABLE_MAP
        .iter()
        .find(|(a, _)| *a == alias)
        .map(|(_, t)| *t)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AliasError {
    /// 文本与 PostgreSQL 的报错一致，便于统一分类为语法错误
    #[error("missing FROM-clause entry for table \"{0}\"")]
    UnknownAlias(String),

    #[error("syntax error: {0}")]
    Syntax(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    /// 未加引号的标识符或关键字，已转小写
    Word(String),
    Quoted(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Semi,
    Star,
    Other,
}

impl From<&SqlToken> for Tok {
    fn from(token: &SqlToken) -> Self {
        match token {
            SqlToken::Word(w) if w.quote_style.is_none() => Tok::Word(w.value.to_lowercase()),
            SqlToken::Word(w) => Tok::Quoted(w.value.clone()),
            SqlToken::Period => Tok::Dot,
            SqlToken::Comma => Tok::Comma,
            SqlToken::LParen => Tok::LParen,
            SqlToken::RParen => Tok::RParen,
            SqlToken::SemiColon => Tok::Semi,
            SqlToken::Mul => Tok::Star,
            _ => Tok::Other,
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    start: usize,
    end: usize,
    depth: usize,
}

impl Token {
    fn word(&self) -> Option<&str> {
        match &self.tok {
            Tok::Word(w) => Some(w.as_str()),
            _ => None,
        }
    }

    fn is_word(&self, w: &str) -> bool {
        self.word() == Some(w)
    }
}

fn tokenize(sql: &str) -> Result<Vec<Token>, AliasError> {
    let lexemes = lex(sql).map_err(|e| AliasError::Syntax(e.to_string()))?;
    Ok(lexemes
        .iter()
        .map(|l| Token {
            tok: Tok::from(&l.token),
            start: l.start,
            end: l.end,
            depth: l.depth,
        })
        .collect())
}

/// 未带别名的表引用（可原地补别名）
#[derive(Debug, Clone, PartialEq)]
struct BareTable {
    table: String,
    end: usize,
}

/// 别名分析结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasReport {
    pub defined: BTreeSet<String>,
    pub referenced: BTreeSet<String>,
    bare_tables: Vec<BareTable>,
    main_from: Option<usize>,
    from_list_end: Option<usize>,
    clause_start: Option<usize>,
    statement_end: usize,
}

impl AliasReport {
    /// 引用了但未定义、且不是允许的 CTE 名的别名
    pub fn missing(&self) -> Vec<String> {
        self.referenced
            .iter()
            .filter(|a| !self.defined.contains(*a))
            .filter(|a| !SUPPORTED_CTE_ALIASES.contains(&a.as_str()))
            .cloned()
            .collect()
    }

    pub fn has_from(&self) -> bool {
        self.main_from.is_some()
    }
}

struct Analyzer<'a> {
    toks: &'a [Token],
    report: AliasReport,
    table_tokens: BTreeSet<usize>,
    in_from: Vec<bool>,
    pending_subquery: Vec<usize>,
}

impl<'a> Analyzer<'a> {
    fn set_in_from(&mut self, depth: usize, value: bool) {
        if self.in_from.len() <= depth {
            self.in_from.resize(depth + 1, false);
        }
        self.in_from[depth] = value;
    }

    fn in_from(&self, depth: usize) -> bool {
        self.in_from.get(depth).copied().unwrap_or(false)
    }

    /// 解析一个 FROM 项；返回下一次继续扫描的位置
    fn from_item(&mut self, mut j: usize) -> usize {
        let toks = self.toks;
        while toks.get(j).is_some_and(|t| t.is_word("lateral") || t.is_word("only")) {
            j += 1;
        }
        let Some(first) = toks.get(j) else {
            return j;
        };
        match &first.tok {
            Tok::LParen => {
                // 子查询：内部继续扫描，右括号处再取别名
                self.pending_subquery.push(first.depth);
                j + 1
            }
            Tok::Word(_) | Tok::Quoted(_) => {
                let mut name = String::new();
                let mut last_end = first.end;
                while let Some(t) = toks.get(j) {
                    match &t.tok {
                        Tok::Word(w) | Tok::Quoted(w) => {
                            name = w.to_lowercase();
                            last_end = t.end;
                            self.table_tokens.insert(j);
                        }
                        _ => break,
                    }
                    if toks.get(j + 1).is_some_and(|t| t.tok == Tok::Dot) {
                        j += 2;
                    } else {
                        j += 1;
                        break;
                    }
                }
                if toks.get(j).is_some_and(|t| t.tok == Tok::LParen) {
                    // 表函数，如 generate_series(...) g
                    self.report.defined.insert(name);
                    self.pending_subquery.push(toks[j].depth);
                    return j + 1;
                }
                self.report.defined.insert(name.clone());
                match self.alias_at(j) {
                    Some((alias, next)) => {
                        self.report.defined.insert(alias);
                        next
                    }
                    None => {
                        self.report.bare_tables.push(BareTable {
                            table: name,
                            end: last_end,
                        });
                        j
                    }
                }
            }
            _ => j,
        }
    }

    /// `[AS] alias`；返回别名与其后位置
    fn alias_at(&self, mut j: usize) -> Option<(String, usize)> {
        let toks = self.toks;
        if toks.get(j).is_some_and(|t| t.is_word("as")) {
            j += 1;
        }
        match toks.get(j).map(|t| &t.tok) {
            Some(Tok::Word(w)) if !NON_ALIAS_KEYWORDS.contains(&w.as_str()) => {
                Some((w.clone(), j + 1))
            }
            Some(Tok::Quoted(q)) => Some((q.to_lowercase(), j + 1)),
            _ => None,
        }
    }

    fn run(mut self) -> AliasReport {
        let toks = self.toks;
        let mut i = 0;
        while i < toks.len() {
            let t = &toks[i];
            let depth = t.depth;
            match &t.tok {
                Tok::Word(w) if w == "from" => {
                    let inside_function = i > 0 && toks[i - 1].depth == depth && toks[i - 1].word().is_some() && depth > 0
                        && !self.in_from(depth)
                        && !toks[..i].iter().rev().take_while(|p| p.depth >= depth).any(|p| p.depth == depth && p.is_word("select"));
                    if inside_function {
                        // EXTRACT(YEAR FROM x) 之类
                        i += 1;
                        continue;
                    }
                    if depth == 0 && self.report.main_from.is_none() {
                        self.report.main_from = Some(i);
                    }
                    self.set_in_from(depth, true);
                    i = self.from_item(i + 1);
                    continue;
                }
                Tok::Word(w) if w == "join" => {
                    i = self.from_item(i + 1);
                    continue;
                }
                Tok::Word(w) if FROM_TERMINATORS.contains(&w.as_str()) => {
                    if self.in_from(depth) {
                        self.set_in_from(depth, false);
                        if depth == 0 && self.report.from_list_end.is_none() && self.report.main_from.is_some() {
                            self.report.from_list_end = Some(t.start);
                        }
                    }
                    if depth == 0
                        && self.report.clause_start.is_none()
                        && self.report.main_from.is_none()
                        && w != "select"
                    {
                        self.report.clause_start = Some(t.start);
                    }
                }
                Tok::Word(w) => {
                    // CTE：WITH name AS ( / , name AS (
                    let prev_ok = i == 0
                        || toks[i - 1].tok == Tok::Comma
                        || toks[i - 1].is_word("with")
                        || toks[i - 1].is_word("recursive");
                    let is_cte = prev_ok
                        && toks.get(i + 1).is_some_and(|n| n.is_word("as"))
                        && toks.get(i + 2).is_some_and(|n| n.tok == Tok::LParen);
                    if is_cte && !self.in_from(depth) {
                        self.report.defined.insert(w.clone());
                    }
                }
                Tok::Comma if self.in_from(depth) => {
                    i = self.from_item(i + 1);
                    continue;
                }
                Tok::RParen => {
                    if self.pending_subquery.last() == Some(&depth) {
                        self.pending_subquery.pop();
                        if let Some((alias, next)) = self.alias_at(i + 1) {
                            self.report.defined.insert(alias);
                            i = next;
                            continue;
                        }
                    }
                }
                Tok::Semi if depth == 0 => {
                    if self.in_from(0) && self.report.from_list_end.is_none() {
                        self.report.from_list_end = Some(t.start);
                    }
                    self.report.statement_end = t.start;
                    break;
                }
                _ => {}
            }
            i += 1;
        }

        for (i, t) in toks.iter().enumerate() {
            let Some(word) = t.word() else { continue };
            if self.table_tokens.contains(&i) || SCHEMA_NAMES.contains(&word) {
                continue;
            }
            if i > 0 && toks[i - 1].tok == Tok::Dot {
                continue;
            }
            let dotted = toks.get(i + 1).is_some_and(|n| n.tok == Tok::Dot)
                && toks
                    .get(i + 2)
                    .is_some_and(|n| matches!(n.tok, Tok::Word(_) | Tok::Quoted(_) | Tok::Star));
            let call = toks.get(i + 3).is_some_and(|n| n.tok == Tok::LParen);
            if dotted && !call {
                self.report.referenced.insert(word.to_string());
            }
        }
        self.report
    }
}

/// 分析 SQL 的别名定义与引用
pub fn analyze_aliases(sql: &str) -> Result<AliasReport, AliasError> {
    let toks = tokenize(sql)?;
    let analyzer = Analyzer {
        toks: &toks,
        report: AliasReport {
            statement_end: sql.trim_end().len(),
            ..AliasReport::default()
        },
        table_tokens: BTreeSet::new(),
        in_from: Vec::new(),
        pending_subquery: Vec::new(),
    };
    Ok(analyzer.run())
}

/// 修复结果
#[derive(Debug, Clone, PartialEq)]
pub struct AliasRepair {
    pub sql: String,
    /// 补上的 (别名, 表)
    pub added: Vec<(String, String)>,
}

impl AliasRepair {
    pub fn changed(&self) -> bool {
        !self.added.is_empty()
    }
}

/// 检查并修复缺失的别名定义
pub fn repair_aliases(sql: &str) -> Result<AliasRepair, AliasError> {
    let report = analyze_aliases(sql)?;
    let missing = report.missing();
    if missing.is_empty() {
        return Ok(AliasRepair {
            sql: sql.to_string(),
            added: Vec::new(),
        });
    }

    let mut resolved: Vec<(String, &'static str)> = Vec::new();
    for alias in &missing {
        match table_for_alias(alias) {
            Some(table) => resolved.push((alias.clone(), table)),
            None => return Err(AliasError::UnknownAlias(alias.clone())),
        }
    }

    let mut edits: Vec<(usize, String)> = Vec::new();
    let mut remaining: Vec<(String, &'static str)> = Vec::new();
    let mut used_bare: Vec<usize> = Vec::new();
    for (alias, table) in resolved.iter().cloned() {
        // 表已在 FROM 中但没有别名：原地补上
        let bare = report
            .bare_tables
            .iter()
            .enumerate()
            .find(|(idx, b)| b.table == table && !used_bare.contains(idx));
        match bare {
            Some((idx, b)) if alias != table => {
                used_bare.push(idx);
                edits.push((b.end, format!(" {alias}")));
            }
            _ => remaining.push((alias, table)),
        }
    }

    if !remaining.is_empty() {
        let items = from_items(&remaining);
        match (report.main_from, report.from_list_end) {
            (Some(_), end) => {
                let at = end.unwrap_or(report.statement_end);
                edits.push((at, format!(", {items}")));
            }
            (None, _) => {
                let at = report.clause_start.unwrap_or(report.statement_end);
                edits.push((at, format!("\nFROM {items}")));
            }
        }
    }

    let mut fixed = sql.to_string();
    edits.sort_by(|a, b| b.0.cmp(&a.0));
    for (at, text) in edits {
        let head = fixed[..at].trim_end().to_string();
        let tail = fixed[at..].to_string();
        let sep = if tail.is_empty() || tail.starts_with(char::is_whitespace) || tail.starts_with(';') {
            ""
        } else {
            "\n"
        };
        fixed = format!("{head}{text}{sep}{tail}");
    }

    tracing::debug!(?missing, "repaired missing table aliases");
    Ok(AliasRepair {
        sql: fixed,
        added: resolved
            .into_iter()
            .map(|(alias, table)| (alias, table.to_string()))
            .collect(),
    })
}

/// 缺失项的 FROM 文本；两张表都缺时用名称前缀 LEFT JOIN 关联
fn from_items(missing: &[(String, &'static str)]) -> String {
    let sight = missing.iter().position(|(_, t)| *t == "a_sight");
    let spot = missing.iter().position(|(_, t)| *t == "tourist_spot");
    let mut items = Vec::new();
    let mut skip = Vec::new();
    if let (Some(si), Some(ti)) = (sight, spot) {
        let a = &missing[si].0;
        let t = &missing[ti].0;
        items.push(format!(
            "a_sight {a}\nLEFT JOIN tourist_spot {t} ON {t}.name LIKE {a}.name || '%' OR TRIM(SPLIT_PART({t}.name, ' ', 1)) = {a}.name"
        ));
        skip.extend([si, ti]);
    }
    for (idx, (alias, table)) in missing.iter().enumerate() {
        if skip.contains(&idx) {
            continue;
        }
        if alias == table {
            items.push(table.to_string());
        } else {
            items.push(format!("{table} {alias}"));
        }
    }
    items.join(", ")
}
