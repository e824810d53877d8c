//! PostgreSQL 词法（sqlparser）：为每个 token 附上字节偏移与括号深度
//!
//! 空白与注释不出现在结果中；字符串字面量保留为单个 token，内部内容不会被当作关键字。

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer, TokenizerError};

#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    /// 字节偏移，左闭右开
    pub start: usize,
    pub end: usize,
    /// 所在的括号层数；左括号本身计在外层
    pub depth: usize,
}

impl Lexeme {
    /// 未加引号、大小写不敏感地等于 `keyword`
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
    }
}

/// sqlparser 的位置是 (行, 列)，列按字符计数；按 token 顺序单调前移换算成字节偏移
struct OffsetCursor<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: u64,
    column: u64,
    len: usize,
}

impl<'a> OffsetCursor<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            chars: sql.char_indices().peekable(),
            line: 1,
            column: 1,
            len: sql.len(),
        }
    }

    fn seek(&mut self, loc: &Location) -> usize {
        let target = (loc.line as u64, loc.column as u64);
        while (self.line, self.column) < target {
            match self.chars.next() {
                Some((_, '\n')) => {
                    self.line += 1;
                    self.column = 1;
                }
                Some(_) => self.column += 1,
                None => break,
            }
        }
        self.chars.peek().map(|(i, _)| *i).unwrap_or(self.len)
    }
}

pub fn lex(sql: &str) -> Result<Vec<Lexeme>, TokenizerError> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize_with_location()?;

    let mut cursor = OffsetCursor::new(sql);
    let mut depth = 0usize;
    let mut out = Vec::with_capacity(tokens.len());
    for t in tokens {
        if matches!(t.token, Token::Whitespace(_) | Token::EOF) {
            continue;
        }
        let start = cursor.seek(&t.span.start);
        let end = cursor.seek(&t.span.end);
        let token_depth = match t.token {
            Token::RParen => {
                depth = depth.saturating_sub(1);
                depth
            }
            Token::LParen => {
                depth += 1;
                depth - 1
            }
            _ => depth,
        };
        out.push(Lexeme {
            token: t.token,
            start,
            end,
            depth: token_depth,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_bytes() {
        let sql = "SELECT t.\"评分\"\n  FROM tourist_spot t";
        let lexemes = lex(sql).unwrap();
        let quoted = lexemes
            .iter()
            .find(|l| matches!(&l.token, Token::Word(w) if w.value == "评分"))
            .unwrap();
        assert_eq!(&sql[quoted.start..quoted.end], "\"评分\"");
        let from = lexemes.iter().find(|l| l.is_keyword("from")).unwrap();
        assert_eq!(&sql[from.start..from.end], "FROM");
        let last = lexemes.last().unwrap();
        assert_eq!(last.end, sql.len());
    }

    #[test]
    fn test_comments_and_literals_are_opaque() {
        let lexemes = lex("SELECT 'drop table' -- delete\n/* update */ FROM x").unwrap();
        assert!(!lexemes.iter().any(|l| l.is_keyword("delete") || l.is_keyword("update")));
        assert!(lexemes.iter().any(|l| matches!(&l.token, Token::SingleQuotedString(s) if s == "drop table")));
    }

    #[test]
    fn test_paren_depth() {
        let lexemes = lex("SELECT (SELECT 1 LIMIT 1) LIMIT 5").unwrap();
        let limits: Vec<usize> = lexemes
            .iter()
            .filter(|l| l.is_keyword("limit"))
            .map(|l| l.depth)
            .collect();
        assert_eq!(limits, vec![1, 0]);
    }

    #[test]
    fn test_unterminated_literal_is_an_error() {
        assert!(lex("SELECT 'abc").is_err());
    }
}
