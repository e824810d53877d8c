//! 中英文混合分词，供本地哈希向量使用
//!
//! 含 CJK 字符的文本走 jieba 搜索引擎模式（细粒度），纯英文按空白切分。

use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 标点与空白不参与向量
fn is_noise(token: &str) -> bool {
    token.chars().all(|c| {
        c.is_whitespace()
            || c.is_ascii_punctuation()
            || matches!(c, '\u{3000}'..='\u{303F}' | '\u{FF00}'..='\u{FF20}')
    })
}

fn keep(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (None, _) => false,
        (Some(c), None) => is_cjk(c) || c.is_ascii_alphanumeric(),
        _ => !is_noise(token),
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| keep(s))
            .collect()
    } else {
        text.split_whitespace()
            .map(|s| s.trim_matches(|c: char| c.is_ascii_punctuation()).to_lowercase())
            .filter(|s| s.len() > 1)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chinese_query() {
        let tokens = tokenize("杭州市的5A景区有哪些？");
        assert!(tokens.iter().any(|t| t.contains("杭州")));
        assert!(tokens.iter().any(|t| t.contains("景区")));
        assert!(!tokens.iter().any(|t| t == "？"));
    }

    #[test]
    fn test_english_query() {
        let tokens = tokenize("Scenic spots near West Lake, please");
        assert_eq!(tokens, vec!["scenic", "spots", "near", "west", "lake", "please"]);
    }

    #[test]
    fn test_empty() {
        assert!(tokenize("   ").is_empty());
        assert!(!contains_cjk("hello"));
        assert!(contains_cjk("hello 西湖"));
    }
}
