//! 基于关键词的意图分析（不依赖 LLM）
//!
//! 三个分值独立累加：统计（summary）、空间（spatial）、景区（scenic）。
//! 明确的查询动词会压低统计分；低置信度或缺少明确动词时再做一轮启发式语义修正。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::core::{Intent, IntentSource, IntentType, MatchMode};

/// 诊断用关键词表：空间
pub const SPATIAL_KEYWORDS: &[&str] = &[
    "距离", "附近", "周围", "范围内", "最近", "周边", "临近", "靠近", "邻近", "路径", "路线",
    "附近的", "周围的", "旁边", "边上", "相交", "包含", "在内", "边界", "缓冲", "缓冲区",
    "distance", "near", "nearby", "around", "within", "route", "path", "nearest", "proximity",
    "intersect", "contain", "buffer", "st_", "dwithin", "surrounding",
];

/// 诊断用关键词表：统计
pub const SUMMARY_KEYWORDS: &[&str] = &[
    "统计", "总结", "汇总", "计数", "总数", "总计", "一共", "总共", "共有", "合计", "多少",
    "数量", "个数", "有几个", "有多少", "几个", "分布", "平均", "最多", "最少", "排名", "分析",
    "占比", "百分比", "比例", "count", "sum", "average", "max", "min", "total", "statistics",
    "summary", "analyze", "how many", "percentage",
];

const STRONG_SUMMARY: &[&str] = &["统计", "计数", "总数", "总计", "一共", "总共", "共有", "合计"];
const MEDIUM_SUMMARY: &[&str] = &[
    "汇总", "总结", "分布", "平均", "最多", "最少", "个数", "count", "sum", "total",
];
const WEAK_SUMMARY: &[&str] = &["占比", "百分比", "比例", "average", "max", "min", "percentage"];
const SUMMARY_VERBS: &[&str] = &["统计", "计算", "汇总", "总结"];

const STRONG_SPATIAL: &[&str] = &[
    "距离", "附近", "周围", "范围内", "最近", "周边", "临近", "靠近", "邻近", "分布",
];
const MEDIUM_SPATIAL: &[&str] = &[
    "路径", "路线", "附近的", "周围的", "旁边", "边上", "near", "nearby", "around", "within",
    "surrounding",
];
const WEAK_SPATIAL: &[&str] = &["相交", "包含", "边界", "缓冲", "buffer", "st_", "dwithin"];

const SCENIC_KEYWORDS: &[&str] = &[
    "景区", "景点", "旅游", "5a", "4a", "3a", "2a", "1a", "scenic", "tourist", "spot",
];

const QUERY_VERBS: &[&str] = &["查询", "查找", "列出", "显示", "给我", "找", "搜索", "看看", "获取"];
const EXACT_MARKERS: &[&str] = &["精确", "完全一致", "exact"];

const SUMMARY_THRESHOLD: f64 = 0.25;
const SPATIAL_THRESHOLD: f64 = 0.2;

struct Patterns {
    summary: Vec<(Regex, f64)>,
    exclusion: Vec<Regex>,
    spatial: Vec<(Regex, f64)>,
    level: Vec<(Regex, f64)>,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn compile(table: &[(&str, f64)]) -> Vec<(Regex, f64)> {
    table
        .iter()
        .filter_map(|(p, w)| Regex::new(p).ok().map(|re| (re, *w)))
        .collect()
}

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        summary: compile(&[
            (r"有多少个?\b", 0.5),
            (r"一共.*?多少", 0.5),
            (r"总共.*?多少", 0.5),
            (r"多少.*?个", 0.4),
            (r"(多少|几).{0,5}?个", 0.35),
            (r"排名", 0.25),
            (r"分布情况", 0.3),
        ]),
        exclusion: [r"这几个", r"那几个", r"哪几个", r"前\d+个", r"后\d+个"]
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect(),
        spatial: compile(&[
            (r"距离.{0,10}?(公里|千米|米|km)", 0.5),
            (r"附近.{0,20}?(景区|景点)", 0.4),
            (r"周边.{0,20}?(景区|景点)", 0.4),
            (r"[东南西北].{0,5}?公里", 0.3),
            (r"经纬度", 0.25),
            (r"坐标", 0.2),
        ]),
        level: compile(&[(r"[1-5]a景区", 0.3), (r"[1-5]a级", 0.3), (r"[1-5]a景点", 0.3)]),
    })
}

/// 各项分值与命中明细
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeywordScores {
    pub summary: f64,
    pub spatial: f64,
    pub scenic: f64,
    pub matched_patterns: Vec<String>,
}

fn sum_keywords(text: &str, keywords: &[&str], weight: f64, label: &str, hits: &mut Vec<String>) -> f64 {
    keywords
        .iter()
        .filter(|k| text.contains(**k))
        .map(|k| {
            hits.push(format!("{label}: {k}"));
            weight
        })
        .sum()
}

fn sum_patterns(text: &str, table: &[(Regex, f64)], label: &str, hits: &mut Vec<String>) -> f64 {
    table
        .iter()
        .filter(|(re, _)| re.is_match(text))
        .map(|(re, w)| {
            hits.push(format!("{label}: {}", re.as_str()));
            *w
        })
        .sum()
}

pub fn score(query: &str) -> KeywordScores {
    let text = query.to_lowercase();
    let p = patterns();
    let mut hits = Vec::new();

    let mut summary = sum_keywords(&text, STRONG_SUMMARY, 0.4, "强统计关键词", &mut hits)
        + sum_keywords(&text, MEDIUM_SUMMARY, 0.25, "中等统计关键词", &mut hits)
        + sum_keywords(&text, WEAK_SUMMARY, 0.15, "弱统计关键词", &mut hits);
    if !p.exclusion.iter().any(|re| re.is_match(&text)) {
        summary += sum_patterns(&text, &p.summary, "统计模式", &mut hits);
    }
    if let Some(verb) = SUMMARY_VERBS.iter().find(|v| text.contains(**v)) {
        summary += 0.3;
        hits.push(format!("统计动词: {verb}"));
    }

    let spatial = sum_keywords(&text, STRONG_SPATIAL, 0.3, "强空间关键词", &mut hits)
        + sum_keywords(&text, MEDIUM_SPATIAL, 0.2, "中等空间关键词", &mut hits)
        + sum_keywords(&text, WEAK_SPATIAL, 0.1, "弱空间关键词", &mut hits)
        + sum_patterns(&text, &p.spatial, "空间模式", &mut hits);

    let scenic = sum_keywords(&text, SCENIC_KEYWORDS, 0.1, "景区关键词", &mut hits)
        + sum_patterns(&text, &p.level, "景区等级模式", &mut hits);

    // 明确的查询动词说明用户要明细而不是统计
    let summary = if summary > 0.0 && QUERY_VERBS.iter().any(|v| text.contains(*v)) {
        hits.push(format!("Query动词折扣: {summary:.2} → {:.2}", summary * 0.4));
        summary * 0.4
    } else {
        summary
    };

    KeywordScores {
        summary: summary.min(1.0),
        spatial: spatial.min(1.0),
        scenic: scenic.min(1.0),
        matched_patterns: hits,
    }
}

/// 用户是否要求精确匹配
pub fn detect_match_mode(query: &str) -> MatchMode {
    let text = query.to_lowercase();
    if EXACT_MARKERS.iter().any(|m| text.contains(m)) {
        MatchMode::Exact
    } else {
        MatchMode::Fuzzy
    }
}

/// 诊断用：命中的空间与统计关键词
pub fn matched_keywords(query: &str) -> Vec<String> {
    let text = query.to_lowercase();
    SPATIAL_KEYWORDS
        .iter()
        .chain(SUMMARY_KEYWORDS.iter())
        .filter(|k| text.contains(**k))
        .map(|k| k.to_string())
        .collect()
}

/// 关键词意图分析
pub fn analyze(query: &str) -> Intent {
    let text = query.to_lowercase();
    let scores = score(query);

    let mut is_summary = scores.summary >= SUMMARY_THRESHOLD;
    let mut is_spatial = scores.spatial >= SPATIAL_THRESHOLD;

    let mut confidence = if is_summary {
        scores.summary * 0.7 + scores.scenic * 0.3
    } else if is_spatial {
        scores.spatial * 0.7 + scores.scenic * 0.3
    } else if scores.scenic > 0.0 {
        scores.scenic
    } else {
        0.5
    };

    let mut description = vec![if is_summary {
        format!("统计汇总查询(置信度:{:.2})", scores.summary)
    } else {
        "数据查询".to_string()
    }];
    if is_spatial {
        description.push(format!("空间查询(置信度:{:.2})", scores.spatial));
    }
    if scores.scenic > 0.2 {
        description.push(format!("景区查询(置信度:{:.2})", scores.scenic));
    }

    let has = |words: &[&str]| words.iter().any(|w| text.contains(w));
    let needs_enhancement = confidence < 0.3
        || (!is_summary && !has(&["查询", "查找", "列出"]))
        || (is_summary && !has(&["统计", "计数", "多少"]))
        || (is_spatial && !has(&["距离", "附近", "周边"]));

    if needs_enhancement {
        if text.contains("排名") && text.contains('前') {
            is_summary = true;
            confidence = confidence.max(0.6);
        } else if text.contains("推荐") || text.contains("热门") {
            is_summary = false;
        } else if text.contains("分布") && !text.contains("地图") {
            is_summary = true;
            confidence = confidence.max(0.7);
        }
        if !is_spatial && has(&["周边", "附近", "距离"]) {
            is_spatial = true;
        }
    }

    Intent {
        intent_type: if is_summary {
            IntentType::Summary
        } else {
            IntentType::Query
        },
        is_spatial,
        confidence,
        match_mode: detect_match_mode(query),
        keywords: matched_keywords(query),
        description: description.join(" - "),
        source: IntentSource::Keyword,
        is_clear: true,
    }
}
