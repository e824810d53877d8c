//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SIGHT__*` 覆盖（双下划线表示嵌套，如 `SIGHT__ENGINE__MAX_ITERATIONS=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheSettings;
use crate::workflow::EngineSettings;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub engine: EngineSection,
    pub cache: CacheSection,
    pub checkpoint: CheckpointSection,
    pub database: DatabaseSection,
    pub observability: ObservabilitySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择；调用超时见 engine.llm_timeout_secs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 DEEPSEEK_API_KEY / OPENAI_API_KEY
    pub api_key: Option<String>,
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.0,
        }
    }
}

/// [embedding] 段：语义缓存的向量模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    /// hashing（本地 jieba 哈希向量）/ openai / none
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// hashing 向量维度
    pub dim: usize,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: None,
            api_key: None,
            dim: crate::cache::embedder::DEFAULT_DIM,
        }
    }
}

/// [engine] 段：迭代、重试与时间预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_iterations: u32,
    pub max_retries: u32,
    pub wall_clock_secs: u64,
    pub max_transitions: usize,
    pub llm_timeout_secs: u64,
    pub sql_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub simplify_limit: u32,
    /// 完整性达到此值即停止迭代
    pub completeness_stop: f64,
    /// 首轮完整性低于此值视为源数据缺失
    pub completeness_floor: f64,
    pub required_fields: Vec<String>,
    pub merge_key: String,
    pub enable_validation: bool,
    pub max_validation_retries: u32,
    pub validation_sample_size: usize,
    pub answer_sample_size: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        let s = EngineSettings::default();
        Self {
            max_iterations: s.max_iterations,
            max_retries: s.max_retries,
            wall_clock_secs: s.wall_clock.as_secs(),
            max_transitions: s.max_transitions,
            llm_timeout_secs: s.llm_timeout.as_secs(),
            sql_timeout_secs: s.sql_timeout.as_secs(),
            backoff_base_ms: s.backoff_base.as_millis() as u64,
            backoff_cap_ms: s.backoff_cap.as_millis() as u64,
            simplify_limit: s.simplify_limit,
            completeness_stop: s.completeness_stop,
            completeness_floor: s.completeness_floor,
            required_fields: s.required_fields,
            merge_key: s.merge_key,
            enable_validation: s.enable_validation,
            max_validation_retries: s.max_validation_retries,
            validation_sample_size: s.validation_sample_size,
            answer_sample_size: s.answer_sample_size,
        }
    }
}

impl From<&EngineSection> for EngineSettings {
    fn from(e: &EngineSection) -> Self {
        Self {
            max_iterations: e.max_iterations,
            max_retries: e.max_retries,
            wall_clock: Duration::from_secs(e.wall_clock_secs),
            max_transitions: e.max_transitions,
            llm_timeout: Duration::from_secs(e.llm_timeout_secs),
            sql_timeout: Duration::from_secs(e.sql_timeout_secs),
            backoff_base: Duration::from_millis(e.backoff_base_ms),
            backoff_cap: Duration::from_millis(e.backoff_cap_ms),
            simplify_limit: e.simplify_limit,
            completeness_stop: e.completeness_stop,
            completeness_floor: e.completeness_floor,
            required_fields: e.required_fields.clone(),
            merge_key: e.merge_key.clone(),
            enable_validation: e.enable_validation,
            max_validation_retries: e.max_validation_retries,
            validation_sample_size: e.validation_sample_size,
            answer_sample_size: e.answer_sample_size,
            ..EngineSettings::default()
        }
    }
}

/// [cache] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    /// SQLite 文件；未设置时只在内存中缓存
    pub path: Option<PathBuf>,
    pub ttl_secs: u64,
    pub max_size: usize,
    pub semantic_enabled: bool,
    pub semantic_threshold: f32,
}

impl Default for CacheSection {
    fn default() -> Self {
        let s = CacheSettings::default();
        Self {
            enabled: true,
            path: Some(PathBuf::from("data/query_cache.db")),
            ttl_secs: s.ttl_secs,
            max_size: s.max_size,
            semantic_enabled: s.semantic_enabled,
            semantic_threshold: s.semantic_threshold,
        }
    }
}

impl From<&CacheSection> for CacheSettings {
    fn from(c: &CacheSection) -> Self {
        Self {
            ttl_secs: c.ttl_secs,
            max_size: c.max_size,
            semantic_enabled: c.semantic_enabled,
            semantic_threshold: c.semantic_threshold,
        }
    }
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub enabled: bool,
    pub dir: PathBuf,
    /// 每个会话保留的检查点数
    pub keep_latest: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/checkpoints"),
            keep_latest: 10,
        }
    }
}

/// [database] 段；语句超时见 engine.sql_timeout_secs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// 未设置时读取 DATABASE_URL
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            acquire_timeout_secs: 10,
        }
    }
}

impl DatabaseSection {
    pub fn resolved_url(&self) -> Option<String> {
        self.url
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

/// [observability] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    /// EnvFilter 指令，RUST_LOG 存在时优先
    pub log_filter: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// 引擎参数：[engine] 加上 [checkpoint] 的保留数
    pub fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::from(&self.engine);
        settings.keep_checkpoints = self.checkpoint.keep_latest;
        settings
    }
}

/// 默认配置文件：依次尝试工作目录与上一级目录
fn default_config_file() -> Option<PathBuf> {
    ["config/default.toml", "../config/default.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// 加载配置：默认文件 → `--config` 指定的文件 → 环境变量 `SIGHT__*`，后者覆盖前者
///
/// 显式指定的文件不存在时报错；默认文件缺失时全部取代码内默认值。
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = default_config_file() {
        builder = builder.add_source(config::File::from(path));
    }
    if let Some(path) = config_path {
        if !path.is_file() {
            return Err(config::ConfigError::NotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path));
    }

    builder
        .add_source(
            config::Environment::with_prefix("SIGHT")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.required_fields")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_engine_settings() {
        let cfg = AppConfig::default();
        let settings = cfg.engine_settings();
        assert_eq!(settings.max_iterations, 3);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.wall_clock, Duration::from_secs(450));
        assert_eq!(settings.backoff_cap, Duration::from_millis(8000));
        assert_eq!(settings.keep_checkpoints, 10);
        assert!((CacheSettings::from(&cfg.cache).semantic_threshold - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = load_config(Some(PathBuf::from("/nonexistent/sight.toml"))).unwrap_err();
        assert!(err.to_string().contains("sight.toml"));
    }

    #[test]
    fn test_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nmax_iterations = 5\ncompleteness_stop = 0.8\n\n[checkpoint]\nkeep_latest = 3"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.max_iterations, 5);
        assert_eq!(cfg.engine.max_retries, 5);
        assert_eq!(cfg.engine_settings().keep_checkpoints, 3);
        assert!((cfg.engine.completeness_stop - 0.8).abs() < 1e-9);
    }
}
