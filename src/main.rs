//! Sight - 景区空间问答引擎
//!
//! 加载配置、初始化日志、按配置构建引擎，执行一次查询并以 JSON 输出结果。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use sight::cache::{CacheSettings, HashingEmbedder, QueryCache};
use sight::checkpoint::FileCheckpointStore;
use sight::config::{load_config, AppConfig};
use sight::core::MatchMode;
use sight::db::{SchemaProvider, SqlExecutor};
use sight::llm::{create_embedder_from_config, create_llm_from_config, EmbeddingProvider};
use sight::{observability, QueryEngine, QueryRequest};

/// 景区空间问答：自然语言问题 → SQL → 结果与回答（JSON 输出）
#[derive(Parser)]
#[command(name = "sight", version, about)]
struct Cli {
    /// 配置文件路径（默认 config/default.toml）
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// 会话 id，检查点按会话归档
    #[arg(long, value_name = "ID")]
    conversation: Option<String>,

    /// 从检查点恢复旧会话
    #[arg(long, value_name = "CHECKPOINT")]
    resume: Option<String>,

    /// 文本条件精确匹配（=）而非模糊匹配（ILIKE）
    #[arg(long)]
    exact: bool,

    /// 查询问题，多个参数以空格拼接
    #[arg(required = true, value_name = "QUERY")]
    query: Vec<String>,
}

impl Cli {
    fn query_text(&self) -> String {
        self.query.join(" ").trim().to_string()
    }
}

#[cfg(feature = "postgres")]
async fn database(cfg: &AppConfig) -> anyhow::Result<(Arc<dyn SqlExecutor>, Arc<dyn SchemaProvider>)> {
    use sight::db::{connect_pool, PgExecutor, PgSchemaProvider};

    let Some(url) = cfg.database.resolved_url() else {
        tracing::warn!("no database url configured, running dry");
        return Ok(dry_run());
    };
    let pool = connect_pool(
        &url,
        cfg.database.max_connections,
        std::time::Duration::from_secs(cfg.database.acquire_timeout_secs),
    )
    .await
    .context("Failed to connect to database")?;
    let executor: Arc<dyn SqlExecutor> = Arc::new(PgExecutor::new(pool.clone()));
    let schema: Arc<dyn SchemaProvider> = Arc::new(PgSchemaProvider::new(pool));
    Ok((executor, schema))
}

#[cfg(not(feature = "postgres"))]
async fn database(_cfg: &AppConfig) -> anyhow::Result<(Arc<dyn SqlExecutor>, Arc<dyn SchemaProvider>)> {
    tracing::warn!("built without the postgres feature, running dry");
    Ok(dry_run())
}

fn dry_run() -> (Arc<dyn SqlExecutor>, Arc<dyn SchemaProvider>) {
    use sight::db::{DryRunExecutor, StaticSchemaProvider, SIGHT_SCHEMA};
    let executor: Arc<dyn SqlExecutor> = Arc::new(DryRunExecutor);
    let schema: Arc<dyn SchemaProvider> = Arc::new(StaticSchemaProvider::new(SIGHT_SCHEMA));
    (executor, schema)
}

fn embedder(cfg: &AppConfig) -> Option<Arc<dyn EmbeddingProvider>> {
    let e = &cfg.embedding;
    match e.provider.as_str() {
        "hashing" => Some(Arc::new(HashingEmbedder::new(e.dim))),
        "openai" => create_embedder_from_config(e.base_url.as_deref(), &e.model, e.api_key.as_deref()),
        _ => None,
    }
}

async fn build_engine(cfg: &AppConfig) -> anyhow::Result<QueryEngine> {
    let (executor, schema) = database(cfg).await?;
    let mut builder = QueryEngine::builder()
        .llm(create_llm_from_config(&cfg.llm))
        .executor(executor)
        .schema_provider(schema)
        .settings(cfg.engine_settings());

    if cfg.cache.enabled {
        let settings = CacheSettings::from(&cfg.cache);
        let cache = match &cfg.cache.path {
            Some(path) => QueryCache::open(path, settings)
                .await
                .with_context(|| format!("Failed to open cache at {}", path.display()))?,
            None => QueryCache::in_memory(settings),
        };
        builder = builder.cache(cache);
        if let Some(embedder) = embedder(cfg) {
            builder = builder.embedder(embedder);
        }
    }
    if cfg.checkpoint.enabled {
        builder = builder.checkpoints(Arc::new(FileCheckpointStore::new(&cfg.checkpoint.dir)));
    }

    builder.build().context("Failed to build query engine")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let query = cli.query_text();
    if query.is_empty() {
        bail!("query must not be blank");
    }
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    observability::init_with_filter(&cfg.observability.log_filter);

    let engine = build_engine(&cfg).await?;

    let mut request = QueryRequest::new(query);
    if let Some(id) = cli.conversation {
        request = request.conversation(id);
    }
    if let Some(id) = cli.resume {
        request = request.resume_from(id);
    }
    if cli.exact {
        request = request.match_mode(MatchMode::Exact);
    }

    let result = engine.run(request).await.context("Query failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_and_query_words() {
        let cli = Cli::try_parse_from([
            "sight", "--conversation", "conv-1", "--exact", "杭州的", "5A景区",
        ])
        .unwrap();
        assert_eq!(cli.conversation.as_deref(), Some("conv-1"));
        assert!(cli.exact);
        assert!(cli.resume.is_none());
        assert_eq!(cli.query_text(), "杭州的 5A景区");
    }

    #[test]
    fn test_query_is_required() {
        assert!(Cli::try_parse_from(["sight", "--exact"]).is_err());
    }
}
