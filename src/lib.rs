//! Sight - 景区空间问答引擎
//!
//! 以 LLM 驱动「生成 SQL → 执行 → 检查 → 修复 → 迭代 → 回答」的状态机，查询 PostGIS 景区数据。
//!
//! 模块划分：
//! - **cache**: 查询结果缓存（精确键 + 语义相似度，SQLite 持久化）
//! - **checkpoint**: 运行终态快照与会话恢复
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 运行状态、错误分类与恢复策略
//! - **db**: SQL 执行与 Schema 协作方（PostgreSQL / 内存实现）
//! - **intent**: 查询意图分析（LLM + 关键词回退）
//! - **llm**: LLM 与嵌入客户端抽象及实现
//! - **prompts**: 各步骤的提示词
//! - **sql**: SQL 清洗、别名补全、结果解析与合并
//! - **steps**: 九个步骤处理器
//! - **workflow**: 转移表、控制器与构建器

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod db;
pub mod intent;
pub mod llm;
pub mod observability;
pub mod prompts;
pub mod sql;
pub mod steps;
pub mod workflow;

pub use workflow::{EngineEvent, EngineSettings, QueryEngine, QueryEngineBuilder, QueryRequest, QueryResult};
