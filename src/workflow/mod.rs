//! 工作流：步骤名与转移表、控制器、构建器

pub mod builder;
pub mod engine;
pub mod graph;
pub mod types;

pub use builder::QueryEngineBuilder;
pub use engine::QueryEngine;
pub use graph::next_step;
pub use types::*;
