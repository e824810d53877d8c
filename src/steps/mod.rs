//! 步骤处理器
//!
//! 每个处理器只读 [`AgentState`]，返回 [`StateDelta`]，由控制器合并。
//! 处理器内的阻塞调用只有 LLM 与 SQL 执行两类，均带超时并响应取消令牌；
//! 退避等待由控制器执行。`Err` 仅表示需要中止运行（取消）。

pub mod answer;
pub mod check;
pub mod execute;
pub mod generate;
pub mod intent;
pub mod recover;
pub mod schema;
pub mod validate;

use tokio_util::sync::CancellationToken;

use crate::cache::QueryCache;
use crate::core::{AgentState, EngineError, ErrorClassifier, RecoveryPolicy, StateDelta};
use crate::db::{SchemaProvider, SqlExecutor};
use crate::llm::{LlmClient, LlmError};
use crate::workflow::{EngineSettings, StepName};

/// 处理器可用的协作方与参数
pub struct StepContext<'a> {
    pub llm: &'a dyn LlmClient,
    pub executor: &'a dyn SqlExecutor,
    pub schema: &'a dyn SchemaProvider,
    pub cache: Option<&'a QueryCache>,
    pub settings: &'a EngineSettings,
    pub classifier: &'a ErrorClassifier,
    pub policy: &'a RecoveryPolicy,
    pub cancel: &'a CancellationToken,
}

/// 按步骤名分发
pub async fn run_step(
    step: StepName,
    ctx: &StepContext<'_>,
    state: &AgentState,
) -> Result<StateDelta, EngineError> {
    match step {
        StepName::FetchSchema => schema::fetch_schema(ctx, state).await,
        StepName::AnalyzeIntent => intent::analyze_intent(ctx, state).await,
        StepName::EnhanceQuery => Ok(intent::enhance_query(state)),
        StepName::GenerateSql => generate::generate_sql(ctx, state).await,
        StepName::ExecuteSql => execute::execute_sql(ctx, state).await,
        StepName::HandleError => Ok(recover::handle_error(ctx, state)),
        StepName::CheckResults => Ok(check::check_results(ctx.settings, ctx.classifier, state)),
        StepName::ValidateResults => validate::validate_results(ctx, state).await,
        StepName::GenerateAnswer => answer::generate_answer(ctx, state).await,
    }
}

/// LLM 取消需要中止运行，其余错误由各步骤自行降级
fn abort_if_cancelled(err: &LlmError) -> Result<(), EngineError> {
    match err {
        LlmError::Cancelled => Err(EngineError::Cancelled),
        _ => Ok(()),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_chars() {
        assert_eq!(preview("西湖景区", 2), "西湖…");
        assert_eq!(preview("abc", 5), "abc");
    }
}
