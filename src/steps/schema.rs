//! fetch-schema：每次运行最多获取一次；失败不致命

use tracing::{info, warn};

use super::StepContext;
use crate::core::{AgentState, EngineError, StateDelta, ThoughtStatus, ThoughtStep};

pub async fn fetch_schema(ctx: &StepContext<'_>, state: &AgentState) -> Result<StateDelta, EngineError> {
    if state.schema_fetched && state.schema.is_some() {
        return Ok(StateDelta::new().thought(
            ThoughtStep::new("schema", "复用会话中已获取的数据库Schema", ThoughtStatus::Skipped),
        ));
    }

    let fetched = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
        res = tokio::time::timeout(ctx.settings.sql_timeout, ctx.schema.fetch_schema()) => res,
    };

    let delta = StateDelta {
        schema_fetched: Some(true),
        ..StateDelta::default()
    };
    match fetched {
        Ok(Ok(schema)) => {
            info!(chars = schema.chars().count(), "database schema fetched");
            let thought = ThoughtStep::new("schema", "获取数据库Schema", ThoughtStatus::Completed)
                .with_output(format!("{} 字符", schema.chars().count()));
            Ok(StateDelta {
                schema: Some(Some(schema)),
                ..delta
            }
            .thought(thought))
        }
        Ok(Err(e)) => {
            warn!(error = %e, "schema fetch failed, continuing without schema");
            Ok(delta.thought(
                ThoughtStep::new("schema", "获取数据库Schema", ThoughtStatus::Failed)
                    .with_output(e.to_string()),
            ))
        }
        Err(_) => {
            warn!(timeout = ?ctx.settings.sql_timeout, "schema fetch timed out");
            Ok(delta.thought(
                ThoughtStep::new("schema", "获取数据库Schema", ThoughtStatus::Failed)
                    .with_output("timeout"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StaticSchemaProvider;
    use crate::steps::testing::Fixture;

    #[tokio::test]
    async fn test_schema_fetched_once() {
        let fx = Fixture::new();
        let mut state = AgentState::new("q", "c");
        state.apply(fetch_schema(&fx.ctx(), &state).await.unwrap());
        assert!(state.schema_fetched);
        assert!(state.schema.as_deref().unwrap_or("").contains("a_sight"));

        let delta = fetch_schema(&fx.ctx(), &state).await.unwrap();
        assert!(delta.schema.is_none());
        assert_eq!(delta.thoughts[0].status, ThoughtStatus::Skipped);
    }

    #[tokio::test]
    async fn test_schema_failure_is_not_fatal() {
        let mut fx = Fixture::new();
        fx.schema = StaticSchemaProvider::failing("connection refused");
        let state = AgentState::new("q", "c");
        let delta = fetch_schema(&fx.ctx(), &state).await.unwrap();
        assert_eq!(delta.schema_fetched, Some(true));
        assert!(delta.schema.is_none());
        assert_eq!(delta.thoughts[0].status, ThoughtStatus::Failed);
    }
}
