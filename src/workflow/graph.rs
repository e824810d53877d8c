//! 转移表
//!
//! 纯函数：只根据来源步骤与状态字段决定下一步，不做任何 I/O。

use crate::core::{AgentState, FallbackStrategy};
use crate::workflow::types::{Next, StepName};

pub fn next_step(from: StepName, state: &AgentState) -> Next {
    // 控制器中止后状态已是终态
    if state.is_finalized() {
        return Next::End;
    }

    let to = match from {
        StepName::FetchSchema => StepName::AnalyzeIntent,
        StepName::AnalyzeIntent => StepName::EnhanceQuery,
        StepName::EnhanceQuery => StepName::GenerateSql,
        StepName::GenerateSql => StepName::ExecuteSql,
        StepName::ExecuteSql => {
            if state.last_error.is_some()
                && !state.refinement_exhausted
                && state.retry_budget_left()
                && state.fallback_strategy != FallbackStrategy::Fail
            {
                StepName::HandleError
            } else {
                StepName::CheckResults
            }
        }
        StepName::HandleError => {
            if state.fallback_strategy == FallbackStrategy::Fail {
                StepName::CheckResults
            } else {
                StepName::GenerateSql
            }
        }
        StepName::CheckResults => {
            if state.should_continue && state.current_step < state.max_iterations {
                StepName::GenerateSql
            } else {
                StepName::ValidateResults
            }
        }
        StepName::ValidateResults => {
            if state.validation_feedback.is_some()
                && state.should_continue
                && !state.refinement_exhausted
            {
                StepName::GenerateSql
            } else {
                StepName::GenerateAnswer
            }
        }
        StepName::GenerateAnswer => return Next::End,
    };
    Next::Step(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunStatus, ValidationFeedback};

    fn state() -> AgentState {
        AgentState::new("q", "c")
    }

    #[test]
    fn test_linear_prefix() {
        let s = state();
        assert_eq!(next_step(StepName::FetchSchema, &s), Next::Step(StepName::AnalyzeIntent));
        assert_eq!(next_step(StepName::AnalyzeIntent, &s), Next::Step(StepName::EnhanceQuery));
        assert_eq!(next_step(StepName::EnhanceQuery, &s), Next::Step(StepName::GenerateSql));
        assert_eq!(next_step(StepName::GenerateSql, &s), Next::Step(StepName::ExecuteSql));
        assert_eq!(next_step(StepName::GenerateAnswer, &s), Next::End);
    }

    #[test]
    fn test_execute_routes_errors_while_budget_left() {
        let mut s = state();
        assert_eq!(next_step(StepName::ExecuteSql, &s), Next::Step(StepName::CheckResults));

        s.last_error = Some("syntax error".into());
        assert_eq!(next_step(StepName::ExecuteSql, &s), Next::Step(StepName::HandleError));

        s.retry_count = s.max_retries;
        assert_eq!(next_step(StepName::ExecuteSql, &s), Next::Step(StepName::CheckResults));
    }

    #[test]
    fn test_duplicate_sql_skips_error_handling() {
        let mut s = state();
        s.last_error = Some("syntax error".into());
        s.refinement_exhausted = true;
        assert_eq!(next_step(StepName::ExecuteSql, &s), Next::Step(StepName::CheckResults));
    }

    #[test]
    fn test_handle_error_fail_carries_to_check() {
        let mut s = state();
        s.fallback_strategy = FallbackStrategy::RetrySql;
        assert_eq!(next_step(StepName::HandleError, &s), Next::Step(StepName::GenerateSql));
        s.fallback_strategy = FallbackStrategy::Fail;
        assert_eq!(next_step(StepName::HandleError, &s), Next::Step(StepName::CheckResults));
    }

    #[test]
    fn test_check_results_respects_iteration_cap() {
        let mut s = state();
        s.should_continue = true;
        s.current_step = 1;
        assert_eq!(next_step(StepName::CheckResults, &s), Next::Step(StepName::GenerateSql));
        s.current_step = s.max_iterations;
        assert_eq!(next_step(StepName::CheckResults, &s), Next::Step(StepName::ValidateResults));
        s.current_step = 1;
        s.should_continue = false;
        assert_eq!(next_step(StepName::CheckResults, &s), Next::Step(StepName::ValidateResults));
    }

    #[test]
    fn test_validation_feedback_loops_once() {
        let mut s = state();
        s.should_continue = false;
        assert_eq!(next_step(StepName::ValidateResults, &s), Next::Step(StepName::GenerateAnswer));

        s.validation_feedback = Some(ValidationFeedback {
            message: "缺少字段".into(),
            issues: vec![],
            suggestions: vec![],
            confidence: 0.7,
        });
        s.should_continue = true;
        assert_eq!(next_step(StepName::ValidateResults, &s), Next::Step(StepName::GenerateSql));
    }

    #[test]
    fn test_finalized_state_ends() {
        let mut s = state();
        s.status = RunStatus::Error;
        assert_eq!(next_step(StepName::GenerateSql, &s), Next::End);
    }
}
