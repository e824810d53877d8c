//! 工作流控制器
//!
//! 从入口步骤开始，按转移表逐步调用处理器并合并返回的 delta，直到终态。
//! 每次转移前检查取消令牌、墙钟预算与转移次数上限；处理器调用本身也受剩余墙钟时间约束。
//! 首轮执行成功后写一次缓存；运行结束时保存终态检查点并按保留数清理。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::QueryCache;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::core::{
    AgentState, EngineError, ErrorClassifier, ErrorStats, FallbackStrategy, RecoveryPolicy,
    RunStatus, StateDelta, ThoughtStatus, ThoughtStep,
};
use crate::db::{SchemaProvider, SqlExecutor};
use crate::llm::LlmClient;
use crate::steps::{run_step, StepContext};
use crate::workflow::builder::QueryEngineBuilder;
use crate::workflow::graph::next_step;
use crate::workflow::types::{EngineEvent, EngineSettings, Next, QueryRequest, QueryResult, StepName};

/// 查询引擎：持有协作方与跨运行共享的缓存 / 检查点存储
pub struct QueryEngine {
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) executor: Arc<dyn SqlExecutor>,
    pub(crate) schema: Arc<dyn SchemaProvider>,
    pub(crate) cache: Option<Arc<QueryCache>>,
    pub(crate) checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub(crate) settings: EngineSettings,
    pub(crate) classifier: ErrorClassifier,
    pub(crate) policy: RecoveryPolicy,
    pub(crate) stats: Mutex<ErrorStats>,
    pub(crate) event_tx: Option<UnboundedSender<EngineEvent>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueryEngine {
    pub fn builder() -> QueryEngineBuilder {
        QueryEngineBuilder::new()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_deref()
    }

    pub fn checkpoints(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.checkpoints.as_ref()
    }

    /// 跨运行的错误统计快照
    pub fn error_stats(&self) -> ErrorStats {
        lock(&self.stats).clone()
    }

    pub async fn run(&self, request: QueryRequest) -> Result<QueryResult, EngineError> {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// 外部可通过 `cancel` 中止运行；中止后仍返回带错误状态的结果
    pub async fn run_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryResult, EngineError> {
        let started = Instant::now();
        let state = self.initial_state(request).await?;
        let state = self.run_state(state, cancel).await;
        Ok(QueryResult::from_state(&state, started.elapsed()))
    }

    async fn initial_state(&self, request: QueryRequest) -> Result<AgentState, EngineError> {
        let QueryRequest {
            query,
            conversation_id,
            match_mode,
            resume_from,
        } = request;

        if let Some(checkpoint_id) = resume_from {
            let store = self
                .checkpoints
                .as_ref()
                .ok_or_else(|| EngineError::Config("checkpoint store not configured".to_string()))?;
            let checkpoint = store.load(&checkpoint_id).await?;
            if let Some(conv) = conversation_id.as_deref() {
                if conv != checkpoint.conversation_id {
                    return Err(EngineError::Config(format!(
                        "checkpoint {checkpoint_id} belongs to conversation {}",
                        checkpoint.conversation_id
                    )));
                }
            }
            info!(checkpoint_id = %checkpoint_id, "resuming from checkpoint");
            let state = checkpoint
                .resume(query)
                .with_budgets(self.settings.max_iterations, self.settings.max_retries)
                .with_match_mode(match_mode);
            return Ok(state);
        }

        let conversation_id = conversation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(AgentState::new(query, conversation_id)
            .with_budgets(self.settings.max_iterations, self.settings.max_retries)
            .with_match_mode(match_mode))
    }

    /// 驱动一个已构造的状态直到终态
    pub async fn run_state(&self, state: AgentState, cancel: CancellationToken) -> AgentState {
        let span = info_span!(
            "query_run",
            conversation_id = %state.conversation_id,
            resumed = state.is_resumed
        );
        self.drive(state, cancel).instrument(span).await
    }

    async fn drive(&self, mut state: AgentState, cancel: CancellationToken) -> AgentState {
        let started = Instant::now();
        let conversation_id = state.conversation_id.clone();
        let ctx = StepContext {
            llm: self.llm.as_ref(),
            executor: self.executor.as_ref(),
            schema: self.schema.as_ref(),
            cache: self.cache.as_deref(),
            settings: &self.settings,
            classifier: &self.classifier,
            policy: &self.policy,
            cancel: &cancel,
        };

        let mut step = StepName::ENTRY;
        let mut transitions = 0usize;
        let mut awaiting_recovery = false;
        info!(query = %state.query, "run started");

        loop {
            transitions += 1;
            if let Err(e) = self.check_budgets(started, transitions, &cancel) {
                abort(&mut state, step, e);
                break;
            }

            self.send_event(EngineEvent::StepStarted {
                conversation_id: conversation_id.clone(),
                step,
                transition: transitions,
            });
            let step_started = Instant::now();
            let remaining = self.settings.wall_clock.saturating_sub(started.elapsed());

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                res = tokio::time::timeout(remaining, run_step(step, &ctx, &state)) => match res {
                    Ok(r) => r,
                    Err(_) => Err(self.wall_clock_error(started)),
                },
            };
            let delta = match outcome {
                Ok(delta) => delta,
                Err(e) => {
                    abort(&mut state, step, e);
                    break;
                }
            };

            if let Some(record) = &delta.error_record {
                let mut stats = lock(&self.stats);
                stats.record(record.classified_type);
                if record.strategy == FallbackStrategy::Fail && awaiting_recovery {
                    stats.record_recovery(false);
                }
                awaiting_recovery = record.strategy != FallbackStrategy::Fail;
            }

            let step_before = state.current_step;
            let backoff = state.apply(delta);
            let elapsed_ms = step_started.elapsed().as_millis() as u64;
            debug!(step = %step, elapsed_ms, current_step = state.current_step, "step finished");
            self.send_event(EngineEvent::StepFinished {
                conversation_id: conversation_id.clone(),
                step,
                elapsed_ms,
            });

            if step == StepName::ExecuteSql {
                let succeeded = state.execution_results.last().is_some_and(|r| r.is_success());
                if succeeded && awaiting_recovery {
                    lock(&self.stats).record_recovery(true);
                    awaiting_recovery = false;
                }
                if step_before == 0 && state.current_step == 1 {
                    self.write_cache(&mut state).await;
                }
            }

            if let Some(delay) = backoff {
                if let Err(e) = self.backoff(&conversation_id, delay, started, &cancel).await {
                    abort(&mut state, step, e);
                    break;
                }
            }

            match next_step(step, &state) {
                Next::Step(to) => step = to,
                Next::End => break,
            }
        }

        if awaiting_recovery {
            lock(&self.stats).record_recovery(false);
        }
        if let Err(msg) = state.check_invariants() {
            warn!(%msg, "state invariant violated");
        }

        self.save_checkpoint(&mut state).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        // 客户端跨运行累计
        let total_tokens = self.llm.token_usage().map(|u| u.total());
        info!(
            status = ?state.status,
            steps = state.current_step,
            retries = state.retry_count,
            transitions,
            elapsed_ms,
            total_tokens,
            "run finished"
        );
        self.send_event(EngineEvent::Finished {
            conversation_id,
            status: state.status,
            elapsed_ms,
        });
        state
    }

    fn check_budgets(
        &self,
        started: Instant,
        transitions: usize,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if started.elapsed() >= self.settings.wall_clock {
            return Err(self.wall_clock_error(started));
        }
        if transitions > self.settings.max_transitions {
            return Err(EngineError::StepLimitExceeded(self.settings.max_transitions));
        }
        Ok(())
    }

    fn wall_clock_error(&self, started: Instant) -> EngineError {
        EngineError::WallClockExceeded {
            elapsed_ms: started.elapsed().as_millis() as u64,
            budget_ms: self.settings.wall_clock.as_millis() as u64,
        }
    }

    /// 可取消的退避等待，不超过剩余墙钟时间
    async fn backoff(
        &self,
        conversation_id: &str,
        delay: Duration,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let remaining = self.settings.wall_clock.saturating_sub(started.elapsed());
        let delay = delay.min(remaining);
        info!(delay_ms = delay.as_millis() as u64, "backing off before retry");
        self.send_event(EngineEvent::Backoff {
            conversation_id: conversation_id.to_string(),
            delay_ms: delay.as_millis() as u64,
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// 每次运行最多写一次：首轮执行成功、非缓存结果且有数据
    async fn write_cache(&self, state: &mut AgentState) {
        let Some(cache) = self.cache.as_deref() else {
            return;
        };
        if state.cache_written {
            return;
        }
        let (Some(sql), Some(result)) = (state.sql_history.last(), state.execution_results.last()) else {
            return;
        };
        if !result.is_success() || result.from_cache || result.row_count == 0 {
            return;
        }

        match cache
            .put(&state.query, &state.intent, sql, result, &state.final_data)
            .await
        {
            Ok(key) => {
                debug!(%key, "result cached");
                state.apply(StateDelta {
                    cache_written: Some(true),
                    ..StateDelta::default()
                });
            }
            Err(e) => warn!(error = %e, "cache write failed"),
        }
    }

    /// 保存终态快照并清理旧检查点；在 run 返回前完成
    async fn save_checkpoint(&self, state: &mut AgentState) {
        let Some(store) = self.checkpoints.as_ref() else {
            return;
        };
        let checkpoint = Checkpoint::capture(state);
        let id = checkpoint.id.clone();
        match store.save(&checkpoint).await {
            Ok(()) => {
                state.checkpoint_id = Some(id.clone());
                debug!(checkpoint_id = %id, "checkpoint saved");
                match store
                    .prune(&state.conversation_id, self.settings.keep_checkpoints)
                    .await
                {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "old checkpoints pruned"),
                    Err(e) => warn!(error = %e, "checkpoint prune failed"),
                }
            }
            Err(e) => warn!(error = %e, checkpoint_id = %id, "checkpoint save failed"),
        }
    }

    fn send_event(&self, ev: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

/// 以终态错误结束运行
fn abort(state: &mut AgentState, step: StepName, err: EngineError) {
    let message = err.to_string();
    warn!(step = %step, error = %message, "run aborted");
    state.apply(
        StateDelta {
            status: Some(RunStatus::Error),
            answer: Some(format!("抱歉，查询未能完成：{message}")),
            message: Some(message.clone()),
            ..StateDelta::default()
        }
        .fail_with(message.clone())
        .thought(
            ThoughtStep::new("abort", "中止运行", ThoughtStatus::Failed)
                .with_input(step.to_string())
                .with_output(message),
        ),
    );
}
