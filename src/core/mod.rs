//! 核心层：错误与恢复策略、运行状态、按键互斥锁

pub mod error;
pub mod keyed_lock;
pub mod recovery;
pub mod state;

pub use error::{EngineError, ErrorType, FallbackStrategy};
pub use keyed_lock::KeyedLocks;
pub use recovery::{
    extract_location, ErrorAnalysis, ErrorClassifier, ErrorLocation, ErrorStats, RecoveryDecision,
    RecoveryPolicy,
};
pub use state::{
    AgentState, ErrorContext, ErrorRecord, ExecutionResult, ExecutionStatus, Intent, IntentSource,
    IntentType, MatchMode, Record, RunStatus, StateDelta, ThoughtStatus, ThoughtStep,
    ValidationFeedback,
};
