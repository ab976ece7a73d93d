pub mod core;

pub use crate::core::engines::{Actuator, DecisionEngine, PerceptionEngine};
pub use crate::core::events::{Event, EventChannel, EventKind, EventPayload, SubscriptionId};
pub use crate::core::locks::{AccessMode, ModelLock};
pub use crate::core::pipeline::Pipeline;
pub use crate::core::state::{
    ActionKind, AgentAction, Detection, Frame, GameState, MetricsSnapshot, PipelineConfig,
    PipelineMetrics,
};
pub use crate::core::store::{ConfigStore, ConfigValue, Transaction};
