// src/core/engines.rs - External collaborator contracts

use anyhow::Result;
use async_trait::async_trait;

use crate::core::state::{AgentAction, Detection, Frame, GameState};

/// Captures and analyzes frames of the target application's screen.
/// `capture_frame` returning None is a soft gap, not an error.
#[async_trait]
pub trait PerceptionEngine: Send + Sync {
    async fn capture_frame(&self) -> Option<Frame>;
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Chooses an action for a state snapshot and accepts online feedback.
/// Access to the underlying model is arbitrated through [`crate::core::locks::ModelLock`];
/// the core never touches the model itself.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(&self, state: &GameState) -> Result<AgentAction>;
    async fn update_from_feedback(&self, state: &GameState, action: &AgentAction, reward: f32);
}

/// Performs an action against the target application.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn execute(&self, action: &AgentAction) -> Result<bool>;
}
