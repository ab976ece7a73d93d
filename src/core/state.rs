// src/core/state.rs - Observed game state, actions, and loop metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured screen frame. Pixel data stays with the perception engine;
/// the core only carries metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
}

/// A detected object in a frame, normalized coordinates (0..1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionKind {
    Tap { x: f32, y: f32 },
    Swipe { from: (f32, f32), to: (f32, f32), duration_ms: u64 },
    KeyPress(String),
    Wait(u64),
    NoOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub kind: ActionKind,
    pub confidence: f32,
}

impl AgentAction {
    /// Safe substitute when the decision engine fails or the model is in a
    /// training session: does nothing and never clears a confidence gate.
    pub fn noop() -> Self {
        Self {
            kind: ActionKind::NoOp,
            confidence: 0.0,
        }
    }
}

const THREAT_LABELS: &[&str] = &["enemy", "hazard", "projectile", "trap"];
const OPPORTUNITY_LABELS: &[&str] = &["bonus", "pickup", "powerup", "opening"];

/// In-memory summary of observed conditions, rebuilt once per loop iteration
/// and published whole. Readers always see a complete snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub threat_level: f32,
    pub opportunity_level: f32,
    pub player_position: Option<(f32, f32)>,
    pub enemy_count: u32,
    pub object_count: u32,
    pub score: i64,
    pub last_frame_id: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl GameState {
    /// Pure fold of one frame's detections into the previous state. Threat
    /// and opportunity decay each frame and are pushed back up by fresh
    /// detections, so a single noisy frame neither spikes nor erases them.
    pub fn fold(prev: &GameState, detections: &[Detection], frame: &Frame) -> GameState {
        let mut enemy_count = 0u32;
        let mut threat_signal = 0.0f32;
        let mut opportunity_count = 0u32;
        let mut opportunity_signal = 0.0f32;
        let mut player_position = prev.player_position;

        for det in detections {
            if THREAT_LABELS.contains(&det.label.as_str()) {
                enemy_count += 1;
                threat_signal += det.confidence;
            } else if OPPORTUNITY_LABELS.contains(&det.label.as_str()) {
                opportunity_count += 1;
                opportunity_signal += det.confidence;
            } else if det.label == "player" {
                player_position = Some(det.center());
            }
        }

        GameState {
            threat_level: (prev.threat_level * 0.6).max((threat_signal / 2.0).min(1.0)),
            opportunity_level: (prev.opportunity_level * 0.6)
                .max((opportunity_signal / 2.0).min(1.0)),
            player_position,
            enemy_count,
            object_count: detections.len() as u32,
            score: prev.score + i64::from(opportunity_count),
            last_frame_id: frame.id,
            updated_at: Some(frame.captured_at),
        }
    }
}

/// Loop cadence and gating, read from the config store at startup and
/// mutable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub interval_ms: u64,
    pub confidence_threshold: f32,
    pub learning_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            confidence_threshold: 0.7,
            learning_enabled: true,
        }
    }
}

/// Loop counters shared between the orchestrator task and diagnostics
/// readers. Atomics, so reading never contends with the loop.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub frames_processed: Arc<AtomicU64>,
    pub actions_executed: Arc<AtomicU64>,
    pub errors: Arc<AtomicU64>,
    started_at: Arc<Mutex<Instant>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_processed: Arc::new(AtomicU64::new(0)),
            actions_executed: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            started_at: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Rewinds everything to a fresh epoch. The loop calls this on start so
    /// elapsed time and fps describe the current run, not construction-to-now.
    pub fn reset(&self) {
        self.frames_processed.store(0, Ordering::Relaxed);
        self.actions_executed.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self
            .started_at
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            frames as f64 / secs
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed_ms: self.elapsed().as_millis() as u64,
            fps: self.fps(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain-data view of the counters for UI/diagnostic consumers.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub frames_processed: u64,
    pub actions_executed: u64,
    pub errors: u64,
    pub elapsed_ms: u64,
    pub fps: f64,
}
