use gambit::core::engines::{Actuator, DecisionEngine, PerceptionEngine};
use gambit::core::events::{EventChannel, EventKind, EventPayload};
use gambit::core::locks::ModelLock;
use gambit::core::pipeline::Pipeline;
use gambit::core::state::{ActionKind, AgentAction, Detection, Frame, GameState};
use gambit::core::store::ConfigStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use colored::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Synthetic perception for dry runs: emits one frame per tick with a small
/// rotating cast of detections, no screen access required.
struct DemoPerception {
    counter: AtomicU64,
}

#[async_trait]
impl PerceptionEngine for DemoPerception {
    async fn capture_frame(&self) -> Option<Frame> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Some(Frame {
            id,
            captured_at: Utc::now(),
            width: 1920,
            height: 1080,
        })
    }

    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut detections = vec![Detection {
            label: "player".to_string(),
            confidence: 0.99,
            x: 0.45,
            y: 0.7,
            width: 0.1,
            height: 0.1,
        }];
        if frame.id % 5 == 0 {
            detections.push(Detection {
                label: "enemy".to_string(),
                confidence: 0.9,
                x: 0.5,
                y: 0.2,
                width: 0.1,
                height: 0.1,
            });
        }
        if frame.id % 3 == 0 {
            detections.push(Detection {
                label: "pickup".to_string(),
                confidence: 0.85,
                x: 0.2,
                y: 0.5,
                width: 0.05,
                height: 0.05,
            });
        }
        Ok(detections)
    }
}

/// Rule-of-thumb decisions: tap threats, drift toward pickups, otherwise
/// wait. Confidence follows the strongest signal in the snapshot.
struct DemoDecision;

#[async_trait]
impl DecisionEngine for DemoDecision {
    async fn decide(&self, state: &GameState) -> Result<AgentAction> {
        let action = if state.threat_level > 0.5 {
            AgentAction {
                kind: ActionKind::Tap { x: 0.5, y: 0.2 },
                confidence: state.threat_level,
            }
        } else if state.opportunity_level > 0.5 {
            AgentAction {
                kind: ActionKind::Swipe {
                    from: state.player_position.unwrap_or((0.5, 0.7)),
                    to: (0.2, 0.5),
                    duration_ms: 150,
                },
                confidence: state.opportunity_level,
            }
        } else {
            AgentAction {
                kind: ActionKind::Wait(50),
                confidence: 0.3,
            }
        };
        Ok(action)
    }

    async fn update_from_feedback(&self, _state: &GameState, _action: &AgentAction, _reward: f32) {}
}

struct DemoActuator;

#[async_trait]
impl Actuator for DemoActuator {
    async fn execute(&self, action: &AgentAction) -> Result<bool> {
        println!(
            "   {} dispatching {:?} (confidence {:.2})",
            "🎮".cyan(),
            action.kind,
            action.confidence
        );
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("{}", "🕹  Gambit Automation Core".green().bold());

    let data_dir = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("gambit");
    let store = ConfigStore::open(&data_dir.join("config.json"))?;
    let channel = EventChannel::new();
    let model_lock = Arc::new(ModelLock::new());

    channel.subscribe(EventKind::ActionExecuted, |ev| {
        if let EventPayload::ActionExecuted { success, .. } = &ev.payload {
            if !success {
                eprintln!("{} action dispatch reported failure", "⚠️".yellow());
            }
        }
    });
    channel.subscribe(EventKind::StateChanged, |ev| {
        if let EventPayload::StateChanged { snapshot } = &ev.payload {
            println!(
                "   {} threat {:.2} / opportunity {:.2} / score {}",
                "👁".blue(),
                snapshot.threat_level,
                snapshot.opportunity_level,
                snapshot.score
            );
        }
    });

    let pipeline = Pipeline::new(
        Arc::new(DemoPerception {
            counter: AtomicU64::new(0),
        }),
        Arc::new(DemoDecision),
        Arc::new(DemoActuator),
        channel.clone(),
        model_lock,
        store.clone(),
    );

    pipeline.start()?;
    println!("{}", "Running. Ctrl-C to stop.".dimmed());
    tokio::signal::ctrl_c().await?;

    pipeline.stop().await;
    let metrics = pipeline.get_metrics();
    println!(
        "{} {} frames, {} actions, {} errors, {:.1} fps",
        "📊".green(),
        metrics.frames_processed,
        metrics.actions_executed,
        metrics.errors,
        metrics.fps
    );

    channel.clear();
    store.shutdown();
    Ok(())
}
