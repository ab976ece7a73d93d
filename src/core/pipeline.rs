// src/core/pipeline.rs - The perception→decision→actuation→feedback loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::*;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::core::engines::{Actuator, DecisionEngine, PerceptionEngine};
use crate::core::events::{Event, EventChannel, EventKind, EventPayload, SubscriptionId};
use crate::core::locks::ModelLock;
use crate::core::state::{
    ActionKind, AgentAction, GameState, MetricsSnapshot, PipelineConfig, PipelineMetrics,
};
use crate::core::store::ConfigStore;

pub const KEY_INTERVAL_MS: &str = "pipeline.interval_ms";
pub const KEY_CONFIDENCE_THRESHOLD: &str = "pipeline.confidence_threshold";
pub const KEY_LEARNING_ENABLED: &str = "pipeline.learning_enabled";

/// Name this component uses with the model lock.
const COMPONENT: &str = "pipeline";

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

/// Everything one loop iteration needs, clonable into the worker task.
#[derive(Clone)]
struct LoopCtx {
    perception: Arc<dyn PerceptionEngine>,
    decision: Arc<dyn DecisionEngine>,
    actuator: Arc<dyn Actuator>,
    channel: Arc<EventChannel>,
    model_lock: Arc<ModelLock>,
    config: Arc<RwLock<PipelineConfig>>,
    state: Arc<RwLock<GameState>>,
    metrics: PipelineMetrics,
    running: Arc<AtomicBool>,
}

/// Runs the automation loop on one background tokio task. Collaborators are
/// injected; the pipeline owns nothing but the loop, the published snapshot,
/// and its counters. A single bad iteration never terminates the loop, only
/// `stop()` does.
pub struct Pipeline {
    ctx: LoopCtx,
    store: ConfigStore,
    worker: Mutex<Option<JoinHandle<()>>>,
    session_id: String,
    _config_sub: SubscriptionId,
}

impl Pipeline {
    pub fn new(
        perception: Arc<dyn PerceptionEngine>,
        decision: Arc<dyn DecisionEngine>,
        actuator: Arc<dyn Actuator>,
        channel: Arc<EventChannel>,
        model_lock: Arc<ModelLock>,
        store: ConfigStore,
    ) -> Self {
        let defaults = PipelineConfig::default();
        let config = Arc::new(RwLock::new(PipelineConfig {
            interval_ms: store.get_int(KEY_INTERVAL_MS, defaults.interval_ms as i64) as u64,
            confidence_threshold: store
                .get_float(KEY_CONFIDENCE_THRESHOLD, defaults.confidence_threshold as f64)
                as f32,
            learning_enabled: store.get_bool(KEY_LEARNING_ENABLED, defaults.learning_enabled),
        }));

        // Reconfiguration arrives over the channel as well, so a UI can poke
        // the store and broadcast without holding a pipeline reference.
        let cfg = config.clone();
        let config_sub = channel.subscribe(EventKind::ConfigChanged, move |ev| {
            if let EventPayload::ConfigChanged {
                interval_ms,
                confidence_threshold,
                learning_enabled,
            } = &ev.payload
            {
                *write_lock(&cfg) = PipelineConfig {
                    interval_ms: *interval_ms,
                    confidence_threshold: *confidence_threshold,
                    learning_enabled: *learning_enabled,
                };
            }
        });

        Self {
            ctx: LoopCtx {
                perception,
                decision,
                actuator,
                channel,
                model_lock,
                config,
                state: Arc::new(RwLock::new(GameState::default())),
                metrics: PipelineMetrics::new(),
                running: Arc::new(AtomicBool::new(false)),
            },
            store,
            worker: Mutex::new(None),
            session_id: uuid::Uuid::new_v4().to_string(),
            _config_sub: config_sub,
        }
    }

    /// Spawns the loop. Rejected when already running; the caller is never
    /// blocked by the loop itself.
    pub fn start(&self) -> Result<()> {
        if self.ctx.running.swap(true, Ordering::SeqCst) {
            bail!("pipeline is already running");
        }
        self.ctx.metrics.reset();

        let interval = read_lock(&self.ctx.config).interval_ms;
        println!(
            "{} pipeline {} starting ({}ms cadence)",
            "🔁".green(),
            &self.session_id[..8],
            interval
        );
        self.ctx.channel.publish(&Event::new(
            COMPONENT,
            EventPayload::ServiceStatus {
                service: COMPONENT.to_string(),
                running: true,
            },
        ));

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(run_loop(ctx));
        *self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    /// Requests a stop and waits for the worker to observe it, which happens
    /// at the top of the next iteration (bounded by one interval).
    pub async fn stop(&self) {
        if !self.ctx.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.ctx.channel.publish(&Event::new(
            COMPONENT,
            EventPayload::ServiceStatus {
                service: COMPONENT.to_string(),
                running: false,
            },
        ));
        println!("{} pipeline {} stopped", "⏹".yellow(), &self.session_id[..8]);
    }

    /// Applies new loop settings immediately, persists them, and broadcasts a
    /// ConfigChanged event. Returns whether the persisted commit succeeded;
    /// the in-memory settings apply either way.
    pub fn update_configuration(
        &self,
        interval_ms: u64,
        confidence_threshold: f32,
        learning_enabled: bool,
    ) -> bool {
        let next = PipelineConfig {
            interval_ms: interval_ms.max(1),
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
            learning_enabled,
        };
        *write_lock(&self.ctx.config) = next;

        let mut txn = self.store.begin_transaction();
        txn.put_int(KEY_INTERVAL_MS, next.interval_ms as i64);
        txn.put_float(KEY_CONFIDENCE_THRESHOLD, next.confidence_threshold as f64);
        txn.put_bool(KEY_LEARNING_ENABLED, next.learning_enabled);
        let committed = txn.commit();

        self.ctx.channel.publish(&Event::new(
            COMPONENT,
            EventPayload::ConfigChanged {
                interval_ms: next.interval_ms,
                confidence_threshold: next.confidence_threshold,
                learning_enabled: next.learning_enabled,
            },
        ));
        committed
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub fn get_current_state(&self) -> GameState {
        read_lock(&self.ctx.state).clone()
    }

    pub fn configuration(&self) -> PipelineConfig {
        *read_lock(&self.ctx.config)
    }

    pub fn is_running(&self) -> bool {
        self.ctx.running.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

async fn run_loop(ctx: LoopCtx) {
    while ctx.running.load(Ordering::SeqCst) {
        let interval = Duration::from_millis(read_lock(&ctx.config).interval_ms);
        match run_iteration(&ctx).await {
            Ok(_) => sleep(interval).await,
            Err(e) => {
                PipelineMetrics::inc(&ctx.metrics.errors);
                eprintln!("{} iteration failed: {:#}", "⚠️".yellow(), e);
                // Back off so a persistently failing collaborator does not
                // spin the loop hot.
                sleep(interval * 2).await;
            }
        }
    }
}

/// One pass of capture → detect → fold → decide → act → feedback. Returns
/// Ok(false) for a capture gap (no frame this tick), which is not an error.
async fn run_iteration(ctx: &LoopCtx) -> Result<bool> {
    // 1. Capture. A missing frame is a processing gap, counted nowhere.
    let frame = match ctx.perception.capture_frame().await {
        Some(frame) => frame,
        None => return Ok(false),
    };

    // 2. Detect. Failures degrade to an empty detection set.
    let detections = match ctx.perception.detect(&frame).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{} detection failed on frame {}: {:#}", "⚠️".yellow(), frame.id, e);
            Vec::new()
        }
    };

    // 3. Fold into the shared snapshot, published whole.
    let prev = read_lock(&ctx.state).clone();
    let next = GameState::fold(&prev, &detections, &frame);
    *write_lock(&ctx.state) = next.clone();
    if materially_changed(&prev, &next) {
        ctx.channel.publish(&Event::new(
            COMPONENT,
            EventPayload::StateChanged {
                snapshot: next.clone(),
            },
        ));
    }

    // 4. Decide. While another component trains or writes the model, fail
    // fast to a no-op instead of blocking the loop; the wait for the read
    // lock is capped at one interval so stop() stays responsive.
    let config = *read_lock(&ctx.config);
    let decide_wait = Duration::from_millis(config.interval_ms);
    let action = if ctx.model_lock.can_access_resource(COMPONENT)
        && ctx.model_lock.acquire_read_timeout(COMPONENT, decide_wait)
    {
        let decided = ctx.decision.decide(&next).await;
        ctx.model_lock.release_read(COMPONENT);
        match decided {
            Ok(action) => action,
            Err(e) => {
                eprintln!("{} decision failed: {:#}", "⚠️".yellow(), e);
                AgentAction::noop()
            }
        }
    } else {
        AgentAction::noop()
    };

    // 5. Act, gated by the confidence threshold.
    let mut executed = false;
    let mut execution_ok = false;
    if action.kind != ActionKind::NoOp && action.confidence >= config.confidence_threshold {
        execution_ok = ctx
            .actuator
            .execute(&action)
            .await
            .context("actuator dispatch")?;
        executed = true;
        PipelineMetrics::inc(&ctx.metrics.actions_executed);
        ctx.channel.publish(&Event::new(
            COMPONENT,
            EventPayload::ActionExecuted {
                action: action.clone(),
                success: execution_ok,
            },
        ));
    }

    // 6. Feedback: score holding steady or a confident action counts as
    // success; the decision engine gets a scalar reward either way.
    if config.learning_enabled && executed {
        let looked_successful =
            next.score >= prev.score || action.confidence >= config.confidence_threshold;
        let reward = match (execution_ok, looked_successful) {
            (true, true) => 1.0,
            (true, false) => 0.25,
            (false, _) => -0.25,
        };
        ctx.decision.update_from_feedback(&next, &action, reward).await;
    }

    // 7. Frame accounted for; the caller sleeps the interval.
    PipelineMetrics::inc(&ctx.metrics.frames_processed);
    Ok(true)
}

/// Frame id and timestamp change every tick; only the observed content
/// decides whether a StateChanged event goes out.
fn materially_changed(prev: &GameState, next: &GameState) -> bool {
    let strip = |s: &GameState| {
        let mut s = s.clone();
        s.last_frame_id = 0;
        s.updated_at = None;
        s
    };
    strip(prev) != strip(next)
}
