use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Named phase durations for one request. Cleared at request start, drained
/// into the response.
#[derive(Debug, Default)]
pub struct Timings {
    started: HashMap<String, Instant>,
    finished: Vec<(String, Duration)>,
}

impl Timings {
    pub fn clear(&mut self) {
        self.started.clear();
        self.finished.clear();
    }

    pub fn start(&mut self, phase: &str) {
        self.started.insert(phase.to_string(), Instant::now());
    }

    pub fn done(&mut self, phase: &str) {
        if let Some(started) = self.started.remove(phase) {
            self.finished.push((phase.to_string(), started.elapsed()));
        }
    }

    /// Durations in milliseconds, consuming the registry.
    pub fn drain(&mut self) -> BTreeMap<String, u128> {
        self.started.clear();
        self.finished
            .drain(..)
            .map(|(phase, elapsed)| (phase, elapsed.as_millis()))
            .collect()
    }
}

/// Current stage and normalized progress of the in-flight generation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    pub stage: String,
    pub progress: f32,
}

/// Shared, pollable status. The generation call overwrites it on every step;
/// the heartbeat task reads it at a fixed period.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard(Arc<Mutex<Status>>);

impl StatusBoard {
    pub fn update(&self, stage: &str, progress: f32) {
        if let Ok(mut status) = self.0.lock() {
            status.stage = stage.to_string();
            status.progress = progress.clamp(0.0, 1.0);
        }
    }

    pub fn get(&self) -> Status {
        self.0.lock().map(|status| status.clone()).unwrap_or_default()
    }
}

/// Fire-and-forget JSON event sink for lifecycle and progress events,
/// keyed to one request's correlation id.
#[derive(Debug, Clone)]
pub struct EventSink {
    client: reqwest::Client,
    send_url: Option<String>,
    request_id: Option<String>,
}

impl EventSink {
    pub fn new(
        client: reqwest::Client,
        send_url: Option<String>,
        request_id: Option<String>,
    ) -> Self {
        Self {
            client,
            send_url,
            request_id,
        }
    }

    /// POST one event. Failures are logged and swallowed; telemetry never
    /// fails a request.
    pub fn emit(&self, kind: &str, state: &str, mut payload: Map<String, Value>) {
        let Some(url) = self.send_url.clone() else {
            return;
        };
        if let Some(request_id) = &self.request_id {
            payload.insert("startRequestId".to_string(), json!(request_id));
        }
        let body = json!({ "type": kind, "status": state, "payload": payload });
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&body).send().await {
                debug!(url, error = %e, "progress event delivery failed");
            }
        });
    }

    pub fn progress(&self, step: usize) {
        let mut payload = Map::new();
        payload.insert("step".to_string(), json!(step));
        self.emit("inference", "progress", payload);
    }
}

/// How step-level progress leaves the generation call. Chosen per request by
/// the orchestrator; the engine only ever sees a step callback.
pub enum ProgressMode {
    /// Emit an event to the network sink every `every` steps.
    Push { every: usize, steps: mpsc::UnboundedSender<usize> },
    /// Fold each step into the pollable status board.
    Pull { status: StatusBoard, total_steps: usize },
}

impl ProgressMode {
    /// Step callback body. Callable from the blocking generation thread.
    pub fn on_step(&self, step: usize) {
        match self {
            ProgressMode::Push { every, steps } => {
                if *every > 0 && step % every == 0 {
                    // Receiver gone means the request is already over.
                    let _ = steps.send(step);
                }
            }
            ProgressMode::Pull { status, total_steps } => {
                let fraction = step as f32 / (*total_steps).max(1) as f32;
                status.update("inference", fraction);
            }
        }
    }
}

/// Handle for the ~1 Hz status republisher attached to one response stream.
/// Cancelled deterministically when the response completes; a failed publish
/// also stops it (best effort, no retry).
pub struct Heartbeat {
    cancel: watch::Sender<bool>,
}

impl Heartbeat {
    pub fn spawn(status: StatusBoard, line_tx: mpsc::Sender<String>) -> Self {
        let (cancel, mut cancelled) = watch::channel(false);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick is immediate; skip it so callers get their
            // first heartbeat one period in.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let line = match serde_json::to_string(&status.get()) {
                            Ok(line) => line + "\n",
                            Err(_) => break,
                        };
                        if line_tx.send(line).await.is_err() {
                            debug!("status publish failed, stopping heartbeat");
                            break;
                        }
                    }
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self { cancel }
    }

    pub fn cancel(self) {
        if self.cancel.send(true).is_err() {
            warn!("heartbeat task already gone at cancellation");
        }
    }
}
